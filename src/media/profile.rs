use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Capture constraints for one quality tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
}

impl QualityProfile {
    pub fn low() -> Self {
        Self::preset("low", 320, 240, 15, 16_000, 1)
    }

    pub fn standard() -> Self {
        Self::preset("standard", 640, 480, 30, 48_000, 1)
    }

    pub fn high() -> Self {
        Self::preset("high", 1280, 720, 30, 48_000, 2)
    }

    /// Display capture: large frames, low frame rate.
    pub fn screen() -> Self {
        Self::preset("screen", 1920, 1080, 15, 48_000, 2)
    }

    pub fn named(name: &str) -> Result<Self> {
        match name {
            "low" => Ok(Self::low()),
            "standard" => Ok(Self::standard()),
            "high" => Ok(Self::high()),
            "screen" => Ok(Self::screen()),
            other => Err(Error::InvalidConfig(format!("unknown quality profile '{}'", other))),
        }
    }

    fn preset(
        name: &str,
        width: u32,
        height: u32,
        frame_rate: u32,
        audio_sample_rate: u32,
        audio_channels: u16,
    ) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            frame_rate,
            audio_sample_rate,
            audio_channels,
        }
    }
}

impl Default for QualityProfile {
    fn default() -> Self {
        Self::standard()
    }
}
