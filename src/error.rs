use crate::media::MediaAcquisitionError;
use crate::peer::LinkState;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Camera, microphone or display capture could not be acquired.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaAcquisitionError),

    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// The signaling channel is down; the message was dropped.
    #[error("Signaling channel is down")]
    ChannelDown,

    #[error("Signaling channel gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),

    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    #[error("Invalid peer link transition {from} -> {to}")]
    InvalidTransition { from: LinkState, to: LinkState },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Errors the signaling layer recovers from on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::ChannelDown | Error::Ws(_))
    }

    /// Errors that end the local session and need user action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MediaAcquisition(_) | Error::ReconnectExhausted(_) | Error::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidTransition {
            from: LinkState::Closed,
            to: LinkState::Connected,
        };
        assert_eq!(err.to_string(), "Invalid peer link transition closed -> connected");
        assert_eq!(Error::ChannelDown.to_string(), "Signaling channel is down");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::ChannelDown.is_retryable());
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(!Error::ChannelDown.is_fatal());

        let media = Error::from(MediaAcquisitionError::PermissionDenied("camera".into()));
        assert!(media.is_fatal());
        assert!(!media.is_retryable());
        assert!(Error::ReconnectExhausted(5).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        assert!(matches!(Error::from(io_err), Error::Io(_)));
    }
}
