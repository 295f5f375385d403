//! Feed error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Timed out after {millis}ms: {operation}")]
    Timeout { operation: &'static str, millis: u64 },

    #[error("Invalid endpoint: {details}")]
    InvalidEndpoint { details: String },

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type FeedResult<T> = Result<T, FeedError>;

/// How the stream source reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport fault: reconnect with exponential backoff.
    Recoverable,
    /// Anything else: report, then retry after a fixed delay.
    Unexpected,
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::WebSocket(_) | Self::Closed | Self::Timeout { .. } => {
                ErrorKind::Recoverable
            }
            _ => ErrorKind::Unexpected,
        }
    }

    pub fn should_backoff(&self) -> bool {
        matches!(self.kind(), ErrorKind::Recoverable)
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Io(e) => Self::Connection {
                message: e.to_string(),
            },
            other => Self::WebSocket(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_faults_are_recoverable() {
        let errors = [
            FeedError::Connection {
                message: "reset".to_string(),
            },
            FeedError::WebSocket("protocol".to_string()),
            FeedError::Closed,
            FeedError::Timeout {
                operation: "connect",
                millis: 10_000,
            },
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Recoverable, "{err}");
            assert!(err.should_backoff());
        }
    }

    #[test]
    fn test_other_faults_are_unexpected() {
        let err = FeedError::Internal {
            message: "boom".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(!FeedError::Encode("bad".to_string()).should_backoff());
    }

    #[test]
    fn test_tungstenite_closed_maps_to_closed() {
        let err: FeedError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, FeedError::Closed));
    }
}
