//! Error types for the relay core.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which half of a connection ran past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::Read => write!(f, "read"),
            IoDirection::Write => write!(f, "write"),
        }
    }
}

/// Per-connection and dial failures.
///
/// Everything except `ConnectTimeout` is terminal for the connection it
/// happened on and nothing else.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Accept, dial, read or write failed at the transport layer.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A read or write did not complete before its deadline.
    #[error("{op} deadline exceeded after {timeout:?}")]
    DeadlineExceeded { op: IoDirection, timeout: Duration },

    /// Oversized frame, embedded delimiter or non UTF-8 request.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connection establishment lost the race against the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The connection was closed before the operation could complete.
    #[error("connection closed")]
    Closed,
}

impl RelayError {
    /// True for a deadline or connect timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RelayError::DeadlineExceeded { .. } | RelayError::ConnectTimeout(_)
        )
    }
}

/// Result type alias using RelayError.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RelayError::DeadlineExceeded {
            op: IoDirection::Read,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "read deadline exceeded after 30s");
        assert!(err.is_timeout());

        let err = RelayError::ConnectTimeout(Duration::from_millis(500));
        assert_eq!(err.to_string(), "connect timed out after 500ms");
        assert!(err.is_timeout());

        let err = RelayError::ProtocolViolation("frame too long".to_string());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
