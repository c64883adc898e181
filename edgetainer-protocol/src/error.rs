//! Error handling for the Edgetainer core
//!
//! One error type is shared by the protocol crate, the server endpoint and the
//! device agent. Variants map onto the observable failure categories of the
//! system: configuration problems are fatal at startup, authentication and
//! transport failures close a single connection, protocol and device errors
//! are surfaced to whoever issued the request.

use thiserror::Error;

/// Result type for protocol and tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the tunnel core.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication failed (unknown device, bad key, protocol auth
    /// failure). The message is for logs only and is never sent to the peer.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TCP or SSH layer failure affecting a single connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed envelope, unknown command type, oversized frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No port available, channel limit reached.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// A command or keepalive deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The device answered with `success: false`; the message is passed
    /// through verbatim.
    #[error("device error: {0}")]
    Device(String),

    /// The target device has no live connection.
    #[error("device not connected: {0}")]
    NotConnected(String),

    /// I/O error (file system, sockets).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Refine a generic I/O error into the taxonomy, keeping the context.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => Error::Timeout(format!("{context}: {error}")),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NetworkUnreachable => Error::Transport(format!("{context}: {error}")),
            _ => Error::Io(error),
        }
    }

    /// Whether retrying the operation later may succeed.
    ///
    /// Transport hiccups and timeouts are retried by the reconnect loop;
    /// configuration and authentication failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::NotConnected(_) | Error::Io(_)
        )
    }

    /// Whether this error should abort the process (startup-time fatal).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::Auth("unknown device".to_string());
        assert_eq!(error.to_string(), "authentication failed: unknown device");

        let error = Error::Resource("no port available".to_string());
        assert_eq!(error.to_string(), "resource exhausted: no port available");

        let error = Error::NotConnected("dev-A".to_string());
        assert_eq!(error.to_string(), "device not connected: dev-A");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error as IoError, ErrorKind};

        let io_error = IoError::new(ErrorKind::NotFound, "file not found");
        let error: Error = io_error.into();

        assert!(matches!(error, Error::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_io_refinement() {
        use std::io::{Error as IoError, ErrorKind};

        let timed_out = IoError::new(ErrorKind::TimedOut, "deadline");
        assert!(matches!(
            Error::from_io_error(timed_out, "keepalive"),
            Error::Timeout(_)
        ));

        let refused = IoError::new(ErrorKind::ConnectionRefused, "nope");
        assert!(matches!(
            Error::from_io_error(refused, "dial"),
            Error::Transport(_)
        ));
    }

    #[test]
    fn test_recoverability() {
        assert!(Error::Timeout("t".into()).is_recoverable());
        assert!(Error::Transport("t".into()).is_recoverable());
        assert!(!Error::Auth("bad key".into()).is_recoverable());
        assert!(!Error::Config("missing".into()).is_recoverable());
        assert!(Error::Config("missing".into()).is_fatal());
        assert!(!Error::Device("failed".into()).is_fatal());
    }

    #[test]
    fn test_json_error_conversion() {
        let json = r#"{"broken"#;
        let json_error = serde_json::from_str::<serde_json::Value>(json).unwrap_err();
        let error: Error = json_error.into();
        assert!(matches!(error, Error::Json(_)));
    }
}
