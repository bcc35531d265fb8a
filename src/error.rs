//! Error types for the client engine.
//!
//! Failures fall into two categories. Misuse errors (bad arguments, calls on
//! a destroyed instance, unsupported operations) indicate a defect in the
//! calling code; binding layers typically re-raise them instead of branching.
//! Operational errors (no connection, connection lost, refused handshake,
//! oversized payload, I/O) describe transient network conditions a caller is
//! expected to handle. [`Error::is_misuse`] exposes the split.

use rumqttc::mqttbytes;
use thiserror::Error;

/// Errors reported by the client engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An argument failed validation before any socket or codec state was
    /// touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested operation is not available in this configuration.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The instance was torn down with `destroy()` and no longer accepts
    /// calls.
    #[error("client instance has been destroyed")]
    Destroyed,

    /// `loop_start()` was called while a network loop task is running.
    #[error("network loop is already running")]
    LoopAlreadyRunning,

    /// The peer sent data the wire codec could not frame or decode.
    #[error("protocol violation: {0}")]
    Protocol(#[source] mqttbytes::Error),

    /// No connection is established or being established.
    #[error("not connected to a broker")]
    NoConnection,

    /// The connection dropped unexpectedly (socket closed, read/write
    /// failure, or keep-alive timeout).
    #[error("connection lost")]
    ConnectionLost,

    /// The broker refused the connection in its CONNACK.
    #[error("connection refused by broker: {reason}")]
    ConnectionRefused {
        /// Raw CONNACK return code.
        code: u8,
        /// Human-readable refusal reason.
        reason: &'static str,
    },

    /// The publish payload exceeds the configured maximum packet size.
    #[error("payload of {size} bytes exceeds the {limit} byte packet limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// An operating-system level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Whether this error is a programming error rather than an operational
    /// network condition.
    ///
    /// Misuse errors never trigger reconnection; the persistent loop modes
    /// surface them to the caller immediately.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::NotSupported(_)
                | Error::Destroyed
                | Error::LoopAlreadyRunning
        )
    }

    /// The raw OS error code carried by this failure, if any.
    ///
    /// Used by the disconnect event to report why a connection dropped.
    pub fn os_code(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(-1),
            _ => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_classification() {
        assert!(Error::invalid("bad").is_misuse());
        assert!(Error::NotSupported("x").is_misuse());
        assert!(Error::Destroyed.is_misuse());
        assert!(Error::LoopAlreadyRunning.is_misuse());

        assert!(!Error::NoConnection.is_misuse());
        assert!(!Error::ConnectionLost.is_misuse());
        assert!(!Error::ConnectionRefused {
            code: 5,
            reason: "connection refused - not authorised"
        }
        .is_misuse());
        assert!(!Error::PayloadTooLarge { size: 10, limit: 1 }.is_misuse());
    }

    #[test]
    fn display_is_not_empty() {
        let errors = vec![
            Error::invalid("x"),
            Error::NoConnection,
            Error::ConnectionLost,
            Error::Destroyed,
            Error::LoopAlreadyRunning,
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
