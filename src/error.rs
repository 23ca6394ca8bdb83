//! Error types for the protocol engine.
//!
//! `BusError` is the single error type surfaced to callers of an
//! [`Instrument`](crate::instrument::Instrument). It mirrors the five failure
//! classes a bus exchange can end in:
//!
//! - **`Validation`**: the command was malformed or incomplete. Detected before
//!   the bus is touched, so the instrument state is never affected.
//! - **`LockTimeout`**: the bus access lock was not granted in time. The caller
//!   may simply retry.
//! - **`Transport`**: an I/O failure or read timeout during a sequence step. The
//!   whole atomic sequence is abandoned.
//! - **`Decode`**: the instrument answered, but not in the expected grammar.
//!   Propagated exactly like a transport error.
//! - **`Unsupported`**: the model does not implement the requested command.
//!
//! Two lifecycle variants complete the set: `WaitTimeout` for a synchronous
//! caller that gave up waiting, and `Closed` once the instrument is shut down.
//!
//! None of these variants implies a partially updated session: a failed command
//! or poll publishes nothing.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Errors raised by a bus transport primitive.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bus read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Bus connection closed")]
    Closed,

    #[error("Controller protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the failure was a timeout rather than a hard I/O fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// A wire response that did not match the grammar the model expects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Unknown field code in '{0}'")]
    UnknownCode(String),

    #[error("Field '{field}' has unrecognized unit suffix")]
    UnknownUnit { field: String },

    #[error("Field '{field}' is not a number: '{value}'")]
    NotNumeric { field: String, value: String },

    #[error("Value {value} out of range for {what}")]
    OutOfRange { what: &'static str, value: i64 },

    #[error("Bad binary block: {0}")]
    BadBlock(String),

    #[error("Expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("Response is not valid text")]
    NotText,
}

/// Primary error type for all bus-touching operations.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Invalid command: {0}")]
    Validation(String),

    #[error("Timed out after {timeout:?} waiting for bus lock (requested by '{requester}')")]
    LockTimeout { requester: String, timeout: Duration },

    #[error("Transport error at step {step}: {source}")]
    Transport {
        step: usize,
        #[source]
        source: TransportError,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Operation not supported by {model}: {operation}")]
    Unsupported { model: &'static str, operation: String },

    #[error("Stopped waiting for command after {0:?}")]
    WaitTimeout(Duration),

    #[error("Instrument is closed")]
    Closed,
}

impl BusError {
    /// Construct a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        BusError::Validation(msg.into())
    }

    /// Construct an unsupported-operation error.
    pub fn unsupported(model: &'static str, operation: impl Into<String>) -> Self {
        BusError::Unsupported {
            model,
            operation: operation.into(),
        }
    }

    /// Whether repeating the same call may succeed without changing anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::LockTimeout { .. } | BusError::WaitTimeout(_) => true,
            BusError::Transport { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether the error happened before any byte was put on the wire.
    pub fn is_pre_bus(&self) -> bool {
        matches!(
            self,
            BusError::Validation(_) | BusError::Unsupported { .. } | BusError::LockTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BusError::validation("missing argument 'hz'");
        assert_eq!(err.to_string(), "Invalid command: missing argument 'hz'");

        let err = BusError::unsupported("hp3478a", "fetch_trace");
        assert_eq!(
            err.to_string(),
            "Operation not supported by hp3478a: fetch_trace"
        );
    }

    #[test]
    fn test_decode_error_wraps() {
        let err: BusError = DecodeError::FieldCount {
            expected: 20,
            actual: 19,
        }
        .into();
        assert!(err.to_string().contains("Expected 20 fields, got 19"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        let lock = BusError::LockTimeout {
            requester: "poller".into(),
            timeout: Duration::from_millis(10),
        };
        assert!(lock.is_retryable());
        assert!(lock.is_pre_bus());

        let timeout = BusError::Transport {
            step: 2,
            source: TransportError::Timeout(Duration::from_millis(5)),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_pre_bus());

        let io = BusError::Transport {
            step: 0,
            source: TransportError::Closed,
        };
        assert!(!io.is_retryable());
    }
}
