//! Error handling for tinylink
//!
//! Provides the error types for all layers of the sender:
//! - Connection errors (serial transport, I/O, unexpected close)
//! - Protocol errors (malformed wire data, unexpected message shapes)
//! - Controller errors (alarms, rejected requests, cancellation)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Controller error type
///
/// Represents errors surfaced by the controller while operating the machine:
/// firmware alarms, per-instruction rejections, and cancellation of
/// outstanding work.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// Controller is not connected
    #[error("Controller not connected")]
    NotConnected,

    /// Firmware reported an error condition. Sticky until cleared.
    #[error("Machine alarm: {message}")]
    MachineAlarm {
        /// Firmware status code, if one was reported.
        code: Option<u16>,
        /// The alarm message.
        message: String,
    },

    /// Firmware returned a non-zero status for one instruction
    #[error("Request rejected ({code}): {message}")]
    RequestRejected {
        /// The firmware status code.
        code: u16,
        /// Decoded status text.
        message: String,
    },

    /// The instruction was cancelled before it retired
    #[error("Operation cancelled: {reason}")]
    Cancelled {
        /// Why outstanding operations were cancelled.
        reason: String,
    },

    /// Probe operation failed for a reason other than not tripping
    #[error("Probe failed: {reason}")]
    ProbeFailed {
        /// The reason the probe operation failed.
        reason: String,
    },

    /// Invalid argument for a controller operation
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong with the request.
        reason: String,
    },
}

/// Protocol error type
///
/// The wire protocol state is not trustworthy after one of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Wire text could not be decoded
    #[error("Malformed wire data at offset {offset}: {reason}")]
    MalformedWireData {
        /// Byte offset into the line where decoding failed.
        offset: usize,
        /// The reason decoding failed.
        reason: String,
    },

    /// A well-formed message did not have the expected shape
    #[error("Unexpected message: {reason}")]
    UnexpectedMessage {
        /// What was unexpected.
        reason: String,
    },
}

impl ProtocolError {
    /// Create a malformed-data error at a byte offset
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        ProtocolError::MalformedWireData {
            offset,
            reason: reason.into(),
        }
    }
}

/// G-code line could not be parsed
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid G-code at column {column}: {reason}")]
pub struct GcodeParseError {
    /// Byte column of the offending character
    pub column: usize,
    /// The reason parsing failed
    pub reason: String,
}

impl GcodeParseError {
    /// Create a parse error at a column
    pub fn new(column: usize, reason: impl Into<String>) -> Self {
        Self {
            column,
            reason: reason.into(),
        }
    }
}

/// Connection error type
///
/// Represents errors related to the serial link with the controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Main error type for tinylink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// G-code error
    #[error(transparent)]
    Gcode(#[from] GcodeParseError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this error is the result of cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Controller(ControllerError::Cancelled { .. }))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err: Error = ConnectionError::ConnectionLost {
            reason: "unplugged".into(),
        }
        .into();
        assert!(err.is_connection_error());
        assert!(!err.is_protocol_error());

        let err: Error = ProtocolError::malformed(3, "unterminated string").into();
        assert!(err.is_protocol_error());
        assert_eq!(
            err.to_string(),
            "Malformed wire data at offset 3: unterminated string"
        );

        let err: Error = ControllerError::Cancelled {
            reason: "reset".into(),
        }
        .into();
        assert!(err.is_cancelled());
    }
}
