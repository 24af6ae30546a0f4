//! # Error Handling
//!
//! Every failure in the crate is a value. The taxonomy follows the layers a
//! request travels through, from the wire upwards:
//!
//! ## Error Layers
//!
//! ### Codec Errors
//! - **Malformed**: frame too short, wrong protocol id, length field that does not
//!   match the bytes present, byte count that does not match the requested quantity
//! - **EchoMismatch**: a write response that does not echo the request
//! - **UnsupportedFunction**: a function code outside 0x03 / 0x06 / 0x10
//!
//! ### Transport Errors
//! - **IoError**: connect, write and read failures. Any of them tears the connection down.
//! - **TimeoutError**: request-scoped. The connection stays open.
//!
//! ### Engine Errors
//! `EngineError` is what a caller of the transaction engine observes: `Busy`,
//! `Timeout`, `ConnectionLost`, `Protocol(CodecError)` or `Exception(ExceptionCode)`.
//!
//! ### Client Errors
//! `ClientError` adds argument validation and read-after-write verification on top.
//!
//! ## Error Classification
//!
//! ```rust
//! use modbus_master::{EngineError, ExceptionCode};
//!
//! let busy = EngineError::Exception(ExceptionCode::ServerDeviceBusy);
//! assert!(busy.is_recoverable());
//! assert!(busy.is_protocol_error());
//!
//! let lost = EngineError::connection_lost("peer reset");
//! assert!(lost.is_transport_error());
//! ```
//!
//! ## Retry Logic
//!
//! The engine never retries. Callers that want retries layer them on top:
//!
//! ```rust,no_run
//! use modbus_master::{ClientResult, ModbusTcpClient, RegisterClient};
//! use tokio::time::{sleep, Duration};
//!
//! async fn read_with_retry(client: &ModbusTcpClient, max_retries: usize) -> ClientResult<Vec<u16>> {
//!     let mut attempt = 0;
//!     loop {
//!         match client.read_holding_registers(0, 10, 1).await {
//!             Ok(values) => return Ok(values),
//!             Err(error) if error.is_recoverable() && attempt < max_retries => {
//!                 attempt += 1;
//!                 sleep(Duration::from_millis(100 * attempt as u64)).await;
//!             }
//!             Err(error) => return Err(error),
//!         }
//!     }
//! }
//! ```

use thiserror::Error;

use crate::protocol::ExceptionCode;

/// Result type for transaction engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for register client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Frame encoding/decoding failures
///
/// Local and never retried; surfaced to the caller as a failed request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame structure violation
    ///
    /// # Examples
    /// - Fewer than 8 bytes
    /// - Protocol id other than 0
    /// - Declared length larger than the bytes actually present
    #[error("Malformed frame: {message}")]
    Malformed { message: String },

    /// A write response did not echo the request
    #[error("Echo mismatch on {field}: expected {expected}, got {actual}")]
    EchoMismatch {
        field: &'static str,
        expected: u16,
        actual: u16,
    },

    /// Function code outside the supported set
    #[error("Unsupported function code: 0x{code:02X}")]
    UnsupportedFunction { code: u8 },
}

impl CodecError {
    /// Create a malformed frame error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::Malformed { message: message.into() }
    }

    /// Create an echo mismatch error
    pub fn echo_mismatch(field: &'static str, expected: u16, actual: u16) -> Self {
        Self::EchoMismatch { field, expected, actual }
    }

    /// Create an unsupported function error
    pub fn unsupported_function(code: u8) -> Self {
        Self::UnsupportedFunction { code }
    }
}

/// Socket level failures
///
/// Any of these invalidates the connection it happened on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Connection establishment failed (refused, unreachable, connect timeout)
    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed { address: String, message: String },

    /// Listener could not be bound
    #[error("Failed to bind {address}: {message}")]
    BindFailed { address: String, message: String },

    /// Writing a frame to the socket failed
    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    /// Reading from the socket failed, including end of stream
    #[error("Read failed: {message}")]
    ReadFailed { message: String },
}

impl IoError {
    pub fn connect_failed<A: Into<String>, S: Into<String>>(address: A, message: S) -> Self {
        Self::ConnectFailed { address: address.into(), message: message.into() }
    }

    pub fn bind_failed<A: Into<String>, S: Into<String>>(address: A, message: S) -> Self {
        Self::BindFailed { address: address.into(), message: message.into() }
    }

    pub fn write_failed<S: Into<String>>(message: S) -> Self {
        Self::WriteFailed { message: message.into() }
    }

    pub fn read_failed<S: Into<String>>(message: S) -> Self {
        Self::ReadFailed { message: message.into() }
    }
}

/// A deadline passed before the operation completed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Timeout after {timeout_ms}ms: {operation}")]
pub struct TimeoutError {
    pub operation: String,
    pub timeout_ms: u64,
}

impl TimeoutError {
    pub fn new<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self { operation: operation.into(), timeout_ms }
    }
}

/// Outcome of a failed framed read on a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The byte stream cannot be split into frames any more
    #[error(transparent)]
    Malformed(#[from] CodecError),
}

/// Errors observed by callers of the transaction engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Another request is already in flight on this engine; nothing was sent
    #[error("Engine busy: a transaction is already in flight")]
    Busy,

    /// No matching response before the deadline. The connection stays open.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The connection is gone; the caller must connect again
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// The response could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// The device answered with a Modbus exception
    #[error("Modbus exception: {0}")]
    Exception(ExceptionCode),
}

impl EngineError {
    /// Create a connection lost error
    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost { message: message.into() }
    }

    /// Exception code carried by this error, if any
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            Self::Exception(code) => Some(*code),
            _ => None,
        }
    }

    /// Check if retrying the same operation might succeed
    ///
    /// `ConnectionLost` counts as recoverable only after an explicit reconnect.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Busy | Self::Timeout(_) | Self::ConnectionLost { .. } => true,
            Self::Exception(code) => code.is_transient(),
            Self::Protocol(_) => false,
        }
    }

    /// Check if the error comes from the transport rather than the device
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ConnectionLost { .. })
    }

    /// Check if the error is a Modbus protocol level failure
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Exception(_))
    }
}

/// Top-level errors of the register client API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Rejected before any network I/O
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Connection could not be established
    #[error(transparent)]
    Connect(#[from] IoError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Read-back after a write did not return the written values
    #[error("Verification failed at address {address}: wrote {expected:?}, read back {observed:?}")]
    VerificationMismatch {
        address: u16,
        expected: Vec<u16>,
        observed: Vec<u16>,
    },

    /// The background worker has shut down
    #[error("Worker task not available")]
    WorkerUnavailable,
}

impl ClientError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Error returned for operations attempted without a live connection
    pub fn not_connected() -> Self {
        Self::Engine(EngineError::connection_lost("not connected"))
    }

    /// Engine error wrapped by this error, if any
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Self::Engine(err) => Some(err),
            _ => None,
        }
    }

    /// Check if the error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Engine(err) => err.is_recoverable(),
            Self::Connect(_) => true,
            Self::InvalidArgument { .. }
            | Self::VerificationMismatch { .. }
            | Self::WorkerUnavailable => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = EngineError::Timeout(TimeoutError::new("request", 3000));
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert!(!err.is_protocol_error());

        let err = EngineError::Exception(ExceptionCode::IllegalDataAddress);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));

        let err = EngineError::Protocol(CodecError::malformed("short"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = CodecError::echo_mismatch("address", 0x10, 0x11);
        let msg = err.to_string();
        assert!(msg.contains("address"));
        assert!(msg.contains("16"));
        assert!(msg.contains("17"));

        let err = EngineError::Exception(ExceptionCode::IllegalDataValue);
        assert!(err.to_string().contains("0x03"));

        let err = TimeoutError::new("receive frame", 250);
        assert_eq!(err.to_string(), "Timeout after 250ms: receive frame");
    }

    #[test]
    fn test_client_error_wraps_engine_error() {
        let err: ClientError = EngineError::Busy.into();
        assert_eq!(err.engine_error(), Some(&EngineError::Busy));
        assert!(err.is_recoverable());

        let err = ClientError::invalid_argument("quantity 126 exceeds 125");
        assert!(!err.is_recoverable());
        assert!(err.engine_error().is_none());
    }
}
