//! Driver error types.

use thiserror::Error;

use crate::protocol::{FrameError, ReplyKind};
use crate::transport::TransportError;

/// The device answered, but not with what the driver expected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected firmware version: expected {expected:?}, got {actual:?}")]
    UnexpectedFirmware { expected: String, actual: String },

    #[error("Unexpected PSK: {0}")]
    UnexpectedPsk(String),

    #[error("Unexpected reset number: expected {expected}, got {actual}")]
    UnexpectedReset { expected: u16, actual: u16 },

    #[error("Invalid OTP: {len} bytes (need at least {min})")]
    InvalidOtp { len: usize, min: usize },

    #[error("Command 0x{command:02X} reported failure")]
    CommandFailed { command: u8 },

    #[error("Malformed {kind} reply: {detail}")]
    UnexpectedReply { kind: ReplyKind, detail: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsError {
    #[error("TLS setup failed: {0}")]
    Setup(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("TLS read failed: {0}")]
    Read(String),

    #[error("TLS worker did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("TLS session is not established")]
    NotEstablished,

    #[error("TLS worker has stopped")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Raw frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("Pixel buffer holds {actual} samples, scan needs {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("USB I/O error: {0}")]
    Io(#[from] TransportError),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("No {kind} reply within {timeout_ms}ms")]
    Timeout { kind: ReplyKind, timeout_ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Tls(#[from] TlsError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("A {0} reply is already pending")]
    Busy(ReplyKind),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state machine transition")]
    InvalidState,

    #[error("Device is not activated")]
    NotActivated,
}

impl DriverError {
    /// Whether this error only reports a deliberate teardown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverError::Cancelled)
    }

    /// An equivalent error for another waiter of the same failure.
    ///
    /// Transport errors that wrap `std::io::Error` keep only their message.
    pub(crate) fn duplicate(&self) -> DriverError {
        match self {
            DriverError::Io(e) => DriverError::Io(match e {
                TransportError::Disconnected => TransportError::Disconnected,
                TransportError::Timeout { timeout_ms } => TransportError::Timeout {
                    timeout_ms: *timeout_ms,
                },
                other => TransportError::ReadFailed(other.to_string()),
            }),
            DriverError::Frame(e) => DriverError::Frame(e.clone()),
            DriverError::Timeout { kind, timeout_ms } => DriverError::Timeout {
                kind: *kind,
                timeout_ms: *timeout_ms,
            },
            DriverError::Protocol(e) => DriverError::Protocol(e.clone()),
            DriverError::Tls(e) => DriverError::Tls(e.clone()),
            DriverError::Image(e) => DriverError::Image(e.clone()),
            DriverError::Busy(kind) => DriverError::Busy(*kind),
            DriverError::Cancelled => DriverError::Cancelled,
            DriverError::InvalidState => DriverError::InvalidState,
            DriverError::NotActivated => DriverError::NotActivated,
        }
    }
}
