//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for bulk USB communication,
//! allowing different implementations (nusb, mock, etc.).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint 0x{address:02X} unavailable: {message}")]
    EndpointUnavailable { address: u8, message: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract bulk transport.
///
/// Every call is bounded by the transport's per-transfer timeout; a read
/// that sees no data in that window returns `TransportError::Timeout`,
/// which the read loop treats as "nothing yet" rather than a failure.
pub trait UsbTransport: Send + Sync {
    /// Write raw bytes to the OUT endpoint.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read at most `max_len` bytes from the IN endpoint.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}
