//! Goodix-Core: driver core for Goodix TLS USB fingerprint sensors.
//!
//! These sensors wrap image transfer in a PSK-authenticated TLS 1.2 session
//! whose records travel inside the device's own USB framing. This crate
//! frames and dispatches MCU commands, sequences bring-up and capture as
//! state machines, and terminates the TLS session on the host.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Wire frames, reassembly, MCU messages, command table, reply shapes
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Dispatch**: Pending-reply table correlating replies by kind
//! - **State**: State machine engine plus activation, TLS and scan sequences
//! - **TLS**: OpenSSL PSK server running against an in-memory pipe
//! - **Image**: 12-bit frame unpacking, normalization, PGM export
//! - **Model**: Per-sensor constants behind the `SensorModel` trait
//! - **Events**: Observer pattern for consumer decoupling
//! - **Session**: The driver instance and its read loop
//!
//! # Example
//!
//! ```no_run
//! use goodix_core::model::{Goodix511, goodix511};
//! use goodix_core::session::{DeviceSession, SessionConfig};
//! use goodix_core::transport::NusbTransport;
//!
//! let config = SessionConfig::default();
//! let transport = NusbTransport::open(&goodix511::USB_PROFILE, config.usb_timeout())?;
//! let blob = std::fs::read("goodix511_mcu.bin")?;
//!
//! let mut session = DeviceSession::new(transport, Box::new(Goodix511::new(blob)), config);
//! session.activate()?;
//! session.run_until_idle()?;
//! session.start_scan()?;
//! session.run_until_idle()?;
//! session.deactivate();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod dispatch;
pub mod error;
pub mod events;
pub mod image;
pub mod model;
pub mod protocol;
mod read_loop;
pub mod session;
pub mod state;
pub mod tls;
pub mod transport;

// Re-exports for convenience
pub use error::{DriverError, ImageError, ProtocolError, TlsError};
pub use events::{DeviceEvent, DeviceObserver, NullObserver, PacketDirection, TracingObserver};
pub use image::Image;
pub use model::{Goodix511, SensorModel, UsbProfile};
pub use protocol::{Command, Reply, ReplyKind};
pub use session::{DeviceSession, SessionConfig};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
