//! Event system for consumer decoupling.
//!
//! The driver reports finger transitions, captured images, activation
//! results and session errors through `DeviceObserver`, so that a CLI or an
//! enrollment layer can react without the core knowing about it.

use std::fmt;

use crate::image::Image;

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Bring-up and TLS establishment finished; scans may start.
    Activated,
    /// Bring-up or TLS establishment failed.
    ActivationFailed { message: String },
    /// Finger placed on (`true`) or lifted from (`false`) the sensor.
    FingerStatus { present: bool },
    /// One decoded, normalized image.
    ImageCaptured(Image),
    /// A scan or the read loop failed.
    SessionError { message: String },
    Deactivated,
    /// A frame was sent or received.
    Packet {
        direction: PacketDirection,
        flags: u8,
        length: usize,
    },
}

/// Observer trait for receiving device events.
pub trait DeviceObserver: Send + Sync {
    fn on_event(&self, event: &DeviceEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DeviceObserver for NullObserver {
    fn on_event(&self, _event: &DeviceEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DeviceObserver for TracingObserver {
    fn on_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Activated => tracing::info!("Device activated"),
            DeviceEvent::ActivationFailed { message } => {
                tracing::error!("Activation failed: {}", message);
            }
            DeviceEvent::FingerStatus { present } => {
                tracing::info!(present = present, "Finger status changed");
            }
            DeviceEvent::ImageCaptured(image) => {
                tracing::info!(
                    width = image.width,
                    height = image.height,
                    partial = image.partial,
                    "Image captured"
                );
            }
            DeviceEvent::SessionError { message } => {
                tracing::error!("Session error: {}", message);
            }
            DeviceEvent::Deactivated => tracing::info!("Device deactivated"),
            DeviceEvent::Packet {
                direction,
                flags,
                length,
            } => {
                tracing::trace!(
                    dir = %direction,
                    flags = %format!("0x{:02X}", flags),
                    len = length,
                    "USB Packet"
                );
            }
        }
    }
}
