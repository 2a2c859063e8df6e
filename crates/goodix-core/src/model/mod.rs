//! Sensor model capabilities.
//!
//! The session and its state machines only talk to a `SensorModel`; every
//! per-model constant (firmware string, PSK, reset number, MCU blobs, scan
//! geometry, USB endpoints) is injected through it.

pub mod goodix511;

pub use goodix511::Goodix511;

use crate::error::{ImageError, ProtocolError};
use crate::image::{self, Image};

/// Where a model lives on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbProfile {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub ep_in: u8,
    pub ep_out: u8,
}

pub trait SensorModel: Send {
    /// Human-readable model name.
    fn name(&self) -> &str;

    fn usb_profile(&self) -> UsbProfile;

    /// Firmware string the device must report.
    fn firmware_version(&self) -> &str;

    /// PSK the device must report, byte for byte.
    fn psk(&self) -> &[u8];

    fn psk_flags(&self) -> u32;

    /// Number the device must answer a sensor reset with.
    fn reset_number(&self) -> u16;

    /// Payload of the FDT mode switch commands.
    fn mcu_config(&self) -> &[u8];

    /// MCU configuration blob uploaded during activation.
    fn config_blob(&self) -> &[u8];

    /// `(scan_width, scan_height)` of a raw frame, in pixels.
    fn scan_dimensions(&self) -> (usize, usize);

    /// Plaintext bytes of one raw frame.
    fn raw_frame_len(&self) -> usize {
        let (width, height) = self.scan_dimensions();
        image::raw_frame_len(width * height)
    }

    /// Sensor register writes derived from the OTP calibration block.
    fn calibration_writes(&self, otp: &[u8]) -> Result<Vec<(u16, u16)>, ProtocolError>;

    /// Turn a squashed scan into the image handed to the consumer.
    fn process_frame(&self, squashed: &[u8]) -> Result<Image, ImageError>;
}
