//! Goodix 511 (27C6:5110).

use super::{SensorModel, UsbProfile};
use crate::error::{ImageError, ProtocolError};
use crate::image::Image;
use crate::protocol::constants::{GOODIX_511_PRODUCT_ID, GOODIX_VENDOR_ID};

pub const FIRMWARE_VERSION: &str = "GF_ST411SEC_APP_12117";
pub const PSK_FLAGS: u32 = 0xBB02_0003;
pub const RESET_NUMBER: u16 = 2048;

pub const PSK: [u8; 32] = [
    0xba, 0x1a, 0x86, 0x03, 0x7c, 0x1d, 0x3c, 0x71, 0xc3, 0xaf, 0x34, 0x49, 0x55, 0xbd, 0x69, 0xa9,
    0xa9, 0x86, 0x1d, 0x9e, 0x91, 0x1f, 0xa2, 0x49, 0x85, 0xb6, 0x77, 0xe8, 0xdb, 0xd7, 0x2d, 0x43,
];

/// FDT mode switch payload.
pub const FDT_SWITCH_MODE: [u8; 13] = [
    0x01, 0x80, 0xaf, 0x80, 0xbf, 0x80, 0xa4, 0x80, 0xb8, 0x80, 0xa8, 0x80, 0xb7,
];

pub const WIDTH: usize = 64;
pub const HEIGHT: usize = 80;
pub const SCAN_WIDTH: usize = 88;

pub const USB_PROFILE: UsbProfile = UsbProfile {
    vendor_id: GOODIX_VENDOR_ID,
    product_id: GOODIX_511_PRODUCT_ID,
    interface: 1,
    ep_in: 0x83,
    ep_out: 0x01,
};

/// Minimum OTP length; calibration reads bytes 46..=49.
pub const OTP_MIN_LEN: usize = 64;

const OTP_REGISTERS: [u16; 4] = [0x0220, 0x0236, 0x0238, 0x023a];

pub struct Goodix511 {
    config_blob: Vec<u8>,
}

impl Goodix511 {
    /// The MCU configuration blob is device specific and supplied by the caller.
    pub fn new(config_blob: Vec<u8>) -> Self {
        Self { config_blob }
    }
}

impl SensorModel for Goodix511 {
    fn name(&self) -> &str {
        "Goodix TLS Fingerprint Sensor 511"
    }

    fn usb_profile(&self) -> UsbProfile {
        USB_PROFILE
    }

    fn firmware_version(&self) -> &str {
        FIRMWARE_VERSION
    }

    fn psk(&self) -> &[u8] {
        &PSK
    }

    fn psk_flags(&self) -> u32 {
        PSK_FLAGS
    }

    fn reset_number(&self) -> u16 {
        RESET_NUMBER
    }

    fn mcu_config(&self) -> &[u8] {
        &FDT_SWITCH_MODE
    }

    fn config_blob(&self) -> &[u8] {
        &self.config_blob
    }

    fn scan_dimensions(&self) -> (usize, usize) {
        (SCAN_WIDTH, HEIGHT)
    }

    fn calibration_writes(&self, otp: &[u8]) -> Result<Vec<(u16, u16)>, ProtocolError> {
        if otp.len() < OTP_MIN_LEN {
            return Err(ProtocolError::InvalidOtp {
                len: otp.len(),
                min: OTP_MIN_LEN,
            });
        }
        let values = [
            (u16::from(otp[46]) << 4) | 8,
            u16::from(otp[47]),
            u16::from(otp[48]),
            u16::from(otp[49]),
        ];
        Ok(OTP_REGISTERS.into_iter().zip(values).collect())
    }

    /// Crop the 88-wide scan to the 64-wide sensing area.
    fn process_frame(&self, squashed: &[u8]) -> Result<Image, ImageError> {
        let expected = SCAN_WIDTH * HEIGHT;
        if squashed.len() != expected {
            return Err(ImageError::DimensionMismatch {
                expected,
                actual: squashed.len(),
            });
        }
        let data = squashed
            .chunks_exact(SCAN_WIDTH)
            .flat_map(|row| &row[..WIDTH])
            .copied()
            .collect();
        Ok(Image {
            width: WIDTH,
            height: HEIGHT,
            data,
            partial: true,
        })
    }
}
