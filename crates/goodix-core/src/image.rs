//! Sensor frame decoding and normalization.
//!
//! The sensor packs four 12-bit samples into every six bytes, after an
//! 8-byte header and before a 5-byte trailer:
//!
//! ```text
//! [a, b, c, d, e, f] -> ((a & 0xF) << 8) | b
//!                       (d << 4) | (a >> 4)
//!                       ((f & 0xF) << 8) | c
//!                       (e << 4) | (f >> 4)
//! ```

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::error::ImageError;

/// Bytes preceding the first pixel group.
pub const RAW_FRAME_HEADER: usize = 8;

/// Bytes following the last pixel group.
pub const RAW_FRAME_TRAILER: usize = 5;

/// Bytes per group of four samples.
pub const PIXEL_GROUP_BYTES: usize = 6;

/// Raw frame size holding `samples` pixels (a multiple of four).
pub const fn raw_frame_len(samples: usize) -> usize {
    RAW_FRAME_HEADER + samples / 4 * PIXEL_GROUP_BYTES + RAW_FRAME_TRAILER
}

/// Unpack the 12-bit samples of a raw frame.
///
/// A trailing partial group, if any, is ignored.
pub fn decode_frame(raw: &[u8]) -> Result<Vec<u16>, ImageError> {
    let min = RAW_FRAME_HEADER + RAW_FRAME_TRAILER;
    if raw.len() < min {
        return Err(ImageError::FrameTooShort {
            expected: min,
            actual: raw.len(),
        });
    }

    let body = &raw[RAW_FRAME_HEADER..raw.len() - RAW_FRAME_TRAILER];
    let mut pixels = Vec::with_capacity(body.len() / PIXEL_GROUP_BYTES * 4);
    for chunk in body.chunks_exact(PIXEL_GROUP_BYTES) {
        let [a, b, c, d, e, f] = [chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5]]
            .map(u16::from);
        pixels.push(((a & 0xF) << 8) | b);
        pixels.push((d << 4) | (a >> 4));
        pixels.push(((f & 0xF) << 8) | c);
        pixels.push((e << 4) | (f >> 4));
    }
    Ok(pixels)
}

/// Rescale samples linearly onto `0..=255`.
///
/// Only relative contrast survives: the minimum maps to 0 and the maximum
/// to 255. A flat frame maps to all zeros.
pub fn squash_frame_linear(frame: &[u16]) -> Vec<u8> {
    let (Some(&min), Some(&max)) = (frame.iter().min(), frame.iter().max()) else {
        return Vec::new();
    };
    let range = u32::from(max - min);

    frame
        .iter()
        .map(|&pix| {
            let offset = u32::from(pix - min);
            if offset == 0 || range == 0 {
                0
            } else {
                (offset * 0xFF / range) as u8
            }
        })
        .collect()
}

/// An 8-bit grayscale fingerprint image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    /// Row-major, `width * height` bytes.
    pub data: Vec<u8>,
    /// The image covers only part of the finger.
    pub partial: bool,
}

impl Image {
    /// Write the image as a binary PGM (P5).
    pub fn write_pgm<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        writeln!(out, "P5 {} {} 255", self.width, self.height)?;
        out.write_all(&self.data)?;
        out.flush()
    }

    pub fn save_pgm<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("could not open '{}' for writing", path.display()))?;
        self.write_pgm(std::io::BufWriter::new(file))
            .with_context(|| format!("short write to '{}'", path.display()))?;
        debug!(path = %path.display(), "Image written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(groups: &[u8]) -> Vec<u8> {
        let mut raw = vec![0xEE; RAW_FRAME_HEADER];
        raw.extend_from_slice(groups);
        raw.extend_from_slice(&[0xEE; RAW_FRAME_TRAILER]);
        raw
    }

    #[test]
    fn test_decode_fixed_vector() {
        let raw = framed(&[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        let pixels = decode_frame(&raw).unwrap();
        assert_eq!(pixels, vec![0x234, 0x781, 0xC56, 0x9AB]);
    }

    #[test]
    fn test_decode_skips_header_and_trailer() {
        let raw = framed(&[0u8; 12]);
        assert_eq!(decode_frame(&raw).unwrap(), vec![0; 8]);
        assert_eq!(raw_frame_len(8), raw.len());
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            decode_frame(&[0u8; 12]),
            Err(ImageError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn test_squash_linear() {
        assert_eq!(squash_frame_linear(&[10, 20, 30]), vec![0, 127, 255]);
    }

    #[test]
    fn test_squash_flat_frame() {
        assert_eq!(squash_frame_linear(&[5, 5, 5]), vec![0, 0, 0]);
        assert!(squash_frame_linear(&[]).is_empty());
    }

    #[test]
    fn test_write_pgm() {
        let image = Image {
            width: 2,
            height: 1,
            data: vec![0x00, 0xFF],
            partial: false,
        };
        let mut out = Vec::new();
        image.write_pgm(&mut out).unwrap();
        assert_eq!(out, b"P5 2 1 255\n\x00\xFF");
    }
}
