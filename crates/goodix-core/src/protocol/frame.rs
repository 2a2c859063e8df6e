//! Outer wire frame.
//!
//! ```text
//! ┌──────────┬─────────┬──────────────┬───────────────┬──────────────────┐
//! │  Magic   │  Flags  │    Length    │    Payload    │ Checksum (opt.)  │
//! │ 2 bytes  │ 1 byte  │ 2 bytes (LE) │    N bytes    │      1 byte      │
//! └──────────┴─────────┴──────────────┴───────────────┴──────────────────┘
//! ```
//!
//! `Length` counts the payload plus the checksum byte when `FLAG_CHECKSUM` is
//! set in `Flags`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::{
    CHECKSUM_SEED, FLAG_CHECKSUM, FLAGS_PROTOCOL, FLAGS_TLS, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_BODY,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Invalid frame magic: {0:02X?}")]
    BadMagic([u8; 2]),

    #[error("Frame length mismatch: header declares {declared}, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Payload too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("Reassembly buffer overflow: {pending} bytes pending (max {max})")]
    Overflow { pending: usize, max: usize },
}

impl FrameError {
    /// Errors after which the byte stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::BadMagic(_) | FrameError::Overflow { .. })
    }
}

/// What a frame carries, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Protocol,
    Tls,
    Unknown(u8),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Flags as sent, including `FLAG_CHECKSUM` when present.
    pub flags: u8,
    pub payload: Vec<u8>,
    /// Trailing checksum byte, verified during decode.
    pub checksum: Option<u8>,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self.flags & !FLAG_CHECKSUM {
            FLAGS_PROTOCOL => FrameKind::Protocol,
            FLAGS_TLS => FrameKind::Tls,
            other => FrameKind::Unknown(other),
        }
    }

    /// Size of this frame on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + usize::from(self.checksum.is_some())
    }
}

/// `0xAA - (sum(flags, payload) & 0xFF)`, wrapping.
///
/// A weak checksum: any set of changes whose byte sum is unchanged modulo 256
/// goes undetected. A single flipped bit is always caught.
pub fn checksum(flags: u8, payload: &[u8]) -> u8 {
    let sum = payload
        .iter()
        .fold(flags, |acc, &b| acc.wrapping_add(b));
    CHECKSUM_SEED.wrapping_sub(sum)
}

/// Encode a payload into a wire frame.
///
/// `flags` must not carry `FLAG_CHECKSUM`; it is set here when
/// `calc_checksum` is requested.
pub fn encode(flags: u8, payload: &[u8], calc_checksum: bool) -> Result<Vec<u8>, FrameError> {
    let body_len = payload.len() + usize::from(calc_checksum);
    if body_len > MAX_FRAME_BODY {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: MAX_FRAME_BODY - usize::from(calc_checksum),
        });
    }

    let flags = if calc_checksum {
        flags | FLAG_CHECKSUM
    } else {
        flags & !FLAG_CHECKSUM
    };

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + body_len);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.push(flags);
    buf.write_u16::<LittleEndian>(body_len as u16)
        .map_err(|_| FrameError::TooLarge {
            len: body_len,
            max: MAX_FRAME_BODY,
        })?;
    buf.extend_from_slice(payload);
    if calc_checksum {
        buf.push(checksum(flags, payload));
    }
    Ok(buf)
}

/// Read the header of a (possibly partial) frame.
///
/// Returns `(flags, declared body length)`.
pub fn peek_header(data: &[u8]) -> Result<(u8, usize), FrameError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::Truncated {
            expected: FRAME_HEADER_SIZE,
            actual: data.len(),
        });
    }
    let magic = [data[0], data[1]];
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let mut cursor = Cursor::new(&data[2..FRAME_HEADER_SIZE]);
    let flags = cursor.read_u8().map_err(|_| FrameError::Truncated {
        expected: FRAME_HEADER_SIZE,
        actual: data.len(),
    })?;
    let len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| FrameError::Truncated {
            expected: FRAME_HEADER_SIZE,
            actual: data.len(),
        })?;
    Ok((flags, len as usize))
}

/// Decode exactly one complete frame.
pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
    let (flags, body_len) = peek_header(data)?;
    let expected = FRAME_HEADER_SIZE + body_len;
    if data.len() < expected {
        return Err(FrameError::Truncated {
            expected,
            actual: data.len(),
        });
    }
    if data.len() > expected {
        return Err(FrameError::LengthMismatch {
            declared: body_len,
            actual: data.len() - FRAME_HEADER_SIZE,
        });
    }

    let body = &data[FRAME_HEADER_SIZE..];
    if flags & FLAG_CHECKSUM == 0 {
        return Ok(Frame {
            flags,
            payload: body.to_vec(),
            checksum: None,
        });
    }

    let Some((&received, payload)) = body.split_last() else {
        return Err(FrameError::Truncated {
            expected: FRAME_HEADER_SIZE + 1,
            actual: data.len(),
        });
    };
    let expected_sum = checksum(flags, payload);
    if received != expected_sum {
        return Err(FrameError::ChecksumMismatch {
            expected: expected_sum,
            actual: received,
        });
    }
    Ok(Frame {
        flags,
        payload: payload.to_vec(),
        checksum: Some(received),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let bytes = encode(FLAGS_PROTOCOL, &[0x01, 0x02], true).unwrap();
        assert_eq!(&bytes[..2], &FRAME_MAGIC);
        assert_eq!(bytes[2], FLAGS_PROTOCOL | FLAG_CHECKSUM);
        assert_eq!(&bytes[3..5], &[3, 0]);
        assert_eq!(&bytes[5..7], &[0x01, 0x02]);
        // 0xAA - (0xA1 + 0x01 + 0x02)
        assert_eq!(bytes[7], 0xAAu8.wrapping_sub(0xA4));
    }

    #[test]
    fn test_encode_without_checksum() {
        let bytes = encode(FLAGS_TLS, &[0x16, 0x03, 0x03], false).unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 3);
        assert_eq!(bytes[2], FLAGS_TLS);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.kind(), FrameKind::Tls);
        assert_eq!(frame.checksum, None);
        assert_eq!(frame.payload, vec![0x16, 0x03, 0x03]);
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(0xFF, &[0xFF, 0xFF]), 0xAAu8.wrapping_sub(0xFD));
        assert_eq!(checksum(0x00, &[]), 0xAA);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = encode(FLAGS_PROTOCOL, &[1, 2, 3, 4], true).unwrap();
        let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = encode(FLAGS_PROTOCOL, &[1, 2], false).unwrap();
        bytes.push(0xEE);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut bytes = encode(FLAGS_PROTOCOL, &[1], true).unwrap();
        bytes[0] = 0x00;
        let err = decode(&bytes).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, FrameError::BadMagic(_)));
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let payload = [0x10, 0x20, 0x30, 0x40, 0x50];
        let clean = encode(FLAGS_PROTOCOL, &payload, true).unwrap();

        for byte in 0..payload.len() {
            for bit in 0..8 {
                let mut corrupted = clean.clone();
                corrupted[FRAME_HEADER_SIZE + byte] ^= 1 << bit;
                assert!(
                    matches!(
                        decode(&corrupted),
                        Err(FrameError::ChecksumMismatch { .. })
                    ),
                    "flip of byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn test_compensating_change_undetected() {
        // Known weakness: +1 on one byte and -1 on another keeps the sum.
        let payload = [0x10, 0x20];
        let mut bytes = encode(FLAGS_PROTOCOL, &payload, true).unwrap();
        bytes[FRAME_HEADER_SIZE] += 1;
        bytes[FRAME_HEADER_SIZE + 1] -= 1;
        assert!(decode(&bytes).is_ok());
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_FRAME_BODY];
        assert!(encode(FLAGS_TLS, &payload, false).is_ok());
        assert!(matches!(
            encode(FLAGS_TLS, &payload, true),
            Err(FrameError::TooLarge { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            payload in proptest::collection::vec(any::<u8>(), 0..4096),
            calc_checksum in any::<bool>(),
        ) {
            let bytes = encode(FLAGS_PROTOCOL, &payload, calc_checksum).unwrap();
            let frame = decode(&bytes).unwrap();
            prop_assert_eq!(frame.kind(), FrameKind::Protocol);
            prop_assert_eq!(frame.checksum.is_some(), calc_checksum);
            prop_assert_eq!(&frame.payload, &payload);
        }
    }
}
