//! Reassembly of frames split across USB transfers.
//!
//! Bulk IN transfers are smaller than some replies (a full image record spans
//! many of them), so incoming bytes are accumulated until a frame's declared
//! length is satisfied.

use tracing::trace;

use super::constants::{DEFAULT_MAX_PENDING, FRAME_HEADER_SIZE};
use super::frame::{self, Frame, FrameError};

/// Accumulates transfer chunks and yields whole frames in arrival order.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_pending: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_pending,
        }
    }

    /// Append one transfer worth of bytes.
    ///
    /// Fails with `Overflow` once more than `max_pending` bytes would be held.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), FrameError> {
        let pending = self.buffer.len() + chunk.len();
        if pending > self.max_pending {
            return Err(FrameError::Overflow {
                pending,
                max: self.max_pending,
            });
        }
        self.buffer.extend_from_slice(chunk);
        trace!(chunk = chunk.len(), pending, "Buffered transfer");
        Ok(())
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// A frame that fails its checksum is consumed and reported so the stream
    /// stays aligned. Fatal errors (bad magic, a declared length that can
    /// never fit) clear the buffer.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let body_len = match frame::peek_header(&self.buffer) {
            Ok((_, len)) => len,
            Err(e) => {
                self.buffer.clear();
                return Some(Err(e));
            }
        };

        let total = FRAME_HEADER_SIZE + body_len;
        if total > self.max_pending {
            self.buffer.clear();
            return Some(Err(FrameError::Overflow {
                pending: total,
                max: self.max_pending,
            }));
        }
        if self.buffer.len() < total {
            return None;
        }

        let result = frame::decode(&self.buffer[..total]);
        self.buffer.drain(..total);
        Some(result)
    }

    /// Bytes held for an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{FLAGS_PROTOCOL, FLAGS_TLS};
    use proptest::prelude::*;

    fn drain(assembler: &mut FrameAssembler) -> Vec<Result<Frame, FrameError>> {
        std::iter::from_fn(|| assembler.next_frame()).collect()
    }

    #[test]
    fn test_single_chunk() {
        let bytes = frame::encode(FLAGS_PROTOCOL, b"abc", true).unwrap();
        let mut assembler = FrameAssembler::new();
        assembler.push(&bytes).unwrap();

        let frames = drain(&mut assembler);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().payload, b"abc");
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_partial_header_waits() {
        let bytes = frame::encode(FLAGS_TLS, &[0x17; 100], false).unwrap();
        let mut assembler = FrameAssembler::new();

        assembler.push(&bytes[..3]).unwrap();
        assert!(assembler.next_frame().is_none());
        assembler.push(&bytes[3..50]).unwrap();
        assert!(assembler.next_frame().is_none());
        assembler.push(&bytes[50..]).unwrap();

        let frame = assembler.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.len(), 100);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut bytes = frame::encode(FLAGS_PROTOCOL, &[1], true).unwrap();
        bytes.extend(frame::encode(FLAGS_TLS, &[2, 3], false).unwrap());
        let mut assembler = FrameAssembler::new();
        assembler.push(&bytes).unwrap();

        let frames = drain(&mut assembler);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().payload, vec![1]);
        assert_eq!(frames[1].as_ref().unwrap().payload, vec![2, 3]);
    }

    #[test]
    fn test_corrupt_frame_keeps_alignment() {
        let mut bad = frame::encode(FLAGS_PROTOCOL, &[9, 9], true).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        bad.extend(frame::encode(FLAGS_PROTOCOL, &[7], true).unwrap());

        let mut assembler = FrameAssembler::new();
        assembler.push(&bad).unwrap();
        let frames = drain(&mut assembler);
        assert!(matches!(
            frames[0],
            Err(FrameError::ChecksumMismatch { .. })
        ));
        assert_eq!(frames[1].as_ref().unwrap().payload, vec![7]);
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut assembler = FrameAssembler::with_max_pending(16);
        let err = assembler.push(&[0u8; 17]).unwrap_err();
        assert!(err.is_fatal());

        // A header declaring more than the bound is rejected before waiting.
        let bytes = frame::encode(FLAGS_TLS, &[0u8; 32], false).unwrap();
        assembler.push(&bytes[..8]).unwrap();
        let err = assembler.next_frame().unwrap().unwrap_err();
        assert!(matches!(err, FrameError::Overflow { .. }));
        assert_eq!(assembler.pending(), 0);
    }

    proptest! {
        #[test]
        fn prop_any_split_yields_one_frame(
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
            calc_checksum in any::<bool>(),
            cuts in proptest::collection::vec(1usize..97, 1..40),
        ) {
            let bytes = frame::encode(FLAGS_PROTOCOL, &payload, calc_checksum).unwrap();
            let whole = frame::decode(&bytes).unwrap();

            let mut assembler = FrameAssembler::new();
            let mut frames = Vec::new();
            let mut offset = 0;
            let mut sizes = cuts.iter().cycle();
            while offset < bytes.len() {
                let size = (*sizes.next().unwrap()).min(bytes.len() - offset);
                assembler.push(&bytes[offset..offset + size]).unwrap();
                offset += size;
                frames.extend(std::iter::from_fn(|| assembler.next_frame()));
            }

            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(frames.pop().unwrap().unwrap(), whole);
            prop_assert_eq!(assembler.pending(), 0);
        }
    }
}
