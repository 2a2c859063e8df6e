//! Inner protocol message carried in `FLAGS_PROTOCOL` frames.
//!
//! `[command id][payload length u16 LE][payload...]`

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::constants::{CMD_ACK, MESSAGE_HEADER_SIZE};
use super::frame::FrameError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn new(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.command == CMD_ACK
    }

    /// For an ACK, the id of the command being acknowledged.
    pub fn acked_command(&self) -> Option<u8> {
        if self.is_ack() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = u16::try_from(self.payload.len()).map_err(|_| FrameError::TooLarge {
            len: self.payload.len(),
            max: u16::MAX as usize,
        })?;
        let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE + self.payload.len());
        buf.push(self.command);
        buf.write_u16::<LittleEndian>(len)
            .map_err(|_| FrameError::TooLarge {
                len: self.payload.len(),
                max: u16::MAX as usize,
            })?;
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a message; the declared length must fit in `data`.
    ///
    /// Bytes past the declared length are padding and ignored.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: MESSAGE_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let truncated = |_| FrameError::Truncated {
            expected: MESSAGE_HEADER_SIZE,
            actual: data.len(),
        };
        let command = cursor.read_u8().map_err(truncated)?;
        let len = cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize;

        let end = MESSAGE_HEADER_SIZE + len;
        if data.len() < end {
            return Err(FrameError::Truncated {
                expected: end,
                actual: data.len(),
            });
        }
        Ok(Self {
            command,
            payload: data[MESSAGE_HEADER_SIZE..end].to_vec(),
        })
    }
}
