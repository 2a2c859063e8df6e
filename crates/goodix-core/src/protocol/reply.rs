//! Parsed reply payloads.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::command::ReplyKind;
use super::constants::{PSK_STATUS_OK, REPLY_STATUS_OK};
use crate::error::ProtocolError;

/// PSK replies longer than this are rejected before allocation.
const MAX_PSK_LEN: usize = 0x100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Resolved by the ACK alone.
    None,
    Success(bool),
    Reset { success: bool, number: u16 },
    FirmwareVersion(String),
    PresetPsk { success: bool, flags: u32, psk: Vec<u8> },
    Data(Vec<u8>),
    /// Ciphertext from a `FLAGS_TLS` frame.
    Tls(Vec<u8>),
}

impl Reply {
    /// Parse a reply payload according to the shape the command expects.
    pub fn parse(kind: ReplyKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        let malformed = |detail: &str| ProtocolError::UnexpectedReply {
            kind,
            detail: detail.to_string(),
        };
        let mut cursor = Cursor::new(payload);

        match kind {
            ReplyKind::Ack | ReplyKind::None => Ok(Reply::None),
            ReplyKind::Success => {
                let status = cursor.read_u8().map_err(|_| malformed("empty payload"))?;
                Ok(Reply::Success(status == REPLY_STATUS_OK))
            }
            ReplyKind::Reset => {
                let status = cursor.read_u8().map_err(|_| malformed("missing status"))?;
                let number = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| malformed("missing reset number"))?;
                Ok(Reply::Reset {
                    success: status == REPLY_STATUS_OK,
                    number,
                })
            }
            ReplyKind::FirmwareVersion => {
                let end = payload
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| malformed("string is not NUL-terminated"))?;
                let version = std::str::from_utf8(&payload[..end])
                    .map_err(|_| malformed("string is not valid UTF-8"))?;
                Ok(Reply::FirmwareVersion(version.to_string()))
            }
            ReplyKind::PskRead => {
                let status = cursor.read_u8().map_err(|_| malformed("missing status"))?;
                if status != PSK_STATUS_OK {
                    return Ok(Reply::PresetPsk {
                        success: false,
                        flags: 0,
                        psk: Vec::new(),
                    });
                }
                let flags = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| malformed("missing flags"))?;
                let len = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| malformed("missing length"))? as usize;
                let start = cursor.position() as usize;
                if len > MAX_PSK_LEN || payload.len() < start + len {
                    return Err(ProtocolError::UnexpectedReply {
                        kind,
                        detail: format!(
                            "declared PSK length {} exceeds {} available bytes",
                            len,
                            payload.len() - start
                        ),
                    });
                }
                Ok(Reply::PresetPsk {
                    success: true,
                    flags,
                    psk: payload[start..start + len].to_vec(),
                })
            }
            ReplyKind::Default => Ok(Reply::Data(payload.to_vec())),
            ReplyKind::Tls => Ok(Reply::Tls(payload.to_vec())),
        }
    }

    /// Raw bytes of a `Data` or `Tls` reply.
    pub fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Reply::Data(bytes) | Reply::Tls(bytes) => Ok(bytes),
            other => Err(ProtocolError::UnexpectedReply {
                kind: ReplyKind::Default,
                detail: format!("expected raw bytes, got {other:?}"),
            }),
        }
    }
}
