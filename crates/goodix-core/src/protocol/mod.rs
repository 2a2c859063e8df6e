//! Goodix wire protocol: outer frames, inner messages, commands and replies.

pub mod assembler;
pub mod command;
pub mod constants;
pub mod frame;
pub mod message;
pub mod reply;

pub use assembler::FrameAssembler;
pub use command::{Command, ReplyKind};
pub use constants::*;
pub use frame::{Frame, FrameError, FrameKind};
pub use message::ProtocolMessage;
pub use reply::Reply;
