//! TLS bridge between the device's USB channel and OpenSSL.

pub mod bridge;
pub mod pipe;

pub use bridge::{BridgeEvent, HandshakeProgress, TlsBridge};
pub use pipe::{PipeEnd, PipeSignal};

#[cfg(test)]
pub(crate) mod test_client;
