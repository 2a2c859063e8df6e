//! Read loop: the standing receive that feeds replies to the dispatcher.
//!
//! Every pump issues one bulk IN transfer, reassembles frames and routes
//! each of them in arrival order: ACKs and command replies to the pending
//! continuations, `FLAGS_TLS` frames to whoever waits for ciphertext.

use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::error::DriverError;
use crate::events::{DeviceEvent, DeviceObserver, PacketDirection};
use crate::protocol::{Frame, FrameKind, ProtocolMessage, Reply};
use crate::session::DeviceSession;
use crate::state::machine;
use crate::transport::{TransportError, UsbTransport};

impl<T: UsbTransport + 'static, O: DeviceObserver + 'static> DeviceSession<T, O> {
    pub(crate) fn start_read_loop(&mut self) {
        if self.read_loop_active {
            return;
        }
        self.assembler.clear();
        self.read_loop_active = true;
        debug!(chunk = self.config.read_chunk_size, "Read loop started");
    }

    pub fn is_reading(&self) -> bool {
        self.read_loop_active
    }

    /// Run one iteration of the read loop.
    ///
    /// Runs deferred completions, performs one receive while the loop is
    /// active, dispatches every complete frame and fires expired timeouts.
    /// A receive error stops the loop, fails everything pending and is
    /// returned.
    pub fn pump_once(&mut self) -> Result<(), DriverError> {
        self.flush_deferred();

        if self.read_loop_active {
            match self.transport.read(self.config.read_chunk_size) {
                Ok(bytes) => self.on_transfer(&bytes)?,
                Err(TransportError::Timeout { .. }) => trace!("No data"),
                Err(e) => return self.fail_session(e.into()),
            }
        }

        self.expire(Instant::now());
        Ok(())
    }

    fn flush_deferred(&mut self) {
        while let Some(continuation) = self.deferred.pop_front() {
            continuation(self, Ok(Reply::None));
        }
    }

    fn on_transfer(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        trace!(len = bytes.len(), "Transfer received");
        if let Err(e) = self.assembler.push(bytes) {
            return self.fail_session(e.into());
        }

        while self.read_loop_active {
            let Some(result) = self.assembler.next_frame() else {
                break;
            };
            match result {
                Ok(frame) => self.handle_frame(frame),
                Err(e) if e.is_fatal() => return self.fail_session(e.into()),
                Err(e) => {
                    warn!(error = %e, "Dropping corrupt frame");
                    self.fail_oldest(e.into());
                }
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) {
        self.emit(DeviceEvent::Packet {
            direction: PacketDirection::Rx,
            flags: frame.flags,
            length: frame.wire_len(),
        });

        match frame.kind() {
            FrameKind::Protocol => match ProtocolMessage::decode(&frame.payload) {
                Ok(message) => self.handle_message(message),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed message");
                    self.fail_oldest(e.into());
                }
            },
            FrameKind::Tls => match self.dispatcher.on_tls() {
                Some(continuation) => {
                    trace!(len = frame.payload.len(), "TLS frame received");
                    continuation(self, Ok(Reply::Tls(frame.payload)));
                }
                None => warn!(len = frame.payload.len(), "Unexpected TLS frame"),
            },
            FrameKind::Unknown(flags) => {
                warn!(flags = %format!("0x{:02X}", flags), "Unknown frame type");
            }
        }
    }

    fn handle_message(&mut self, message: ProtocolMessage) {
        if let Some(command_id) = message.acked_command() {
            if let Some(continuation) = self.dispatcher.on_ack(command_id) {
                continuation(self, Ok(Reply::None));
            }
            return;
        }

        match self.dispatcher.on_reply(message.command) {
            Some((kind, continuation)) => {
                let result = Reply::parse(kind, &message.payload).map_err(DriverError::from);
                continuation(self, result);
            }
            None => debug!(
                command = %format!("0x{:02X}", message.command),
                len = message.payload.len(),
                "Unsolicited message"
            ),
        }
    }

    /// Report a corrupted frame to the oldest waiter.
    fn fail_oldest(&mut self, err: DriverError) {
        if let Some(continuation) = self.dispatcher.take_oldest() {
            continuation(self, Err(err));
        }
    }

    fn expire(&mut self, now: Instant) {
        for expired in self.dispatcher.take_expired(now) {
            warn!(kind = %expired.kind, timeout_ms = expired.timeout_ms, "Reply timed out");
            (expired.continuation)(
                self,
                Err(DriverError::Timeout {
                    kind: expired.kind,
                    timeout_ms: expired.timeout_ms,
                }),
            );
        }
    }

    /// Stop the loop, fail everything waiting on it with `err` and drop
    /// the activation.
    ///
    /// Running sequences report the failure through their own completion;
    /// only an idle session emits `SessionError` directly.
    pub(crate) fn fail_session(&mut self, err: DriverError) -> Result<(), DriverError> {
        error!(error = %err, "Read loop failed");
        self.read_loop_active = false;
        self.assembler.clear();

        if self.machines.is_idle() {
            self.emit(DeviceEvent::SessionError {
                message: err.to_string(),
            });
        }
        for continuation in self.dispatcher.drain() {
            continuation(self, Err(err.duplicate()));
        }
        while let Some(continuation) = self.deferred.pop_front() {
            continuation(self, Err(err.duplicate()));
        }
        machine::abort_all(self, || err.duplicate());

        // Nothing reads the device any more; a new activation is required.
        self.shutdown_bridge();
        self.activated = false;
        Err(err)
    }
}
