//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{GOODIX_511_PRODUCT_ID, GOODIX_VENDOR_ID};
#[cfg(test)]
use crate::protocol::constants::{CMD_ACK, FLAGS_PROTOCOL, FLAGS_TLS};
#[cfg(test)]
use crate::protocol::{FrameAssembler, FrameKind, ProtocolMessage, frame};

/// Scripted transport: reads pop queued transfers, writes are captured.
///
/// Clones share the same queues, so a test can keep a handle while the
/// session owns another.
#[derive(Clone)]
pub struct MockTransport {
    read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    vid: u16,
    pid: u16,
    connected: Arc<Mutex<bool>>,
    read_timeout_ms: u64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            vid: GOODIX_VENDOR_ID,
            pid: GOODIX_511_PRODUCT_ID,
            connected: Arc::new(Mutex::new(true)),
            read_timeout_ms: 1000,
        }
    }

    /// Queue one transfer to be returned by the next read.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.read_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Transfers not yet consumed by a read.
    pub fn pending_reads(&self) -> usize {
        self.read_queue.lock().unwrap().len()
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }
}

/// Codec-aware helpers for tests that script whole device messages.
#[cfg(test)]
impl MockTransport {
    /// Queue a checksummed protocol frame.
    pub fn queue_message(&self, command: u8, payload: &[u8]) {
        let body = ProtocolMessage::new(command, payload.to_vec())
            .encode()
            .unwrap();
        self.queue_read(&frame::encode(FLAGS_PROTOCOL, &body, true).unwrap());
    }

    /// Queue an ACK for `command`.
    pub fn queue_ack(&self, command: u8) {
        self.queue_message(CMD_ACK, &[command, 0x01]);
    }

    /// Queue a raw TLS frame.
    pub fn queue_tls(&self, records: &[u8]) {
        self.queue_read(&frame::encode(FLAGS_TLS, records, false).unwrap());
    }

    /// Command ids of every protocol message written so far, in order.
    pub fn written_commands(&self) -> Vec<u8> {
        let mut assembler = FrameAssembler::new();
        let mut commands = Vec::new();
        for write in self.get_writes() {
            assembler.push(&write).unwrap();
            while let Some(frame) = assembler.next_frame() {
                let frame = frame.unwrap();
                if frame.kind() == FrameKind::Protocol {
                    commands.push(ProtocolMessage::decode(&frame.payload).unwrap().command);
                }
            }
        }
        commands
    }

    /// Concatenated payloads of every TLS frame written so far.
    pub fn written_tls(&self) -> Vec<u8> {
        let mut assembler = FrameAssembler::new();
        let mut records = Vec::new();
        for write in self.get_writes() {
            assembler.push(&write).unwrap();
            while let Some(frame) = assembler.next_frame() {
                let frame = frame.unwrap();
                if frame.kind() == FrameKind::Tls {
                    records.extend(frame.payload);
                }
            }
        }
        records
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let mut queue = self.read_queue.lock().unwrap();
        let mut next = queue.pop_front().ok_or(TransportError::Timeout {
            timeout_ms: self.read_timeout_ms,
        })?;
        if next.len() > max_len {
            let rest = next.split_off(max_len);
            queue.push_front(rest);
        }
        Ok(next)
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
