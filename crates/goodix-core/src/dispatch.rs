//! Pending-command table.
//!
//! Replies carry no sequence number, so the dispatcher correlates them by
//! kind: at most one continuation may wait for a given reply kind, and at
//! most one command may be waiting for its ACK. A second registration for
//! an occupied slot is refused with `DriverError::Busy` instead of
//! replacing the first.
//!
//! The dispatcher never invokes continuations itself. It hands them back to
//! the owner, which calls them with mutable access to itself.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::DriverError;
use crate::protocol::{Command, Reply, ReplyKind};

/// Called exactly once with the reply, or with the error that ended the wait.
pub type Continuation<C> = Box<dyn FnOnce(&mut C, Result<Reply, DriverError>)>;

struct Pending<C> {
    /// `None` for raw TLS waits, which are not tied to a command.
    command: Option<Command>,
    kind: ReplyKind,
    awaiting_ack: bool,
    timeout_ms: u64,
    deadline: Option<Instant>,
    continuation: Continuation<C>,
}

/// A continuation whose wait timed out.
pub struct Expired<C> {
    pub kind: ReplyKind,
    pub timeout_ms: u64,
    pub continuation: Continuation<C>,
}

pub struct Dispatcher<C> {
    /// Registration order, oldest first.
    pending: Vec<Pending<C>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Register a continuation for `command`.
    ///
    /// `timeout_ms == 0` waits indefinitely.
    pub fn register(
        &mut self,
        command: Command,
        timeout_ms: u64,
        now: Instant,
        continuation: Continuation<C>,
    ) -> Result<(), DriverError> {
        self.insert(
            Some(command),
            command.reply_kind(),
            command.expects_ack(),
            timeout_ms,
            now,
            continuation,
        )
    }

    /// Register a continuation for the next raw TLS frame.
    pub fn register_tls(
        &mut self,
        timeout_ms: u64,
        now: Instant,
        continuation: Continuation<C>,
    ) -> Result<(), DriverError> {
        self.insert(None, ReplyKind::Tls, false, timeout_ms, now, continuation)
    }

    /// Check that `command` could be registered right now.
    ///
    /// Lets the caller refuse a send before anything reaches the wire.
    pub fn can_register(&self, command: Command) -> Result<(), DriverError> {
        self.check_slot(command.reply_kind(), command.expects_ack())
    }

    fn check_slot(&self, kind: ReplyKind, awaiting_ack: bool) -> Result<(), DriverError> {
        if awaiting_ack && self.pending.iter().any(|p| p.awaiting_ack) {
            return Err(DriverError::Busy(ReplyKind::Ack));
        }
        if kind != ReplyKind::None && self.pending.iter().any(|p| p.kind == kind) {
            return Err(DriverError::Busy(kind));
        }
        Ok(())
    }

    fn insert(
        &mut self,
        command: Option<Command>,
        kind: ReplyKind,
        awaiting_ack: bool,
        timeout_ms: u64,
        now: Instant,
        continuation: Continuation<C>,
    ) -> Result<(), DriverError> {
        self.check_slot(kind, awaiting_ack)?;

        let deadline = (timeout_ms > 0).then(|| now + Duration::from_millis(timeout_ms));
        trace!(kind = %kind, timeout_ms, "Registered continuation");
        self.pending.push(Pending {
            command,
            kind,
            awaiting_ack,
            timeout_ms,
            deadline,
            continuation,
        });
        Ok(())
    }

    /// Handle an ACK for `command_id`.
    ///
    /// Returns the continuation when the ACK alone completes the command.
    pub fn on_ack(&mut self, command_id: u8) -> Option<Continuation<C>> {
        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.awaiting_ack && p.command.map(Command::id) == Some(command_id))
        else {
            warn!(command = %format!("0x{:02X}", command_id), "Unexpected ACK");
            return None;
        };

        let entry = &mut self.pending[index];
        entry.awaiting_ack = false;
        debug!(command = %format!("0x{:02X}", command_id), "ACK received");
        if entry.kind == ReplyKind::None {
            return Some(self.pending.remove(index).continuation);
        }
        None
    }

    /// Take the continuation waiting for the reply to `command_id`.
    ///
    /// Returns the reply kind to parse the payload with.
    pub fn on_reply(&mut self, command_id: u8) -> Option<(ReplyKind, Continuation<C>)> {
        let kind = Command::from_id(command_id)?.reply_kind();
        if matches!(kind, ReplyKind::None | ReplyKind::Tls) {
            return None;
        }
        let index = self.pending.iter().position(|p| p.kind == kind)?;
        let entry = self.pending.remove(index);
        if entry.awaiting_ack {
            debug!(kind = %kind, "Reply arrived before its ACK");
        }
        Some((kind, entry.continuation))
    }

    /// Take the continuation waiting for raw TLS data.
    pub fn on_tls(&mut self) -> Option<Continuation<C>> {
        let index = self.pending.iter().position(|p| p.kind == ReplyKind::Tls)?;
        Some(self.pending.remove(index).continuation)
    }

    /// Remove every continuation whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Expired<C>> {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            if self.pending[index].deadline.is_some_and(|d| d <= now) {
                let entry = self.pending.remove(index);
                expired.push(Expired {
                    kind: entry.kind,
                    timeout_ms: entry.timeout_ms,
                    continuation: entry.continuation,
                });
            } else {
                index += 1;
            }
        }
        expired
    }

    /// Take the oldest continuation, to report a corrupted frame to it.
    pub fn take_oldest(&mut self) -> Option<Continuation<C>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.pending.remove(0).continuation)
    }

    /// Remove every continuation, oldest first.
    pub fn drain(&mut self) -> Vec<Continuation<C>> {
        self.pending.drain(..).map(|p| p.continuation).collect()
    }

    pub fn is_pending(&self, kind: ReplyKind) -> bool {
        self.pending.iter().any(|p| p.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records what each continuation was called with.
    #[derive(Default)]
    struct Log {
        calls: Vec<String>,
    }

    fn record(tag: &'static str) -> Continuation<Log> {
        Box::new(move |log: &mut Log, result| {
            let outcome = match result {
                Ok(reply) => format!("{tag}: {reply:?}"),
                Err(e) => format!("{tag}: {e}"),
            };
            log.calls.push(outcome);
        })
    }

    #[test]
    fn test_timeout_fires_once() {
        let mut dispatcher = Dispatcher::new();
        let mut log = Log::default();
        let start = Instant::now();

        dispatcher
            .register(Command::FirmwareVersion, 50, start, record("fw"))
            .unwrap();
        assert!(dispatcher.take_expired(start + Duration::from_millis(10)).is_empty());

        for expired in dispatcher.take_expired(start + Duration::from_millis(60)) {
            let err = DriverError::Timeout {
                kind: expired.kind,
                timeout_ms: expired.timeout_ms,
            };
            (expired.continuation)(&mut log, Err(err));
        }
        assert_eq!(log.calls.len(), 1);
        assert!(log.calls[0].contains("within 50ms"));

        // A late reply finds nothing to resolve.
        assert!(dispatcher.on_ack(Command::FirmwareVersion.id()).is_none());
        assert!(dispatcher.on_reply(Command::FirmwareVersion.id()).is_none());
        assert_eq!(log.calls.len(), 1);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let mut dispatcher: Dispatcher<Log> = Dispatcher::new();
        let start = Instant::now();
        dispatcher
            .register(Command::McuSwitchToFdtDown, 0, start, record("fdt"))
            .unwrap();
        assert!(dispatcher
            .take_expired(start + Duration::from_secs(3600))
            .is_empty());
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_ack_only_command_resolves_on_ack() {
        let mut dispatcher = Dispatcher::new();
        let mut log = Log::default();
        dispatcher
            .register(Command::EnableChip, 100, Instant::now(), record("enable"))
            .unwrap();

        let continuation = dispatcher.on_ack(Command::EnableChip.id()).unwrap();
        continuation(&mut log, Ok(Reply::None));
        assert_eq!(log.calls, vec!["enable: None".to_string()]);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_reply_waits_for_matching_kind() {
        let mut dispatcher: Dispatcher<Log> = Dispatcher::new();
        dispatcher
            .register(Command::Reset, 100, Instant::now(), record("reset"))
            .unwrap();

        assert!(dispatcher.on_ack(Command::Reset.id()).is_none());
        assert!(dispatcher.on_reply(Command::FirmwareVersion.id()).is_none());
        let (kind, _) = dispatcher.on_reply(Command::Reset.id()).unwrap();
        assert_eq!(kind, ReplyKind::Reset);
    }

    #[test]
    fn test_second_send_of_same_kind_is_busy() {
        let mut dispatcher: Dispatcher<Log> = Dispatcher::new();
        let now = Instant::now();
        dispatcher
            .register(Command::McuSwitchToFdtMode, 0, now, record("mode"))
            .unwrap();
        dispatcher.on_ack(Command::McuSwitchToFdtMode.id());

        let err = dispatcher
            .register(Command::QueryMcuState, 0, now, record("query"))
            .unwrap_err();
        assert!(matches!(err, DriverError::Busy(ReplyKind::Default)));
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_unacknowledged_command_blocks_next_send() {
        let mut dispatcher: Dispatcher<Log> = Dispatcher::new();
        let now = Instant::now();
        dispatcher
            .register(Command::EnableChip, 0, now, record("enable"))
            .unwrap();
        let err = dispatcher
            .register(Command::FirmwareVersion, 0, now, record("fw"))
            .unwrap_err();
        assert!(matches!(err, DriverError::Busy(ReplyKind::Ack)));
        assert!(dispatcher.can_register(Command::FirmwareVersion).is_err());

        dispatcher.on_ack(Command::EnableChip.id());
        assert!(dispatcher.can_register(Command::FirmwareVersion).is_ok());
    }

    #[test]
    fn test_tls_wait_and_drain() {
        let mut dispatcher = Dispatcher::new();
        let mut log = Log::default();
        let now = Instant::now();
        dispatcher.register_tls(0, now, record("tls")).unwrap();
        assert!(dispatcher.is_pending(ReplyKind::Tls));
        assert!(matches!(
            dispatcher.register_tls(0, now, record("tls2")),
            Err(DriverError::Busy(ReplyKind::Tls))
        ));

        for continuation in dispatcher.drain() {
            continuation(&mut log, Err(DriverError::Cancelled));
        }
        assert_eq!(log.calls, vec!["tls: Operation cancelled".to_string()]);
        assert!(dispatcher.on_tls().is_none());
    }
}
