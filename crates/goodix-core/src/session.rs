//! Device session - owns the transport, dispatcher, state machines and TLS
//! bridge of one activated sensor.
//!
//! Everything here runs on the caller's thread. Commands are written
//! immediately; their replies are delivered by [`DeviceSession::pump_once`],
//! which must be called repeatedly while the device is active.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{Continuation, Dispatcher};
use crate::error::DriverError;
use crate::events::{DeviceEvent, DeviceObserver, PacketDirection, TracingObserver};
use crate::model::SensorModel;
use crate::protocol::constants::{FLAGS_PROTOCOL, FLAGS_TLS, MAX_FRAME_BODY};
use crate::protocol::{Command, FrameAssembler, ProtocolMessage, frame};
use crate::state::machine::{self, SsmHost, SsmStack};
use crate::state::{activate, scan};
use crate::tls::TlsBridge;
use crate::transport::UsbTransport;

/// Configuration for a device session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-transfer USB timeout.
    pub usb_timeout_ms: u64,
    /// Reply timeout of ordinary commands. Finger detection waits forever.
    pub command_timeout_ms: u64,
    /// Bound on every wait for the TLS worker, and on TLS frames from the device.
    pub tls_timeout_ms: u64,
    /// Bytes requested per bulk IN read.
    pub read_chunk_size: usize,
    /// Bound of the frame reassembly buffer.
    pub max_pending_bytes: usize,
    /// Device-side settle time after a sensor reset.
    pub reset_sleep_ms: u8,
    /// Device-side settle time when switching the MCU to idle.
    pub idle_sleep_ms: u8,
    pub powerdown_scan_frequency: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            usb_timeout_ms: 1000,
            command_timeout_ms: 2000,
            tls_timeout_ms: 5000,
            read_chunk_size: 0x2000,
            max_pending_bytes: 0x18000,
            reset_sleep_ms: 20,
            idle_sleep_ms: 20,
            powerdown_scan_frequency: 100,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn usb_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_timeout_ms)
    }

    pub fn tls_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_timeout_ms)
    }
}

/// One sensor, from activation to deactivation.
pub struct DeviceSession<T: UsbTransport, O: DeviceObserver> {
    pub(crate) transport: T,
    pub(crate) observer: Arc<O>,
    pub(crate) model: Box<dyn SensorModel>,
    pub(crate) config: SessionConfig,
    pub(crate) assembler: FrameAssembler,
    pub(crate) dispatcher: Dispatcher<Self>,
    pub(crate) machines: SsmStack<Self>,
    /// Continuations of commands that expect no answer, run on the next pump.
    pub(crate) deferred: VecDeque<Continuation<Self>>,
    pub(crate) bridge: Option<TlsBridge>,
    /// Calibration writes derived from the OTP block during activation.
    pub(crate) otp_writes: Vec<(u16, u16)>,
    pub(crate) read_loop_active: bool,
    pub(crate) activated: bool,
}

impl<T: UsbTransport + 'static> DeviceSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, model: Box<dyn SensorModel>, config: SessionConfig) -> Self {
        Self::with_observer(transport, model, config, Arc::new(TracingObserver))
    }
}

impl<T: UsbTransport + 'static, O: DeviceObserver + 'static> DeviceSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(
        transport: T,
        model: Box<dyn SensorModel>,
        config: SessionConfig,
        observer: Arc<O>,
    ) -> Self {
        let assembler = FrameAssembler::with_max_pending(config.max_pending_bytes);
        Self {
            transport,
            observer,
            model,
            config,
            assembler,
            dispatcher: Dispatcher::new(),
            machines: SsmStack::new(),
            deferred: VecDeque::new(),
            bridge: None,
            otp_writes: Vec::new(),
            read_loop_active: false,
            activated: false,
        }
    }

    /// Start device bring-up.
    ///
    /// Returns once the first command is on the wire; the outcome is
    /// reported as `Activated` or `ActivationFailed`.
    #[instrument(skip(self), fields(model = self.model.name()))]
    pub fn activate(&mut self) -> Result<(), DriverError> {
        if self.activated || self.bridge.is_some() {
            return Err(DriverError::InvalidState);
        }
        info!("Activating device");
        machine::start(self, activate::machine(), activate::on_complete::<T, O>)
    }

    /// Run one capture: wait for a finger, read an image, wait for lift.
    pub fn start_scan(&mut self) -> Result<(), DriverError> {
        if !self.activated || !self.read_loop_active {
            return Err(DriverError::NotActivated);
        }
        debug!("Starting scan");
        machine::start(self, scan::machine(), scan::on_complete::<T, O>)
    }

    /// Stop the read loop, cancel everything in flight and close TLS.
    #[instrument(skip(self))]
    pub fn deactivate(&mut self) {
        self.read_loop_active = false;
        self.assembler.clear();

        for continuation in self.dispatcher.drain() {
            continuation(self, Err(DriverError::Cancelled));
        }
        while let Some(continuation) = self.deferred.pop_front() {
            continuation(self, Err(DriverError::Cancelled));
        }
        machine::abort_all(self, || DriverError::Cancelled);

        self.shutdown_bridge();
        self.activated = false;
        info!("Device deactivated");
        self.emit(DeviceEvent::Deactivated);
    }

    /// Pump until no state machine is running.
    pub fn run_until_idle(&mut self) -> Result<(), DriverError> {
        while !self.machines.is_idle() || !self.deferred.is_empty() {
            self.pump_once()?;
        }
        Ok(())
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Whether a sequence is still running.
    pub fn is_busy(&self) -> bool {
        !self.machines.is_idle()
    }

    pub fn has_tls_bridge(&self) -> bool {
        self.bridge.is_some()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn model(&self) -> &dyn SensorModel {
        self.model.as_ref()
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        self.observer.on_event(&event);
    }

    /// Send a command with the default reply timeout.
    pub(crate) fn send(
        &mut self,
        command: Command,
        payload: &[u8],
        continuation: Continuation<Self>,
    ) -> Result<(), DriverError> {
        let timeout_ms = self.config.command_timeout_ms;
        self.send_with_timeout(command, payload, timeout_ms, continuation)
    }

    /// Frame and write `command`, then park `continuation` until it resolves.
    ///
    /// Never blocks on the reply. On error nothing is registered and the
    /// continuation is dropped uncalled.
    pub(crate) fn send_with_timeout(
        &mut self,
        command: Command,
        payload: &[u8],
        timeout_ms: u64,
        continuation: Continuation<Self>,
    ) -> Result<(), DriverError> {
        let message = ProtocolMessage::new(command.id(), payload).encode()?;
        let bytes = frame::encode(FLAGS_PROTOCOL, &message, command.checksum())?;

        if command.is_fire_and_forget() {
            self.write_frame(&bytes)?;
            self.deferred.push_back(continuation);
        } else {
            self.dispatcher.can_register(command)?;
            self.write_frame(&bytes)?;
            self.dispatcher
                .register(command, timeout_ms, Instant::now(), continuation)?;
        }
        debug!(command = %command, len = payload.len(), timeout_ms, "Command sent");
        Ok(())
    }

    /// Wait for the next raw TLS frame from the device.
    pub(crate) fn expect_tls(&mut self, continuation: Continuation<Self>) -> Result<(), DriverError> {
        let timeout_ms = self.config.tls_timeout_ms;
        self.dispatcher
            .register_tls(timeout_ms, Instant::now(), continuation)
    }

    /// Send TLS records to the device, split across frames as needed.
    pub(crate) fn write_tls(&mut self, records: &[u8]) -> Result<(), DriverError> {
        for chunk in records.chunks(MAX_FRAME_BODY) {
            let bytes = frame::encode(FLAGS_TLS, chunk, false)?;
            self.write_frame(&bytes)?;
        }
        debug!(len = records.len(), "TLS records sent");
        Ok(())
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        self.transport.write(bytes)?;
        self.emit(DeviceEvent::Packet {
            direction: PacketDirection::Tx,
            flags: bytes.get(2).copied().unwrap_or_default(),
            length: bytes.len(),
        });
        Ok(())
    }

    pub(crate) fn bridge_mut(&mut self) -> Result<&mut TlsBridge, DriverError> {
        self.bridge.as_mut().ok_or(DriverError::NotActivated)
    }

    pub(crate) fn start_tls_bridge(&mut self) -> Result<(), DriverError> {
        if self.bridge.is_some() {
            warn!("TLS bridge already running");
            return Err(DriverError::InvalidState);
        }
        self.bridge = Some(TlsBridge::start(self.config.tls_timeout())?);
        Ok(())
    }

    pub(crate) fn shutdown_bridge(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.shutdown();
        }
    }
}

impl<T: UsbTransport, O: DeviceObserver> SsmHost for DeviceSession<T, O> {
    fn machines(&mut self) -> &mut SsmStack<Self> {
        &mut self.machines
    }
}
