//! TLS server whose ciphertext travels over the device's USB channel.
//!
//! A worker thread owns the OpenSSL session exclusively and runs it against
//! a [`PipeEnd`]. The primary context never touches the session: it pushes
//! device bytes into the pipe, collects what the server wrote, and asks the
//! worker for plaintext through a command channel.
//!
//! ```text
//!   device ──USB──> write_to_device_side ──pipe──> SslStream (worker)
//!   device <──USB── read_from_device_side <──pipe── SslStream (worker)
//!                   request_plaintext ──cmd──> read_exact
//!                   poll_plaintext    <──evt── plaintext
//! ```
//!
//! Calls that wait for the worker to react to fed bytes block the caller
//! until the worker reports a milestone, for at most the `timeout` given to
//! [`TlsBridge::start`]. The worker reacts to already buffered input, so the
//! wait normally lasts as long as one OpenSSL step; it never waits on the
//! device.

use std::io::Read;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use openssl::error::ErrorStack;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslVersion};
use tracing::{debug, info, instrument, trace, warn};

use super::pipe::{PipeEnd, PipeSignal};
use crate::error::TlsError;
use crate::protocol::constants::TLS_PSK_LEN;

/// Everything the worker reports back.
#[derive(Debug)]
pub enum BridgeEvent {
    Pipe(PipeSignal),
    Handshake(Result<(), String>),
    Plaintext(Result<Vec<u8>, String>),
}

impl From<PipeSignal> for BridgeEvent {
    fn from(signal: PipeSignal) -> Self {
        BridgeEvent::Pipe(signal)
    }
}

enum WorkerCommand {
    Read(usize),
    Shutdown,
}

/// Where the handshake stands after the server consumed its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// The server wants more bytes from the device.
    NeedInput,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Pending,
    Established,
    Failed,
}

/// What the worker did with the input it was given.
enum Milestone {
    Starved,
    Established,
    Plaintext(Vec<u8>),
}

pub struct TlsBridge {
    incoming: Option<Sender<Vec<u8>>>,
    commands: Option<Sender<WorkerCommand>>,
    events: Receiver<BridgeEvent>,
    worker: Option<JoinHandle<()>>,
    /// Server output not yet relayed to the device.
    outgoing: Vec<u8>,
    /// Chunks pushed into the pipe.
    fed: usize,
    handshake: HandshakeState,
    read_requested: bool,
    timeout: Duration,
}

/// PSK-only, TLS 1.2-only server context.
///
/// The device authenticates with an all-zero key; the identity it presents
/// is not checked.
fn build_context() -> Result<SslContext, ErrorStack> {
    let mut builder = SslContextBuilder::new(SslMethod::tls())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_cipher_list("PSK")?;
    builder.set_psk_server_callback(|_ssl, identity, psk| {
        trace!(identity_len = identity.map_or(0, <[u8]>::len), max_len = psk.len(), "PSK requested");
        if psk.len() < TLS_PSK_LEN {
            warn!(max_len = psk.len(), needed = TLS_PSK_LEN, "PSK buffer too short");
            return Ok(0);
        }
        psk[..TLS_PSK_LEN].fill(0);
        Ok(TLS_PSK_LEN)
    });
    Ok(builder.build())
}

fn run_worker(
    ctx: SslContext,
    pipe: PipeEnd<BridgeEvent>,
    events: Sender<BridgeEvent>,
    commands: Receiver<WorkerCommand>,
) {
    let ssl = match Ssl::new(&ctx) {
        Ok(ssl) => ssl,
        Err(e) => {
            let _ = events.send(BridgeEvent::Handshake(Err(e.to_string())));
            return;
        }
    };

    let mut stream = match ssl.accept(pipe) {
        Ok(stream) => {
            debug!(cipher = ?stream.ssl().current_cipher().map(|c| c.name()), "TLS handshake complete");
            let _ = events.send(BridgeEvent::Handshake(Ok(())));
            stream
        }
        Err(e) => {
            let _ = events.send(BridgeEvent::Handshake(Err(e.to_string())));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::Read(len) => {
                let mut buf = vec![0u8; len];
                let result = stream
                    .read_exact(&mut buf)
                    .map(|_| buf)
                    .map_err(|e| e.to_string());
                let failed = result.is_err();
                let _ = events.send(BridgeEvent::Plaintext(result));
                if failed {
                    return;
                }
            }
            WorkerCommand::Shutdown => {
                if let Err(e) = stream.shutdown() {
                    debug!(error = %e, "TLS close notify failed");
                }
                return;
            }
        }
    }
}

impl TlsBridge {
    /// Create the server and start the accept worker.
    ///
    /// `timeout` bounds every wait on the worker.
    #[instrument(level = "debug")]
    pub fn start(timeout: Duration) -> Result<Self, TlsError> {
        let ctx = build_context().map_err(|e| TlsError::Setup(e.to_string()))?;

        let (incoming_tx, incoming_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();
        let (commands_tx, commands_rx) = mpsc::channel();
        let pipe = PipeEnd::new(incoming_rx, events_tx.clone());

        let worker = thread::Builder::new()
            .name("goodix-tls".into())
            .spawn(move || run_worker(ctx, pipe, events_tx, commands_rx))
            .map_err(|e| TlsError::Setup(e.to_string()))?;

        info!("TLS server started");
        Ok(Self {
            incoming: Some(incoming_tx),
            commands: Some(commands_tx),
            events: events_rx,
            worker: Some(worker),
            outgoing: Vec::new(),
            fed: 0,
            handshake: HandshakeState::Pending,
            read_requested: false,
            timeout,
        })
    }

    /// Hand ciphertext received from the device to the server.
    pub fn write_to_device_side(&mut self, bytes: &[u8]) -> Result<(), TlsError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let incoming = self.incoming.as_ref().ok_or(TlsError::Closed)?;
        incoming.send(bytes.to_vec()).map_err(|_| TlsError::Closed)?;
        self.fed += 1;
        trace!(len = bytes.len(), chunks = self.fed, "Fed device bytes");
        Ok(())
    }

    /// Take up to `max_len` bytes the server wrote for the device.
    ///
    /// During the handshake this first waits until the server has reacted
    /// to everything fed so far, so the result is a complete flight.
    pub fn read_from_device_side(&mut self, max_len: usize) -> Result<Vec<u8>, TlsError> {
        if self.handshake == HandshakeState::Pending {
            self.next_milestone()?;
        }
        let n = max_len.min(self.outgoing.len());
        let flight: Vec<u8> = self.outgoing.drain(..n).collect();
        trace!(len = flight.len(), remaining = self.outgoing.len(), "Drained server output");
        Ok(flight)
    }

    /// Wait until the server has consumed its input and report whether the
    /// handshake completed.
    pub fn handshake_progress(&mut self) -> Result<HandshakeProgress, TlsError> {
        match self.handshake {
            HandshakeState::Established => return Ok(HandshakeProgress::Established),
            HandshakeState::Failed => return Err(TlsError::Closed),
            HandshakeState::Pending => {}
        }
        match self.next_milestone()? {
            Milestone::Established => Ok(HandshakeProgress::Established),
            Milestone::Starved => Ok(HandshakeProgress::NeedInput),
            Milestone::Plaintext(_) => Err(TlsError::Handshake(
                "plaintext before handshake completion".into(),
            )),
        }
    }

    /// Take everything the server wrote that has not been relayed yet.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn is_established(&self) -> bool {
        self.handshake == HandshakeState::Established
    }

    /// Ask the worker to decrypt exactly `len` bytes of application data.
    pub fn request_plaintext(&mut self, len: usize) -> Result<(), TlsError> {
        if !self.is_established() {
            return Err(TlsError::NotEstablished);
        }
        if self.read_requested {
            return Ok(());
        }
        let commands = self.commands.as_ref().ok_or(TlsError::Closed)?;
        commands
            .send(WorkerCommand::Read(len))
            .map_err(|_| TlsError::Closed)?;
        self.read_requested = true;
        debug!(len, "Plaintext requested");
        Ok(())
    }

    /// Result of the outstanding plaintext request.
    ///
    /// `None` means the worker consumed all ciphertext fed so far and needs
    /// more from the device.
    pub fn poll_plaintext(&mut self) -> Result<Option<Vec<u8>>, TlsError> {
        if !self.read_requested {
            return Err(TlsError::Read("no plaintext requested".into()));
        }
        match self.next_milestone() {
            Ok(Milestone::Plaintext(data)) => {
                self.read_requested = false;
                Ok(Some(data))
            }
            Ok(Milestone::Starved) | Ok(Milestone::Established) => Ok(None),
            Err(e) => {
                self.read_requested = false;
                Err(e)
            }
        }
    }

    /// Decrypt `len` bytes from ciphertext that has already been fed.
    pub fn read_plaintext(&mut self, len: usize) -> Result<Vec<u8>, TlsError> {
        self.request_plaintext(len)?;
        self.poll_plaintext()?
            .ok_or_else(|| TlsError::Read(format!("ciphertext exhausted before {len} bytes")))
    }

    /// Close the session and join the worker. Safe to call more than once
    /// and before the handshake completed.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(WorkerCommand::Shutdown);
        }
        // Closing the pipe unblocks a worker waiting for ciphertext.
        self.incoming = None;
        if worker.join().is_err() {
            warn!("TLS worker panicked");
        }
        self.handshake = match self.handshake {
            HandshakeState::Established => HandshakeState::Failed,
            other => other,
        };
        info!("TLS server stopped");
    }

    fn next_milestone(&mut self) -> Result<Milestone, TlsError> {
        loop {
            let event = match self.events.recv_timeout(self.timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TlsError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TlsError::Closed),
            };

            match event {
                BridgeEvent::Pipe(PipeSignal::Data(bytes)) => self.outgoing.extend(bytes),
                BridgeEvent::Pipe(PipeSignal::Drained { consumed }) if consumed == self.fed => {
                    return Ok(Milestone::Starved);
                }
                BridgeEvent::Pipe(PipeSignal::Drained { .. }) => {}
                BridgeEvent::Handshake(Ok(())) => {
                    self.handshake = HandshakeState::Established;
                    return Ok(Milestone::Established);
                }
                BridgeEvent::Handshake(Err(message)) => {
                    self.handshake = HandshakeState::Failed;
                    return Err(TlsError::Handshake(message));
                }
                BridgeEvent::Plaintext(Ok(data)) => return Ok(Milestone::Plaintext(data)),
                BridgeEvent::Plaintext(Err(message)) => return Err(TlsError::Read(message)),
            }
        }
    }
}

impl Drop for TlsBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::TLS_MAX_FLIGHT;
    use crate::tls::test_client::PskClient;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Run the handshake up to the point where the client flight is ready.
    fn exchange_hellos(client: &mut PskClient, bridge: &mut TlsBridge) -> Vec<u8> {
        let client_hello = client.flight();
        assert!(!client_hello.is_empty());
        bridge.write_to_device_side(&client_hello).unwrap();

        let server_flight = bridge.read_from_device_side(TLS_MAX_FLIGHT).unwrap();
        assert!(!server_flight.is_empty());
        assert!(!bridge.is_established());

        client.send(&server_flight);
        client.flight()
    }

    #[test]
    fn test_handshake_and_plaintext() {
        let mut client = PskClient::spawn();
        let mut bridge = TlsBridge::start(TIMEOUT).unwrap();

        let client_flight = exchange_hellos(&mut client, &mut bridge);
        bridge.write_to_device_side(&client_flight).unwrap();
        assert_eq!(
            bridge.handshake_progress().unwrap(),
            HandshakeProgress::Established
        );

        let server_finished = bridge.read_from_device_side(TLS_MAX_FLIGHT).unwrap();
        assert!(!server_finished.is_empty());
        client.send(&server_finished);

        let payload = b"raw frame bytes from the sensor";
        let records = client.encrypt(payload);
        bridge.write_to_device_side(&records).unwrap();
        assert_eq!(bridge.read_plaintext(payload.len()).unwrap(), payload);

        bridge.shutdown();
        bridge.shutdown();
        assert!(!bridge.is_established());
    }

    #[test]
    fn test_split_client_flight_needs_input() {
        let mut client = PskClient::spawn();
        let mut bridge = TlsBridge::start(TIMEOUT).unwrap();
        let client_flight = exchange_hellos(&mut client, &mut bridge);

        // Deliver the client flight in two pieces, as separate USB frames would.
        let (first, second) = client_flight.split_at(client_flight.len() / 2);
        bridge.write_to_device_side(first).unwrap();
        assert_eq!(
            bridge.handshake_progress().unwrap(),
            HandshakeProgress::NeedInput
        );
        bridge.write_to_device_side(second).unwrap();
        assert_eq!(
            bridge.handshake_progress().unwrap(),
            HandshakeProgress::Established
        );
    }

    #[test]
    fn test_plaintext_across_several_writes() {
        let mut client = PskClient::spawn();
        let mut bridge = TlsBridge::start(TIMEOUT).unwrap();
        let client_flight = exchange_hellos(&mut client, &mut bridge);
        bridge.write_to_device_side(&client_flight).unwrap();
        bridge.handshake_progress().unwrap();
        client.send(&bridge.read_from_device_side(TLS_MAX_FLIGHT).unwrap());

        let payload = vec![0x5A; 3000];
        let records = client.encrypt(&payload);
        let (first, second) = records.split_at(100);

        bridge.write_to_device_side(first).unwrap();
        bridge.request_plaintext(payload.len()).unwrap();
        assert_eq!(bridge.poll_plaintext().unwrap(), None);
        bridge.write_to_device_side(second).unwrap();
        assert_eq!(bridge.poll_plaintext().unwrap(), Some(payload));
    }

    #[test]
    fn test_garbage_fails_handshake() {
        let mut bridge = TlsBridge::start(TIMEOUT).unwrap();
        bridge
            .write_to_device_side(b"this is not a tls record at all")
            .unwrap();
        assert!(matches!(
            bridge.read_from_device_side(TLS_MAX_FLIGHT),
            Err(TlsError::Handshake(_))
        ));
        assert!(!bridge.is_established());
    }

    #[test]
    fn test_worker_wait_is_bounded() {
        let mut bridge = TlsBridge::start(Duration::from_millis(300)).unwrap();
        assert_eq!(
            bridge.handshake_progress().unwrap(),
            HandshakeProgress::NeedInput
        );
        assert!(bridge.take_outgoing().is_empty());

        // Nothing new was fed, so the worker has nothing to report.
        let started = std::time::Instant::now();
        assert!(matches!(
            bridge.handshake_progress(),
            Err(TlsError::Timeout { timeout_ms: 300 })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_shutdown_before_handshake() {
        let mut bridge = TlsBridge::start(TIMEOUT).unwrap();
        assert!(matches!(
            bridge.request_plaintext(16),
            Err(TlsError::NotEstablished)
        ));
        bridge.shutdown();
        assert!(matches!(
            bridge.write_to_device_side(&[0x16]),
            Err(TlsError::Closed)
        ));
    }
}
