//! TLS establishment over the device channel.
//!
//! The device is the TLS client. It sends its ClientHello in answer to
//! REQUEST_TLS_CONNECTION. Every TLS frame from the device is fed to the
//! bridge, and whatever the server wrote in reaction is relayed back as
//! `FLAGS_TLS` frames, until the server reports the handshake complete.
//! Either side's flight may span several frames.

use tracing::{debug, error, info, trace};

use super::machine::{Ssm, Step, then};
use crate::error::DriverError;
use crate::events::{DeviceEvent, DeviceObserver};
use crate::protocol::constants::EMPTY_PAYLOAD;
use crate::protocol::{Command, Reply};
use crate::session::DeviceSession;
use crate::tls::HandshakeProgress;
use crate::transport::UsbTransport;

type Session<T, O> = DeviceSession<T, O>;

const REQUEST_CONNECTION: usize = 0;
const EXCHANGE_FLIGHTS: usize = 1;
const NOTIFY_ESTABLISHED: usize = 2;
const NUM_STATES: usize = 3;

pub(crate) fn machine<T, O>() -> Ssm<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    Ssm::new("tls", NUM_STATES, run_state::<T, O>)
}

fn run_state<T, O>(dev: &mut Session<T, O>, state: usize) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let step = match state {
        REQUEST_CONNECTION => dev
            .send(
                Command::RequestTlsConnection,
                &EMPTY_PAYLOAD,
                then(feed_and_exchange::<T, O>),
            )
            .map(|()| Step::Wait),
        EXCHANGE_FLIGHTS => exchange_flights(dev),
        NOTIFY_ESTABLISHED => dev
            .send(
                Command::TlsSuccessfullyEstablished,
                &EMPTY_PAYLOAD,
                then(|_, _| Step::Next),
            )
            .map(|()| Step::Wait),
        _ => Err(DriverError::InvalidState),
    };
    step.unwrap_or_else(Step::Fail)
}

/// Push device records into the bridge.
fn feed<T, O>(dev: &mut Session<T, O>, reply: Reply) -> Result<(), DriverError>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let records = reply.into_bytes()?;
    trace!(len = records.len(), "Device TLS records");
    dev.bridge_mut()?.write_to_device_side(&records)?;
    Ok(())
}

fn feed_and_exchange<T, O>(dev: &mut Session<T, O>, reply: Reply) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    match feed(dev, reply) {
        Ok(()) => Step::Jump(EXCHANGE_FLIGHTS),
        Err(e) => Step::Fail(e),
    }
}

/// Relay the server's reaction to everything fed so far, then either wait
/// for more device records or move on once the handshake is complete.
fn exchange_flights<T, O>(dev: &mut Session<T, O>) -> Result<Step<Session<T, O>>, DriverError>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let bridge = dev.bridge_mut()?;
    let progress = bridge.handshake_progress()?;
    let flight = bridge.take_outgoing();
    if !flight.is_empty() {
        debug!(len = flight.len(), "Relaying server flight");
        dev.write_tls(&flight)?;
    }

    match progress {
        HandshakeProgress::Established => Ok(Step::Next),
        HandshakeProgress::NeedInput => {
            trace!("Server waits for more device records");
            dev.expect_tls(then(feed_and_exchange::<T, O>))?;
            Ok(Step::Wait)
        }
    }
}

pub(crate) fn on_complete<T, O>(dev: &mut Session<T, O>, result: Result<(), DriverError>)
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    match result {
        Ok(()) => {
            info!("TLS established");
            dev.activated = true;
            dev.emit(DeviceEvent::Activated);
        }
        Err(e) => {
            dev.shutdown_bridge();
            if e.is_cancelled() {
                debug!("TLS establishment cancelled");
                return;
            }
            error!(error = %e, "TLS establishment failed");
            dev.emit(DeviceEvent::ActivationFailed {
                message: e.to_string(),
            });
        }
    }
}
