//! One capture: finger down, image, finger up.

use tracing::{debug, error, trace};

use super::machine::{Ssm, Step, then};
use crate::error::DriverError;
use crate::events::{DeviceEvent, DeviceObserver};
use crate::image;
use crate::protocol::constants::{GET_IMAGE_PAYLOAD, QUERY_MCU_STATE_PAYLOAD};
use crate::protocol::{Command, Reply};
use crate::session::DeviceSession;
use crate::transport::UsbTransport;

type Session<T, O> = DeviceSession<T, O>;

const QUERY_MCU: usize = 0;
const SWITCH_TO_FDT_MODE: usize = 1;
const SWITCH_TO_FDT_DOWN: usize = 2;
const GET_IMAGE: usize = 3;
const SWITCH_TO_FDT_UP: usize = 4;
const FDT_DONE: usize = 5;
const NUM_STATES: usize = 6;

/// Finger transitions are awaited without a deadline.
const WAIT_FOREVER: u64 = 0;

pub(crate) fn machine<T, O>() -> Ssm<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    Ssm::new("scan", NUM_STATES, run_state::<T, O>)
}

fn run_state<T, O>(dev: &mut Session<T, O>, state: usize) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    match state {
        QUERY_MCU => dev
            .send(Command::QueryMcuState, &QUERY_MCU_STATE_PAYLOAD, then(advance))
            .into(),
        SWITCH_TO_FDT_MODE => {
            let mcu_config = dev.model.mcu_config().to_vec();
            dev.send(Command::McuSwitchToFdtMode, &mcu_config, then(advance))
                .into()
        }
        SWITCH_TO_FDT_DOWN => {
            let mcu_config = dev.model.mcu_config().to_vec();
            dev.send_with_timeout(
                Command::McuSwitchToFdtDown,
                &mcu_config,
                WAIT_FOREVER,
                then(advance),
            )
            .into()
        }
        GET_IMAGE => {
            dev.emit(DeviceEvent::FingerStatus { present: true });
            dev.send(
                Command::McuGetImage,
                &GET_IMAGE_PAYLOAD,
                then(on_image_records::<T, O>),
            )
            .into()
        }
        SWITCH_TO_FDT_UP => {
            let mcu_config = dev.model.mcu_config().to_vec();
            dev.send_with_timeout(
                Command::McuSwitchToFdtUp,
                &mcu_config,
                WAIT_FOREVER,
                then(advance),
            )
            .into()
        }
        FDT_DONE => {
            dev.emit(DeviceEvent::FingerStatus { present: false });
            Step::Next
        }
        _ => Step::Fail(DriverError::InvalidState),
    }
}

fn advance<C>(_: &mut C, _: Reply) -> Step<C> {
    Step::Next
}

fn on_image_records<T, O>(dev: &mut Session<T, O>, reply: Reply) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    receive_image(dev, reply).unwrap_or_else(Step::Fail)
}

/// Feed image records to the bridge until a whole raw frame decrypts.
fn receive_image<T, O>(
    dev: &mut Session<T, O>,
    reply: Reply,
) -> Result<Step<Session<T, O>>, DriverError>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let records = reply.into_bytes()?;
    let len = dev.model.raw_frame_len();

    let bridge = dev.bridge_mut()?;
    bridge.write_to_device_side(&records)?;
    bridge.request_plaintext(len)?;
    match bridge.poll_plaintext()? {
        Some(raw) => {
            capture(dev, &raw)?;
            Ok(Step::Next)
        }
        None => {
            trace!(len = records.len(), "Image incomplete, waiting for more records");
            dev.expect_tls(then(on_image_records::<T, O>))?;
            Ok(Step::Wait)
        }
    }
}

fn capture<T, O>(dev: &mut Session<T, O>, raw: &[u8]) -> Result<(), DriverError>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let samples = image::decode_frame(raw)?;
    let squashed = image::squash_frame_linear(&samples);
    let image = dev.model.process_frame(&squashed)?;
    debug!(width = image.width, height = image.height, "Image decoded");
    dev.emit(DeviceEvent::ImageCaptured(image));
    Ok(())
}

pub(crate) fn on_complete<T, O>(dev: &mut Session<T, O>, result: Result<(), DriverError>)
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    match result {
        Ok(()) => debug!("Scan finished"),
        Err(e) if e.is_cancelled() => debug!("Scan cancelled"),
        Err(e) => {
            error!(error = %e, "Scan failed");
            dev.emit(DeviceEvent::SessionError {
                message: e.to_string(),
            });
        }
    }
}
