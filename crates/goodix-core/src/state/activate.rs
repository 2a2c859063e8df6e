//! Device bring-up.
//!
//! Start the read loop, enable the chip, verify firmware, PSK and reset
//! number, idle the MCU, apply the OTP calibration, upload the MCU
//! configuration and set the power-down scan frequency. Success hands over
//! to TLS establishment.

use tracing::{debug, error, info};

use super::machine::{self, Ssm, Step, then};
use super::tls;
use crate::error::{DriverError, ProtocolError};
use crate::events::{DeviceEvent, DeviceObserver};
use crate::protocol::constants::{EMPTY_PAYLOAD, NOP_PAYLOAD, RESET_SENSOR, WRITE_REGISTER_SINGLE};
use crate::protocol::{Command, Reply, ReplyKind};
use crate::session::DeviceSession;
use crate::transport::UsbTransport;

type Session<T, O> = DeviceSession<T, O>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivateState {
    ReadAndNop,
    EnableChip,
    Nop,
    CheckFirmware,
    CheckPsk,
    Reset,
    SetMcuIdle,
    ReadOtp,
    UploadMcuConfig,
    SetPowerdownScanFrequency,
}

impl ActivateState {
    const ALL: [ActivateState; 10] = [
        ActivateState::ReadAndNop,
        ActivateState::EnableChip,
        ActivateState::Nop,
        ActivateState::CheckFirmware,
        ActivateState::CheckPsk,
        ActivateState::Reset,
        ActivateState::SetMcuIdle,
        ActivateState::ReadOtp,
        ActivateState::UploadMcuConfig,
        ActivateState::SetPowerdownScanFrequency,
    ];
}

pub(crate) fn machine<T, O>() -> Ssm<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    Ssm::new("activate", ActivateState::ALL.len(), run_state::<T, O>)
}

fn run_state<T, O>(dev: &mut Session<T, O>, state: usize) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let Some(&state) = ActivateState::ALL.get(state) else {
        return Step::Fail(DriverError::InvalidState);
    };

    match state {
        ActivateState::ReadAndNop => {
            dev.start_read_loop();
            dev.send(Command::Nop, &NOP_PAYLOAD, then(advance)).into()
        }
        ActivateState::EnableChip => dev
            .send(Command::EnableChip, &[0x01, 0x00], then(advance))
            .into(),
        ActivateState::Nop => dev.send(Command::Nop, &NOP_PAYLOAD, then(advance)).into(),
        ActivateState::CheckFirmware => dev
            .send(Command::FirmwareVersion, &EMPTY_PAYLOAD, then(check_firmware))
            .into(),
        ActivateState::CheckPsk => {
            let mut payload = dev.model.psk_flags().to_le_bytes().to_vec();
            payload.extend_from_slice(&0u32.to_le_bytes());
            dev.send(Command::PresetPskRead, &payload, then(check_psk)).into()
        }
        ActivateState::Reset => {
            let payload = [RESET_SENSOR, dev.config.reset_sleep_ms];
            dev.send(Command::Reset, &payload, then(check_reset)).into()
        }
        ActivateState::SetMcuIdle => {
            let payload = [dev.config.idle_sleep_ms, 0x00];
            dev.send(Command::McuSwitchToIdleMode, &payload, then(advance))
                .into()
        }
        ActivateState::ReadOtp => dev
            .send(Command::ReadOtp, &EMPTY_PAYLOAD, then(apply_otp))
            .into(),
        ActivateState::UploadMcuConfig => {
            let blob = dev.model.config_blob().to_vec();
            dev.send(
                Command::UploadConfigMcu,
                &blob,
                then(|_, reply| expect_success(Command::UploadConfigMcu, reply)),
            )
            .into()
        }
        ActivateState::SetPowerdownScanFrequency => {
            let payload = dev.config.powerdown_scan_frequency.to_le_bytes();
            dev.send(
                Command::SetPowerdownScanFrequency,
                &payload,
                then(|_, reply| expect_success(Command::SetPowerdownScanFrequency, reply)),
            )
            .into()
        }
    }
}

fn advance<C>(_: &mut C, _: Reply) -> Step<C> {
    Step::Next
}

fn unexpected<C>(kind: ReplyKind, reply: Reply) -> Step<C> {
    Step::Fail(
        ProtocolError::UnexpectedReply {
            kind,
            detail: format!("{reply:?}"),
        }
        .into(),
    )
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn check_firmware<T, O>(dev: &mut Session<T, O>, reply: Reply) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let Reply::FirmwareVersion(actual) = reply else {
        return unexpected(ReplyKind::FirmwareVersion, reply);
    };
    debug!(firmware = %actual, "Device firmware");

    let expected = dev.model.firmware_version();
    if actual != expected {
        return Step::Fail(
            ProtocolError::UnexpectedFirmware {
                expected: expected.to_string(),
                actual,
            }
            .into(),
        );
    }
    Step::Next
}

fn check_psk<T, O>(dev: &mut Session<T, O>, reply: Reply) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let Reply::PresetPsk {
        success,
        flags,
        psk,
    } = reply
    else {
        return unexpected(ReplyKind::PskRead, reply);
    };
    if !success {
        let reason = "device failed to read its PSK".to_string();
        return Step::Fail(ProtocolError::UnexpectedPsk(reason).into());
    }
    debug!(psk = %hex(&psk), flags = %format!("0x{:08x}", flags), "Device PSK");

    if flags != dev.model.psk_flags() {
        return Step::Fail(ProtocolError::UnexpectedPsk(format!("flags 0x{flags:08x}")).into());
    }
    if psk != dev.model.psk() {
        return Step::Fail(ProtocolError::UnexpectedPsk(format!("0x{}", hex(&psk))).into());
    }
    Step::Next
}

fn check_reset<T, O>(dev: &mut Session<T, O>, reply: Reply) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let Reply::Reset { success, number } = reply else {
        return unexpected(ReplyKind::Reset, reply);
    };
    if !success {
        return Step::Fail(
            ProtocolError::CommandFailed {
                command: Command::Reset.id(),
            }
            .into(),
        );
    }
    debug!(number, "Device reset number");

    let expected = dev.model.reset_number();
    if number != expected {
        return Step::Fail(
            ProtocolError::UnexpectedReset {
                expected,
                actual: number,
            }
            .into(),
        );
    }
    Step::Next
}

fn expect_success<C>(command: Command, reply: Reply) -> Step<C> {
    match reply {
        Reply::Success(true) => Step::Next,
        Reply::Success(false) => Step::Fail(
            ProtocolError::CommandFailed {
                command: command.id(),
            }
            .into(),
        ),
        other => unexpected(ReplyKind::Success, other),
    }
}

/// Turn the OTP block into register writes and run them as a child machine.
fn apply_otp<T, O>(dev: &mut Session<T, O>, reply: Reply) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let otp = match reply.into_bytes() {
        Ok(otp) => otp,
        Err(e) => return Step::Fail(e.into()),
    };
    match dev.model.calibration_writes(&otp) {
        Ok(writes) => {
            debug!(len = otp.len(), writes = writes.len(), "OTP read");
            dev.otp_writes = writes;
            Step::Child(Ssm::new("otp_write", dev.otp_writes.len(), otp_write_state::<T, O>))
        }
        Err(e) => Step::Fail(e.into()),
    }
}

fn otp_write_state<T, O>(dev: &mut Session<T, O>, state: usize) -> Step<Session<T, O>>
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    let Some(&(address, value)) = dev.otp_writes.get(state) else {
        return Step::Fail(DriverError::InvalidState);
    };
    let mut payload = vec![WRITE_REGISTER_SINGLE];
    payload.extend_from_slice(&address.to_le_bytes());
    payload.extend_from_slice(&value.to_le_bytes());
    dev.send(Command::WriteSensorRegister, &payload, then(advance)).into()
}

pub(crate) fn on_complete<T, O>(dev: &mut Session<T, O>, result: Result<(), DriverError>)
where
    T: UsbTransport + 'static,
    O: DeviceObserver + 'static,
{
    dev.otp_writes.clear();
    match result {
        Ok(()) => {
            info!("Bring-up complete, establishing TLS");
            let started = dev
                .start_tls_bridge()
                .and_then(|()| machine::start(dev, tls::machine(), tls::on_complete::<T, O>));
            if let Err(e) = started {
                error!(error = %e, "Failed to start TLS");
                dev.shutdown_bridge();
                dev.emit(DeviceEvent::ActivationFailed {
                    message: e.to_string(),
                });
            }
        }
        Err(e) if e.is_cancelled() => debug!("Activation cancelled"),
        Err(e) => {
            error!(error = %e, "Activation failed");
            dev.emit(DeviceEvent::ActivationFailed {
                message: e.to_string(),
            });
        }
    }
}
