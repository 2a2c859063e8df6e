//! Command table: id, acknowledgement and reply shape of every MCU command.

use std::fmt;

use super::constants::*;

/// Shape of the reply a command resolves with.
///
/// Replies carry no sequence number, so they are matched to the outstanding
/// command by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    /// The ACK itself; used to reject a second command while one is unacknowledged.
    Ack,
    /// Resolved by the ACK alone.
    None,
    /// `[status]`
    Success,
    /// `[status][number u16 LE]`
    Reset,
    /// NUL-terminated string.
    FirmwareVersion,
    /// `[status][flags u32 LE][len u32 LE][psk...]`
    PskRead,
    /// Opaque payload.
    Default,
    /// Raw TLS records in a `FLAGS_TLS` frame.
    Tls,
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplyKind::Ack => "ACK",
            ReplyKind::None => "NONE",
            ReplyKind::Success => "SUCCESS",
            ReplyKind::Reset => "RESET",
            ReplyKind::FirmwareVersion => "FIRMWARE_VERSION",
            ReplyKind::PskRead => "PSK_READ",
            ReplyKind::Default => "DEFAULT",
            ReplyKind::Tls => "TLS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Nop,
    McuGetImage,
    McuSwitchToFdtDown,
    McuSwitchToFdtUp,
    McuSwitchToFdtMode,
    McuSwitchToIdleMode,
    WriteSensorRegister,
    UploadConfigMcu,
    SetPowerdownScanFrequency,
    EnableChip,
    Reset,
    ReadOtp,
    FirmwareVersion,
    QueryMcuState,
    RequestTlsConnection,
    TlsSuccessfullyEstablished,
    PresetPskRead,
}

impl Command {
    pub const fn id(self) -> u8 {
        match self {
            Command::Nop => CMD_NOP,
            Command::McuGetImage => CMD_MCU_GET_IMAGE,
            Command::McuSwitchToFdtDown => CMD_MCU_SWITCH_TO_FDT_DOWN,
            Command::McuSwitchToFdtUp => CMD_MCU_SWITCH_TO_FDT_UP,
            Command::McuSwitchToFdtMode => CMD_MCU_SWITCH_TO_FDT_MODE,
            Command::McuSwitchToIdleMode => CMD_MCU_SWITCH_TO_IDLE_MODE,
            Command::WriteSensorRegister => CMD_WRITE_SENSOR_REGISTER,
            Command::UploadConfigMcu => CMD_UPLOAD_CONFIG_MCU,
            Command::SetPowerdownScanFrequency => CMD_SET_POWERDOWN_SCAN_FREQUENCY,
            Command::EnableChip => CMD_ENABLE_CHIP,
            Command::Reset => CMD_RESET,
            Command::ReadOtp => CMD_READ_OTP,
            Command::FirmwareVersion => CMD_FIRMWARE_VERSION,
            Command::QueryMcuState => CMD_QUERY_MCU_STATE,
            Command::RequestTlsConnection => CMD_REQUEST_TLS_CONNECTION,
            Command::TlsSuccessfullyEstablished => CMD_TLS_SUCCESSFULLY_ESTABLISHED,
            Command::PresetPskRead => CMD_PRESET_PSK_READ,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }

    pub const ALL: [Command; 17] = [
        Command::Nop,
        Command::McuGetImage,
        Command::McuSwitchToFdtDown,
        Command::McuSwitchToFdtUp,
        Command::McuSwitchToFdtMode,
        Command::McuSwitchToIdleMode,
        Command::WriteSensorRegister,
        Command::UploadConfigMcu,
        Command::SetPowerdownScanFrequency,
        Command::EnableChip,
        Command::Reset,
        Command::ReadOtp,
        Command::FirmwareVersion,
        Command::QueryMcuState,
        Command::RequestTlsConnection,
        Command::TlsSuccessfullyEstablished,
        Command::PresetPskRead,
    ];

    /// Whether the device acknowledges this command.
    pub const fn expects_ack(self) -> bool {
        !matches!(self, Command::Nop)
    }

    /// Whether the outgoing frame carries a checksum.
    pub const fn checksum(self) -> bool {
        !matches!(self, Command::Nop)
    }

    pub const fn reply_kind(self) -> ReplyKind {
        match self {
            Command::Nop
            | Command::McuSwitchToIdleMode
            | Command::WriteSensorRegister
            | Command::EnableChip
            | Command::TlsSuccessfullyEstablished => ReplyKind::None,
            Command::UploadConfigMcu | Command::SetPowerdownScanFrequency => ReplyKind::Success,
            Command::Reset => ReplyKind::Reset,
            Command::FirmwareVersion => ReplyKind::FirmwareVersion,
            Command::PresetPskRead => ReplyKind::PskRead,
            Command::McuSwitchToFdtDown
            | Command::McuSwitchToFdtUp
            | Command::McuSwitchToFdtMode
            | Command::ReadOtp
            | Command::QueryMcuState => ReplyKind::Default,
            Command::McuGetImage | Command::RequestTlsConnection => ReplyKind::Tls,
        }
    }

    /// Whether the command resolves without any message from the device.
    pub const fn is_fire_and_forget(self) -> bool {
        !self.expects_ack() && matches!(self.reply_kind(), ReplyKind::None)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_roundtrip_through_table() {
        for command in Command::ALL {
            assert_eq!(Command::from_id(command.id()), Some(command));
        }
        assert_eq!(Command::from_id(CMD_ACK), None);
    }

    #[test]
    fn test_nop_is_fire_and_forget() {
        assert!(Command::Nop.is_fire_and_forget());
        assert!(!Command::EnableChip.is_fire_and_forget());
        assert_eq!(Command::McuGetImage.reply_kind(), ReplyKind::Tls);
    }
}
