//! Protocol constants for the Goodix TLS sensor family.

// ============================================================================
// Device Identification
// ============================================================================

/// Shenzhen Goodix Technology Vendor ID
pub const GOODIX_VENDOR_ID: u16 = 0x27C6;

/// Goodix 511 Product ID
pub const GOODIX_511_PRODUCT_ID: u16 = 0x5110;

// ============================================================================
// Outer Frame
// ============================================================================

/// Frame magic, ASCII "GX".
pub const FRAME_MAGIC: [u8; 2] = [0x47, 0x58];

/// Magic (2) + flags (1) + little-endian length (2).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest value the length field can carry.
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Frame carries an MCU protocol message.
pub const FLAGS_PROTOCOL: u8 = 0xA0;

/// Frame carries raw TLS records.
pub const FLAGS_TLS: u8 = 0xB0;

/// Set when the body ends with a checksum byte.
pub const FLAG_CHECKSUM: u8 = 0x01;

/// Checksum seed: `CHECKSUM_SEED - (sum & 0xFF)`.
pub const CHECKSUM_SEED: u8 = 0xAA;

/// Default bound for the reassembly buffer.
pub const DEFAULT_MAX_PENDING: usize = 0x18000;

// ============================================================================
// Inner Protocol Message
// ============================================================================

/// Command id (1) + little-endian payload length (2).
pub const MESSAGE_HEADER_SIZE: usize = 3;

// ============================================================================
// Command IDs (Host -> Device)
// ============================================================================

pub const CMD_NOP: u8 = 0x00;
pub const CMD_MCU_GET_IMAGE: u8 = 0x20;
pub const CMD_MCU_SWITCH_TO_FDT_DOWN: u8 = 0x32;
pub const CMD_MCU_SWITCH_TO_FDT_UP: u8 = 0x34;
pub const CMD_MCU_SWITCH_TO_FDT_MODE: u8 = 0x36;
pub const CMD_MCU_SWITCH_TO_IDLE_MODE: u8 = 0x70;
pub const CMD_WRITE_SENSOR_REGISTER: u8 = 0x80;
pub const CMD_UPLOAD_CONFIG_MCU: u8 = 0x90;
pub const CMD_SET_POWERDOWN_SCAN_FREQUENCY: u8 = 0x94;
pub const CMD_ENABLE_CHIP: u8 = 0x96;
pub const CMD_RESET: u8 = 0xA2;
pub const CMD_READ_OTP: u8 = 0xA6;
pub const CMD_FIRMWARE_VERSION: u8 = 0xA8;
pub const CMD_QUERY_MCU_STATE: u8 = 0xAE;
pub const CMD_REQUEST_TLS_CONNECTION: u8 = 0xD0;
pub const CMD_TLS_SUCCESSFULLY_ESTABLISHED: u8 = 0xD4;
pub const CMD_PRESET_PSK_READ: u8 = 0xE4;

// ============================================================================
// Device -> Host
// ============================================================================

/// Acknowledgement message; payload is `[acked command id, status]`.
pub const CMD_ACK: u8 = 0xB0;

/// Status byte of a successful "success"/"reset" reply.
pub const REPLY_STATUS_OK: u8 = 0x01;

/// Status byte of a successful PSK read (the PSK reply inverts the convention).
pub const PSK_STATUS_OK: u8 = 0x00;

// ============================================================================
// Command Payload Constants
// ============================================================================

/// Payload of QUERY_MCU_STATE.
pub const QUERY_MCU_STATE_PAYLOAD: [u8; 1] = [0x55];

/// Payload of MCU_GET_IMAGE.
pub const GET_IMAGE_PAYLOAD: [u8; 2] = [0x01, 0x00];

/// Payload of commands that take no arguments.
pub const EMPTY_PAYLOAD: [u8; 2] = [0x00, 0x00];

/// Payload of NOP.
pub const NOP_PAYLOAD: [u8; 4] = [0x00; 4];

/// RESET flag: reset the sensor (as opposed to a soft MCU reset).
pub const RESET_SENSOR: u8 = 0x01;

/// WRITE_SENSOR_REGISTER "multiple registers" flag; single writes only.
pub const WRITE_REGISTER_SINGLE: u8 = 0x00;

// ============================================================================
// TLS
// ============================================================================

/// The device authenticates with an all-zero 32-byte PSK.
pub const TLS_PSK_LEN: usize = 32;

/// Maximum bytes drained from the device side of the bridge in one go.
pub const TLS_MAX_FLIGHT: usize = 0x4000;
