//! NCI protocol constants.
//!
//! Message types, group/opcode identifiers, status codes and the timing
//! values used by the controller family this engine drives.

use std::time::Duration;

// ============================================================================
// Header layout
// ============================================================================

/// Mask of the message type bits in header byte 0.
pub const MT_MASK: u8 = 0xE0;
pub const MT_SHIFT: u8 = 5;
/// Packet boundary flag (segmented control messages).
pub const PBF_MASK: u8 = 0x10;
/// Group identifier bits of header byte 0 (control packets).
pub const GID_MASK: u8 = 0x0F;
/// Opcode identifier bits of header byte 1 (control packets).
pub const OID_MASK: u8 = 0x3F;
/// Connection identifier bits of header byte 0 (data packets).
pub const CONN_ID_MASK: u8 = 0x0F;

/// Control and data packets both carry a 3-byte header.
pub const NCI_HEADER_SIZE: usize = 3;
/// Offset of the payload length byte.
pub const NCI_LEN_OFFSET: usize = 2;
/// Largest frame the link may deliver in one read.
pub const NCI_MAX_FRAME_SIZE: usize = 258;

// ============================================================================
// Message types (top nibble of byte 0)
// ============================================================================

pub const MT_DATA: u8 = 0x00;
pub const MT_CMD: u8 = 0x20;
pub const MT_RSP: u8 = 0x40;
pub const MT_NTF: u8 = 0x60;

// ============================================================================
// Group identifiers
// ============================================================================

pub const GID_CORE: u8 = 0x00;
pub const GID_RF: u8 = 0x01;
pub const GID_NFCEE: u8 = 0x02;
pub const GID_PROPRIETARY: u8 = 0x0F;

// ============================================================================
// Opcodes
// ============================================================================

pub const OID_CORE_RESET: u8 = 0x00;
pub const OID_CORE_INIT: u8 = 0x01;
pub const OID_CORE_SET_CONFIG: u8 = 0x02;
pub const OID_CORE_GET_CONFIG: u8 = 0x03;
pub const OID_CORE_GENERIC_ERROR: u8 = 0x07;

/// Proprietary: enable vendor extensions.
pub const OID_PROP_ENABLE_EXTN: u8 = 0x02;
/// Proprietary: standby / full power selection.
pub const OID_PROP_POWER_MODE: u8 = 0x00;

// ============================================================================
// Status codes
// ============================================================================

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_REJECTED: u8 = 0x01;
pub const STATUS_RF_FRAME_CORRUPTED: u8 = 0x02;
pub const STATUS_FAILED: u8 = 0x03;
pub const STATUS_NOT_INITIALIZED: u8 = 0x04;
pub const STATUS_SYNTAX_ERROR: u8 = 0x05;
pub const STATUS_SEMANTIC_ERROR: u8 = 0x06;
pub const STATUS_INVALID_PARAM: u8 = 0x09;
pub const STATUS_MESSAGE_SIZE_EXCEEDED: u8 = 0x0A;

// ============================================================================
// Canned frames
// ============================================================================

/// CORE_RESET_CMD, keep configuration.
pub const CORE_RESET_CMD: [u8; 4] = [0x20, 0x00, 0x01, 0x00];
/// CORE_INIT_CMD, NCI 1.x.
pub const CORE_INIT_CMD_V1: [u8; 3] = [0x20, 0x01, 0x00];
/// CORE_INIT_CMD, NCI 2.0 (no feature enables).
pub const CORE_INIT_CMD_V2: [u8; 5] = [0x20, 0x01, 0x02, 0x00, 0x00];
/// Synthesized CORE_RESET_NTF delivered upstream after the link was bounced.
pub const CORE_RESET_NTF_RECOVERY: [u8; 9] = [0x60, 0x00, 0x06, 0xA0, 0x00, 0xC7, 0xD4, 0x00, 0x00];
/// Proprietary vendor extension enable.
pub const PROP_ENABLE_EXTN_CMD: [u8; 3] = [0x2F, 0x02, 0x00];

// ============================================================================
// Proprietary configuration parameter identifiers
// ============================================================================

pub const PARAM_CLOCK_SOURCE: u16 = 0xA003;
pub const PARAM_CLOCK_FREQUENCY: u16 = 0xA004;
pub const PARAM_POWER_CONTROL: u16 = 0xA007;

/// Power control value requesting the controller to switch off.
pub const POWER_CONTROL_OFF: u8 = 0x02;

// ============================================================================
// Firmware
// ============================================================================

/// Major version reported by factory/infrastructure firmware builds.
pub const INFRA_FW_MAJOR: u8 = 0xA0;

// ============================================================================
// Retry bounds
// ============================================================================

/// Physical write attempts per frame inside the writer thread.
pub const MAX_PHYSICAL_WRITE_ATTEMPTS: u32 = 3;
/// Dispatcher-level re-issues of a failed write.
pub const MAX_WRITE_RETRY_COUNT: u32 = 3;
/// Re-issues of a command whose response never arrived.
pub const MAX_RESPONSE_RETRY_COUNT: u32 = 1;
/// CORE_RESET attempts, with a power cycle between them.
pub const MAX_RESET_ATTEMPTS: u32 = 3;
/// Flashing sessions per download decision.
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;
/// Invalid-parameter recovery cycles before bring-up gives up.
pub const MAX_CONFIG_RECOVERY_CYCLES: u32 = 3;

// ============================================================================
// Timing
// ============================================================================

pub const READ_BACKOFF_BASE: Duration = Duration::from_millis(5);
pub const READ_BACKOFF_CAP: Duration = Duration::from_millis(100);
pub const WRITE_RETRY_DELAY: Duration = Duration::from_millis(10);
/// How long shutdown waits for a transport thread to exit.
pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Settle time after a power cycle before talking to the controller.
pub const POWER_CYCLE_SETTLE: Duration = Duration::from_millis(10);
