//! NCI protocol definitions: constants and frame codec.

pub mod constants;
pub mod frame;

pub use frame::{
    FrameError, MessageType, NciFrame, NciHeader, NciVersion, ResetOutcome, SetConfig, hex,
    is_command, is_control_packet, message_type_of, parse_reset_response,
    reset_notification_version,
};
