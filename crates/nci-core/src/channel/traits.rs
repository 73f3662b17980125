//! Physical link abstraction.
//!
//! Defines the `FrameChannel` trait the transport drives, allowing
//! different implementations (I2C/SPI device nodes, simulators, mocks).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to open link {device}: {message}")]
    OpenFailed { device: String, message: String },

    #[error("Link not open")]
    NotOpen,

    #[error("Link closed")]
    Closed,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Reset ({mode:?}) failed: {message}")]
    ResetFailed { mode: ResetMode, message: String },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device-level control operations on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetMode {
    /// Drive the enable line low.
    PowerOff,
    /// Drive the enable line high.
    PowerOn,
    /// Off then on: a hard controller reset.
    PowerCycle,
    /// Switch the link into firmware download framing.
    EnterDownload,
    /// Return the link to NCI framing.
    ExitDownload,
}

/// Static description of the physical link, handed to `open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Device node or bus address of the controller.
    pub device: String,
    /// Largest single read the link delivers.
    pub max_frame_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device: "/dev/nfc0".to_string(),
            max_frame_size: crate::protocol::constants::NCI_MAX_FRAME_SIZE,
        }
    }
}

/// Abstract byte-oriented link to the controller.
///
/// `read` blocks until a complete frame arrives or the link is closed;
/// `close` must unblock any reader parked in `read`.
pub trait FrameChannel: Send + Sync {
    /// Open the link.
    fn open(&self, config: &LinkConfig) -> Result<(), ChannelError>;

    /// Read one frame into `buf`, returning its length.
    fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError>;

    /// Write one frame.
    fn write(&self, data: &[u8]) -> Result<usize, ChannelError>;

    /// Power/mode control.
    fn reset(&self, mode: ResetMode) -> Result<(), ChannelError>;

    /// Release the link. Idempotent.
    fn close(&self);
}
