//! NCI-Core: transport and command/response engine for NFC controllers.
//!
//! Drives an NFC controller over a byte-oriented link (I2C/SPI class) using
//! the NFC Controller Interface framing, and sequences controller bring-up.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Frame header layout, constants and command builders
//! - **Channel**: Physical link abstraction (`FrameChannel`, mock, observable wrapper)
//! - **Transport**: Reader/writer threads with retransmission and abort
//! - **Command**: Write-window arbitration and write-and-wait dispatch
//! - **Dispatch**: Client dispatch thread delivering callbacks
//! - **Bring-up**: Reset, init, firmware check, download and configuration
//! - **Events**: Observer pattern for embedding processes
//! - **HAL**: Public entry points (`open`, `write`, `close`, `ioctl`, ...)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use nci_core::{HalConfig, MockChannel, NciHal, NfcEvent, NfcStatus};
//!
//! let config = HalConfig::load_from_file("nci-hal.toml").unwrap_or_default();
//! let hal = NciHal::new(Arc::new(MockChannel::new()), config);
//! hal.open(
//!     Arc::new(|event: NfcEvent, status: NfcStatus| println!("{event:?}: {status}")),
//!     Arc::new(|data: &[u8]| println!("{} bytes", data.len())),
//! )
//! .expect("open failed");
//! ```

pub mod bringup;
pub mod channel;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod firmware;
pub mod hal;
pub mod link;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use bringup::{BringUpError, BringUpState};
pub use channel::{ChannelError, FrameChannel, LinkConfig, MockChannel, ResetMode};
pub use command::{DispatchError, DispatchTimeouts};
pub use config::{ClockSource, ConfigParam, HalConfig};
pub use dispatch::{DataCallback, NfcEvent, NfcStatus, StackCallback};
pub use events::{HalEvent, HalObserver, LogLevel, NullObserver, TracingObserver};
pub use firmware::{
    FirmwareDecision, FirmwareDownloader, FirmwarePolicy, FirmwareVersion, ImageDownloader,
};
pub use hal::{HalError, HalStatus, IoctlRequest, IoctlResponse, NciHal, PowerState};
pub use protocol::{MessageType, NciFrame, NciVersion};
pub use transport::{RetransmitConfig, TransportError};
