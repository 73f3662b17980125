//! Transport layer: reader/writer threads over a `FrameChannel`.

pub mod context;
pub mod sync;
pub mod timer;

pub use context::{
    Direction, RetransmitConfig, TransferCompletion, TransferStatus, Transport, TransportError,
};
pub use sync::Semaphore;
pub use timer::Timer;
