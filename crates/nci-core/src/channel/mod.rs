//! Physical link layer.

pub mod mock;
pub mod observable;
pub mod traits;

pub use mock::{MockChannel, SimulatedController};
pub use observable::ObservableChannel;
pub use traits::{ChannelError, FrameChannel, LinkConfig, ResetMode};
