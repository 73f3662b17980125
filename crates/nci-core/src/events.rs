//! Event system for observing the engine.
//!
//! Lets an embedding process follow bring-up progress, link traffic and
//! recovery activity without coupling to the core logic.

use std::fmt;

use crate::bringup::BringUpState;
use crate::firmware::FirmwareDecision;
use crate::hal::HalStatus;
use crate::protocol::MessageType;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the HAL and its bring-up machine.
#[derive(Debug, Clone)]
pub enum HalEvent {
    /// Bring-up state changed.
    PhaseChanged {
        from: BringUpState,
        to: BringUpState,
    },
    /// HAL status changed.
    StatusChanged { from: HalStatus, to: HalStatus },
    /// Frame went over the physical link.
    Packet {
        direction: PacketDirection,
        message_type: Option<MessageType>,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Firmware update decision for this bring-up cycle.
    Firmware { decision: FirmwareDecision },
    /// Invalid-parameter recovery cycle started.
    RecoveryCycle { cycle: u32, max: u32 },
    /// Controller was reset outside the normal bring-up order.
    LinkReset { reason: String },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Unrecoverable error surfaced to the caller.
    Error { message: String },
}

/// Link direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Controller
    Rx, // Controller -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving HAL events.
pub trait HalObserver: Send + Sync {
    /// Called when an event occurs. May run on any engine thread.
    fn on_event(&self, event: &HalEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl HalObserver for NullObserver {
    fn on_event(&self, _event: &HalEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl HalObserver for TracingObserver {
    fn on_event(&self, event: &HalEvent) {
        match event {
            HalEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Bring-up phase changed");
            }
            HalEvent::StatusChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "HAL status changed");
            }
            HalEvent::Packet {
                direction,
                message_type,
                length,
                data,
            } => {
                let kind = message_type
                    .map(|mt| mt.to_string())
                    .unwrap_or_else(|| "RAW".to_string());
                tracing::trace!(
                    dir = %direction,
                    type_ = %kind,
                    len = length,
                    data = %data.as_deref().map(crate::protocol::hex).unwrap_or_default(),
                    "NCI packet"
                );
            }
            HalEvent::Firmware { decision } => {
                tracing::info!(decision = ?decision, "Firmware decision");
            }
            HalEvent::RecoveryCycle { cycle, max } => {
                tracing::warn!(cycle, max, "Configuration recovery cycle");
            }
            HalEvent::LinkReset { reason } => {
                tracing::warn!(reason = %reason, "Controller link reset");
            }
            HalEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            HalEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
        }
    }
}
