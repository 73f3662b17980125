//! Bring-up states and the context carried across them.

use std::fmt;

use crate::events::{HalEvent, HalObserver};
use crate::firmware::{FirmwareDecision, FirmwareVersion};
use crate::protocol::NciVersion;

/// Phase of controller bring-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BringUpState {
    #[default]
    Closed,
    Resetting,
    Initializing,
    FirmwareCheck,
    Downloading,
    ConfigApplying,
    Ready,
    /// Terminal until the next open.
    Failed,
}

impl fmt::Display for BringUpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BringUpState::Closed => write!(f, "CLOSED"),
            BringUpState::Resetting => write!(f, "RESETTING"),
            BringUpState::Initializing => write!(f, "INITIALIZING"),
            BringUpState::FirmwareCheck => write!(f, "FW_CHECK"),
            BringUpState::Downloading => write!(f, "DOWNLOADING"),
            BringUpState::ConfigApplying => write!(f, "CONFIG_APPLYING"),
            BringUpState::Ready => write!(f, "READY"),
            BringUpState::Failed => write!(f, "FAILED"),
        }
    }
}

impl BringUpState {
    /// Controller traffic is in flight for this phase.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            BringUpState::Closed | BringUpState::Ready | BringUpState::Failed
        )
    }
}

/// Runtime state of one open session.
#[derive(Debug, Default)]
pub struct BringUpContext {
    pub state: BringUpState,
    /// Negotiated from the reset response.
    pub nci_version: NciVersion,
    /// As reported by the controller this cycle.
    pub firmware: FirmwareVersion,
    pub last_decision: Option<FirmwareDecision>,
    /// Set when the controller rejected its configuration; forces the next
    /// firmware check into a recovery download. Cleared by a successful flash.
    pub recovery_download: bool,
    pub recovery_cycles: u32,
    /// Running firmware kept after a failed download.
    pub degraded: bool,
}

impl BringUpContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: BringUpState, observer: &dyn HalObserver) {
        if self.state == new_state {
            return;
        }
        tracing::info!(from = %self.state, to = %new_state, "Bring-up transition");
        observer.on_event(&HalEvent::PhaseChanged {
            from: self.state,
            to: new_state,
        });
        self.state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::RecordingObserver;

    #[test]
    fn test_transition_emits_once() {
        let obs = RecordingObserver::default();
        let mut ctx = BringUpContext::new();
        ctx.goto_state(BringUpState::Resetting, &obs);
        ctx.goto_state(BringUpState::Resetting, &obs);
        ctx.goto_state(BringUpState::Initializing, &obs);
        let events = obs.events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            HalEvent::PhaseChanged {
                from: BringUpState::Resetting,
                to: BringUpState::Initializing
            }
        ));
    }

    #[test]
    fn test_display_and_activity() {
        assert_eq!(BringUpState::FirmwareCheck.to_string(), "FW_CHECK");
        assert!(BringUpState::Downloading.is_active());
        assert!(!BringUpState::Ready.is_active());
        assert!(!BringUpState::Failed.is_active());
    }
}
