//! Controller bring-up: reset, init, firmware update and configuration.
//!
//! `BringUp` borrows the session's dispatcher and drives one phase sequence
//! per call. Every blocking step is bounded; failures move the machine to
//! `Failed` and leave teardown to the owner.

pub mod apply;
pub mod machine;
pub mod steps;

use std::thread;

use thiserror::Error;
use tracing::{error, warn};

use crate::channel::ResetMode;
use crate::command::{CommandDispatcher, DispatchError};
use crate::config::HalConfig;
use crate::events::{HalEvent, HalObserver, LogLevel};
use crate::firmware::{DownloadPort, FirmwareDownloader, FirmwareError, FirmwareVersion};
use crate::protocol::FrameError;
use crate::protocol::constants::POWER_CYCLE_SETTLE;

pub use apply::ConfigBlock;
pub use machine::{BringUpContext, BringUpState};

#[derive(Error, Debug)]
pub enum BringUpError {
    #[error("Controller reset failed after {attempts} attempts: {source}")]
    Reset {
        attempts: u32,
        #[source]
        source: DispatchError,
    },

    #[error("CORE_INIT failed: {0}")]
    Init(#[source] DispatchError),

    #[error("Firmware download failed and running firmware {running} is not usable: {source}")]
    Firmware {
        running: FirmwareVersion,
        #[source]
        source: FirmwareError,
    },

    #[error("Configuration block {block} failed: {source}")]
    Config {
        block: String,
        #[source]
        source: DispatchError,
    },

    #[error("Configuration recovery exhausted after {cycles} cycles")]
    RecoveryExhausted { cycles: u32 },

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// One bring-up run over an open session.
pub struct BringUp<'a> {
    pub(crate) commands: &'a CommandDispatcher,
    pub(crate) config: &'a HalConfig,
    pub(crate) downloader: Option<&'a dyn FirmwareDownloader>,
    pub(crate) port: &'a dyn DownloadPort,
    pub(crate) observer: &'a dyn HalObserver,
    pub(crate) ctx: &'a mut BringUpContext,
}

impl<'a> BringUp<'a> {
    pub fn new(
        commands: &'a CommandDispatcher,
        config: &'a HalConfig,
        downloader: Option<&'a dyn FirmwareDownloader>,
        port: &'a dyn DownloadPort,
        observer: &'a dyn HalObserver,
        ctx: &'a mut BringUpContext,
    ) -> Self {
        Self {
            commands,
            config,
            downloader,
            port,
            observer,
            ctx,
        }
    }

    /// Cold open: reset, init and the firmware check (with download).
    pub fn open(&mut self) -> Result<(), BringUpError> {
        self.ctx.recovery_cycles = 0;
        self.ctx.degraded = false;
        let result = self.reset_and_check();
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    fn reset_and_check(&mut self) -> Result<(), BringUpError> {
        self.reset()?;
        self.init()?;
        self.check_firmware()
    }

    pub(crate) fn goto(&mut self, state: BringUpState) {
        self.ctx.goto_state(state, self.observer);
    }

    pub(crate) fn emit(&self, event: HalEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(HalEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn fail(&mut self, err: &BringUpError) {
        error!(error = %err, state = %self.ctx.state, "Bring-up failed");
        self.goto(BringUpState::Failed);
        self.emit(HalEvent::Error {
            message: err.to_string(),
        });
    }

    /// Hard reset of the controller between attempts.
    pub(crate) fn power_cycle(&self) {
        if let Err(e) = self.commands.channel().reset(ResetMode::PowerCycle) {
            warn!(error = %e, "Power cycle failed");
        }
        thread::sleep(POWER_CYCLE_SETTLE);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::{MockChannel, SimulatedController};
    use crate::command::tests::{Rig, rig};
    use crate::events::tests::RecordingObserver;
    use crate::firmware::tests::RecordingDownloader;
    use crate::firmware::{DownloadLink, FlashMode};
    use crate::protocol::NciVersion;
    use crate::protocol::constants::*;
    use std::time::Duration;

    /// Download port that answers every chunk with an ack, without touching the link.
    pub(crate) struct LoopbackPort;

    struct LoopbackLink;

    impl DownloadLink for LoopbackLink {
        fn transceive(&self, _chunk: &[u8], _timeout: Duration) -> Result<Vec<u8>, FirmwareError> {
            Ok(vec![0x00])
        }
    }

    impl DownloadPort for LoopbackPort {
        fn enter(&self) -> Result<Box<dyn DownloadLink + '_>, FirmwareError> {
            Ok(Box::new(LoopbackLink))
        }
    }

    pub(crate) fn run<R>(
        r: &Rig,
        config: &HalConfig,
        downloader: Option<&dyn FirmwareDownloader>,
        ctx: &mut BringUpContext,
        f: impl FnOnce(&mut BringUp<'_>) -> R,
    ) -> (R, Vec<HalEvent>) {
        let observer = RecordingObserver::default();
        let result = {
            let mut b = BringUp::new(&r.dispatcher, config, downloader, &LoopbackPort, &observer, ctx);
            f(&mut b)
        };
        let events = observer.events.lock().clone();
        (result, events)
    }

    #[test]
    fn test_open_v1_sequence() {
        let r = rig(MockChannel::with_controller(SimulatedController::new(NciVersion::V1)));
        let mut ctx = BringUpContext::new();
        let (result, events) = run(&r, &HalConfig::default(), None, &mut ctx, |b| b.open());
        result.unwrap();
        assert_eq!(r.mock.writes(), vec![CORE_RESET_CMD.to_vec(), CORE_INIT_CMD_V1.to_vec()]);
        assert_eq!(ctx.nci_version, NciVersion::V1);
        assert_eq!(ctx.firmware, FirmwareVersion::new(0x11, 0x01, 0x0E));
        assert_eq!(ctx.state, BringUpState::FirmwareCheck);
        assert!(events.iter().any(|e| matches!(e, HalEvent::Firmware { .. })));
    }

    #[test]
    fn test_open_v2_sequence() {
        let controller = SimulatedController::new(NciVersion::V2)
            .with_firmware(FirmwareVersion::new(0x12, 0x02, 0x01));
        let r = rig(MockChannel::with_controller(controller));
        let mut ctx = BringUpContext::new();
        let (result, _) = run(&r, &HalConfig::default(), None, &mut ctx, |b| b.open());
        result.unwrap();
        assert_eq!(r.mock.writes(), vec![CORE_RESET_CMD.to_vec(), CORE_INIT_CMD_V2.to_vec()]);
        assert_eq!(ctx.nci_version, NciVersion::V2);
        assert_eq!(ctx.firmware, FirmwareVersion::new(0x12, 0x02, 0x01));
    }

    #[test]
    fn test_reset_retries_with_power_cycle() {
        let controller = SimulatedController::new(NciVersion::V1)
            .with_status_times(GID_CORE, OID_CORE_RESET, STATUS_FAILED, 2);
        let r = rig(MockChannel::with_controller(controller));
        let mut ctx = BringUpContext::new();
        let (result, _) = run(&r, &HalConfig::default(), None, &mut ctx, |b| b.open());
        result.unwrap();
        assert_eq!(r.mock.count_writes(&CORE_RESET_CMD), 3);
        assert_eq!(
            r.mock.resets(),
            vec![ResetMode::PowerCycle, ResetMode::PowerCycle]
        );
    }

    #[test]
    fn test_reset_exhaustion_fails() {
        let controller = SimulatedController::new(NciVersion::V1)
            .with_status(GID_CORE, OID_CORE_RESET, STATUS_REJECTED);
        let r = rig(MockChannel::with_controller(controller));
        let mut ctx = BringUpContext::new();
        let (result, events) = run(&r, &HalConfig::default(), None, &mut ctx, |b| b.open());
        assert!(matches!(
            result,
            Err(BringUpError::Reset {
                attempts: MAX_RESET_ATTEMPTS,
                ..
            })
        ));
        assert_eq!(ctx.state, BringUpState::Failed);
        assert!(events.iter().any(|e| matches!(e, HalEvent::Error { .. })));
    }

    #[test]
    fn test_newer_image_is_flashed_then_reinitialized() {
        let r = rig(MockChannel::with_controller(SimulatedController::new(NciVersion::V1)));
        let downloader = RecordingDownloader::new(Some(FirmwareVersion::new(0x11, 0x02, 0x00)));
        let mut ctx = BringUpContext::new();
        let (result, _) = run(&r, &HalConfig::default(), Some(&downloader), &mut ctx, |b| b.open());
        result.unwrap();
        assert_eq!(*downloader.sessions.lock(), vec![FlashMode::Normal]);
        assert_eq!(r.mock.count_writes(&CORE_RESET_CMD), 2);
        assert_eq!(r.mock.count_writes(&CORE_INIT_CMD_V1), 2);
    }

    #[test]
    fn test_failed_download_continues_degraded() {
        let r = rig(MockChannel::with_controller(SimulatedController::new(NciVersion::V1)));
        let downloader =
            RecordingDownloader::new(Some(FirmwareVersion::new(0x11, 0x02, 0x00))).failing(3);
        let mut config = HalConfig::default();
        config.firmware.min_usable_major = 0x01;
        let mut ctx = BringUpContext::new();
        let (result, _) = run(&r, &config, Some(&downloader), &mut ctx, |b| b.open());
        result.unwrap();
        assert_eq!(downloader.session_count(), MAX_DOWNLOAD_ATTEMPTS as usize);
        assert!(ctx.degraded);
    }

    #[test]
    fn test_failed_download_below_usable_version_fails() {
        let r = rig(MockChannel::with_controller(SimulatedController::new(NciVersion::V1)));
        let downloader =
            RecordingDownloader::new(Some(FirmwareVersion::new(0x11, 0x02, 0x00))).failing(3);
        let mut config = HalConfig::default();
        config.firmware.min_usable_major = 0x02;
        let mut ctx = BringUpContext::new();
        let (result, _) = run(&r, &config, Some(&downloader), &mut ctx, |b| b.open());
        assert!(matches!(result, Err(BringUpError::Firmware { .. })));
        assert_eq!(ctx.state, BringUpState::Failed);
    }

    #[test]
    fn test_unknown_firmware_without_image_fails() {
        let controller = SimulatedController::new(NciVersion::V1)
            .with_firmware(FirmwareVersion::default());
        let r = rig(MockChannel::with_controller(controller));
        let mut ctx = BringUpContext::new();
        let (result, _) = run(&r, &HalConfig::default(), None, &mut ctx, |b| b.open());
        assert!(matches!(
            result,
            Err(BringUpError::Firmware {
                source: FirmwareError::NoImage,
                ..
            })
        ));
    }
}
