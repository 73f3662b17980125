//! Reset, init, firmware check and download steps.

use tracing::{debug, info, warn};

use super::{BringUp, BringUpError, BringUpState};
use crate::command::DispatchError;
use crate::events::{HalEvent, LogLevel};
use crate::firmware::{FirmwareDecision, FirmwareError, FirmwareVersion, FlashMode, ForceReason};
use crate::protocol::constants::*;
use crate::protocol::{
    NciVersion, ResetOutcome, parse_reset_response, reset_notification_version,
};

impl BringUp<'_> {
    /// CORE_RESET with a power cycle between failed attempts.
    pub fn reset(&mut self) -> Result<(), BringUpError> {
        self.goto(BringUpState::Resetting);

        let mut attempt = 1;
        loop {
            match self.reset_once() {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= MAX_RESET_ATTEMPTS => {
                    return Err(BringUpError::Reset {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "CORE_RESET failed, power cycling");
                    self.power_cycle();
                    attempt += 1;
                }
            }
        }
    }

    fn reset_once(&mut self) -> Result<(), DispatchError> {
        let exchange = self
            .commands
            .exchange(&CORE_RESET_CMD, Some((GID_CORE, OID_CORE_RESET)))?;

        match parse_reset_response(exchange.response())? {
            ResetOutcome::Version(version) => self.ctx.nci_version = version,
            ResetOutcome::AwaitNotification => {
                let ntf = exchange.wait_notification()?;
                self.ctx.nci_version = reset_notification_version(&ntf).unwrap_or(NciVersion::V2);
                if let Some(fw) = FirmwareVersion::from_reset_notification(&ntf) {
                    self.ctx.firmware = fw;
                }
            }
        }
        info!(version = %self.ctx.nci_version, "Controller reset");
        Ok(())
    }

    /// CORE_INIT in the negotiated wire format.
    pub fn init(&mut self) -> Result<(), BringUpError> {
        self.goto(BringUpState::Initializing);
        let rsp = self
            .commands
            .send_and_wait(self.ctx.nci_version.init_command())
            .map_err(BringUpError::Init)?;

        if self.ctx.nci_version == NciVersion::V1
            && let Some(fw) = FirmwareVersion::from_init_response(&rsp)
        {
            self.ctx.firmware = fw;
        }
        info!(firmware = %self.ctx.firmware, "Controller initialized");
        Ok(())
    }

    /// Compare the local image with the running firmware and flash if needed.
    pub fn check_firmware(&mut self) -> Result<(), BringUpError> {
        self.goto(BringUpState::FirmwareCheck);

        let local = self.downloader.and_then(|d| d.image_version());
        let decision = FirmwareDecision::decide(
            local,
            self.ctx.firmware,
            &self.config.firmware,
            self.ctx.recovery_download,
        );
        self.ctx.last_decision = Some(decision);
        self.emit(HalEvent::Firmware { decision });

        match decision {
            FirmwareDecision::UpToDate => {
                debug!(running = %self.ctx.firmware, "Firmware up to date");
                Ok(())
            }
            FirmwareDecision::Refused => {
                self.log(
                    LogLevel::Warn,
                    format!(
                        "Keeping running firmware {}, image would be a downgrade",
                        self.ctx.firmware
                    ),
                );
                Ok(())
            }
            FirmwareDecision::Forced(ForceReason::Recovery) => self.download(FlashMode::Recovery),
            FirmwareDecision::Update | FirmwareDecision::Forced(_) => {
                self.download(FlashMode::Normal)
            }
        }
    }

    /// Up to `MAX_DOWNLOAD_ATTEMPTS` flashing sessions, then reset and init
    /// on the new firmware.
    fn download(&mut self, mode: FlashMode) -> Result<(), BringUpError> {
        self.goto(BringUpState::Downloading);

        let Some(downloader) = self.downloader else {
            return self.continue_degraded(FirmwareError::NoImage);
        };

        let mut last_error = FirmwareError::NoImage;
        for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
            // The link returns to NCI framing when dropped, on every path.
            let result = self
                .port
                .enter()
                .and_then(|link| downloader.flash(link.as_ref(), mode));
            match result {
                Ok(()) => {
                    info!(attempt, mode = ?mode, "Firmware download complete");
                    self.ctx.recovery_download = false;
                    self.reset()?;
                    return self.init();
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Firmware download failed");
                    last_error = e;
                }
            }
        }
        self.continue_degraded(last_error)
    }

    /// Keep the running firmware if it is usable for this chip.
    fn continue_degraded(&mut self, err: FirmwareError) -> Result<(), BringUpError> {
        let running = self.ctx.firmware;
        let policy = &self.config.firmware;
        if !running.is_unknown() && running.is_at_least(policy.min_usable_major, policy.min_usable_minor)
        {
            self.log(
                LogLevel::Warn,
                format!("Firmware download failed ({err}), continuing on {running}"),
            );
            self.ctx.degraded = true;
            Ok(())
        } else {
            Err(BringUpError::Firmware {
                running,
                source: err,
            })
        }
    }
}
