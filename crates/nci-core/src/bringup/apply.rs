//! Configuration apply with the invalid-parameter recovery loop.

use tracing::{debug, info, warn};

use super::{BringUp, BringUpError, BringUpState};
use crate::command::DispatchError;
use crate::config::HalConfig;
use crate::events::HalEvent;
use crate::protocol::constants::*;
use crate::protocol::{FrameError, NciFrame, hex};

/// One command of the configuration sequence.
#[derive(Debug, Clone)]
pub struct ConfigBlock {
    pub name: String,
    pub frame: NciFrame,
    /// A rejected hard block aborts bring-up; others are logged and skipped.
    pub hard: bool,
}

impl ConfigBlock {
    fn new(name: impl Into<String>, frame: NciFrame, hard: bool) -> Self {
        Self {
            name: name.into(),
            frame,
            hard,
        }
    }
}

/// Ordered blocks for `config`: clock, core parameters, RF tuning, power
/// mode, proprietary extensions.
pub fn config_blocks(config: &HalConfig) -> Result<Vec<ConfigBlock>, FrameError> {
    let mut blocks = vec![ConfigBlock::new("clock", config.clock_command()?, true)];
    if let Some(core) = config.core_conf_command()? {
        blocks.push(ConfigBlock::new("core_conf", core, false));
    }
    for (index, raw) in config.rf_blocks.iter().enumerate() {
        let frame = NciFrame::from_bytes(raw.clone())?;
        blocks.push(ConfigBlock::new(format!("rf[{index}]"), frame, false));
    }
    blocks.push(ConfigBlock::new("power_mode", config.standby_command()?, false));
    if config.extensions_enable {
        let frame = NciFrame::from_bytes(PROP_ENABLE_EXTN_CMD.to_vec())?;
        blocks.push(ConfigBlock::new("extensions", frame, true));
    }
    Ok(blocks)
}

enum ApplyFailure {
    /// Controller answered INVALID_PARAM; recoverable by re-flashing.
    InvalidParam { block: String },
    Fatal(BringUpError),
}

impl BringUp<'_> {
    /// Apply every block, running the recovery sequence on INVALID_PARAM.
    pub fn apply_config(&mut self) -> Result<(), BringUpError> {
        let result = self.apply_with_recovery();
        match &result {
            Ok(()) => self.goto(BringUpState::Ready),
            Err(e) => self.fail(e),
        }
        result
    }

    fn apply_with_recovery(&mut self) -> Result<(), BringUpError> {
        let blocks = config_blocks(self.config)?;
        loop {
            self.goto(BringUpState::ConfigApplying);
            match self.apply_blocks(&blocks) {
                Ok(()) => {
                    info!(blocks = blocks.len(), "Configuration applied");
                    return Ok(());
                }
                Err(ApplyFailure::Fatal(e)) => return Err(e),
                Err(ApplyFailure::InvalidParam { block }) => {
                    if self.ctx.recovery_cycles >= MAX_CONFIG_RECOVERY_CYCLES {
                        return Err(BringUpError::RecoveryExhausted {
                            cycles: self.ctx.recovery_cycles,
                        });
                    }
                    self.ctx.recovery_cycles += 1;
                    warn!(
                        block = %block,
                        cycle = self.ctx.recovery_cycles,
                        "Controller rejected configuration, recovering"
                    );
                    self.emit(HalEvent::RecoveryCycle {
                        cycle: self.ctx.recovery_cycles,
                        max: MAX_CONFIG_RECOVERY_CYCLES,
                    });
                    self.recover()?;
                }
            }
        }
    }

    /// Reset the device and re-flash before the next apply pass.
    fn recover(&mut self) -> Result<(), BringUpError> {
        self.ctx.recovery_download = true;
        self.power_cycle();
        self.reset()?;
        self.init()?;
        self.check_firmware()
    }

    fn apply_blocks(&mut self, blocks: &[ConfigBlock]) -> Result<(), ApplyFailure> {
        for block in blocks {
            debug!(block = %block.name, cmd = %hex(block.frame.as_bytes()), "Applying");
            match self.commands.send_and_wait(block.frame.as_bytes()) {
                Ok(_) => {}
                Err(DispatchError::Rejected {
                    status: STATUS_INVALID_PARAM,
                    ..
                }) => {
                    return Err(ApplyFailure::InvalidParam {
                        block: block.name.clone(),
                    });
                }
                Err(source @ DispatchError::Rejected { .. }) if !block.hard => {
                    warn!(block = %block.name, error = %source, "Optional block rejected, continuing");
                }
                Err(source) => {
                    return Err(ApplyFailure::Fatal(BringUpError::Config {
                        block: block.name.clone(),
                        source,
                    }));
                }
            }
        }
        Ok(())
    }
}
