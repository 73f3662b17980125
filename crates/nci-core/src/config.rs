//! HAL configuration.
//!
//! Read once at bring-up and cached for the session.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::channel::LinkConfig;
use crate::command::DispatchTimeouts;
use crate::firmware::FirmwarePolicy;
use crate::protocol::constants::*;
use crate::protocol::{FrameError, MessageType, NciFrame, SetConfig};
use crate::transport::RetransmitConfig;

/// Controller reference clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    #[default]
    Pll,
    Xtal,
}

impl ClockSource {
    pub fn code(&self) -> u8 {
        match self {
            ClockSource::Xtal => 0x01,
            ClockSource::Pll => 0x02,
        }
    }
}

/// One CORE_SET_CONFIG parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigParam {
    pub id: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    pub link: LinkConfig,
    pub clock_source: ClockSource,
    /// Frequency code written to the clock frequency parameter.
    pub clock_frequency: u8,
    pub retransmission: RetransmitConfig,
    pub firmware: FirmwarePolicy,
    /// RF tuning commands, sent in order as raw NCI frames.
    pub rf_blocks: Vec<Vec<u8>>,
    /// Core parameters applied in a single CORE_SET_CONFIG.
    pub core_conf: Vec<ConfigParam>,
    pub standby_enable: bool,
    pub extensions_enable: bool,
    /// Send the power-off setting on `close(true)`.
    pub power_off_on_shutdown: bool,
    pub timeouts: DispatchTimeouts,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            clock_source: ClockSource::default(),
            clock_frequency: 0x11,
            retransmission: RetransmitConfig::default(),
            firmware: FirmwarePolicy::default(),
            rf_blocks: Vec::new(),
            core_conf: Vec::new(),
            standby_enable: true,
            extensions_enable: true,
            power_off_on_shutdown: false,
            timeouts: DispatchTimeouts::default(),
        }
    }
}

impl HalConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HalConfig = toml::from_str(content)?;
        for (index, block) in config.rf_blocks.iter().enumerate() {
            NciFrame::from_bytes(block.clone())
                .with_context(|| format!("rf_blocks[{index}] is not a valid NCI frame"))?;
        }
        Ok(config)
    }

    pub fn clock_command(&self) -> Result<NciFrame, FrameError> {
        SetConfig::new()
            .param(PARAM_CLOCK_SOURCE, &[self.clock_source.code()])
            .param(PARAM_CLOCK_FREQUENCY, &[self.clock_frequency])
            .build()
    }

    /// `None` when no core parameters are configured.
    pub fn core_conf_command(&self) -> Result<Option<NciFrame>, FrameError> {
        if self.core_conf.is_empty() {
            return Ok(None);
        }
        let builder = self
            .core_conf
            .iter()
            .fold(SetConfig::new(), |b, p| b.param(p.id, &p.value));
        builder.build().map(Some)
    }

    pub fn standby_command(&self) -> Result<NciFrame, FrameError> {
        power_mode_command(self.standby_enable)
    }

    pub fn power_off_command(&self) -> Result<NciFrame, FrameError> {
        SetConfig::new()
            .param(PARAM_POWER_CONTROL, &[POWER_CONTROL_OFF])
            .build()
    }
}

/// Proprietary power-mode command: standby allowed or full power.
pub fn power_mode_command(standby: bool) -> Result<NciFrame, FrameError> {
    NciFrame::control(
        MessageType::Command,
        GID_PROPRIETARY,
        OID_PROP_POWER_MODE,
        &[u8::from(standby)],
    )
}
