//! Campaign configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandSpec;
use crate::cycle::StageKind;
use crate::director::Options;
use crate::machine::{MachineConfig, MachineId, QuantitySet};

/// Default capacity of the fan-in channel.
pub const DEFAULT_FORWARD_BUFFER: usize = 64;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON.
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    /// Well-formed but unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Opaque fuzzer parameters, handed to the fuzz stage as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FuzzerConfig(pub BTreeMap<String, serde_json::Value>);

/// Substring patterns of compiler or runtime output known to be benign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(pub Vec<String>);

impl FilterSet {
    /// True if any pattern occurs in `output`.
    pub fn matches(&self, output: &str) -> bool {
        self.0.iter().any(|pattern| output.contains(pattern.as_str()))
    }

    /// True if there are no patterns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Whole-campaign configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Output root; one directory per machine is created below it.
    pub out_dir: Option<PathBuf>,
    /// Campaign deadline in seconds; absent means run until interrupted.
    pub global_timeout_secs: Option<u64>,
    /// Capacity of the fan-in channel.
    pub forward_buffer: usize,
    /// Global quantities, overridden per machine.
    pub quantities: QuantitySet,
    /// Target machines.
    pub machines: BTreeMap<MachineId, MachineConfig>,
    /// Command run for each stage; missing stages pass the plan through.
    pub stages: BTreeMap<StageKind, CommandSpec>,
    /// Fuzzer parameters.
    pub fuzzer: Option<FuzzerConfig>,
    /// Benign-failure filters.
    pub filters: FilterSet,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            out_dir: None,
            global_timeout_secs: None,
            forward_buffer: DEFAULT_FORWARD_BUFFER,
            quantities: QuantitySet::default(),
            machines: BTreeMap::new(),
            stages: BTreeMap::new(),
            fuzzer: None,
            filters: FilterSet::default(),
        }
    }
}

impl CampaignConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no campaign can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forward_buffer == 0 {
            return Err(ConfigError::Invalid(
                "forward_buffer must be positive".to_string(),
            ));
        }
        if self.global_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "global_timeout_secs must be positive when set".to_string(),
            ));
        }
        for (kind, spec) in &self.stages {
            if spec.program.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{kind} stage has an empty program"
                )));
            }
        }
        Ok(())
    }

    /// Set output root.
    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    /// Set campaign deadline in seconds.
    pub fn with_global_timeout_secs(mut self, secs: u64) -> Self {
        self.global_timeout_secs = Some(secs);
        self
    }

    /// Add a machine.
    pub fn with_machine(mut self, id: impl Into<MachineId>, config: MachineConfig) -> Self {
        self.machines.insert(id.into(), config);
        self
    }

    /// Set the command for one stage.
    pub fn with_stage(mut self, kind: StageKind, spec: CommandSpec) -> Self {
        self.stages.insert(kind, spec);
        self
    }

    /// Campaign deadline.
    pub fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout_secs.map(Duration::from_secs)
    }

    /// Director options carrying this configuration's campaign-wide settings.
    pub fn director_options(&self) -> Options {
        let mut options = Options::default()
            .with_quantities(self.quantities)
            .with_filters(self.filters.clone());
        if let Some(out_dir) = &self.out_dir {
            options = options.with_out_dir(out_dir.clone());
        }
        if let Some(timeout) = self.global_timeout() {
            options = options.with_global_timeout(timeout);
        }
        if let Some(fuzzer) = &self.fuzzer {
            options = options.with_fuzzer(fuzzer.clone());
        }
        options
    }
}
