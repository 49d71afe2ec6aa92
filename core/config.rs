use crate::jacobi::JacobiOptions;
use crate::types::{
    DEFAULT_CAPACITY_BYTES, DEFAULT_COMPONENTS, DEFAULT_SWEEPS, ExecutionMode, PcaError,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const WORKING_BUDGET_ENV: &str = "EIGENSWEEP_WORKING_BUDGET_BYTES";
const DEFAULT_WORKING_BUDGET_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Tunables for a PCA job, usually read from a TOML file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PcaConfig {
    pub sweeps: usize,
    pub components: usize,
    pub tolerance: Option<f64>,
    pub execution: ExecutionMode,
    /// Backing store size every job must fit in.
    pub capacity_bytes: u64,
    /// RAM the dense path may use before `Auto` switches to streaming.
    pub working_budget_bytes: Option<u64>,
    pub timeout_secs: Option<u64>,
    /// File used for a memory-mapped store; streamed jobs stay in memory when unset.
    pub scratch_path: Option<PathBuf>,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            sweeps: DEFAULT_SWEEPS,
            components: DEFAULT_COMPONENTS,
            tolerance: None,
            execution: ExecutionMode::Auto,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            working_budget_bytes: None,
            timeout_secs: None,
            scratch_path: None,
        }
    }
}

impl PcaConfig {
    pub fn load(path: &Path) -> Result<Self, PcaError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, PcaError> {
        toml::to_string_pretty(self).map_err(|err| PcaError::Config(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), PcaError> {
        if self.capacity_bytes == 0 {
            return Err(PcaError::Config(
                "capacity_bytes must be greater than zero".to_string(),
            ));
        }
        if let Some(tolerance) = self.tolerance {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(PcaError::Config(format!(
                    "tolerance must be a finite, non-negative number, found {tolerance}"
                )));
            }
        }
        Ok(())
    }

    pub fn jacobi_options(&self) -> JacobiOptions {
        JacobiOptions {
            sweeps: self.sweeps,
            tolerance: self.tolerance,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Working-memory budget, with the environment taking precedence over the file.
    pub fn working_budget(&self) -> u64 {
        std::env::var(WORKING_BUDGET_ENV)
            .ok()
            .and_then(|value| parse_budget(&value))
            .or(self.working_budget_bytes.map(unlimited_if_zero))
            .unwrap_or(DEFAULT_WORKING_BUDGET_BYTES)
    }
}

fn unlimited_if_zero(bytes: u64) -> u64 {
    if bytes == 0 { u64::MAX } else { bytes }
}

fn parse_budget(value: &str) -> Option<u64> {
    match value.trim().parse::<u64>() {
        Ok(parsed) => Some(unlimited_if_zero(parsed)),
        Err(err) => {
            log::warn!("Ignoring {WORKING_BUDGET_ENV}={value:?}: {err}");
            None
        }
    }
}
