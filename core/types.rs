use serde::{Deserialize, Serialize};
use std::error::Error;
use std::time::Duration;
use thiserror::Error;

/// Number of full Jacobi sweeps run when no tolerance is configured.
pub const DEFAULT_SWEEPS: usize = 10;
/// Depth of the eigenvalue ranking produced by a default job.
pub const DEFAULT_COMPONENTS: usize = 10;
/// Marker written over ranked slots so later scans skip them (-2^30).
pub const RANK_SENTINEL: f64 = -1_073_741_824.0;
/// Size of one backing-store transfer unit in bytes.
pub const BURST_BYTES: usize = 64;
/// Default backing-store capacity: the 8 GiB of DRAM on the reference card.
pub const DEFAULT_CAPACITY_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Errors raised by the PCA core.
#[derive(Error, Debug)]
pub enum PcaError {
    #[error(
        "Working set of {required} bytes exceeds the backing store capacity of {capacity} bytes."
    )]
    CapacityExceeded { required: u64, capacity: u64 },

    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("Backing store error: {0}")]
    Store(Box<dyn Error + Send + Sync + 'static>),

    #[error("Deadline exceeded after {elapsed:?}; all partial results were discarded.")]
    DeadlineExceeded { elapsed: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PcaError {
    pub(crate) fn store<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(err))
    }
}

/// Outcome reported to whoever launched the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failure,
}

impl JobStatus {
    pub fn from_result<T>(result: &Result<T, PcaError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(_) => Self::Failure,
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILED",
        }
    }
}

/// How the pipeline holds S, U and V while it works.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Dense when the working set fits the working-memory budget, streamed otherwise.
    #[default]
    Auto,
    /// Whole matrices in memory, rotations applied in place.
    Dense,
    /// Matrices live in a burst store and are streamed row by row.
    Streamed,
}

impl ExecutionMode {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Dense => "dense",
            Self::Streamed => "streamed",
        }
    }
}

/// The largest eigenvalues in descending order together with their diagonal positions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EigenRanking {
    pub values: Vec<f64>,
    pub indices: Vec<u32>,
}

impl EigenRanking {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, u32)> + '_ {
        self.values.iter().copied().zip(self.indices.iter().copied())
    }
}
