#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod covariance;
pub mod jacobi;
pub mod layout;
pub mod pipeline;
pub mod progress;
pub mod rank;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod stream;
pub mod types;
pub mod window;
pub mod shared {
    pub use super::shared_files as files;
}

pub use config::PcaConfig;
pub use covariance::{compute_covariance, compute_covariance_streamed, row_means};
pub use jacobi::{JacobiOptions, SolveReport, solve};
pub use layout::{MatrixRegion, StoreLayout};
pub use pipeline::{PcaJob, PcaResult, run, run_with_progress};
pub use progress::{NoopPcaProgress, PcaProgressObserver, PcaStage};
pub use rank::top_k;
pub use stream::{Burst, BurstStore, MemoryStore, MmapStore, RowStreamer};
pub use types::{
    DEFAULT_COMPONENTS, DEFAULT_SWEEPS, EigenRanking, ExecutionMode, JobStatus, PcaError,
    RANK_SENTINEL,
};
pub use window::solve_streamed;
