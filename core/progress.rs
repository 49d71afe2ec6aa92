use std::fmt;

/// Stages reported while a PCA job runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PcaStage {
    Staging,
    Covariance,
    Sweeps,
    Ranking,
}

impl PcaStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Staging => "staging input into the store",
            Self::Covariance => "covariance matrix",
            Self::Sweeps => "Jacobi sweeps",
            Self::Ranking => "eigenvalue ranking",
        }
    }
}

impl fmt::Display for PcaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress of a job.
pub trait PcaProgressObserver {
    fn on_stage_start(&mut self, stage: PcaStage, total: usize) {
        let _ = (stage, total);
    }
    fn on_stage_advance(&mut self, stage: PcaStage, processed: usize) {
        let _ = (stage, processed);
    }
    fn on_stage_finish(&mut self, stage: PcaStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopPcaProgress;

impl PcaProgressObserver for NoopPcaProgress {}
