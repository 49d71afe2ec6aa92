use crate::config::PcaConfig;
use crate::covariance::{compute_covariance_streamed, covariance_with_means, row_means};
use crate::jacobi::{JacobiOptions, SolveReport, SweepEvent, solve_with_checkpoint};
use crate::layout::{MatrixRegion, StoreLayout, dense_working_set_bytes};
use crate::progress::{NoopPcaProgress, PcaProgressObserver, PcaStage};
use crate::rank::top_k;
use crate::stream::{BurstStore, MemoryStore, MmapStore, RowStreamer};
use crate::types::{EigenRanking, ExecutionMode, PcaError};
use crate::window::solve_streamed;
use ndarray::{Array2, ArrayView2, Axis};
use std::time::{Duration, Instant};

// ========================================================================================
//                                   Job description
// ========================================================================================

/// One PCA run over a byte matrix whose rows are variables and columns observations.
pub struct PcaJob<'a> {
    input: ArrayView2<'a, u8>,
    components: usize,
    jacobi: JacobiOptions,
    execution: ExecutionMode,
    initial: Option<(Array2<f64>, Array2<f64>)>,
    deadline: Option<Instant>,
}

impl<'a> PcaJob<'a> {
    pub fn new(input: ArrayView2<'a, u8>) -> Self {
        let defaults = PcaConfig::default();
        Self {
            input,
            components: defaults.components,
            jacobi: defaults.jacobi_options(),
            execution: defaults.execution,
            initial: None,
            deadline: None,
        }
    }

    /// Job parameters taken from `config`; a configured timeout starts counting now.
    pub fn from_config(input: ArrayView2<'a, u8>, config: &PcaConfig) -> Self {
        let job = Self::new(input)
            .components(config.components)
            .jacobi(config.jacobi_options())
            .execution(config.execution);
        match config.timeout() {
            Some(timeout) => job.deadline(Instant::now() + timeout),
            None => job,
        }
    }

    pub fn components(mut self, components: usize) -> Self {
        self.components = components;
        self
    }

    pub fn jacobi(mut self, options: JacobiOptions) -> Self {
        self.jacobi = options;
        self
    }

    pub fn execution(mut self, mode: ExecutionMode) -> Self {
        self.execution = mode;
        self
    }

    /// Starting U and V; both default to the identity.
    pub fn initial_accumulators(mut self, u: Array2<f64>, v: Array2<f64>) -> Self {
        self.initial = Some((u, v));
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn validate(&self) -> Result<(), PcaError> {
        let (rows, cols) = self.input.dim();
        if rows == 0 {
            return Err(PcaError::InvalidDimension(
                "input matrix has no rows".to_string(),
            ));
        }
        if cols <= 1 {
            return Err(PcaError::InvalidDimension(format!(
                "at least two observations per row are required, found {cols}"
            )));
        }
        if self.components > rows {
            return Err(PcaError::InvalidDimension(format!(
                "{} components requested from {rows} rows",
                self.components
            )));
        }
        if let Some((u, v)) = &self.initial {
            for (name, m) in [("U", u), ("V", v)] {
                if m.dim() != (rows, rows) {
                    return Err(PcaError::InvalidDimension(format!(
                        "initial {name} must be {rows}x{rows}, found {}x{}",
                        m.nrows(),
                        m.ncols()
                    )));
                }
            }
        }
        Ok(())
    }

    fn accumulators(&self) -> (Array2<f64>, Array2<f64>) {
        let rows = self.input.nrows();
        match &self.initial {
            Some((u, v)) => (u.clone(), v.clone()),
            None => (Array2::eye(rows), Array2::eye(rows)),
        }
    }
}

/// Everything a finished job produces; the diagonal of `s` holds the eigenvalues.
#[derive(Clone, Debug)]
pub struct PcaResult {
    pub covariance_means: Vec<f64>,
    pub s: Array2<f64>,
    pub u: Array2<f64>,
    pub v: Array2<f64>,
    pub ranking: EigenRanking,
    pub report: SolveReport,
    pub mode: ExecutionMode,
}

impl PcaResult {
    pub fn eigenvalues(&self) -> Vec<f64> {
        self.s.diag().to_vec()
    }
}

struct Deadline {
    started: Instant,
    at: Option<Instant>,
}

impl Deadline {
    fn check(&self) -> Result<(), PcaError> {
        match self.at {
            Some(at) if Instant::now() >= at => Err(PcaError::DeadlineExceeded {
                elapsed: self.started.elapsed(),
            }),
            _ => Ok(()),
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

// ========================================================================================
//                                      Execution
// ========================================================================================

pub fn run(job: PcaJob<'_>, config: &PcaConfig) -> Result<PcaResult, PcaError> {
    run_with_progress(job, config, &mut NoopPcaProgress)
}

pub fn run_with_progress<P>(
    job: PcaJob<'_>,
    config: &PcaConfig,
    progress: &mut P,
) -> Result<PcaResult, PcaError>
where
    P: PcaProgressObserver,
{
    config.validate()?;
    job.validate()?;
    let deadline = Deadline {
        started: Instant::now(),
        at: job.deadline,
    };
    deadline.check()?;

    let (rows, cols) = job.input.dim();
    let layout = StoreLayout::plan(rows, cols, job.components);
    layout.ensure_capacity(config.capacity_bytes)?;

    let mode = resolve_mode(job.execution, rows, cols, job.components, config.working_budget());
    log::info!(
        "Running PCA on {rows}x{cols} input ({} mode, {} sweeps, {} components, {} byte working set)",
        mode.describe(),
        job.jacobi.sweeps,
        job.components,
        layout.total_bytes()
    );
    if let Some(remaining) = deadline.remaining() {
        log::debug!("Deadline in {remaining:?}");
    }

    let result = match mode {
        ExecutionMode::Streamed => match &config.scratch_path {
            Some(path) => {
                log::info!("Using memory-mapped scratch store at {}", path.display());
                let mut store =
                    MmapStore::create(path, layout.total_bytes()).map_err(PcaError::store)?;
                run_streamed(&job, &layout, &mut store, &deadline, progress)
            }
            None => {
                let mut store = MemoryStore::new(layout.total_bursts());
                run_streamed(&job, &layout, &mut store, &deadline, progress)
            }
        },
        ExecutionMode::Dense | ExecutionMode::Auto => run_dense(&job, &deadline, progress),
    }?;

    log::info!(
        "PCA finished after {} sweeps ({} rotations, off-diagonal norm {:.3e})",
        result.report.sweeps_run,
        result.report.rotations,
        result.report.off_diagonal_norm
    );
    Ok(result)
}

fn resolve_mode(
    requested: ExecutionMode,
    rows: usize,
    cols: usize,
    components: usize,
    budget_bytes: u64,
) -> ExecutionMode {
    match requested {
        ExecutionMode::Auto => match dense_working_set_bytes(rows, cols, components) {
            Some(bytes) if bytes <= budget_bytes => ExecutionMode::Dense,
            _ => {
                log::info!(
                    "Dense working set exceeds the {budget_bytes} byte budget; streaming through a burst store"
                );
                ExecutionMode::Streamed
            }
        },
        explicit => explicit,
    }
}

fn sweep_checkpoint<'d, P: PcaProgressObserver>(
    deadline: &'d Deadline,
    progress: &'d mut P,
) -> impl FnMut(SweepEvent) -> Result<(), PcaError> + 'd {
    move |event| match event {
        SweepEvent::Pivot { .. } => deadline.check(),
        SweepEvent::SweepFinished { sweep, .. } => {
            progress.on_stage_advance(PcaStage::Sweeps, sweep + 1);
            Ok(())
        }
    }
}

fn rank_stage<P: PcaProgressObserver>(
    diag: &[f64],
    components: usize,
    deadline: &Deadline,
    progress: &mut P,
) -> Result<EigenRanking, PcaError> {
    deadline.check()?;
    progress.on_stage_start(PcaStage::Ranking, components);
    let ranking = top_k(diag, components)?;
    progress.on_stage_advance(PcaStage::Ranking, components);
    progress.on_stage_finish(PcaStage::Ranking);
    Ok(ranking)
}

fn run_dense<P: PcaProgressObserver>(
    job: &PcaJob<'_>,
    deadline: &Deadline,
    progress: &mut P,
) -> Result<PcaResult, PcaError> {
    let rows = job.input.nrows();

    progress.on_stage_start(PcaStage::Covariance, rows);
    let means = row_means(job.input)?;
    let mut s = covariance_with_means(job.input, &means)?;
    progress.on_stage_advance(PcaStage::Covariance, rows);
    progress.on_stage_finish(PcaStage::Covariance);

    deadline.check()?;
    let (mut u, mut v) = job.accumulators();
    progress.on_stage_start(PcaStage::Sweeps, job.jacobi.sweeps);
    let report = solve_with_checkpoint(
        &mut s,
        &mut u,
        &mut v,
        &job.jacobi,
        sweep_checkpoint(deadline, progress),
    )?;
    progress.on_stage_finish(PcaStage::Sweeps);

    let diag = s.diag().to_vec();
    let ranking = rank_stage(&diag, job.components, deadline, progress)?;
    Ok(PcaResult {
        covariance_means: means,
        s,
        u,
        v,
        ranking,
        report,
        mode: ExecutionMode::Dense,
    })
}

fn write_matrix<S: BurstStore>(
    streamer: &mut RowStreamer<'_, S>,
    region: &MatrixRegion,
    matrix: ArrayView2<'_, f64>,
) -> Result<(), PcaError> {
    let mut cursor = region.base;
    let mut row = vec![0.0f64; region.cols];
    for source in matrix.axis_iter(Axis(0)) {
        for (dst, src) in row.iter_mut().zip(source.iter()) {
            *dst = *src;
        }
        streamer.write_row(&mut cursor, region.bursts_per_row, &row)?;
    }
    Ok(())
}

fn read_matrix<S: BurstStore>(
    streamer: &mut RowStreamer<'_, S>,
    region: &MatrixRegion,
) -> Result<Array2<f64>, PcaError> {
    let mut matrix = Array2::<f64>::zeros((region.rows, region.cols));
    let mut cursor = region.base;
    let mut row = vec![0.0f64; region.cols];
    for mut target in matrix.axis_iter_mut(Axis(0)) {
        streamer.read_row(&mut cursor, region.bursts_per_row, &mut row)?;
        for (dst, src) in target.iter_mut().zip(&row) {
            *dst = *src;
        }
    }
    Ok(matrix)
}

fn run_streamed<S: BurstStore, P: PcaProgressObserver>(
    job: &PcaJob<'_>,
    layout: &StoreLayout,
    store: &mut S,
    deadline: &Deadline,
    progress: &mut P,
) -> Result<PcaResult, PcaError> {
    let rows = layout.input.rows;
    let mut streamer = RowStreamer::new(store);

    progress.on_stage_start(PcaStage::Staging, rows);
    let mut cursor = layout.input.base;
    let mut row = vec![0u8; layout.input.cols];
    for (index, source) in job.input.axis_iter(Axis(0)).enumerate() {
        for (dst, src) in row.iter_mut().zip(source.iter()) {
            *dst = *src;
        }
        streamer.write_row(&mut cursor, layout.input.bursts_per_row, &row)?;
        progress.on_stage_advance(PcaStage::Staging, index + 1);
    }
    let (u, v) = job.accumulators();
    write_matrix(&mut streamer, &layout.u, u.view())?;
    write_matrix(&mut streamer, &layout.v, v.view())?;
    progress.on_stage_finish(PcaStage::Staging);

    deadline.check()?;
    progress.on_stage_start(PcaStage::Covariance, rows);
    let means = compute_covariance_streamed(&mut streamer, layout)?;
    progress.on_stage_advance(PcaStage::Covariance, rows);
    progress.on_stage_finish(PcaStage::Covariance);

    deadline.check()?;
    progress.on_stage_start(PcaStage::Sweeps, job.jacobi.sweeps);
    let report = solve_streamed(
        &mut streamer,
        layout,
        &job.jacobi,
        sweep_checkpoint(deadline, progress),
    )?;
    progress.on_stage_finish(PcaStage::Sweeps);

    let mut diag = Vec::with_capacity(rows);
    let mut chunk = vec![0.0f64; layout.s.elements_per_burst];
    for i in 0..rows {
        let group = layout.s.group_of(i);
        streamer.read_chunk(&layout.s, i, group, &mut chunk)?;
        diag.push(chunk[i - layout.s.group_columns(group).start]);
    }
    let ranking = rank_stage(&diag, job.components, deadline, progress)?;
    streamer.write_row_at(&layout.ranking, 0, &ranking.indices)?;
    streamer.flush()?;

    Ok(PcaResult {
        covariance_means: means,
        s: read_matrix(&mut streamer, &layout.s)?,
        u: read_matrix(&mut streamer, &layout.u)?,
        v: read_matrix(&mut streamer, &layout.v)?,
        ranking,
        report,
        mode: ExecutionMode::Streamed,
    })
}
