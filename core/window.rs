//! Cyclic Jacobi sweep over matrices that live in a burst store.
//!
//! Only the pivot rows `p` and `q` of S, U and V are held whole. The columns `p` and
//! `q` of S are touched in every row, so they are served from column windows: one
//! burst-wide chunk of S per row, covering the column group that contains the pivot.
//! The store plus the live windows always describe S exactly; a window is written back
//! when its pivot moves to another column group and at the end of every `p`.

use crate::jacobi::{JacobiOptions, Rotation, SolveReport, SweepEvent, finish_sweep, log_outcome};
use crate::layout::{MatrixRegion, StoreLayout};
use crate::stream::{BurstStore, RowStreamer};
use crate::types::PcaError;
use std::ops::Range;

/// The chunk of one column group of S for every row.
struct ColumnWindow {
    group: usize,
    columns: Range<usize>,
    width: usize,
    chunks: Vec<f64>,
}

impl ColumnWindow {
    fn load<S: BurstStore>(
        streamer: &mut RowStreamer<'_, S>,
        region: &MatrixRegion,
        group: usize,
    ) -> Result<Self, PcaError> {
        let width = region.elements_per_burst;
        let mut chunks = vec![0.0f64; region.rows * width];
        for (row, chunk) in chunks.chunks_exact_mut(width).enumerate() {
            streamer.read_chunk(region, row, group, chunk)?;
        }
        Ok(Self {
            group,
            columns: region.group_columns(group),
            width,
            chunks,
        })
    }

    fn flush<S: BurstStore>(
        &self,
        streamer: &mut RowStreamer<'_, S>,
        region: &MatrixRegion,
    ) -> Result<(), PcaError> {
        for (row, chunk) in self.chunks.chunks_exact(self.width).enumerate() {
            streamer.write_chunk(region, row, self.group, chunk)?;
        }
        Ok(())
    }

    fn contains(&self, col: usize) -> bool {
        self.columns.contains(&col)
    }

    fn set(&mut self, row: usize, col: usize, value: f64) {
        self.chunks[row * self.width + (col - self.columns.start)] = value;
    }

    /// Copies this window's columns of `row` over the matching entries of `full_row`.
    fn overlay_row(&self, row: usize, full_row: &mut [f64]) {
        let chunk = &self.chunks[row * self.width..][..self.columns.len()];
        full_row[self.columns.clone()].copy_from_slice(chunk);
    }

    /// Takes this window's columns of `row` from `full_row`.
    fn sync_row(&mut self, row: usize, full_row: &[f64]) {
        let len = self.columns.len();
        self.chunks[row * self.width..][..len].copy_from_slice(&full_row[self.columns.clone()]);
    }
}

struct PivotRows {
    s: Vec<f64>,
    u: Vec<f64>,
    v: Vec<f64>,
}

impl PivotRows {
    fn new(n: usize) -> Self {
        Self {
            s: vec![0.0; n],
            u: vec![0.0; n],
            v: vec![0.0; n],
        }
    }

    fn read<S: BurstStore>(
        &mut self,
        streamer: &mut RowStreamer<'_, S>,
        layout: &StoreLayout,
        row: usize,
    ) -> Result<(), PcaError> {
        streamer.read_row_at(&layout.s, row, &mut self.s)?;
        streamer.read_row_at(&layout.u, row, &mut self.u)?;
        streamer.read_row_at(&layout.v, row, &mut self.v)
    }

    fn write<S: BurstStore>(
        &self,
        streamer: &mut RowStreamer<'_, S>,
        layout: &StoreLayout,
        row: usize,
    ) -> Result<(), PcaError> {
        streamer.write_row_at(&layout.s, row, &self.s)?;
        streamer.write_row_at(&layout.u, row, &self.u)?;
        streamer.write_row_at(&layout.v, row, &self.v)
    }
}

fn validate_layout(layout: &StoreLayout) -> Result<usize, PcaError> {
    let n = layout.s.rows;
    for (name, region) in [("S", &layout.s), ("U", &layout.u), ("V", &layout.v)] {
        if region.rows != n || region.cols != n {
            return Err(PcaError::InvalidDimension(format!(
                "{name} region must be {n}x{n}, found {}x{}",
                region.rows, region.cols
            )));
        }
    }
    Ok(n)
}

fn streamed_off_diagonal_norm<S: BurstStore>(
    streamer: &mut RowStreamer<'_, S>,
    region: &MatrixRegion,
) -> Result<f64, PcaError> {
    let mut row = vec![0.0f64; region.cols];
    let mut sum = 0.0f64;
    for i in 0..region.rows {
        streamer.read_row_at(region, i, &mut row)?;
        for (j, value) in row.iter().enumerate() {
            if i != j {
                sum += value * value;
            }
        }
    }
    Ok(sum.sqrt())
}

/// Runs the cyclic Jacobi sweep on S, U and V held in `layout`'s regions of the store.
///
/// Produces bit-for-bit the same S, U and V as [`crate::jacobi::solve`].
pub fn solve_streamed<S, F>(
    streamer: &mut RowStreamer<'_, S>,
    layout: &StoreLayout,
    options: &JacobiOptions,
    mut checkpoint: F,
) -> Result<SolveReport, PcaError>
where
    S: BurstStore,
    F: FnMut(SweepEvent) -> Result<(), PcaError>,
{
    let n = validate_layout(layout)?;
    let region = layout.s;
    let mut report = SolveReport {
        sweeps_run: 0,
        rotations: 0,
        off_diagonal_norm: streamed_off_diagonal_norm(streamer, &region)?,
        converged_early: false,
    };
    let mut pivot_p = PivotRows::new(n);
    let mut pivot_q = PivotRows::new(n);

    for sweep in 0..options.sweeps {
        for p in 0..n.saturating_sub(1) {
            checkpoint(SweepEvent::Pivot { sweep, p })?;
            pivot_p.read(streamer, layout, p)?;
            let mut window_p = ColumnWindow::load(streamer, &region, region.group_of(p))?;
            let mut window_q: Option<ColumnWindow> = None;

            for q in (p + 1)..n {
                let group_q = region.group_of(q);
                let needs_window =
                    group_q != window_p.group && window_q.as_ref().map(|w| w.group) != Some(group_q);
                if needs_window {
                    if let Some(old) = window_q.take() {
                        old.flush(streamer, &region)?;
                    }
                    let mut fresh = ColumnWindow::load(streamer, &region, group_q)?;
                    fresh.sync_row(p, &pivot_p.s);
                    window_q = Some(fresh);
                }

                pivot_q.read(streamer, layout, q)?;
                window_p.overlay_row(q, &mut pivot_q.s);
                if let Some(window) = &window_q {
                    window.overlay_row(q, &mut pivot_q.s);
                }

                let (app, aqq, apq) = (pivot_p.s[p], pivot_q.s[q], pivot_p.s[q]);
                if let Some(rotation) = Rotation::annihilating(app, aqq, apq) {
                    let (new_pp, new_qq) = rotation.rotate_block(app, aqq, apq);
                    for r in 0..n {
                        if r == p || r == q {
                            continue;
                        }
                        let (rp, rq) = rotation.rotate_pair(pivot_p.s[r], pivot_q.s[r]);
                        pivot_p.s[r] = rp;
                        pivot_q.s[r] = rq;
                        window_p.set(r, p, rp);
                        match window_q.as_mut() {
                            Some(window) if !window_p.contains(q) => window.set(r, q, rq),
                            _ => window_p.set(r, q, rq),
                        }
                    }
                    pivot_p.s[p] = new_pp;
                    pivot_q.s[q] = new_qq;
                    pivot_p.s[q] = 0.0;
                    pivot_q.s[p] = 0.0;
                    for (a, b) in pivot_p.u.iter_mut().zip(pivot_q.u.iter_mut()) {
                        (*a, *b) = rotation.rotate_pair(*a, *b);
                    }
                    for (a, b) in pivot_p.v.iter_mut().zip(pivot_q.v.iter_mut()) {
                        (*a, *b) = rotation.rotate_pair(*a, *b);
                    }
                    report.rotations += 1;
                }

                window_p.sync_row(p, &pivot_p.s);
                window_p.sync_row(q, &pivot_q.s);
                if let Some(window) = window_q.as_mut() {
                    window.sync_row(p, &pivot_p.s);
                    window.sync_row(q, &pivot_q.s);
                }
                pivot_q.write(streamer, layout, q)?;
            }

            if let Some(window) = window_q.take() {
                window.flush(streamer, &region)?;
            }
            window_p.flush(streamer, &region)?;
            pivot_p.write(streamer, layout, p)?;
        }

        let norm = streamed_off_diagonal_norm(streamer, &region)?;
        checkpoint(SweepEvent::SweepFinished {
            sweep,
            off_diagonal_norm: norm,
        })?;
        if finish_sweep(options, &mut report, sweep, norm) {
            break;
        }
    }
    streamer.flush()?;
    log_outcome(options, &report);
    log::debug!(
        "Streamed Jacobi solve moved {} bursts",
        streamer.bursts_transferred()
    );
    Ok(report)
}
