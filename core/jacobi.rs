use crate::types::{DEFAULT_SWEEPS, PcaError};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct JacobiOptions {
    /// Full sweeps over every (p, q) pair.
    pub sweeps: usize,
    /// Stop after a sweep once the off-diagonal Frobenius norm falls to this value.
    pub tolerance: Option<f64>,
}

impl Default for JacobiOptions {
    fn default() -> Self {
        Self {
            sweeps: DEFAULT_SWEEPS,
            tolerance: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    pub sweeps_run: usize,
    pub rotations: usize,
    pub off_diagonal_norm: f64,
    pub converged_early: bool,
}

/// Points at which a running solve hands control back to its caller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SweepEvent {
    Pivot { sweep: usize, p: usize },
    SweepFinished { sweep: usize, off_diagonal_norm: f64 },
}

/// A plane rotation that zeroes one symmetric off-diagonal pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rotation {
    pub cos: f64,
    pub sin: f64,
}

impl Rotation {
    /// Rotation annihilating `S[p][q]` for the 2x2 block `[[app, apq], [apq, aqq]]`.
    ///
    /// Returns `None` when the block is already diagonal. Equal diagonal entries
    /// take the pi/4 angle instead of dividing by zero.
    pub fn annihilating(app: f64, aqq: f64, apq: f64) -> Option<Self> {
        if apq == 0.0 {
            return None;
        }
        let theta = if app == aqq {
            FRAC_PI_4
        } else {
            0.5 * (2.0 * apq / (app - aqq)).atan()
        };
        Some(Self {
            cos: theta.cos(),
            sin: theta.sin(),
        })
    }

    /// New `(S[p][p], S[q][q])` after the rotation.
    pub fn rotate_block(&self, app: f64, aqq: f64, apq: f64) -> (f64, f64) {
        let (c, s) = (self.cos, self.sin);
        let cross = 2.0 * c * s * apq;
        (
            c * c * app + cross + s * s * aqq,
            s * s * app - cross + c * c * aqq,
        )
    }

    #[inline]
    pub fn rotate_pair(&self, p_value: f64, q_value: f64) -> (f64, f64) {
        (
            self.cos * p_value + self.sin * q_value,
            -self.sin * p_value + self.cos * q_value,
        )
    }
}

fn validate_shapes(s: &Array2<f64>, u: &Array2<f64>, v: &Array2<f64>) -> Result<usize, PcaError> {
    let (rows, cols) = s.dim();
    if rows != cols {
        return Err(PcaError::InvalidDimension(format!(
            "covariance matrix must be square, found {rows}x{cols}"
        )));
    }
    for (name, m) in [("U", u), ("V", v)] {
        if m.dim() != (rows, rows) {
            return Err(PcaError::InvalidDimension(format!(
                "{name} must be {rows}x{rows} to match S, found {}x{}",
                m.nrows(),
                m.ncols()
            )));
        }
    }
    Ok(rows)
}

fn rotate_rows(m: &mut Array2<f64>, p: usize, q: usize, rotation: &Rotation) {
    for col in 0..m.ncols() {
        let (new_p, new_q) = rotation.rotate_pair(m[[p, col]], m[[q, col]]);
        m[[p, col]] = new_p;
        m[[q, col]] = new_q;
    }
}

/// Applies the rotation for pair `(p, q)` to S and accumulates it into rows `p`, `q` of U and V.
pub fn apply_rotation(
    s: &mut Array2<f64>,
    u: &mut Array2<f64>,
    v: &mut Array2<f64>,
    p: usize,
    q: usize,
) -> Option<Rotation> {
    let (app, aqq, apq) = (s[[p, p]], s[[q, q]], s[[p, q]]);
    let rotation = Rotation::annihilating(app, aqq, apq)?;
    let (new_pp, new_qq) = rotation.rotate_block(app, aqq, apq);
    for r in 0..s.nrows() {
        if r == p || r == q {
            continue;
        }
        let (rp, rq) = rotation.rotate_pair(s[[p, r]], s[[q, r]]);
        s[[p, r]] = rp;
        s[[r, p]] = rp;
        s[[q, r]] = rq;
        s[[r, q]] = rq;
    }
    s[[p, p]] = new_pp;
    s[[q, q]] = new_qq;
    s[[p, q]] = 0.0;
    s[[q, p]] = 0.0;
    rotate_rows(u, p, q, &rotation);
    rotate_rows(v, p, q, &rotation);
    Some(rotation)
}

pub fn off_diagonal_norm(s: ArrayView2<'_, f64>) -> f64 {
    let mut sum = 0.0f64;
    for ((row, col), value) in s.indexed_iter() {
        if row != col {
            sum += value * value;
        }
    }
    sum.sqrt()
}

/// Records a finished sweep and returns `true` once the tolerance is met.
pub(crate) fn finish_sweep(
    options: &JacobiOptions,
    report: &mut SolveReport,
    sweep: usize,
    norm: f64,
) -> bool {
    report.sweeps_run = sweep + 1;
    report.off_diagonal_norm = norm;
    log::debug!("Jacobi sweep {} finished, off-diagonal norm {norm:.6e}", sweep + 1);
    match options.tolerance {
        Some(tolerance) if norm <= tolerance => {
            report.converged_early = report.sweeps_run < options.sweeps;
            true
        }
        _ => false,
    }
}

pub(crate) fn log_outcome(options: &JacobiOptions, report: &SolveReport) {
    if let Some(tolerance) = options.tolerance {
        if report.off_diagonal_norm > tolerance {
            log::debug!(
                "Jacobi solve stopped after {} sweeps above tolerance {tolerance:.3e} (norm {:.3e})",
                report.sweeps_run,
                report.off_diagonal_norm
            );
        }
    }
}

/// Runs the cyclic Jacobi sweep on in-memory matrices.
pub fn solve(
    s: &mut Array2<f64>,
    u: &mut Array2<f64>,
    v: &mut Array2<f64>,
    options: &JacobiOptions,
) -> Result<SolveReport, PcaError> {
    solve_with_checkpoint(s, u, v, options, |_| Ok(()))
}

/// Like [`solve`], calling `checkpoint` before every pivot row and after every sweep.
///
/// An error returned by the checkpoint aborts the solve and is passed through.
pub fn solve_with_checkpoint<F>(
    s: &mut Array2<f64>,
    u: &mut Array2<f64>,
    v: &mut Array2<f64>,
    options: &JacobiOptions,
    mut checkpoint: F,
) -> Result<SolveReport, PcaError>
where
    F: FnMut(SweepEvent) -> Result<(), PcaError>,
{
    let n = validate_shapes(s, u, v)?;
    let mut report = SolveReport {
        sweeps_run: 0,
        rotations: 0,
        off_diagonal_norm: off_diagonal_norm(s.view()),
        converged_early: false,
    };

    for sweep in 0..options.sweeps {
        for p in 0..n.saturating_sub(1) {
            checkpoint(SweepEvent::Pivot { sweep, p })?;
            for q in (p + 1)..n {
                if apply_rotation(s, u, v, p, q).is_some() {
                    report.rotations += 1;
                }
            }
        }
        let norm = off_diagonal_norm(s.view());
        checkpoint(SweepEvent::SweepFinished {
            sweep,
            off_diagonal_norm: norm,
        })?;
        if finish_sweep(options, &mut report, sweep, norm) {
            break;
        }
    }
    log_outcome(options, &report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_symmetric(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut m = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in i..n {
                let value = rng.gen_range(-5.0..5.0);
                m[[i, j]] = value;
                m[[j, i]] = value;
            }
        }
        m
    }

    fn assert_mats_close(actual: &Array2<f64>, expected: &Array2<f64>, tol: f64) {
        assert_eq!(actual.dim(), expected.dim());
        for ((row, col), value) in actual.indexed_iter() {
            let target = expected[[row, col]];
            assert!(
                (value - target).abs() <= tol,
                "mismatch at ({row}, {col}): {value} vs {target}"
            );
        }
    }

    #[test]
    fn every_rotation_preserves_trace_and_symmetry() {
        let n = 7;
        let mut s = random_symmetric(n, 3);
        let mut u = Array2::eye(n);
        let mut v = Array2::eye(n);
        let trace = s.diag().sum();
        for p in 0..n - 1 {
            for q in (p + 1)..n {
                apply_rotation(&mut s, &mut u, &mut v, p, q);
                assert!(
                    (s.diag().sum() - trace).abs() <= 1e-9,
                    "trace drifted after rotation ({p}, {q})"
                );
                assert_eq!(s[[p, q]], 0.0);
                for i in 0..n {
                    for j in 0..n {
                        assert_eq!(s[[i, j]].to_bits(), s[[j, i]].to_bits());
                    }
                }
            }
        }
    }

    #[test]
    fn accumulated_rows_stay_orthonormal() {
        let n = 12;
        let mut s = random_symmetric(n, 9);
        let mut u = Array2::eye(n);
        let mut v = Array2::eye(n);
        solve(&mut s, &mut u, &mut v, &JacobiOptions::default()).unwrap();
        assert_mats_close(&u.dot(&u.t()), &Array2::eye(n), 1e-9);
        assert_mats_close(&u, &v, 0.0);
    }

    #[test]
    fn solve_reconstructs_the_input() {
        let n = 9;
        let original = random_symmetric(n, 21);
        let mut s = original.clone();
        let mut u = Array2::eye(n);
        let mut v = Array2::eye(n);
        let report = solve(&mut s, &mut u, &mut v, &JacobiOptions::default()).unwrap();
        assert_eq!(report.sweeps_run, DEFAULT_SWEEPS);
        assert!(report.off_diagonal_norm <= 1e-8, "norm {}", report.off_diagonal_norm);

        let eigenvalues = Array2::from_diag(&s.diag().to_owned());
        let rebuilt = u.t().dot(&eigenvalues).dot(&u);
        assert_mats_close(&rebuilt, &original, 1e-8);

        for i in 0..n {
            let vector: Array1<f64> = u.row(i).to_owned();
            let applied = original.dot(&vector);
            assert_mats_close(
                &applied.insert_axis(ndarray::Axis(0)),
                &(&vector * s[[i, i]]).insert_axis(ndarray::Axis(0)),
                1e-8,
            );
        }
    }

    #[test]
    fn diagonal_input_is_left_untouched() {
        let mut s = Array2::from_diag(&array![4.0, 1.0, 3.0, 2.0]);
        let mut u = Array2::eye(4);
        let mut v = Array2::eye(4);
        let report = solve(&mut s, &mut u, &mut v, &JacobiOptions::default()).unwrap();
        assert_eq!(report.rotations, 0);
        assert_eq!(report.off_diagonal_norm, 0.0);
        assert_eq!(s, Array2::from_diag(&array![4.0, 1.0, 3.0, 2.0]));
        assert_eq!(u, Array2::eye(4));
        assert_eq!(v, Array2::eye(4));
    }

    #[test]
    fn equal_diagonal_uses_quarter_turn() {
        let rotation = Rotation::annihilating(2.0, 2.0, 1.0).unwrap();
        assert!((rotation.cos - FRAC_PI_4.cos()).abs() <= 1e-15);
        let mut s = array![[2.0, 1.0], [1.0, 2.0]];
        let mut u = Array2::eye(2);
        let mut v = Array2::eye(2);
        apply_rotation(&mut s, &mut u, &mut v, 0, 1);
        assert!((s[[0, 0]] - 3.0).abs() <= 1e-12);
        assert!((s[[1, 1]] - 1.0).abs() <= 1e-12);
        assert_eq!(s[[0, 1]], 0.0);
    }

    #[test]
    fn tolerance_stops_early() {
        let n = 6;
        let mut s = random_symmetric(n, 44);
        let mut u = Array2::eye(n);
        let mut v = Array2::eye(n);
        let options = JacobiOptions {
            sweeps: 50,
            tolerance: Some(1e-6),
        };
        let report = solve(&mut s, &mut u, &mut v, &options).unwrap();
        assert!(report.converged_early);
        assert!(report.sweeps_run < 50);
        assert!(report.off_diagonal_norm <= 1e-6);
    }

    #[test]
    fn checkpoint_errors_abort_the_solve() {
        let n = 5;
        let mut s = random_symmetric(n, 8);
        let mut u = Array2::eye(n);
        let mut v = Array2::eye(n);
        let mut pivots = 0;
        let result = solve_with_checkpoint(&mut s, &mut u, &mut v, &JacobiOptions::default(), |event| {
            if let SweepEvent::Pivot { sweep: 1, p: 2 } = event {
                return Err(PcaError::Config("stop".to_string()));
            }
            pivots += 1;
            Ok(())
        });
        assert!(matches!(result, Err(PcaError::Config(_))));
        assert_eq!(pivots, 4 + 1 + 2);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let mut s = Array2::<f64>::zeros((3, 3));
        let mut u = Array2::<f64>::zeros((3, 2));
        let mut v = Array2::<f64>::eye(3);
        assert!(matches!(
            solve(&mut s, &mut u, &mut v, &JacobiOptions::default()),
            Err(PcaError::InvalidDimension(_))
        ));
        let mut rect = Array2::<f64>::zeros((2, 3));
        let mut u = Array2::<f64>::eye(2);
        let mut v = Array2::<f64>::eye(2);
        assert!(matches!(
            solve(&mut rect, &mut u, &mut v, &JacobiOptions::default()),
            Err(PcaError::InvalidDimension(_))
        ));
    }
}
