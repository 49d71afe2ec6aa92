use crate::layout::StoreLayout;
use crate::stream::{BurstStore, RowStreamer};
use crate::types::PcaError;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, ArrayViewMut1, Axis};

/// Row count from which the upper triangle is filled in parallel.
const PARALLEL_ROW_THRESHOLD: usize = 64;

fn validate_shape(rows: usize, cols: usize) -> Result<(), PcaError> {
    if rows == 0 {
        return Err(PcaError::InvalidDimension(
            "input matrix has no rows".to_string(),
        ));
    }
    if cols <= 1 {
        return Err(PcaError::InvalidDimension(format!(
            "at least two observations per row are required for a sample covariance, found {cols}"
        )));
    }
    Ok(())
}

fn mean_of<'a>(values: impl Iterator<Item = &'a u8>, cols: usize) -> f64 {
    let sum: u64 = values.map(|&v| u64::from(v)).sum();
    sum as f64 / cols as f64
}

/// Bessel-corrected covariance of two rows given their means.
fn centered_covariance<'a>(
    left: impl Iterator<Item = &'a u8>,
    left_mean: f64,
    right: impl Iterator<Item = &'a u8>,
    right_mean: f64,
    cols: usize,
) -> f64 {
    let mut acc = 0.0f64;
    for (&x, &y) in left.zip(right) {
        acc += (f64::from(x) - left_mean) * (f64::from(y) - right_mean);
    }
    acc / (cols - 1) as f64
}

pub fn row_means(input: ArrayView2<'_, u8>) -> Result<Vec<f64>, PcaError> {
    let (rows, cols) = input.dim();
    validate_shape(rows, cols)?;
    Ok(input
        .axis_iter(Axis(0))
        .map(|row| mean_of(row.iter(), cols))
        .collect())
}

pub fn compute_covariance(input: ArrayView2<'_, u8>) -> Result<Array2<f64>, PcaError> {
    let means = row_means(input)?;
    covariance_with_means(input, &means)
}

/// Covariance matrix from precomputed row means; the upper triangle is mirrored.
pub fn covariance_with_means(
    input: ArrayView2<'_, u8>,
    means: &[f64],
) -> Result<Array2<f64>, PcaError> {
    let (rows, cols) = input.dim();
    validate_shape(rows, cols)?;
    if means.len() != rows {
        return Err(PcaError::InvalidDimension(format!(
            "{} row means supplied for {rows} rows",
            means.len()
        )));
    }

    let mut cov = Array2::<f64>::zeros((rows, rows));
    let fill_row = |i: usize, mut out: ArrayViewMut1<'_, f64>| {
        let left = input.row(i);
        for j in i..rows {
            out[j] = centered_covariance(left.iter(), means[i], input.row(j).iter(), means[j], cols);
        }
    };

    if rows >= PARALLEL_ROW_THRESHOLD {
        log::debug!(
            "Filling {rows} covariance rows across {} threads",
            rayon::current_num_threads()
        );
        cov.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(i, out)| fill_row(i, out));
    } else {
        for (i, out) in cov.axis_iter_mut(Axis(0)).enumerate() {
            fill_row(i, out);
        }
    }

    for i in 1..rows {
        for j in 0..i {
            cov[[i, j]] = cov[[j, i]];
        }
    }
    log::debug!("Computed {rows}x{rows} covariance over {cols} observations");
    Ok(cov)
}

/// Computes S inside a store, reading input rows and writing S rows through `streamer`.
///
/// Returns the row means. Entries below the diagonal are read back from the S rows
/// already written instead of being recomputed.
pub fn compute_covariance_streamed<S: BurstStore>(
    streamer: &mut RowStreamer<'_, S>,
    layout: &StoreLayout,
) -> Result<Vec<f64>, PcaError> {
    let rows = layout.input.rows;
    let cols = layout.input.cols;
    validate_shape(rows, cols)?;
    let input_bursts = layout.input.bursts_per_row;

    let mut row = vec![0u8; cols];
    let mut cursor = layout.input.base;
    let mut means = Vec::with_capacity(rows);
    for _ in 0..rows {
        streamer.read_row(&mut cursor, input_bursts, &mut row)?;
        means.push(mean_of(row.iter(), cols));
    }

    let mut inner = vec![0u8; cols];
    let mut cov_row = vec![0.0f64; rows];
    let mut chunk = vec![0.0f64; layout.s.elements_per_burst];
    let mut outer_cursor = layout.input.base;
    let mut out_cursor = layout.s.base;
    for i in 0..rows {
        let group = layout.s.group_of(i);
        let lane = i - layout.s.group_columns(group).start;
        for (j, entry) in cov_row.iter_mut().enumerate().take(i) {
            streamer.read_chunk(&layout.s, j, group, &mut chunk)?;
            *entry = chunk[lane];
        }

        streamer.read_row(&mut outer_cursor, input_bursts, &mut row)?;
        cov_row[i] = centered_covariance(row.iter(), means[i], row.iter(), means[i], cols);
        let mut inner_cursor = outer_cursor;
        for j in (i + 1)..rows {
            streamer.read_row(&mut inner_cursor, input_bursts, &mut inner)?;
            cov_row[j] = centered_covariance(row.iter(), means[i], inner.iter(), means[j], cols);
        }
        streamer.write_row(&mut out_cursor, layout.s.bursts_per_row, &cov_row)?;
    }
    log::debug!(
        "Streamed {rows}x{rows} covariance; {} bursts transferred so far",
        streamer.bursts_transferred()
    );
    Ok(means)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStore;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_input(rows: usize, cols: usize, seed: u64) -> Array2<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.r#gen::<u8>())
    }

    fn stage_input<S: BurstStore>(
        streamer: &mut RowStreamer<'_, S>,
        layout: &StoreLayout,
        input: &Array2<u8>,
    ) {
        for (i, row) in input.axis_iter(Axis(0)).enumerate() {
            let values: Vec<u8> = row.to_vec();
            streamer.write_row_at(&layout.input, i, &values).unwrap();
        }
    }

    #[test]
    fn means_use_integer_sums() {
        let input = array![[1u8, 2, 4], [255, 255, 0]];
        let means = row_means(input.view()).unwrap();
        assert_abs_diff_eq!(means[0], 7.0 / 3.0);
        assert_abs_diff_eq!(means[1], 170.0);
    }

    #[test]
    fn centered_rows_sum_to_zero() {
        let input = random_input(20, 37, 3);
        let means = row_means(input.view()).unwrap();
        for (i, row) in input.axis_iter(Axis(0)).enumerate() {
            let mut residual = 0.0f64;
            for &x in row.iter() {
                residual += f64::from(x) - means[i];
            }
            assert!(residual.abs() <= 1e-9 * 37.0, "row {i} centers to {residual}");
        }
    }

    #[test]
    fn covariance_matches_hand_computation() {
        let input = array![[1u8, 2, 3, 4], [2, 4, 6, 8], [4, 3, 2, 1]];
        let cov = compute_covariance(input.view()).unwrap();
        let expected = array![
            [5.0 / 3.0, 10.0 / 3.0, -5.0 / 3.0],
            [10.0 / 3.0, 20.0 / 3.0, -10.0 / 3.0],
            [-5.0 / 3.0, -10.0 / 3.0, 5.0 / 3.0]
        ];
        for ((row, col), value) in cov.indexed_iter() {
            assert!(
                (value - expected[[row, col]]).abs() <= 1e-12,
                "mismatch at ({row}, {col}): {value} vs {}",
                expected[[row, col]]
            );
        }
    }

    #[test]
    fn covariance_is_symmetric() {
        let input = random_input(70, 33, 11);
        let cov = compute_covariance(input.view()).unwrap();
        for i in 0..70 {
            for j in 0..70 {
                assert_eq!(cov[[i, j]].to_bits(), cov[[j, i]].to_bits());
            }
        }
    }

    #[test]
    fn constant_shift_leaves_covariance_unchanged() {
        let input = random_input(6, 40, 5).mapv(|v| v / 2);
        let shifted = input.mapv(|v| v + 100);
        let base = compute_covariance(input.view()).unwrap();
        let moved = compute_covariance(shifted.view()).unwrap();
        for ((row, col), value) in base.indexed_iter() {
            assert!(
                (value - moved[[row, col]]).abs() <= 1e-9,
                "mismatch at ({row}, {col})"
            );
        }
    }

    #[test]
    fn degenerate_shapes_are_rejected() {
        let single_column = Array2::<u8>::zeros((3, 1));
        assert!(matches!(
            compute_covariance(single_column.view()),
            Err(PcaError::InvalidDimension(_))
        ));
        let no_rows = Array2::<u8>::zeros((0, 5));
        assert!(matches!(
            row_means(no_rows.view()),
            Err(PcaError::InvalidDimension(_))
        ));
    }

    #[test]
    fn streamed_covariance_is_bit_identical_to_dense() {
        for &(rows, cols) in &[(1usize, 2usize), (5, 9), (17, 70), (24, 130)] {
            let input = random_input(rows, cols, (rows * cols) as u64);
            let dense = compute_covariance(input.view()).unwrap();

            let layout = StoreLayout::plan(rows, cols, 0);
            let mut store = MemoryStore::new(layout.total_bursts());
            let mut streamer = RowStreamer::new(&mut store);
            stage_input(&mut streamer, &layout, &input);
            let means = compute_covariance_streamed(&mut streamer, &layout).unwrap();
            assert_eq!(means, row_means(input.view()).unwrap());

            let mut row = vec![0.0f64; rows];
            for i in 0..rows {
                streamer.read_row_at(&layout.s, i, &mut row).unwrap();
                for j in 0..rows {
                    assert_eq!(
                        row[j].to_bits(),
                        dense[[i, j]].to_bits(),
                        "mismatch at ({i}, {j}) for {rows}x{cols}"
                    );
                }
            }
        }
    }
}
