use crate::jacobi::SolveReport;
use crate::types::{EigenRanking, ExecutionMode};
use memmap2::Mmap;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("Could not access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' holds {actual} bytes but a {rows}x{cols} matrix needs {expected}.")]
    SizeMismatch {
        path: PathBuf,
        rows: usize,
        cols: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to serialize the run summary: {0}")]
    Summary(#[from] toml::ser::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> FileError + '_ {
    move |source| FileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ========================================================================================
//                                        Input
// ========================================================================================

/// Loads a raw row-major byte matrix of exactly `rows * cols` bytes.
pub fn read_matrix_file(path: &Path, rows: usize, cols: usize) -> Result<Array2<u8>, FileError> {
    let expected = rows.saturating_mul(cols);
    let file = File::open(path).map_err(io_error(path))?;
    let actual = file.metadata().map_err(io_error(path))?.len() as usize;
    if actual != expected {
        return Err(FileError::SizeMismatch {
            path: path.to_path_buf(),
            rows,
            cols,
            expected,
            actual,
        });
    }
    if expected == 0 {
        return Ok(Array2::zeros((rows, cols)));
    }
    // SAFETY: the mapping is read-only and copied out before the file is closed.
    let mmap = unsafe { Mmap::map(&file) }.map_err(io_error(path))?;
    let matrix = Array2::from_shape_vec((rows, cols), mmap.to_vec()).map_err(|err| {
        FileError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
        }
    })?;
    log::debug!("Loaded {rows}x{cols} input from {}", path.display());
    Ok(matrix)
}

/// Synthetic input counting up one per element and wrapping at 256.
pub fn ramp_matrix(rows: usize, cols: usize) -> Array2<u8> {
    Array2::from_shape_fn((rows, cols), |(row, col)| (row * cols + col) as u8)
}

// ========================================================================================
//                                        Output
// ========================================================================================

fn create_writer(path: &Path) -> Result<BufWriter<File>, FileError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    Ok(BufWriter::new(File::create(path).map_err(io_error(path))?))
}

fn emit_matrix(writer: &mut impl Write, matrix: ArrayView2<'_, f64>) -> io::Result<()> {
    for row in matrix.axis_iter(Axis(0)) {
        for value in row {
            write!(writer, "{value:.6} ")?;
        }
        writeln!(writer)?;
    }
    writer.flush()
}

fn emit_indices(writer: &mut impl Write, indices: &[u32]) -> io::Result<()> {
    for index in indices {
        write!(writer, "{index} ")?;
    }
    writeln!(writer)?;
    writer.flush()
}

/// Writes one text line per row with every value followed by a space.
pub fn write_matrix_text(path: &Path, matrix: ArrayView2<'_, f64>) -> Result<(), FileError> {
    let mut writer = create_writer(path)?;
    emit_matrix(&mut writer, matrix).map_err(io_error(path))
}

/// Writes the ranked indices on a single line.
pub fn write_sorted_indices(path: &Path, indices: &[u32]) -> Result<(), FileError> {
    let mut writer = create_writer(path)?;
    emit_indices(&mut writer, indices).map_err(io_error(path))
}

/// Machine-readable record of a finished run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub rows: usize,
    pub cols: usize,
    pub mode: ExecutionMode,
    pub sweeps_run: usize,
    pub rotations: usize,
    pub off_diagonal_norm: f64,
    pub converged_early: bool,
    pub elapsed_usec: u64,
    pub ranking: EigenRanking,
}

impl RunSummary {
    pub fn new(
        rows: usize,
        cols: usize,
        mode: ExecutionMode,
        report: &SolveReport,
        ranking: &EigenRanking,
        elapsed_usec: u64,
    ) -> Self {
        Self {
            rows,
            cols,
            mode,
            sweeps_run: report.sweeps_run,
            rotations: report.rotations,
            off_diagonal_norm: report.off_diagonal_norm,
            converged_early: report.converged_early,
            elapsed_usec,
            ranking: ranking.clone(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), FileError> {
        let text = toml::to_string_pretty(self)?;
        let mut writer = create_writer(path)?;
        writer
            .write_all(text.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(io_error(path))
    }

    pub fn load(path: &Path) -> Result<Self, FileError> {
        let text = fs::read_to_string(path).map_err(io_error(path))?;
        toml::from_str(&text).map_err(|err| FileError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, err.to_string()),
        })
    }
}
