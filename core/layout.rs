use crate::stream::{Element, bursts_per_row, elements_per_burst};
use crate::types::{BURST_BYTES, PcaError};
use std::ops::Range;

/// A row-major matrix stored as whole bursts per row, starting at burst `base`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatrixRegion {
    pub base: usize,
    pub rows: usize,
    pub cols: usize,
    pub bursts_per_row: usize,
    pub elements_per_burst: usize,
}

impl MatrixRegion {
    pub fn new<T: Element>(base: usize, rows: usize, cols: usize) -> Self {
        Self {
            base,
            rows,
            cols,
            bursts_per_row: bursts_per_row::<T>(cols),
            elements_per_burst: elements_per_burst::<T>(),
        }
    }

    pub fn row_offset(&self, row: usize) -> usize {
        self.base + row * self.bursts_per_row
    }

    pub fn len_bursts(&self) -> usize {
        self.rows * self.bursts_per_row
    }

    /// First burst after this region.
    pub fn end(&self) -> usize {
        self.base + self.len_bursts()
    }

    /// Column group (burst index within a row) holding `col`.
    pub fn group_of(&self, col: usize) -> usize {
        col / self.elements_per_burst
    }

    /// Columns held by `group`; the last group may be narrower than a burst.
    pub fn group_columns(&self, group: usize) -> Range<usize> {
        let start = group * self.elements_per_burst;
        start..(start + self.elements_per_burst).min(self.cols)
    }
}

/// Placement of every matrix the streamed pipeline keeps in a burst store.
///
/// Regions follow each other without gaps in the order input, S, U, V and the
/// ranked index row, matching the order the stages produce them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreLayout {
    pub input: MatrixRegion,
    pub s: MatrixRegion,
    pub u: MatrixRegion,
    pub v: MatrixRegion,
    pub ranking: MatrixRegion,
}

impl StoreLayout {
    pub fn plan(rows: usize, cols: usize, components: usize) -> Self {
        let input = MatrixRegion::new::<u8>(0, rows, cols);
        let s = MatrixRegion::new::<f64>(input.end(), rows, rows);
        let u = MatrixRegion::new::<f64>(s.end(), rows, rows);
        let v = MatrixRegion::new::<f64>(u.end(), rows, rows);
        let ranking = MatrixRegion::new::<u32>(v.end(), 1, components);
        Self {
            input,
            s,
            u,
            v,
            ranking,
        }
    }

    pub fn total_bursts(&self) -> usize {
        self.ranking.end()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bursts() as u64 * BURST_BYTES as u64
    }

    /// Fails when the laid-out working set does not fit `capacity_bytes`.
    pub fn ensure_capacity(&self, capacity_bytes: u64) -> Result<(), PcaError> {
        let required = self.total_bytes();
        if required > capacity_bytes {
            return Err(PcaError::CapacityExceeded {
                required,
                capacity: capacity_bytes,
            });
        }
        Ok(())
    }
}

/// Bytes the dense path holds at once: input, three R x R matrices, means and ranking.
pub fn dense_working_set_bytes(rows: usize, cols: usize, components: usize) -> Option<u64> {
    let rows = rows as u64;
    let square = rows.checked_mul(rows)?.checked_mul(8)?;
    rows.checked_mul(cols as u64)?
        .checked_add(square.checked_mul(3)?)?
        .checked_add(rows.checked_mul(8)?)?
        .checked_add((components as u64).checked_mul(12)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_contiguous_in_stage_order() {
        let layout = StoreLayout::plan(10, 100, 4);
        assert_eq!(layout.input.base, 0);
        assert_eq!(layout.input.bursts_per_row, 2);
        assert_eq!(layout.s.base, 20);
        assert_eq!(layout.s.bursts_per_row, 2);
        assert_eq!(layout.u.base, 40);
        assert_eq!(layout.v.base, 60);
        assert_eq!(layout.ranking.base, 80);
        assert_eq!(layout.ranking.bursts_per_row, 1);
        assert_eq!(layout.total_bursts(), 81);
        assert_eq!(layout.total_bytes(), 81 * 64);
    }

    #[test]
    fn column_groups_cover_each_column_once() {
        let region = MatrixRegion::new::<f64>(0, 19, 19);
        assert_eq!(region.bursts_per_row, 3);
        let mut covered = Vec::new();
        for group in 0..region.bursts_per_row {
            for col in region.group_columns(group) {
                assert_eq!(region.group_of(col), group);
                covered.push(col);
            }
        }
        assert_eq!(covered, (0..19).collect::<Vec<_>>());
        assert_eq!(region.group_columns(2), 16..19);
    }

    #[test]
    fn capacity_check_reports_the_shortfall() {
        let layout = StoreLayout::plan(64, 64, 10);
        let required = layout.total_bytes();
        assert!(layout.ensure_capacity(required).is_ok());
        match layout.ensure_capacity(required - 1) {
            Err(PcaError::CapacityExceeded {
                required: reported,
                capacity,
            }) => {
                assert_eq!(reported, required);
                assert_eq!(capacity, required - 1);
            }
            other => panic!("expected capacity failure, got {other:?}"),
        }
    }

    #[test]
    fn dense_working_set_counts_three_square_matrices() {
        assert_eq!(
            dense_working_set_bytes(4, 10, 2),
            Some(40 + 3 * 16 * 8 + 32 + 24)
        );
        assert_eq!(dense_working_set_bytes(usize::MAX, 2, 1), None);
    }
}
