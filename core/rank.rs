use crate::types::{EigenRanking, PcaError, RANK_SENTINEL};

/// Picks the `k` largest entries of `diag` in descending order.
///
/// Each pass takes the first maximum found with a strict comparison, so ties resolve
/// to the lowest index, then overwrites that slot of a working copy with the
/// [`RANK_SENTINEL`] marker. Every entry must lie strictly above the sentinel,
/// otherwise a consumed slot could outrank it.
pub fn top_k(diag: &[f64], k: usize) -> Result<EigenRanking, PcaError> {
    if k > diag.len() {
        return Err(PcaError::InvalidDimension(format!(
            "cannot rank {k} eigenvalues from a diagonal of length {}",
            diag.len()
        )));
    }
    if u32::try_from(diag.len()).is_err() {
        return Err(PcaError::InvalidDimension(format!(
            "diagonal of length {} exceeds the u32 index range",
            diag.len()
        )));
    }
    if let Some(index) = diag
        .iter()
        .position(|&value| value.is_nan() || value <= RANK_SENTINEL)
    {
        return Err(PcaError::InvalidDimension(format!(
            "diagonal entry {index} ({}) does not lie above the ranking sentinel {RANK_SENTINEL}",
            diag[index]
        )));
    }

    let mut working = diag.to_vec();
    let mut ranking = EigenRanking {
        values: Vec::with_capacity(k),
        indices: Vec::with_capacity(k),
    };
    for _ in 0..k {
        let mut best = 0usize;
        for (index, &value) in working.iter().enumerate().skip(1) {
            if value > working[best] {
                best = index;
            }
        }
        ranking.values.push(working[best]);
        ranking.indices.push(best as u32);
        working[best] = RANK_SENTINEL;
    }
    Ok(ranking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_the_worked_example() {
        let ranking = top_k(&[5.0, 1.0, 9.0, 3.0, 7.0], 3).unwrap();
        assert_eq!(ranking.values, vec![9.0, 7.0, 5.0]);
        assert_eq!(ranking.indices, vec![2, 4, 0]);
    }

    #[test]
    fn ties_resolve_to_the_lowest_index() {
        let ranking = top_k(&[2.0, 4.0, 4.0, 1.0], 3).unwrap();
        assert_eq!(ranking.indices, vec![1, 2, 0]);
        assert_eq!(ranking.values, vec![4.0, 4.0, 2.0]);
    }

    #[test]
    fn full_ranking_is_a_permutation() {
        let diag = [0.5, -1.0, 3.5, 0.0, 2.0, 2.5];
        let ranking = top_k(&diag, diag.len()).unwrap();
        let mut seen = ranking.indices.clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert!(ranking.values.windows(2).all(|w| w[0] >= w[1]));
        for (value, index) in ranking.iter() {
            assert_eq!(value, diag[index as usize]);
        }
    }

    #[test]
    fn input_is_not_modified() {
        let diag = vec![1.0, 3.0, 2.0];
        let ranking = top_k(&diag, 2).unwrap();
        assert_eq!(diag, vec![1.0, 3.0, 2.0]);
        assert_eq!(ranking.len(), 2);
    }

    #[test]
    fn zero_components_give_an_empty_ranking() {
        let ranking = top_k(&[1.0, 2.0], 0).unwrap();
        assert!(ranking.is_empty());
    }

    #[test]
    fn entries_at_or_below_the_sentinel_are_rejected() {
        assert!(matches!(
            top_k(&[-2.0e9, -3.0e9], 2),
            Err(PcaError::InvalidDimension(_))
        ));
        assert!(matches!(
            top_k(&[1.0, RANK_SENTINEL], 1),
            Err(PcaError::InvalidDimension(_))
        ));
        assert!(matches!(
            top_k(&[1.0, f64::NAN], 1),
            Err(PcaError::InvalidDimension(_))
        ));
    }

    #[test]
    fn large_negative_entries_above_the_sentinel_rank_distinctly() {
        let ranking = top_k(&[-1.0e9, -1.05e9, 4.0], 3).unwrap();
        assert_eq!(ranking.indices, vec![2, 0, 1]);
    }

    #[test]
    fn asking_for_too_many_fails() {
        assert!(matches!(
            top_k(&[1.0, 2.0], 3),
            Err(PcaError::InvalidDimension(_))
        ));
    }
}
