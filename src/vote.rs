//! Weighted label voting
//!
//! Combines per-atlas weights with each atlas's (search-corrected) label into
//! a posterior over labels at one voxel.

use std::collections::BTreeMap;

/// Label assigned when no atlas casts an eligible vote
pub const BACKGROUND_LABEL: i32 = 0;

/// Outcome of voting at one voxel
#[derive(Clone, Debug, PartialEq)]
pub struct Vote {
    /// Maximum-posterior label (smallest label on ties)
    pub label: i32,
    /// Positive posteriors in ascending label order
    pub posteriors: Vec<(i32, f64)>,
}

impl Vote {
    pub fn background() -> Self {
        Self { label: BACKGROUND_LABEL, posteriors: Vec::new() }
    }

    /// A voxel where every eligible atlas agrees
    pub fn unanimous(label: i32) -> Self {
        Self { label, posteriors: vec![(label, 1.0)] }
    }

    pub fn posterior(&self, label: i32) -> f64 {
        self.posteriors
            .iter()
            .find(|(l, _)| *l == label)
            .map(|&(_, p)| p)
            .unwrap_or(0.0)
    }
}

/// Aggregate atlas votes into a posterior
///
/// # Arguments
/// * `weights` - One non-negative weight per atlas (any scale)
/// * `labels` - Label each atlas votes for at this voxel
/// * `is_forbidden` - True for labels excluded at this voxel
///
/// Votes for forbidden labels are dropped before normalization. When the
/// remaining votes carry no weight at all, they count equally.
pub fn aggregate<F>(weights: &[f64], labels: &[i32], is_forbidden: F) -> Vote
where
    F: Fn(i32) -> bool,
{
    debug_assert_eq!(weights.len(), labels.len());

    let mut tally: BTreeMap<i32, f64> = BTreeMap::new();
    let mut forbidden_cache: BTreeMap<i32, bool> = BTreeMap::new();
    let mut total = 0.0;
    let mut eligible = 0usize;

    for (&w, &label) in weights.iter().zip(labels.iter()) {
        let forbidden = *forbidden_cache.entry(label).or_insert_with(|| is_forbidden(label));
        if forbidden {
            continue;
        }
        *tally.entry(label).or_insert(0.0) += w;
        total += w;
        eligible += 1;
    }

    if eligible == 0 {
        return Vote::background();
    }

    if !(total > 0.0 && total.is_finite()) {
        // Degenerate weights: fall back to counting eligible votes
        tally.values_mut().for_each(|v| *v = 0.0);
        for &label in labels {
            if let Some(v) = tally.get_mut(&label) {
                *v += 1.0;
            }
        }
        total = eligible as f64;
    }

    let mut best_label = BACKGROUND_LABEL;
    let mut best_p = f64::NEG_INFINITY;
    let mut posteriors = Vec::with_capacity(tally.len());
    for (&label, &sum) in tally.iter() {
        let p = sum / total;
        if p > best_p {
            best_p = p;
            best_label = label;
        }
        if p > 0.0 {
            posteriors.push((label, p));
        }
    }

    Vote { label: best_label, posteriors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_weighted_majority() {
        let v = aggregate(&[0.2, 0.6, 0.2], &[1, 2, 1], |_| false);
        assert_eq!(v.label, 2);
        assert_relative_eq!(v.posterior(1), 0.4);
        assert_relative_eq!(v.posterior(2), 0.6);

        let v = aggregate(&[0.3, 0.5, 0.4], &[1, 2, 1], |_| false);
        assert_eq!(v.label, 1);
    }

    #[test]
    fn test_tie_breaks_to_smallest_label() {
        let v = aggregate(&[1.0, 1.0], &[7, 3], |_| false);
        assert_eq!(v.label, 3);
        assert_relative_eq!(v.posterior(3), 0.5);
    }

    #[test]
    fn test_unnormalized_weights() {
        let v = aggregate(&[2.0, 6.0], &[0, 4], |_| false);
        assert_eq!(v.label, 4);
        assert_relative_eq!(v.posterior(0), 0.25);
        assert_relative_eq!(v.posterior(4), 0.75);
        let sum: f64 = v.posteriors.iter().map(|&(_, p)| p).sum();
        assert_relative_eq!(sum, 1.0);
    }

    #[test]
    fn test_exclusion_zeroes_posterior() {
        let v = aggregate(&[0.6, 0.3, 0.1], &[1, 2, 2], |l| l == 1);
        assert_eq!(v.label, 2);
        assert_eq!(v.posterior(1), 0.0);
        assert_relative_eq!(v.posterior(2), 1.0);
    }

    #[test]
    fn test_all_excluded_is_background() {
        let v = aggregate(&[0.5, 0.5], &[1, 1], |l| l == 1);
        assert_eq!(v, Vote::background());
    }

    #[test]
    fn test_zero_weights_count_votes() {
        let v = aggregate(&[0.0, 0.0, 0.0], &[5, 5, 2], |_| false);
        assert_eq!(v.label, 5);
        assert_relative_eq!(v.posterior(5), 2.0 / 3.0);
        assert_relative_eq!(v.posterior(2), 1.0 / 3.0);
    }

    #[test]
    fn test_zero_weight_label_omitted() {
        let v = aggregate(&[1.0, 0.0], &[1, 2], |_| false);
        assert_eq!(v.label, 1);
        assert_eq!(v.posteriors, vec![(1, 1.0)]);
    }
}
