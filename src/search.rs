//! Local search correction of residual registration error
//!
//! For one atlas, every integer displacement inside the search window is
//! scored by the sum of squared differences between the target patch and the
//! atlas patch at the displaced center. Candidates are visited in a fixed
//! order (zero offset first, then by increasing squared length, ties by
//! z, y, x) and only a strictly smaller score replaces the current best, so the
//! result does not depend on anything but the inputs.

use crate::grid::Grid;
use crate::patch::PatchSampler;
use crate::utils::simd_ops::sum_squared_diff;

/// Ordered displacements of a search window, with their flat strides
#[derive(Clone, Debug)]
pub struct SearchWindow {
    offsets: Vec<[isize; 3]>,
    flat: Vec<isize>,
}

impl SearchWindow {
    pub fn new<T: Copy>(grid: &Grid<T>, radius: [usize; 3]) -> Self {
        let (rx, ry, rz) = (radius[0] as isize, radius[1] as isize, radius[2] as isize);
        let mut offsets = Vec::with_capacity((2 * rx as usize + 1) * (2 * ry as usize + 1) * (2 * rz as usize + 1));
        for dk in -rz..=rz {
            for dj in -ry..=ry {
                for di in -rx..=rx {
                    offsets.push([di, dj, dk]);
                }
            }
        }
        offsets.sort_by_key(|o| (o[0] * o[0] + o[1] * o[1] + o[2] * o[2], o[2], o[1], o[0]));
        let flat = offsets.iter().map(|&o| grid.stride_offset(o)).collect();
        Self { offsets, flat }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offsets(&self) -> &[[isize; 3]] {
        &self.offsets
    }

    /// Flat index displacements, in visiting order
    pub fn flat(&self) -> &[isize] {
        &self.flat
    }
}

/// Best candidate found by the search
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchMatch {
    /// Displacement from the nominal center
    pub offset: [isize; 3],
    /// Flat index of the matched atlas voxel
    pub center: usize,
    /// Sum of squared differences against the target patch
    pub score: f64,
}

/// Full search result including the matched atlas patch
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    pub offset: [isize; 3],
    pub patch: Vec<f64>,
    pub score: f64,
}

/// SSD of the atlas patch at `center` against `target`, abandoned once it
/// reaches `bound` (returned value is then >= bound)
#[inline]
fn bounded_ssd(
    target: &[f64],
    atlas: &[f64],
    center: usize,
    sampler: &PatchSampler,
    bound: f64,
) -> f64 {
    let row_len = sampler.row_len();
    let c = center as isize;
    let mut ssd = 0.0;
    for (t_row, start) in target.chunks_exact(row_len).zip(sampler.row_starts()) {
        let s = (c + start) as usize;
        ssd += sum_squared_diff(t_row, &atlas[s..s + row_len]);
        if ssd >= bound {
            break;
        }
    }
    ssd
}

/// Find the displacement minimizing patch SSD around flat index `center`
pub fn best_match(
    target_patch: &[f64],
    atlas: &Grid<f64>,
    center: usize,
    window: &SearchWindow,
    sampler: &PatchSampler,
) -> SearchMatch {
    let data = atlas.data();
    let mut best = SearchMatch {
        offset: window.offsets[0],
        center: (center as isize + window.flat[0]) as usize,
        score: bounded_ssd(target_patch, data, (center as isize + window.flat[0]) as usize, sampler, f64::INFINITY),
    };

    for (&offset, &flat) in window.offsets.iter().zip(window.flat.iter()).skip(1) {
        let candidate = (center as isize + flat) as usize;
        let score = bounded_ssd(target_patch, data, candidate, sampler, best.score);
        if score < best.score {
            best = SearchMatch { offset, center: candidate, score };
        }
    }

    best
}

/// Search `atlas` around `candidate_center` for the patch closest to `target_patch`
///
/// `target_patch` must have been extracted with the same `patch_radius`.
pub fn search(
    target_patch: &[f64],
    atlas: &Grid<f64>,
    candidate_center: [usize; 3],
    search_radius: [usize; 3],
    patch_radius: [usize; 3],
) -> SearchResult {
    let sampler = PatchSampler::new(atlas, patch_radius);
    let window = SearchWindow::new(atlas, search_radius);
    let m = best_match(target_patch, atlas, atlas.offset(candidate_center), &window, &sampler);
    SearchResult {
        offset: m.offset,
        patch: sampler.sample(atlas, m.center),
        score: m.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::extract_patch;

    fn blob(dims: [usize; 3], peak: [usize; 3]) -> Grid<f64> {
        let mut g = Grid::filled(dims, 0.0);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    let d2 = (i as f64 - peak[0] as f64).powi(2)
                        + (j as f64 - peak[1] as f64).powi(2)
                        + (k as f64 - peak[2] as f64).powi(2);
                    g.set([i, j, k], (-d2 / 4.0).exp() * 100.0);
                }
            }
        }
        g
    }

    #[test]
    fn test_window_order() {
        let g: Grid<f64> = Grid::filled([9, 9, 9], 0.0);
        let w = SearchWindow::new(&g, [1, 1, 1]);
        assert_eq!(w.len(), 27);
        assert_eq!(w.offsets()[0], [0, 0, 0]);
        // Six face neighbours come next, ordered by z, y, x
        assert_eq!(w.offsets()[1], [0, 0, -1]);
        assert_eq!(w.offsets()[2], [0, -1, 0]);
        assert_eq!(w.offsets()[3], [-1, 0, 0]);
        assert_eq!(w.offsets()[6], [0, 0, 1]);
        assert_eq!(w.offsets()[26], [1, 1, 1]);
        assert_eq!(w.flat()[1], -81);
    }

    #[test]
    fn test_zero_radius_is_direct_ssd() {
        let target = blob([9, 9, 9], [4, 4, 4]);
        let atlas = blob([9, 9, 9], [5, 4, 4]);
        let center = [4, 4, 4];
        let tp = extract_patch(&target, center, [1, 1, 1]);
        let ap = extract_patch(&atlas, center, [1, 1, 1]);
        let direct: f64 = tp.iter().zip(ap.iter()).map(|(a, b)| (a - b) * (a - b)).sum();

        let r = search(&tp, &atlas, center, [0, 0, 0], [1, 1, 1]);
        assert_eq!(r.offset, [0, 0, 0]);
        assert!((r.score - direct).abs() <= 1e-9 * direct.max(1.0));
        assert_eq!(r.patch, ap);
    }

    #[test]
    fn test_search_recovers_shift() {
        let target = blob([11, 11, 11], [5, 5, 5]);
        let atlas = blob([11, 11, 11], [6, 4, 5]);
        let tp = extract_patch(&target, [5, 5, 5], [1, 1, 1]);
        let r = search(&tp, &atlas, [5, 5, 5], [2, 2, 2], [1, 1, 1]);
        assert_eq!(r.offset, [1, -1, 0]);
        assert!(r.score < 1e-9);
    }

    #[test]
    fn test_tie_prefers_zero_offset() {
        let flat: Grid<f64> = Grid::filled([7, 7, 7], 3.0);
        let tp = extract_patch(&flat, [3, 3, 3], [1, 1, 1]);
        let r = search(&tp, &flat, [3, 3, 3], [1, 1, 1], [1, 1, 1]);
        assert_eq!(r.offset, [0, 0, 0]);
        assert_eq!(r.score, 0.0);
    }

    #[test]
    fn test_search_2d() {
        let mut target: Grid<f64> = Grid::filled([9, 9, 1], 0.0);
        let mut atlas: Grid<f64> = Grid::filled([9, 9, 1], 0.0);
        target.set([4, 4, 0], 10.0);
        atlas.set([3, 5, 0], 10.0);
        let tp = extract_patch(&target, [4, 4, 0], [1, 1, 0]);
        let r = search(&tp, &atlas, [4, 4, 0], [2, 2, 0], [1, 1, 0]);
        assert_eq!(r.offset, [-1, 1, 0]);
        assert_eq!(r.score, 0.0);
    }
}
