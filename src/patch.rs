//! Patch extraction
//!
//! A patch is the block of voxels within `radius` of a center, flattened with
//! x varying fastest. Callers guarantee `center ± radius` lies inside the grid;
//! the fusion driver shrinks its working region so this always holds.

use crate::grid::Grid;

/// Number of voxels in a patch of the given radius
pub fn patch_len(radius: [usize; 3]) -> usize {
    radius.iter().map(|&r| 2 * r + 1).product()
}

/// Extract the patch around `center` as an ordered intensity vector
pub fn extract_patch(grid: &Grid<f64>, center: [usize; 3], radius: [usize; 3]) -> Vec<f64> {
    let sampler = PatchSampler::new(grid, radius);
    sampler.sample(grid, grid.offset(center))
}

/// Precomputed flat offsets of a patch for one grid shape
///
/// Built once per run; every atlas and the target share the same dims, so the
/// same sampler serves all of them.
#[derive(Clone, Debug)]
pub struct PatchSampler {
    offsets: Vec<isize>,
    row_len: usize,
}

impl PatchSampler {
    pub fn new<T: Copy>(grid: &Grid<T>, radius: [usize; 3]) -> Self {
        let (rx, ry, rz) = (radius[0] as isize, radius[1] as isize, radius[2] as isize);
        let mut offsets = Vec::with_capacity(patch_len(radius));
        for dk in -rz..=rz {
            for dj in -ry..=ry {
                for di in -rx..=rx {
                    offsets.push(grid.stride_offset([di, dj, dk]));
                }
            }
        }
        Self { offsets, row_len: 2 * radius[0] + 1 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Length of one contiguous x-row of the patch
    #[inline]
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// Flat offset of the first voxel of each x-row, relative to the center
    #[inline]
    pub fn row_starts(&self) -> impl Iterator<Item = isize> + '_ {
        self.offsets.iter().step_by(self.row_len).copied()
    }

    /// Fill `out` with the patch centered at flat index `center`
    #[inline]
    pub fn sample_into(&self, grid: &Grid<f64>, center: usize, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.offsets.len());
        let data = grid.data();
        let c = center as isize;
        for (row, start) in out.chunks_exact_mut(self.row_len).zip(self.row_starts()) {
            let s = (c + start) as usize;
            row.copy_from_slice(&data[s..s + self.row_len]);
        }
    }

    pub fn sample(&self, grid: &Grid<f64>, center: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.offsets.len()];
        self.sample_into(grid, center, &mut out);
        out
    }
}
