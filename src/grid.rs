//! Voxel grid buffers and index regions
//!
//! Every image taking part in a fusion run (target, atlas intensities, atlas
//! labels, mask, exclusion flags, weight and posterior outputs) is a `Grid`.
//! Data is stored in Fortran order to match NIfTI: index = i + j*nx + k*nx*ny.
//! 2D images are stored with nz = 1.

use crate::error::{FusionError, Result};

/// Physical placement of a grid. Carried through the engine untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    /// Voxel sizes in mm
    pub spacing: [f64; 3],
    /// World coordinate of voxel (0, 0, 0)
    pub origin: [f64; 3],
    /// Direction cosines, row-major 3x3
    pub direction: [f64; 9],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            spacing: [1.0; 3],
            origin: [0.0; 3],
            direction: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Geometry {
    /// Build from a 4x4 row-major affine (NIfTI sform convention)
    pub fn from_affine(affine: &[f64; 16]) -> Self {
        let mut spacing = [1.0; 3];
        let mut direction = [0.0; 9];
        for c in 0..3 {
            let col = [affine[c], affine[4 + c], affine[8 + c]];
            let norm = (col[0] * col[0] + col[1] * col[1] + col[2] * col[2]).sqrt();
            let s = if norm > 0.0 { norm } else { 1.0 };
            spacing[c] = s;
            for r in 0..3 {
                direction[r * 3 + c] = if norm > 0.0 { col[r] / s } else if r == c { 1.0 } else { 0.0 };
            }
        }
        Self {
            spacing,
            origin: [affine[3], affine[7], affine[11]],
            direction,
        }
    }

    /// 4x4 row-major affine mapping voxel indices to world coordinates
    pub fn to_affine(&self) -> [f64; 16] {
        let mut a = [0.0; 16];
        for r in 0..3 {
            for c in 0..3 {
                a[r * 4 + c] = self.direction[r * 3 + c] * self.spacing[c];
            }
            a[r * 4 + 3] = self.origin[r];
        }
        a[15] = 1.0;
        a
    }

    /// World position of a (possibly negative) voxel index
    pub fn index_to_world(&self, index: [isize; 3]) -> [f64; 3] {
        let mut p = self.origin;
        for r in 0..3 {
            for c in 0..3 {
                p[r] += self.direction[r * 3 + c] * self.spacing[c] * index[c] as f64;
            }
        }
        p
    }
}

/// Axis-aligned box of voxel indices
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub index: [usize; 3],
    pub size: [usize; 3],
}

impl Region {
    /// Region covering a whole grid
    pub fn full(dims: [usize; 3]) -> Self {
        Self { index: [0; 3], size: dims }
    }

    /// Single-voxel region
    pub fn voxel(index: [usize; 3]) -> Self {
        Self { index, size: [1; 3] }
    }

    pub fn num_voxels(&self) -> usize {
        self.size.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.num_voxels() == 0
    }

    /// Upper bound (exclusive) along axis `d`
    #[inline]
    pub fn end(&self, d: usize) -> usize {
        self.index[d] + self.size[d]
    }

    pub fn contains(&self, index: [usize; 3]) -> bool {
        (0..3).all(|d| index[d] >= self.index[d] && index[d] < self.end(d))
    }

    /// Move every face inward by `margin`; empty when the margin swallows an axis
    pub fn shrink(&self, margin: [usize; 3]) -> Self {
        let mut out = *self;
        for d in 0..3 {
            out.index[d] = self.index[d] + margin[d];
            out.size[d] = self.size[d].saturating_sub(2 * margin[d]);
        }
        out
    }

    /// Intersection with `other` (empty when disjoint)
    pub fn crop(&self, other: &Region) -> Self {
        let mut out = *self;
        for d in 0..3 {
            let lo = self.index[d].max(other.index[d]);
            let hi = self.end(d).min(other.end(d));
            out.index[d] = lo;
            out.size[d] = hi.saturating_sub(lo);
        }
        out
    }

    /// Grow to include `index`
    pub fn expand_to(&mut self, index: [usize; 3]) {
        for d in 0..3 {
            if index[d] < self.index[d] {
                self.size[d] += self.index[d] - index[d];
                self.index[d] = index[d];
            } else if index[d] >= self.end(d) {
                self.size[d] = index[d] + 1 - self.index[d];
            }
        }
    }

    /// Smallest region containing both
    pub fn union(&self, other: &Region) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut out = *self;
        for d in 0..3 {
            let lo = self.index[d].min(other.index[d]);
            let hi = self.end(d).max(other.end(d));
            out.index[d] = lo;
            out.size[d] = hi - lo;
        }
        out
    }
}

/// N-dimensional scalar image buffer (2D or 3D)
#[derive(Clone, Debug, PartialEq)]
pub struct Grid<T> {
    data: Vec<T>,
    dims: [usize; 3],
    ndim: usize,
    pub geometry: Geometry,
}

impl<T: Copy> Grid<T> {
    /// Allocate a grid filled with `value`. Set `dims[2] = 1` for 2D.
    pub fn filled(dims: [usize; 3], value: T) -> Self {
        let ndim = if dims[2] <= 1 { 2 } else { 3 };
        Self {
            data: vec![value; dims.iter().product()],
            dims,
            ndim,
            geometry: Geometry::default(),
        }
    }

    /// Wrap an existing Fortran-order buffer
    pub fn from_vec(dims: [usize; 3], data: Vec<T>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if data.len() != expected {
            return Err(FusionError::InvalidParameter(format!(
                "buffer holds {} values, dims {:?} need {}",
                data.len(),
                dims,
                expected
            )));
        }
        let ndim = if dims[2] <= 1 { 2 } else { 3 };
        Ok(Self { data, dims, ndim, geometry: Geometry::default() })
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Force the reported dimensionality (a 3D image with a single slice stays 3D)
    pub fn with_ndim(mut self, ndim: usize) -> Self {
        self.ndim = if ndim == 2 && self.dims[2] == 1 { 2 } else { 3 };
        self
    }

    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn region(&self) -> Region {
        Region::full(self.dims)
    }

    #[inline(always)]
    pub fn offset(&self, index: [usize; 3]) -> usize {
        index[0] + index[1] * self.dims[0] + index[2] * self.dims[0] * self.dims[1]
    }

    /// Signed flat stride for a signed index displacement
    #[inline(always)]
    pub fn stride_offset(&self, delta: [isize; 3]) -> isize {
        let nx = self.dims[0] as isize;
        let ny = self.dims[1] as isize;
        delta[0] + delta[1] * nx + delta[2] * nx * ny
    }

    #[inline]
    pub fn get(&self, index: [usize; 3]) -> T {
        self.data[self.offset(index)]
    }

    #[inline]
    pub fn set(&mut self, index: [usize; 3], value: T) {
        let o = self.offset(index);
        self.data[o] = value;
    }

    #[inline(always)]
    pub fn at(&self, offset: usize) -> T {
        self.data[offset]
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Elementwise conversion keeping dims and geometry
    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> Grid<U> {
        Grid {
            data: self.data.iter().map(|&v| f(v)).collect(),
            dims: self.dims,
            ndim: self.ndim,
            geometry: self.geometry.clone(),
        }
    }

    /// Same shape and geometry, new payload
    pub fn like<U: Copy>(&self, value: U) -> Grid<U> {
        Grid {
            data: vec![value; self.data.len()],
            dims: self.dims,
            ndim: self.ndim,
            geometry: self.geometry.clone(),
        }
    }

    /// Fail unless `other` has the same dims as `self`
    pub fn check_same_dims<U>(&self, other: &Grid<U>, what: &str) -> Result<()> {
        if self.dims != other.dims {
            return Err(FusionError::DimensionMismatch {
                what: what.to_string(),
                expected: self.dims,
                found: other.dims,
            });
        }
        Ok(())
    }

    /// Index of the voxel at flat `offset`
    pub fn index_of(&self, offset: usize) -> [usize; 3] {
        let nx = self.dims[0];
        let nxy = nx * self.dims[1];
        [offset % nx, (offset % nxy) / nx, offset / nxy]
    }
}

impl<T: Copy + Default + PartialEq> Grid<T> {
    /// Bounding box of voxels holding a non-default value
    pub fn nonzero_bounds(&self) -> Option<Region> {
        let zero = T::default();
        let mut bounds: Option<Region> = None;
        for (o, &v) in self.data.iter().enumerate() {
            if v != zero {
                let idx = self.index_of(o);
                match bounds.as_mut() {
                    Some(r) => r.expand_to(idx),
                    None => bounds = Some(Region::voxel(idx)),
                }
            }
        }
        bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fortran_order() {
        let g = Grid::from_vec([2, 3, 4], (0..24).collect::<Vec<i32>>()).unwrap();
        assert_eq!(g.get([1, 0, 0]), 1);
        assert_eq!(g.get([0, 1, 0]), 2);
        assert_eq!(g.get([0, 0, 1]), 6);
        assert_eq!(g.index_of(g.offset([1, 2, 3])), [1, 2, 3]);
        assert_eq!(g.stride_offset([-1, 1, 1]), -1 + 2 + 6);
    }

    #[test]
    fn test_from_vec_length_checked() {
        assert!(Grid::from_vec([2, 2, 2], vec![0.0; 7]).is_err());
    }

    #[test]
    fn test_2d_detection() {
        let g: Grid<f64> = Grid::filled([5, 5, 1], 0.0);
        assert_eq!(g.ndim(), 2);
        let g3: Grid<f64> = Grid::filled([5, 5, 1], 0.0).with_ndim(3);
        assert_eq!(g3.ndim(), 3);
    }

    #[test]
    fn test_region_shrink_and_crop() {
        let r = Region::full([10, 8, 6]);
        let s = r.shrink([2, 2, 3]);
        assert_eq!(s.index, [2, 2, 3]);
        assert_eq!(s.size, [6, 4, 0]);
        assert!(s.is_empty());

        let a = Region { index: [0, 0, 0], size: [5, 5, 5] };
        let b = Region { index: [3, 4, 6], size: [5, 5, 5] };
        let c = a.crop(&b);
        assert_eq!(c.index, [3, 4, 6]);
        assert_eq!(c.size, [2, 1, 0]);
    }

    #[test]
    fn test_region_expand_and_union() {
        let mut r = Region::voxel([4, 4, 4]);
        r.expand_to([2, 6, 4]);
        assert_eq!(r.index, [2, 4, 4]);
        assert_eq!(r.size, [3, 3, 1]);
        assert!(r.contains([3, 5, 4]));
        assert!(!r.contains([5, 5, 4]));

        let u = r.union(&Region::voxel([0, 0, 0]));
        assert_eq!(u.index, [0, 0, 0]);
        assert_eq!(u.size, [5, 7, 5]);
    }

    #[test]
    fn test_nonzero_bounds() {
        let mut g: Grid<i32> = Grid::filled([6, 6, 6], 0);
        assert!(g.nonzero_bounds().is_none());
        g.set([1, 2, 3], 5);
        g.set([4, 2, 1], 2);
        let b = g.nonzero_bounds().unwrap();
        assert_eq!(b.index, [1, 2, 1]);
        assert_eq!(b.size, [4, 1, 3]);
    }

    #[test]
    fn test_affine_roundtrip() {
        let geom = Geometry {
            spacing: [0.5, 1.0, 2.0],
            origin: [10.0, -5.0, 3.0],
            direction: [1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0],
        };
        let back = Geometry::from_affine(&geom.to_affine());
        for d in 0..3 {
            assert!((back.spacing[d] - geom.spacing[d]).abs() < 1e-12);
            assert!((back.origin[d] - geom.origin[d]).abs() < 1e-12);
        }
        for i in 0..9 {
            assert!((back.direction[i] - geom.direction[i]).abs() < 1e-12);
        }
        let p = geom.index_to_world([-1, 2, 0]);
        assert!((p[0] - 9.5).abs() < 1e-12);
        assert!((p[1] - -7.0).abs() < 1e-12);
    }
}
