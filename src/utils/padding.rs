//! Boundary padding for label fusion
//!
//! Fusion cannot label voxels closer to the image edge than the patch plus
//! search radius. When a segmentation reaches the boundary, inputs are padded
//! by mirror reflection first and every output is cropped back afterwards.

use crate::error::Result;
use crate::grid::{Geometry, Grid};

/// Reflect an out-of-range coordinate back into [0, n)
///
/// The edge sample is repeated: -1 -> 0, -2 -> 1, n -> n-1.
#[inline]
fn mirror_index(i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let mut m = i.rem_euclid(period);
    if m >= n {
        m = period - 1 - m;
    }
    m as usize
}

/// Shift the origin so padded voxel `pad` sits where voxel 0 used to be
fn padded_geometry(geometry: &Geometry, pad: [usize; 3], sign: isize) -> Geometry {
    let shift = [
        -sign * pad[0] as isize,
        -sign * pad[1] as isize,
        -sign * pad[2] as isize,
    ];
    Geometry {
        origin: geometry.index_to_world(shift),
        ..geometry.clone()
    }
}

/// Pad every side of a grid by `pad` voxels using mirror reflection
///
/// # Arguments
/// * `grid` - Input grid (nx * ny * nz)
/// * `pad` - Padding per axis, applied to both the lower and upper side
///
/// # Returns
/// Grid of size (nx + 2*px, ny + 2*py, nz + 2*pz)
pub fn mirror_pad<T: Copy>(grid: &Grid<T>, pad: [usize; 3]) -> Result<Grid<T>> {
    let [nx, ny, nz] = grid.dims();
    let new_dims = [nx + 2 * pad[0], ny + 2 * pad[1], nz + 2 * pad[2]];
    let new_total = new_dims[0] * new_dims[1] * new_dims[2];

    let mut data = Vec::with_capacity(new_total);

    // Fortran order: index = i + j*nx + k*nx*ny
    for k in 0..new_dims[2] {
        let sk = mirror_index(k as isize - pad[2] as isize, nz);
        for j in 0..new_dims[1] {
            let sj = mirror_index(j as isize - pad[1] as isize, ny);
            for i in 0..new_dims[0] {
                let si = mirror_index(i as isize - pad[0] as isize, nx);
                data.push(grid.get([si, sj, sk]));
            }
        }
    }

    Ok(Grid::from_vec(new_dims, data)?
        .with_ndim(grid.ndim())
        .with_geometry(padded_geometry(&grid.geometry, pad, 1)))
}

/// Remove `pad` voxels from every side (inverse of `mirror_pad`)
pub fn crop<T: Copy>(grid: &Grid<T>, pad: [usize; 3]) -> Result<Grid<T>> {
    let [pnx, pny, pnz] = grid.dims();
    let dims = [
        pnx.saturating_sub(2 * pad[0]),
        pny.saturating_sub(2 * pad[1]),
        pnz.saturating_sub(2 * pad[2]),
    ];

    let mut data = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
    for k in 0..dims[2] {
        for j in 0..dims[1] {
            for i in 0..dims[0] {
                data.push(grid.get([i + pad[0], j + pad[1], k + pad[2]]));
            }
        }
    }

    Ok(Grid::from_vec(dims, data)?
        .with_ndim(grid.ndim())
        .with_geometry(padded_geometry(&grid.geometry, pad, -1)))
}
