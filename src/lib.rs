//! LabelFusion-WASM: multi-atlas patch-based label fusion
//!
//! Fuses the segmentations of several atlases, each already registered to a
//! target image, into one consensus segmentation. Every atlas votes for its
//! label at each target voxel with a weight derived from how well its local
//! intensity patch matches the target's, optionally after a small local search
//! for the best-matching atlas patch.
//!
//! Runs natively (with a `label_fusion` command-line tool) and compiled to
//! WebAssembly for browser-based use.
//!
//! # Modules
//! - `grid`: Flat Fortran-order image grids, geometry and regions
//! - `patch`: Patch extraction
//! - `search`: Local search for the best-matching atlas patch
//! - `weights`: Gaussian and Joint weight estimation
//! - `vote`: Label aggregation with exclusions
//! - `fusion`: Parallel fusion driver
//! - `solvers`: Dense symmetric linear solves
//! - `utils`: Padding, filename patterns, SIMD helpers
//! - `nifti_io`: NIfTI load/save

pub mod error;
pub mod grid;

// Algorithm modules
pub mod patch;
pub mod search;
pub mod weights;
pub mod vote;
pub mod config;
pub mod fusion;
pub mod solvers;
pub mod utils;

// I/O modules
pub mod nifti_io;

pub use config::{parse_radius, FusionConfig};
pub use error::FusionError;
pub use fusion::{AtlasEntry, ExclusionMaps, FusionOutput, LabelFusion, PosteriorTable};
pub use grid::{Geometry, Grid, Region};
pub use vote::Vote;
pub use weights::WeightMethod;

use wasm_bindgen::prelude::*;

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

#[allow(unused_macros)]
macro_rules! console_log {
    ($($t:tt)*) => (log(&format_args!($($t)*).to_string()))
}

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn to_js(e: FusionError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// Assemble an engine from flat JS arrays
#[allow(clippy::too_many_arguments)]
fn build_engine(
    target: &[f64],
    atlases: &[f64],
    labels: &[f64],
    mask: &[u8],
    n_atlases: usize,
    nx: usize, ny: usize, nz: usize,
    patch_radius: usize,
    search_radius: usize,
    method: &str,
    threads: usize,
) -> error::Result<LabelFusion> {
    let dims = [nx, ny, nz];
    let n = nx * ny * nz;
    let ndim = if nz == 1 { 2 } else { 3 };

    if n == 0 {
        return Err(FusionError::InvalidParameter("empty image".to_string()));
    }
    if atlases.len() != n_atlases * n || labels.len() != n_atlases * n {
        return Err(FusionError::InvalidParameter(format!(
            "expected {} atlas and label values, got {} and {}",
            n_atlases * n,
            atlases.len(),
            labels.len()
        )));
    }

    let config = FusionConfig::default()
        .with_patch_radius([patch_radius; 3])
        .with_search_radius([search_radius; 3])
        .with_method(method.parse()?)
        .with_threads(threads);

    let target = Grid::from_vec(dims, target.to_vec())?.with_ndim(ndim);
    let mut engine = LabelFusion::new(target, config);

    for (intensity, label) in atlases.chunks_exact(n).zip(labels.chunks_exact(n)) {
        let intensity = Grid::from_vec(dims, intensity.to_vec())?.with_ndim(ndim);
        let label = Grid::from_vec(dims, label.iter().map(|v| v.round() as i32).collect())?
            .with_ndim(ndim);
        engine.add_atlas(intensity, Some(label));
    }

    if !mask.is_empty() {
        engine.set_mask(Grid::from_vec(dims, mask.to_vec())?.with_ndim(ndim));
    }

    Ok(engine)
}

// ============================================================================
// WASM Exports: Label Fusion
// ============================================================================

/// Multi-atlas label fusion
///
/// # Arguments
/// * `target` - Target intensities (nx * ny * nz)
/// * `atlases` - Atlas intensities, concatenated (n_atlases * nx * ny * nz)
/// * `labels` - Atlas labels, concatenated (n_atlases * nx * ny * nz)
/// * `mask` - Optional mask (nx * ny * nz), empty = no mask
/// * `n_atlases` - Number of atlases
/// * `nx`, `ny`, `nz` - Array dimensions (nz = 1 for 2D)
/// * `patch_radius` - Patch radius, all axes
/// * `search_radius` - Search radius, all axes
/// * `method` - `Joint[alpha,beta]` or `Gauss[sigma]`
/// * `threads` - Worker threads, 0 = default pool
///
/// # Returns
/// Fused label map (nx * ny * nz)
#[wasm_bindgen]
pub fn label_fusion_wasm(
    target: &[f64],
    atlases: &[f64],
    labels: &[f64],
    mask: &[u8],
    n_atlases: usize,
    nx: usize, ny: usize, nz: usize,
    patch_radius: usize,
    search_radius: usize,
    method: &str,
    threads: usize,
) -> Result<Vec<f64>, JsValue> {
    console_log!("WASM label fusion: {}x{}x{}, {} atlases, {}", nx, ny, nz, n_atlases, method);

    let engine = build_engine(
        target, atlases, labels, mask, n_atlases, nx, ny, nz,
        patch_radius, search_radius, method, threads,
    )
    .map_err(to_js)?;
    let output = engine.run().map_err(to_js)?;

    console_log!("WASM label fusion complete: {} voxels fused", output.region.num_voxels());
    Ok(output.labels.data().iter().map(|&l| l as f64).collect())
}

/// Label fusion with progress callback
///
/// The callback receives `(plane, total_planes)` after each z-plane.
#[wasm_bindgen]
pub fn label_fusion_wasm_with_progress(
    target: &[f64],
    atlases: &[f64],
    labels: &[f64],
    mask: &[u8],
    n_atlases: usize,
    nx: usize, ny: usize, nz: usize,
    patch_radius: usize,
    search_radius: usize,
    method: &str,
    threads: usize,
    progress_callback: &js_sys::Function,
) -> Result<Vec<f64>, JsValue> {
    console_log!("WASM label fusion with progress: {}x{}x{}, {} atlases, {}", nx, ny, nz, n_atlases, method);

    let engine = build_engine(
        target, atlases, labels, mask, n_atlases, nx, ny, nz,
        patch_radius, search_radius, method, threads,
    )
    .map_err(to_js)?;

    let callback = progress_callback.clone();
    let output = engine
        .run_with_progress(|current, total| {
            let this = JsValue::null();
            let _ = callback.call2(&this,
                &JsValue::from(current as u32),
                &JsValue::from(total as u32));
        })
        .map_err(to_js)?;

    console_log!("WASM label fusion complete: {} voxels fused", output.region.num_voxels());
    Ok(output.labels.data().iter().map(|&l| l as f64).collect())
}

/// Simple test function to verify WASM is working
#[wasm_bindgen]
pub fn wasm_health_check() -> bool {
    console_log!("LabelFusion-WASM module loaded successfully!");
    true
}

/// Get version string
#[wasm_bindgen]
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

// ============================================================================
// WASM Exports: NIfTI I/O
// ============================================================================

/// Load a 2D or 3D NIfTI file from bytes
///
/// Returns a JS object with: data (Float64Array), dims (array), voxelSize (array), affine (array)
#[wasm_bindgen]
pub fn load_nifti_wasm(bytes: &[u8]) -> Result<js_sys::Object, JsValue> {
    let grid = nifti_io::load_nifti(bytes).map_err(to_js)?;
    let [nx, ny, nz] = grid.dims();
    let [vsx, vsy, vsz] = grid.geometry.spacing;

    let result = js_sys::Object::new();

    // Data as Float64Array
    let data = js_sys::Float64Array::from(grid.data());
    js_sys::Reflect::set(&result, &"data".into(), &data)?;

    // Dimensions
    let dims = js_sys::Array::new();
    for n in [nx, ny, nz] {
        dims.push(&JsValue::from(n as u32));
    }
    js_sys::Reflect::set(&result, &"dims".into(), &dims)?;

    // Voxel size
    let voxel_size = js_sys::Array::new();
    for v in [vsx, vsy, vsz] {
        voxel_size.push(&JsValue::from(v));
    }
    js_sys::Reflect::set(&result, &"voxelSize".into(), &voxel_size)?;

    // Affine matrix
    let affine = js_sys::Float64Array::from(grid.geometry.to_affine().as_slice());
    js_sys::Reflect::set(&result, &"affine".into(), &affine)?;

    console_log!("WASM load_nifti: {}x{}x{}, voxel=({:.2},{:.2},{:.2})",
                 nx, ny, nz, vsx, vsy, vsz);

    Ok(result)
}

fn grid_from_js(data: &[f64], nx: usize, ny: usize, nz: usize, affine: &[f64]) -> Result<Grid<f64>, JsValue> {
    if affine.len() != 16 {
        return Err(JsValue::from_str("Affine matrix must have 16 elements"));
    }

    let mut affine_arr = [0.0f64; 16];
    affine_arr.copy_from_slice(affine);

    let ndim = if nz == 1 { 2 } else { 3 };
    Ok(Grid::from_vec([nx, ny, nz], data.to_vec())
        .map_err(to_js)?
        .with_ndim(ndim)
        .with_geometry(Geometry::from_affine(&affine_arr)))
}

/// Save data as NIfTI bytes
///
/// # Arguments
/// * `data` - Voxel values (nx * ny * nz)
/// * `nx`, `ny`, `nz` - Dimensions
/// * `affine` - 4x4 affine matrix, row-major (16 elements)
#[wasm_bindgen]
pub fn save_nifti_wasm(
    data: &[f64],
    nx: usize, ny: usize, nz: usize,
    affine: &[f64],
) -> Result<Vec<u8>, JsValue> {
    let grid = grid_from_js(data, nx, ny, nz, affine)?;
    let bytes = nifti_io::save_nifti(&grid).map_err(to_js)?;

    console_log!("WASM save_nifti: {}x{}x{}, {} bytes", nx, ny, nz, bytes.len());

    Ok(bytes)
}

/// Save data as gzipped NIfTI bytes (.nii.gz)
#[wasm_bindgen]
pub fn save_nifti_gz_wasm(
    data: &[f64],
    nx: usize, ny: usize, nz: usize,
    affine: &[f64],
) -> Result<Vec<u8>, JsValue> {
    let grid = grid_from_js(data, nx, ny, nz, affine)?;
    let bytes = nifti_io::save_nifti_gz(&grid).map_err(to_js)?;

    console_log!("WASM save_nifti_gz: {}x{}x{}, {} bytes (compressed)", nx, ny, nz, bytes.len());

    Ok(bytes)
}
