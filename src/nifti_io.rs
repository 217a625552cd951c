//! NIfTI file I/O
//!
//! Loads and saves `Grid`s as NIfTI-1 from/to byte arrays (usable from
//! WebAssembly where there is no filesystem) or from/to paths. Gzip is
//! auto-detected on load and selected by the `.gz` extension on save.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{FusionError, Result};
use crate::grid::{Geometry, Grid};

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    // NIfTI-1 header size should be at offset 0, stored as i32
    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    // Magic bytes at offset 344 for NIfTI-1
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();

    // Data type at offset 70
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Load a 2D or 3D NIfTI image from bytes
///
/// Supports both .nii and .nii.gz (gzip is auto-detected). Intensity scaling
/// (`scl_slope`, `scl_inter`) is applied. For 4D inputs the first volume is
/// returned.
pub fn load_nifti(bytes: &[u8]) -> Result<Grid<f64>> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            // Try to get header info from decompressed data
            let mut decoder = GzDecoder::new(Cursor::new(bytes));
            let mut decompressed = Vec::new();
            let info = if std::io::Read::read_to_end(&mut decoder, &mut decompressed).is_ok() {
                get_header_info(&decompressed)
            } else {
                "Could not decompress".to_string()
            };
            FusionError::Nifti(format!("Failed to read gzipped NIfTI: {} ({})", e, info))
        })?
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| FusionError::Nifti(format!("Failed to read NIfTI: {} ({})", e, info)))?
    };

    let header = obj.header().clone();
    let ndim = header.dim[0] as usize;
    if !(2..=7).contains(&ndim) {
        return Err(FusionError::Nifti(format!("Expected a 2D or 3D volume, got {}D", ndim)));
    }

    let geometry = Geometry::from_affine(&get_affine(&header));

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| FusionError::Nifti(format!("Failed to convert to ndarray: {}", e)))?;

    // Use the actual array shape for dimensions (nifti-rs may drop unit axes)
    let shape = array.shape().to_vec();
    let dims = [
        shape.first().copied().unwrap_or(1),
        shape.get(1).copied().unwrap_or(1),
        shape.get(2).copied().unwrap_or(1),
    ];

    // Extract data in Fortran order (x varies fastest)
    let mut data = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
    let mut index = vec![0usize; shape.len()];
    for k in 0..dims[2] {
        for j in 0..dims[1] {
            for i in 0..dims[0] {
                index[0] = i;
                if shape.len() > 1 {
                    index[1] = j;
                }
                if shape.len() > 2 {
                    index[2] = k;
                }
                data.push(array[index.as_slice()]);
            }
        }
    }

    let spatial = if ndim == 2 || shape.len() == 2 { 2 } else { 3 };
    Ok(Grid::from_vec(dims, data)?.with_ndim(spatial).with_geometry(geometry))
}

/// Read a NIfTI image from disk
pub fn read_nifti<P: AsRef<Path>>(path: P) -> Result<Grid<f64>> {
    let bytes = std::fs::read(path.as_ref())?;
    load_nifti(&bytes).map_err(|e| match e {
        FusionError::Nifti(msg) => FusionError::Nifti(format!("{}: {}", path.as_ref().display(), msg)),
        other => other,
    })
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        // Fall back to identity with voxel scaling
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = if header.pixdim[3] > 0.0 { header.pixdim[3] as f64 } else { 1.0 };
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Save a grid as NIfTI bytes
///
/// Writes an uncompressed single-file NIfTI-1 with float32 voxels.
pub fn save_nifti(grid: &Grid<f64>) -> Result<Vec<u8>> {
    use std::io::Write;

    let [nx, ny, nz] = grid.dims();
    let [vsx, vsy, vsz] = grid.geometry.spacing;
    let affine = grid.geometry.to_affine();

    if [nx, ny, nz].iter().any(|&n| n > i16::MAX as usize) {
        return Err(FusionError::Nifti(format!("Dimensions {:?} exceed NIfTI-1 limits", grid.dims())));
    }

    // Create NIfTI-1 header (348 bytes)
    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let dim: [i16; 8] = [grid.ndim() as i16, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32)
    header[70..72].copy_from_slice(&16i16.to_le_bytes());

    // bitpix = 32
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for row in 0..3 {
        for i in 0..4 {
            let offset = 280 + row * 16 + i * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + i] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + grid.len() * 4);
    buffer.write_all(&header)?;

    // Extension (4 bytes, all zeros = no extension)
    buffer.write_all(&[0u8; 4])?;

    for &val in grid.data() {
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }

    Ok(buffer)
}

/// Save a grid as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(grid: &Grid<f64>) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = save_nifti(grid)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&uncompressed)?;
    Ok(encoder.finish()?)
}

/// Write a grid to disk, gzipped when the path ends in `.gz`
pub fn write_nifti<P: AsRef<Path>>(grid: &Grid<f64>, path: P) -> Result<()> {
    let path = path.as_ref();
    let gz = path.extension().map_or(false, |e| e.eq_ignore_ascii_case("gz"));
    let bytes = if gz { save_nifti_gz(grid)? } else { save_nifti(grid)? };
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Interpret intensities as integer labels (rounded to nearest)
pub fn to_labels(grid: &Grid<f64>) -> Grid<i32> {
    grid.map(|v| v.round() as i32)
}

/// Interpret intensities as a binary mask (non-zero = 1)
pub fn to_mask(grid: &Grid<f64>) -> Grid<u8> {
    grid.map(|v| u8::from(v != 0.0))
}
