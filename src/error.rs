//! Error type shared by the fusion engine, the NIfTI layer and the CLI.

use thiserror::Error;

/// Errors reported before any voxel work starts, plus I/O failures.
///
/// Per-voxel problems never surface here: a singular weight solve degrades to
/// uniform weights and a voxel without eligible votes becomes background.
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("too few atlases: {0} supplied, at least 2 required")]
    TooFewAtlases(usize),

    #[error("number of atlases ({atlases}) and segmentations ({labels}) does not match")]
    AtlasLabelCountMismatch { atlases: usize, labels: usize },

    #[error("weight maps can only be generated with a zero search radius")]
    WeightMapsRequireZeroSearch,

    #[error("invalid filename pattern '{0}': it does not vary with the substituted index")]
    InvalidPattern(String),

    #[error("{what} has dimensions {found:?}, expected {expected:?}")]
    DimensionMismatch {
        what: String,
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("nothing to compute: supply atlas segmentations or request weight maps")]
    NothingToCompute,

    #[error("thread pool: {0}")]
    ThreadPool(String),

    #[error("NIfTI error: {0}")]
    Nifti(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nifti::NiftiError> for FusionError {
    fn from(e: nifti::NiftiError) -> Self {
        FusionError::Nifti(e.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for FusionError {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        FusionError::ThreadPool(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FusionError>;
