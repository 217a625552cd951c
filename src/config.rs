//! Fusion parameters
//!
//! Defaults: 3x3x3 patch and search radii, joint label fusion with
//! alpha = 0.1 and beta = 2.

use crate::error::{FusionError, Result};
use crate::weights::WeightMethod;

/// Configuration of one fusion run
#[derive(Clone, Debug, PartialEq)]
pub struct FusionConfig {
    /// Patch radius per axis (z is ignored for 2D images)
    pub patch_radius: [usize; 3],
    /// Search radius per axis; all zero disables local search
    pub search_radius: [usize; 3],
    /// Weighting model
    pub method: WeightMethod,
    /// Keep one posterior map per label
    pub retain_posteriors: bool,
    /// Keep one weight map per atlas (requires a zero search radius)
    pub generate_weight_maps: bool,
    /// Worker threads, 0 = rayon default
    pub threads: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            patch_radius: [3; 3],
            search_radius: [3; 3],
            method: WeightMethod::default(),
            retain_posteriors: false,
            generate_weight_maps: false,
            threads: 0,
        }
    }
}

impl FusionConfig {
    pub fn with_patch_radius(mut self, radius: [usize; 3]) -> Self {
        self.patch_radius = radius;
        self
    }

    pub fn with_search_radius(mut self, radius: [usize; 3]) -> Self {
        self.search_radius = radius;
        self
    }

    pub fn with_method(mut self, method: WeightMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_posteriors(mut self, retain: bool) -> Self {
        self.retain_posteriors = retain;
        self
    }

    pub fn with_weight_maps(mut self, generate: bool) -> Self {
        self.generate_weight_maps = generate;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Radii restricted to the image dimensionality
    pub fn effective_radii(&self, ndim: usize) -> ([usize; 3], [usize; 3]) {
        let mut patch = self.patch_radius;
        let mut search = self.search_radius;
        if ndim < 3 {
            patch[2] = 0;
            search[2] = 0;
        }
        (patch, search)
    }

    /// Parameter checks that do not depend on the images
    pub fn validate(&self, ndim: usize) -> Result<()> {
        self.method.validate()?;
        let (_, search) = self.effective_radii(ndim);
        if self.generate_weight_maps && search.iter().any(|&r| r > 0) {
            return Err(FusionError::WeightMapsRequireZeroSearch);
        }
        Ok(())
    }
}

/// Parse a radius given as `A` (all axes) or `AxB[xC]`
///
/// For 2D (`ndim = 2`) the z radius is always 0.
pub fn parse_radius(text: &str, ndim: usize) -> Result<[usize; 3]> {
    let parts: Vec<&str> = text.trim().split('x').collect();
    let values: Vec<usize> = parts
        .iter()
        .map(|p| {
            p.trim().parse::<usize>().map_err(|_| {
                FusionError::InvalidParameter(format!("bad vector spec '{}'", text))
            })
        })
        .collect::<Result<_>>()?;

    let mut radius = match values.len() {
        1 => [values[0]; 3],
        n if n == ndim => {
            let mut r = [0; 3];
            r[..n].copy_from_slice(&values);
            r
        }
        _ => {
            return Err(FusionError::InvalidParameter(format!(
                "bad vector spec '{}' for {}D image", text, ndim
            )))
        }
    };

    if ndim < 3 {
        radius[2] = 0;
    }
    Ok(radius)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_radius() {
        assert_eq!(parse_radius("3", 3).unwrap(), [3, 3, 3]);
        assert_eq!(parse_radius("2x1x0", 3).unwrap(), [2, 1, 0]);
        assert_eq!(parse_radius("2x1", 2).unwrap(), [2, 1, 0]);
        assert_eq!(parse_radius("4", 2).unwrap(), [4, 4, 0]);
        assert!(parse_radius("2x1", 3).is_err());
        assert!(parse_radius("2xa1x1", 3).is_err());
        assert!(parse_radius("-1", 3).is_err());
    }

    #[test]
    fn test_weight_maps_need_zero_search() {
        let cfg = FusionConfig::default().with_weight_maps(true);
        assert!(matches!(cfg.validate(3), Err(FusionError::WeightMapsRequireZeroSearch)));
        let cfg = cfg.with_search_radius([0, 0, 0]);
        assert!(cfg.validate(3).is_ok());
        // z search radius is irrelevant for 2D images
        let cfg = FusionConfig::default()
            .with_weight_maps(true)
            .with_search_radius([0, 0, 2]);
        assert!(cfg.validate(2).is_ok());
    }

    #[test]
    fn test_defaults() {
        let cfg = FusionConfig::default();
        assert_eq!(cfg.patch_radius, [3, 3, 3]);
        assert_eq!(cfg.search_radius, [3, 3, 3]);
        assert_eq!(cfg.method, WeightMethod::joint(0.1, 2.0));
        assert_eq!(cfg.threads, 0);
    }
}
