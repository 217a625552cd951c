//! Atlas weight estimation
//!
//! Two models are supported:
//! - Gaussian: each atlas is weighted independently by a Gaussian kernel of its
//!   mean squared patch difference.
//! - Joint: weights minimize the expected combined error of all atlases,
//!   which down-weights atlases whose errors are correlated.
//!
//! Reference:
//! Wang H, Suh JW, Pluta J, Altinay M, Yushkevich P. Computing optimal weights
//! for label fusion based multi-atlas segmentation. IPMI 2011.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};

use crate::error::{FusionError, Result};
use crate::solvers::solve_symmetric;
use crate::utils::simd_ops::dot_product;

/// Default Gaussian kernel width
pub const DEFAULT_SIGMA: f64 = 0.5;
/// Default joint regularization
pub const DEFAULT_ALPHA: f64 = 0.1;
/// Default joint error exponent
pub const DEFAULT_BETA: f64 = 2.0;

/// Weighting model, chosen once per run
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WeightMethod {
    Gaussian { sigma: f64 },
    Joint { alpha: f64, beta: f64 },
}

impl Default for WeightMethod {
    fn default() -> Self {
        WeightMethod::Joint { alpha: DEFAULT_ALPHA, beta: DEFAULT_BETA }
    }
}

impl WeightMethod {
    pub fn gaussian(sigma: f64) -> Self {
        WeightMethod::Gaussian { sigma }
    }

    pub fn joint(alpha: f64, beta: f64) -> Self {
        WeightMethod::Joint { alpha, beta }
    }

    /// Reject parameters for which the model is undefined
    pub fn validate(&self) -> Result<()> {
        match *self {
            WeightMethod::Gaussian { sigma } => {
                if !(sigma > 0.0 && sigma.is_finite()) {
                    return Err(FusionError::InvalidParameter(format!(
                        "Gaussian sigma must be positive, got {}", sigma
                    )));
                }
            }
            WeightMethod::Joint { alpha, beta } => {
                if !(alpha >= 0.0 && alpha.is_finite()) {
                    return Err(FusionError::InvalidParameter(format!(
                        "joint alpha must be non-negative, got {}", alpha
                    )));
                }
                if !(beta > 0.0 && beta.is_finite()) {
                    return Err(FusionError::InvalidParameter(format!(
                        "joint beta must be positive, got {}", beta
                    )));
                }
            }
        }
        Ok(())
    }

    /// Compute one weight per atlas
    ///
    /// # Arguments
    /// * `target` - Target patch (length n)
    /// * `atlas_patches` - Search-corrected atlas patches, concatenated (K * n)
    /// * `scores` - Sum of squared differences per atlas (K)
    /// * `weights` - Output (K)
    pub fn estimate(&self, target: &[f64], atlas_patches: &[f64], scores: &[f64], weights: &mut [f64]) {
        match *self {
            WeightMethod::Gaussian { sigma } => gaussian_weights(scores, target.len(), sigma, weights),
            WeightMethod::Joint { alpha, beta } => joint_weights(target, atlas_patches, alpha, beta, weights),
        }
    }
}

impl fmt::Display for WeightMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightMethod::Gaussian { sigma } => write!(f, "Gauss[{}]", sigma),
            WeightMethod::Joint { alpha, beta } => write!(f, "Joint[{},{}]", alpha, beta),
        }
    }
}

/// Parse `Gauss`, `Gauss[sigma]`, `Joint`, `Joint[alpha]` or `Joint[alpha,beta]`
impl FromStr for WeightMethod {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, args) = match s.find('[') {
            Some(open) => {
                let close = s.rfind(']').filter(|&c| c > open).ok_or_else(|| {
                    FusionError::InvalidParameter(format!("unbalanced brackets in method '{}'", s))
                })?;
                (&s[..open], Some(&s[open + 1..close]))
            }
            None => (s, None),
        };

        let values: Vec<f64> = match args {
            Some(a) if !a.trim().is_empty() => a
                .split(',')
                .map(|v| {
                    v.trim().parse::<f64>().map_err(|_| {
                        FusionError::InvalidParameter(format!("bad number '{}' in method '{}'", v, s))
                    })
                })
                .collect::<Result<_>>()?,
            _ => Vec::new(),
        };

        let method = if name.starts_with("Joint") {
            if values.len() > 2 {
                return Err(FusionError::InvalidParameter(format!("Joint takes at most 2 parameters: '{}'", s)));
            }
            WeightMethod::Joint {
                alpha: values.first().copied().unwrap_or(DEFAULT_ALPHA),
                beta: values.get(1).copied().unwrap_or(DEFAULT_BETA),
            }
        } else if name.starts_with("Gauss") {
            if values.len() > 1 {
                return Err(FusionError::InvalidParameter(format!("Gauss takes at most 1 parameter: '{}'", s)));
            }
            WeightMethod::Gaussian { sigma: values.first().copied().unwrap_or(DEFAULT_SIGMA) }
        } else {
            return Err(FusionError::InvalidParameter(format!("unknown method specification '{}'", s)));
        };

        method.validate()?;
        Ok(method)
    }
}

/// Gaussian kernel weights: w_i = exp(-(score_i / n) / (2 sigma^2))
pub fn gaussian_weights(scores: &[f64], patch_len: usize, sigma: f64, weights: &mut [f64]) {
    let scale = 1.0 / (2.0 * sigma * sigma * patch_len.max(1) as f64);
    for (w, &s) in weights.iter_mut().zip(scores.iter()) {
        *w = (-s * scale).exp();
    }
}

/// Joint label fusion weights
///
/// Builds M[i][j] = mean_k |t_k - a_ik|^beta * |t_k - a_jk|^beta, adds
/// `alpha * trace(M) / K` to the diagonal, solves M w = 1, clamps negative
/// weights to zero and normalizes to unit sum. Falls back to uniform weights
/// when the system cannot be solved.
pub fn joint_weights(target: &[f64], atlas_patches: &[f64], alpha: f64, beta: f64, weights: &mut [f64]) {
    let n = target.len();
    let k = weights.len();
    debug_assert_eq!(atlas_patches.len(), n * k);
    let uniform = 1.0 / k as f64;

    if n == 0 || k == 0 {
        weights.iter_mut().for_each(|w| *w = uniform);
        return;
    }

    // Per-atlas error vectors
    let mut errors = vec![0.0; n * k];
    for (err, patch) in errors.chunks_exact_mut(n).zip(atlas_patches.chunks_exact(n)) {
        for ((e, &t), &a) in err.iter_mut().zip(target.iter()).zip(patch.iter()) {
            let d = (t - a).abs();
            *e = if beta == 2.0 {
                d * d
            } else if beta == 1.0 {
                d
            } else {
                d.powf(beta)
            };
        }
    }

    let mut m = DMatrix::<f64>::zeros(k, k);
    for i in 0..k {
        let ei = &errors[i * n..(i + 1) * n];
        for j in 0..=i {
            let v = dot_product(ei, &errors[j * n..(j + 1) * n]) / n as f64;
            m[(i, j)] = v;
            m[(j, i)] = v;
        }
    }

    let trace_scale = m.trace() / k as f64;
    let scale = if trace_scale > 0.0 && trace_scale.is_finite() { trace_scale } else { 1.0 };
    for i in 0..k {
        m[(i, i)] += alpha * scale;
    }

    let ones = DVector::from_element(k, 1.0);
    let solved = solve_symmetric(&m, &ones);

    match solved {
        Some(w) => {
            let mut sum = 0.0;
            for (dst, &v) in weights.iter_mut().zip(w.iter()) {
                *dst = v.max(0.0);
                sum += *dst;
            }
            if sum > 0.0 && sum.is_finite() {
                weights.iter_mut().for_each(|w| *w /= sum);
            } else {
                weights.iter_mut().for_each(|w| *w = uniform);
            }
        }
        None => weights.iter_mut().for_each(|w| *w = uniform),
    }
}
