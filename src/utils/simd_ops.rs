//! SIMD-accelerated reductions for patch comparison
//!
//! Patch distances and joint error products are the innermost loops of the
//! fusion engine. When the `simd` feature is enabled these use 256-bit
//! `f64x4` lanes from `wide` (SSE/AVX/NEON or WASM SIMD); otherwise a scalar
//! fallback with identical semantics is compiled.

#[cfg(feature = "simd")]
use wide::f64x4;

/// SIMD lane width (4 for f64x4)
#[cfg(feature = "simd")]
pub const SIMD_WIDTH: usize = 4;

#[cfg(not(feature = "simd"))]
pub const SIMD_WIDTH: usize = 1;

#[cfg(feature = "simd")]
#[inline(always)]
fn load(a: &[f64], idx: usize) -> f64x4 {
    f64x4::new([a[idx], a[idx + 1], a[idx + 2], a[idx + 3]])
}

// ============================================================================
// Squared Difference
// ============================================================================

/// Compute sum((a[i] - b[i])^2)
#[cfg(feature = "simd")]
#[inline]
pub fn sum_squared_diff(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let chunks = n / SIMD_WIDTH;

    let mut sum = f64x4::ZERO;
    for i in 0..chunks {
        let idx = i * SIMD_WIDTH;
        let d = load(a, idx) - load(b, idx);
        sum += d * d;
    }

    let mut result = sum.reduce_add();
    for i in chunks * SIMD_WIDTH..n {
        let d = a[i] - b[i];
        result += d * d;
    }
    result
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn sum_squared_diff(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&ai, &bi)| (ai - bi) * (ai - bi)).sum()
}

// ============================================================================
// Dot Product
// ============================================================================

/// Compute sum(a[i] * b[i])
#[cfg(feature = "simd")]
#[inline]
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let chunks = n / SIMD_WIDTH;

    let mut sum = f64x4::ZERO;
    for i in 0..chunks {
        let idx = i * SIMD_WIDTH;
        sum += load(a, idx) * load(b, idx);
    }

    let mut result = sum.reduce_add();
    for i in chunks * SIMD_WIDTH..n {
        result += a[i] * b[i];
    }
    result
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&ai, &bi)| ai * bi).sum()
}
