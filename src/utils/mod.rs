//! Utility functions for label fusion
//!
//! This module provides common utility functions:
//! - Mirror padding and cropping
//! - printf-style output filename patterns
//! - SIMD-accelerated operations (optional, with `simd` feature)

pub mod padding;
pub mod pattern;
pub mod simd_ops;

pub use padding::*;
pub use pattern::*;
