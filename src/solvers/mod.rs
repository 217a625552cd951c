//! Linear solvers
//!
//! - Dense: direct Cholesky / LU solve for the joint label fusion weights

pub mod dense;

pub use dense::*;
