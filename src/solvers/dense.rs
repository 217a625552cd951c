//! Direct solver for the small dense systems of joint label fusion
//!
//! The joint weight system is K x K with K the number of atlases (rarely more
//! than a few dozen), so a direct factorization beats any iterative scheme.

use nalgebra::{DMatrix, DVector};

/// Solve `m * x = rhs` for symmetric `m`
///
/// Tries Cholesky first (the regularized error matrix is positive definite in
/// practice) and falls back to LU with partial pivoting. Returns `None` when
/// both fail or the solution is not finite.
pub fn solve_symmetric(m: &DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    let finite = |x: &DVector<f64>| x.iter().all(|v| v.is_finite());

    if let Some(chol) = m.clone().cholesky() {
        let x = chol.solve(rhs);
        if finite(&x) {
            return Some(x);
        }
    }

    m.clone().lu().solve(rhs).filter(finite)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_spd() {
        // [[4,1],[1,3]] x = [1,2] -> x = [1/11, 7/11]
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let x = solve_symmetric(&m, &b).unwrap();
        assert!((x[0] - 1.0 / 11.0).abs() < 1e-12);
        assert!((x[1] - 7.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn test_solve_indefinite_uses_lu() {
        let m = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        let b = DVector::from_vec(vec![2.0, 3.0]);
        let x = solve_symmetric(&m, &b).unwrap();
        assert!((x[0] - 3.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_solve_singular() {
        let m = DMatrix::from_element(3, 3, 1.0);
        let b = DVector::from_element(3, 1.0);
        assert!(solve_symmetric(&m, &b).is_none());
    }
}
