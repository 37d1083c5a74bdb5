use crate::prelude::{DestripeError, DestripeResult};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ArrayView2};

/// Below this reciprocal condition number a Gram matrix is treated as singular.
pub const GRAM_RCOND_LIMIT: f64 = 1e-12;

/// Inverse of a symmetric matrix together with its reciprocal condition number.
#[derive(Debug, Clone)]
pub struct SymmetricInverse {
    pub inverse: Option<Array2<f64>>,
    pub rcond: f64,
}

pub struct MatrixHelper;

impl MatrixHelper {
    /// Eigen-decomposes a symmetric matrix and inverts it when it is positive
    /// definite. The reciprocal condition number is the ratio of the smallest
    /// to the largest eigenvalue, zero for indefinite or empty spectra.
    pub fn invert_symmetric(matrix: ArrayView2<f64>) -> SymmetricInverse {
        let n = matrix.nrows();
        if n == 0 || matrix.ncols() != n || matrix.iter().any(|v| !v.is_finite()) {
            return SymmetricInverse {
                inverse: None,
                rcond: 0.0,
            };
        }
        let dense = DMatrix::from_fn(n, n, |i, j| matrix[[i, j]]);
        let eigen = SymmetricEigen::new(dense);
        let max = eigen.eigenvalues.iter().cloned().fold(f64::MIN, f64::max);
        let min = eigen.eigenvalues.iter().cloned().fold(f64::MAX, f64::min);
        if max <= 0.0 || min <= 0.0 {
            return SymmetricInverse {
                inverse: None,
                rcond: 0.0,
            };
        }
        let inverse_values = DMatrix::from_diagonal(&eigen.eigenvalues.map(|value| 1.0 / value));
        let inverse = &eigen.eigenvectors * inverse_values * eigen.eigenvectors.transpose();
        SymmetricInverse {
            inverse: Some(Array2::from_shape_fn((n, n), |(i, j)| inverse[(i, j)])),
            rcond: min / max,
        }
    }

    /// Inverts a noise-weighted Gram matrix, failing when it is singular.
    pub fn invert_gram(matrix: ArrayView2<f64>) -> DestripeResult<Array2<f64>> {
        let result = Self::invert_symmetric(matrix);
        match result.inverse {
            Some(inverse) if result.rcond >= GRAM_RCOND_LIMIT => Ok(inverse),
            _ => Err(DestripeError::Singular(format!(
                "{}x{} Gram matrix has reciprocal condition number {:e}",
                matrix.nrows(),
                matrix.ncols(),
                result.rcond
            ))),
        }
    }
}
