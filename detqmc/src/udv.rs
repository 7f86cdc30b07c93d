//! Singular value decompositions kept in factored form.
//!
//! A near-singular product of B-matrices is never collapsed back into a
//! dense matrix; it is carried as `U * diag(d) * V` with the real scale
//! vector `d` sorted non-increasing, so that the Green's function
//! assembly can separate the large and small scales.

use nalgebra::{DMatrix, DVector};

use crate::error::{QmcError, Result};
use crate::scalar::{scale_rows_real, GreenScalar};

const SVD_MAX_ITERATIONS: usize = 1000;

/// One factored matrix `U * diag(d) * V`.
#[derive(Debug, Clone)]
pub struct Udv<S: GreenScalar> {
    pub u: DMatrix<S>,
    pub d: DVector<f64>,
    pub v: DMatrix<S>,
}

impl<S: GreenScalar> Udv<S> {
    /// The identity element `(I, 1, I)`.
    pub fn identity(size: usize) -> Self {
        Udv {
            u: DMatrix::identity(size, size),
            d: DVector::from_element(size, 1.0),
            v: DMatrix::identity(size, size),
        }
    }

    pub fn size(&self) -> usize {
        self.d.len()
    }

    /// Collapse back to a dense matrix. Only used by tests and the
    /// naive reference paths; the sweep machinery never does this.
    pub fn reconstruct(&self) -> DMatrix<S> {
        let mut dv = self.v.clone();
        scale_rows_real(&mut dv, &self.d);
        &self.u * dv
    }
}

/// Decompose a dense matrix, sorting the singular values in
/// non-increasing order. Convergence failure is a numerical breakdown
/// the caller must treat as fatal at stabilization points.
pub fn udv_decompose<S: GreenScalar>(a: DMatrix<S>) -> Result<Udv<S>> {
    let svd = a
        .try_svd(true, true, f64::EPSILON, SVD_MAX_ITERATIONS)
        .ok_or_else(|| QmcError::NumericalFailure("SVD did not converge".into()))?;
    let u = svd
        .u
        .ok_or_else(|| QmcError::NumericalFailure("SVD left factor missing".into()))?;
    let v = svd
        .v_t
        .ok_or_else(|| QmcError::NumericalFailure("SVD right factor missing".into()))?;
    Ok(Udv {
        u,
        d: svd.singular_values,
        v,
    })
}

/// A fresh stabilization chain of `count + 1` identity checkpoints.
pub fn identity_storage<S: GreenScalar>(count: usize, size: usize) -> Vec<Udv<S>> {
    (0..=count).map(|_| Udv::identity(size)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_complex::Complex64;

    #[test]
    fn reconstruction_matches_input() {
        let a = DMatrix::<f64>::from_row_slice(
            3,
            3,
            &[2.0, -1.0, 0.5, 0.0, 3.0, 1.0, -0.5, 0.25, 4.0],
        );
        let udv = udv_decompose(a.clone()).unwrap();
        assert_relative_eq!(udv.reconstruct(), a, epsilon = 1e-12);
    }

    #[test]
    fn singular_values_sorted_non_increasing() {
        let a = DMatrix::<f64>::from_fn(5, 5, |i, j| ((i * 7 + j * 3) % 11) as f64 - 5.0);
        let udv = udv_decompose(a).unwrap();
        for i in 1..udv.d.len() {
            assert!(udv.d[i - 1] >= udv.d[i]);
        }
        assert!(udv.d.iter().all(|&d| d >= 0.0));
    }

    #[test]
    fn complex_reconstruction_matches_input() {
        let a = DMatrix::<Complex64>::from_fn(3, 3, |i, j| {
            Complex64::new((i + j) as f64, (i as f64) - (j as f64) * 0.5)
        });
        let udv = udv_decompose(a.clone()).unwrap();
        let diff = (&udv.reconstruct() - &a).map(|z| z.norm()).max();
        assert!(diff < 1e-12);
    }

    #[test]
    fn identity_element_is_neutral() {
        let id = Udv::<f64>::identity(4);
        assert_relative_eq!(id.reconstruct(), DMatrix::<f64>::identity(4, 4));
    }
}
