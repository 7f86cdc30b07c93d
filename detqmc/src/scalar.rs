//! Real/complex polymorphism of the Green's function element type.
//!
//! The matrix algebra is complex whenever the order parameter has more
//! than one component or a magnetic flux threads the lattice; for the
//! O(1) model without flux everything stays real and roughly twice as
//! fast. The concrete scalar is fixed once at replica creation.

use nalgebra::{ComplexField, DMatrix, DVector};
use num_complex::Complex64;

/// Element type of the Green's function and the B-matrices.
pub trait GreenScalar: ComplexField<RealField = f64> + Copy + Send + Sync + 'static {
    const COMPLEX: bool;

    /// Build a scalar from real and imaginary parts. The real sector
    /// only ever receives a vanishing imaginary part.
    fn from_re_im(re: f64, im: f64) -> Self;
}

impl GreenScalar for f64 {
    const COMPLEX: bool = false;

    #[inline]
    fn from_re_im(re: f64, im: f64) -> Self {
        debug_assert!(im == 0.0, "imaginary part in real-valued sector");
        re
    }
}

impl GreenScalar for Complex64 {
    const COMPLEX: bool = true;

    #[inline]
    fn from_re_im(re: f64, im: f64) -> Self {
        Complex64::new(re, im)
    }
}

/// Immutable view of the (rb, cb) block of a matrix with N x N blocks.
#[inline]
pub fn block<S: GreenScalar>(
    m: &DMatrix<S>,
    rb: usize,
    cb: usize,
    n: usize,
) -> nalgebra::DMatrixView<'_, S> {
    m.view((rb * n, cb * n), (n, n))
}

/// Overwrite the (rb, cb) block of `m` with `value`.
#[inline]
pub fn set_block<S: GreenScalar>(
    m: &mut DMatrix<S>,
    rb: usize,
    cb: usize,
    n: usize,
    value: &DMatrix<S>,
) {
    m.view_mut((rb * n, cb * n), (n, n)).copy_from(value);
}

/// diag(d) * a with a real diagonal, in place.
pub fn scale_rows_real<S: GreenScalar>(a: &mut DMatrix<S>, d: &DVector<f64>) {
    debug_assert_eq!(a.nrows(), d.len());
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            a[(i, j)] *= S::from_real(d[i]);
        }
    }
}

/// a * diag(d) with a real diagonal, in place.
pub fn scale_cols_real<S: GreenScalar>(a: &mut DMatrix<S>, d: &DVector<f64>) {
    debug_assert_eq!(a.ncols(), d.len());
    for j in 0..a.ncols() {
        let f = S::from_real(d[j]);
        for i in 0..a.nrows() {
            a[(i, j)] *= f;
        }
    }
}

/// Largest absolute entry of a - b.
pub fn max_abs_diff<S: GreenScalar>(a: &DMatrix<S>, b: &DMatrix<S>) -> f64 {
    debug_assert_eq!(a.shape(), b.shape());
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y).modulus())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn real_scalar_roundtrip() {
        let x = <f64 as GreenScalar>::from_re_im(1.5, 0.0);
        assert_relative_eq!(x, 1.5);
        assert!(!<f64 as GreenScalar>::COMPLEX);
    }

    #[test]
    fn complex_scalar_roundtrip() {
        let z = <Complex64 as GreenScalar>::from_re_im(1.0, -2.0);
        assert_relative_eq!(z.re, 1.0);
        assert_relative_eq!(z.im, -2.0);
        assert!(<Complex64 as GreenScalar>::COMPLEX);
    }

    #[test]
    fn diagonal_scaling_matches_dense_product() {
        let a = DMatrix::<f64>::from_fn(3, 3, |i, j| (i + 2 * j) as f64);
        let d = DVector::from_vec(vec![2.0, 0.5, -1.0]);
        let mut left = a.clone();
        scale_rows_real(&mut left, &d);
        let mut right = a.clone();
        scale_cols_real(&mut right, &d);
        let dd = DMatrix::from_diagonal(&d);
        assert_relative_eq!(left, &dd * &a, epsilon = 1e-14);
        assert_relative_eq!(right, &a * &dd, epsilon = 1e-14);
    }
}
