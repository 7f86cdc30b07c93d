//! The B-matrix factory: single-slice propagators
//! `B_k = e^{-dtau V_k} e^{-dtau K}` applied to arbitrary matrices from
//! the left or right, their inverses, and the per-site delta matrix of
//! a local update.
//!
//! The potential exponential is never formed as a dense matrix in the
//! hot path: its per-site block structure is applied through diagonal
//! coefficient vectors, while the hopping part goes through the
//! [`KineticKernel`]. The chemical potential factor `e^{+-dtau mu}`
//! rides along with each band's hopping exponential.

use nalgebra::{DMatrix, DVector};

use crate::config::ModelParams;
use crate::fields::{cdwl_eta, FieldConfig, Phi};
use crate::hopping::{Band, KineticKernel};
use crate::scalar::{block, set_block, GreenScalar};

/// Borrowed context bundling everything needed to apply B-matrices.
pub struct BmatContext<'a, S: GreenScalar, const OPDIM: usize> {
    pub pars: &'a ModelParams,
    pub kernel: &'a KineticKernel<S>,
    pub field: &'a FieldConfig<OPDIM>,
}

/// Per-slice diagonal coefficient vectors of the potential exponential.
struct SliceCoeffs<S: GreenScalar> {
    /// cosh-phi * cosh-cdwl + sinh-cdwl
    cd: DVector<f64>,
    /// cosh-phi * cosh-cdwl - sinh-cdwl
    cmd: DVector<f64>,
    /// (phi_0 - i phi_1) * sinh-phi * cosh-cdwl
    bx: DVector<S>,
    /// (phi_0 + i phi_1) * sinh-phi * cosh-cdwl
    bcx: DVector<S>,
    /// phi_2 * sinh-phi * cosh-cdwl (three-component order parameter)
    ax: Option<DVector<f64>>,
}

/// diag(f * v) * m with a real coefficient vector.
fn rows_scaled_re<S: GreenScalar>(m: &DMatrix<S>, v: &DVector<f64>, f: f64) -> DMatrix<S> {
    let mut out = m.clone();
    for j in 0..out.ncols() {
        for i in 0..out.nrows() {
            out[(i, j)] *= S::from_real(f * v[i]);
        }
    }
    out
}

/// diag(v) * m * f with a scalar coefficient vector.
fn rows_scaled<S: GreenScalar>(m: &DMatrix<S>, v: &DVector<S>, f: f64) -> DMatrix<S> {
    let mut out = m.clone();
    for j in 0..out.ncols() {
        for i in 0..out.nrows() {
            out[(i, j)] *= v[i] * S::from_real(f);
        }
    }
    out
}

/// m * diag(f * v) with a real coefficient vector.
fn cols_scaled_re<S: GreenScalar>(m: &DMatrix<S>, v: &DVector<f64>, f: f64) -> DMatrix<S> {
    let mut out = m.clone();
    for j in 0..out.ncols() {
        let c = S::from_real(f * v[j]);
        for i in 0..out.nrows() {
            out[(i, j)] *= c;
        }
    }
    out
}

/// m * diag(v) * f with a scalar coefficient vector.
fn cols_scaled<S: GreenScalar>(m: &DMatrix<S>, v: &DVector<S>, f: f64) -> DMatrix<S> {
    let mut out = m.clone();
    for j in 0..out.ncols() {
        let c = v[j] * S::from_real(f);
        for i in 0..out.nrows() {
            out[(i, j)] *= c;
        }
    }
    out
}

impl<'a, S: GreenScalar, const OPDIM: usize> BmatContext<'a, S, OPDIM> {
    pub fn new(
        pars: &'a ModelParams,
        kernel: &'a KineticKernel<S>,
        field: &'a FieldConfig<OPDIM>,
    ) -> Self {
        BmatContext { pars, kernel, field }
    }

    #[inline]
    fn n(&self) -> usize {
        self.pars.num_sites()
    }

    #[inline]
    fn msf(&self) -> usize {
        self.pars.matrix_size_factor()
    }

    /// e^{+dtau mu_band}, attached to each forward hopping factor.
    #[inline]
    fn ov_fac(&self, band: Band) -> f64 {
        match band {
            Band::X => (self.pars.dtau * self.pars.mux).exp(),
            Band::Y => (self.pars.dtau * self.pars.muy).exp(),
        }
    }

    #[inline]
    fn ov_fac_inv(&self, band: Band) -> f64 {
        1.0 / self.ov_fac(band)
    }

    fn slice_coeffs(&self, k: usize) -> SliceCoeffs<S> {
        let n = self.n();
        let f = self.field;
        let mut cd = DVector::zeros(n);
        let mut cmd = DVector::zeros(n);
        let mut bx = DVector::from_element(n, S::from_real(0.0));
        let mut bcx = bx.clone();
        let mut ax = if OPDIM == 3 {
            Some(DVector::zeros(n))
        } else {
            None
        };
        for site in 0..n {
            let c_phi = f.cosh_phi(site, k);
            let s_phi = f.sinh_phi(site, k);
            let c_cdwl = f.cosh_cdwl(site, k);
            let s_cdwl = f.sinh_cdwl(site, k);
            cd[site] = c_phi * c_cdwl + s_cdwl;
            cmd[site] = c_phi * c_cdwl - s_cdwl;
            let sc = s_phi * c_cdwl;
            let phi0 = f.phi_comp(site, 0, k);
            let phi1 = if OPDIM > 1 {
                f.phi_comp(site, 1, k)
            } else {
                0.0
            };
            bx[site] = S::from_re_im(phi0 * sc, -phi1 * sc);
            bcx[site] = S::from_re_im(phi0 * sc, phi1 * sc);
            if let Some(ax) = ax.as_mut() {
                ax[site] = f.phi_comp(site, 2, k) * sc;
            }
        }
        SliceCoeffs { cd, cmd, bx, bcx, ax }
    }

    /// B_k * orig.
    pub fn left_multiply_bk(&self, orig: &DMatrix<S>, k: usize) -> DMatrix<S> {
        let n = self.n();
        let msf = self.msf();
        let co = self.slice_coeffs(k);
        let (ovx, ovy) = (self.ov_fac(Band::X), self.ov_fac(Band::Y));
        let mut result = DMatrix::zeros(msf * n, msf * n);

        for col in 0..msf {
            let kx0 = self
                .kernel
                .lmult_hopping_exp(block(orig, 0, col, n).clone_owned(), Band::X, -1);
            let ky1 = self
                .kernel
                .lmult_hopping_exp(block(orig, 1, col, n).clone_owned(), Band::Y, -1);

            if msf == 2 {
                let r0 = rows_scaled_re(&kx0, &co.cd, ovx) + rows_scaled(&ky1, &co.bx, -ovy);
                let r1 = rows_scaled(&kx0, &co.bcx, -ovx) + rows_scaled_re(&ky1, &co.cmd, ovy);
                set_block(&mut result, 0, col, n, &r0);
                set_block(&mut result, 1, col, n, &r1);
            } else {
                let ax = co.ax.as_ref().expect("three-component coefficients");
                let kx2 = self
                    .kernel
                    .lmult_hopping_exp(block(orig, 2, col, n).clone_owned(), Band::X, -1);
                let ky3 = self
                    .kernel
                    .lmult_hopping_exp(block(orig, 3, col, n).clone_owned(), Band::Y, -1);

                let r0 = rows_scaled_re(&kx0, &co.cd, ovx)
                    + rows_scaled(&ky1, &co.bx, -ovy)
                    + rows_scaled_re(&ky3, ax, -ovy);
                let r1 = rows_scaled(&kx0, &co.bcx, -ovx)
                    + rows_scaled_re(&ky1, &co.cmd, ovy)
                    + rows_scaled_re(&kx2, ax, ovx);
                let r2 = rows_scaled_re(&ky1, ax, ovy)
                    + rows_scaled_re(&kx2, &co.cd, ovx)
                    + rows_scaled(&ky3, &co.bcx, -ovy);
                let r3 = rows_scaled_re(&kx0, ax, -ovx)
                    + rows_scaled(&kx2, &co.bx, -ovx)
                    + rows_scaled_re(&ky3, &co.cmd, ovy);
                set_block(&mut result, 0, col, n, &r0);
                set_block(&mut result, 1, col, n, &r1);
                set_block(&mut result, 2, col, n, &r2);
                set_block(&mut result, 3, col, n, &r3);
            }
        }
        result
    }

    /// B_k^{-1} * orig. The potential part has the analytic inverse
    /// e^{+dtau V_k}, applied before the inverse hopping exponential.
    pub fn left_multiply_bk_inv(&self, orig: &DMatrix<S>, k: usize) -> DMatrix<S> {
        let n = self.n();
        let msf = self.msf();
        let co = self.slice_coeffs(k);
        let (ovx, ovy) = (self.ov_fac_inv(Band::X), self.ov_fac_inv(Band::Y));
        let mut result = DMatrix::zeros(msf * n, msf * n);

        for col in 0..msf {
            let o0 = block(orig, 0, col, n).clone_owned();
            let o1 = block(orig, 1, col, n).clone_owned();
            if msf == 2 {
                let r0 = self.kernel.lmult_hopping_exp(
                    rows_scaled_re(&o0, &co.cmd, ovx) + rows_scaled(&o1, &co.bx, ovx),
                    Band::X,
                    1,
                );
                let r1 = self.kernel.lmult_hopping_exp(
                    rows_scaled(&o0, &co.bcx, ovy) + rows_scaled_re(&o1, &co.cd, ovy),
                    Band::Y,
                    1,
                );
                set_block(&mut result, 0, col, n, &r0);
                set_block(&mut result, 1, col, n, &r1);
            } else {
                let ax = co.ax.as_ref().expect("three-component coefficients");
                let o2 = block(orig, 2, col, n).clone_owned();
                let o3 = block(orig, 3, col, n).clone_owned();

                let r0 = self.kernel.lmult_hopping_exp(
                    rows_scaled_re(&o0, &co.cmd, ovx)
                        + rows_scaled(&o1, &co.bx, ovx)
                        + rows_scaled_re(&o3, ax, ovx),
                    Band::X,
                    1,
                );
                let r1 = self.kernel.lmult_hopping_exp(
                    rows_scaled(&o0, &co.bcx, ovy)
                        + rows_scaled_re(&o1, &co.cd, ovy)
                        + rows_scaled_re(&o2, ax, -ovy),
                    Band::Y,
                    1,
                );
                let r2 = self.kernel.lmult_hopping_exp(
                    rows_scaled_re(&o1, ax, -ovx)
                        + rows_scaled_re(&o2, &co.cmd, ovx)
                        + rows_scaled(&o3, &co.bcx, ovx),
                    Band::X,
                    1,
                );
                let r3 = self.kernel.lmult_hopping_exp(
                    rows_scaled_re(&o0, ax, ovy)
                        + rows_scaled(&o2, &co.bx, ovy)
                        + rows_scaled_re(&o3, &co.cd, ovy),
                    Band::Y,
                    1,
                );
                set_block(&mut result, 0, col, n, &r0);
                set_block(&mut result, 1, col, n, &r1);
                set_block(&mut result, 2, col, n, &r2);
                set_block(&mut result, 3, col, n, &r3);
            }
        }
        result
    }

    /// orig * B_k.
    pub fn right_multiply_bk(&self, orig: &DMatrix<S>, k: usize) -> DMatrix<S> {
        let n = self.n();
        let msf = self.msf();
        let co = self.slice_coeffs(k);
        let (ovx, ovy) = (self.ov_fac(Band::X), self.ov_fac(Band::Y));
        let mut result = DMatrix::zeros(msf * n, msf * n);

        for row in 0..msf {
            let o0 = block(orig, row, 0, n).clone_owned();
            let o1 = block(orig, row, 1, n).clone_owned();
            if msf == 2 {
                let c0 = self.kernel.rmult_hopping_exp(
                    cols_scaled_re(&o0, &co.cd, ovx) + cols_scaled(&o1, &co.bcx, -ovx),
                    Band::X,
                    -1,
                );
                let c1 = self.kernel.rmult_hopping_exp(
                    cols_scaled(&o0, &co.bx, -ovy) + cols_scaled_re(&o1, &co.cmd, ovy),
                    Band::Y,
                    -1,
                );
                set_block(&mut result, row, 0, n, &c0);
                set_block(&mut result, row, 1, n, &c1);
            } else {
                let ax = co.ax.as_ref().expect("three-component coefficients");
                let o2 = block(orig, row, 2, n).clone_owned();
                let o3 = block(orig, row, 3, n).clone_owned();

                let c0 = self.kernel.rmult_hopping_exp(
                    cols_scaled_re(&o0, &co.cd, ovx)
                        + cols_scaled(&o1, &co.bcx, -ovx)
                        + cols_scaled_re(&o3, ax, -ovx),
                    Band::X,
                    -1,
                );
                let c1 = self.kernel.rmult_hopping_exp(
                    cols_scaled(&o0, &co.bx, -ovy)
                        + cols_scaled_re(&o1, &co.cmd, ovy)
                        + cols_scaled_re(&o2, ax, ovy),
                    Band::Y,
                    -1,
                );
                let c2 = self.kernel.rmult_hopping_exp(
                    cols_scaled_re(&o1, ax, ovx)
                        + cols_scaled_re(&o2, &co.cd, ovx)
                        + cols_scaled(&o3, &co.bx, -ovx),
                    Band::X,
                    -1,
                );
                let c3 = self.kernel.rmult_hopping_exp(
                    cols_scaled_re(&o0, ax, -ovy)
                        + cols_scaled(&o2, &co.bcx, -ovy)
                        + cols_scaled_re(&o3, &co.cmd, ovy),
                    Band::Y,
                    -1,
                );
                set_block(&mut result, row, 0, n, &c0);
                set_block(&mut result, row, 1, n, &c1);
                set_block(&mut result, row, 2, n, &c2);
                set_block(&mut result, row, 3, n, &c3);
            }
        }
        result
    }

    /// orig * B_k^{-1}.
    pub fn right_multiply_bk_inv(&self, orig: &DMatrix<S>, k: usize) -> DMatrix<S> {
        let n = self.n();
        let msf = self.msf();
        let co = self.slice_coeffs(k);
        let (ovx, ovy) = (self.ov_fac_inv(Band::X), self.ov_fac_inv(Band::Y));
        let mut result = DMatrix::zeros(msf * n, msf * n);

        for row in 0..msf {
            let hx0 = self
                .kernel
                .rmult_hopping_exp(block(orig, row, 0, n).clone_owned(), Band::X, 1);
            let hy1 = self
                .kernel
                .rmult_hopping_exp(block(orig, row, 1, n).clone_owned(), Band::Y, 1);
            if msf == 2 {
                let c0 = cols_scaled_re(&hx0, &co.cmd, ovx) + cols_scaled(&hy1, &co.bcx, ovy);
                let c1 = cols_scaled(&hx0, &co.bx, ovx) + cols_scaled_re(&hy1, &co.cd, ovy);
                set_block(&mut result, row, 0, n, &c0);
                set_block(&mut result, row, 1, n, &c1);
            } else {
                let ax = co.ax.as_ref().expect("three-component coefficients");
                let hx2 = self
                    .kernel
                    .rmult_hopping_exp(block(orig, row, 2, n).clone_owned(), Band::X, 1);
                let hy3 = self
                    .kernel
                    .rmult_hopping_exp(block(orig, row, 3, n).clone_owned(), Band::Y, 1);

                let c0 = cols_scaled_re(&hx0, &co.cmd, ovx)
                    + cols_scaled(&hy1, &co.bcx, ovy)
                    + cols_scaled_re(&hy3, ax, ovy);
                let c1 = cols_scaled(&hx0, &co.bx, ovx)
                    + cols_scaled_re(&hy1, &co.cd, ovy)
                    + cols_scaled_re(&hx2, ax, -ovx);
                let c2 = cols_scaled_re(&hy1, ax, -ovy)
                    + cols_scaled_re(&hx2, &co.cmd, ovx)
                    + cols_scaled(&hy3, &co.bx, ovy);
                let c3 = cols_scaled_re(&hx0, ax, ovx)
                    + cols_scaled(&hx2, &co.bcx, ovx)
                    + cols_scaled_re(&hy3, &co.cd, ovy);
                set_block(&mut result, row, 0, n, &c0);
                set_block(&mut result, row, 1, n, &c1);
                set_block(&mut result, row, 2, n, &c2);
                set_block(&mut result, row, 3, n, &c3);
            }
        }
        result
    }

    /// B(k2, k1) * a = B_{k2} ... B_{k1+1} * a.
    pub fn left_multiply_b(&self, a: &DMatrix<S>, k2: usize, k1: usize) -> DMatrix<S> {
        assert!(k2 > k1 && k2 <= self.pars.m);
        let mut result = self.left_multiply_bk(a, k1 + 1);
        for k in (k1 + 2)..=k2 {
            result = self.left_multiply_bk(&result, k);
        }
        result
    }

    /// a * B(k2, k1).
    pub fn right_multiply_b(&self, a: &DMatrix<S>, k2: usize, k1: usize) -> DMatrix<S> {
        assert!(k2 > k1 && k2 <= self.pars.m);
        let mut result = self.right_multiply_bk(a, k2);
        for k in ((k1 + 1)..k2).rev() {
            result = self.right_multiply_bk(&result, k);
        }
        result
    }

    /// B(k2, k1)^{-1} * a.
    pub fn left_multiply_b_inv(&self, a: &DMatrix<S>, k2: usize, k1: usize) -> DMatrix<S> {
        assert!(k2 > k1 && k2 <= self.pars.m);
        let mut result = self.left_multiply_bk_inv(a, k2);
        for k in ((k1 + 1)..k2).rev() {
            result = self.left_multiply_bk_inv(&result, k);
        }
        result
    }

    /// a * B(k2, k1)^{-1}.
    pub fn right_multiply_b_inv(&self, a: &DMatrix<S>, k2: usize, k1: usize) -> DMatrix<S> {
        assert!(k2 > k1 && k2 <= self.pars.m);
        let mut result = self.right_multiply_bk_inv(a, k1 + 1);
        for k in (k1 + 2)..=k2 {
            result = self.right_multiply_bk_inv(&result, k);
        }
        result
    }

    /// Dense reference for B(k2, k1), built from explicit single-slice
    /// propagators. Not used in performance-sensitive code.
    pub fn bmat_dense(&self, k2: usize, k1: usize) -> DMatrix<S> {
        let n = self.n();
        let msf = self.msf();
        if k2 == k1 {
            return DMatrix::identity(msf * n, msf * n);
        }
        assert!(k2 > k1 && k2 <= self.pars.m);
        let mut result = self.single_slice_prop_dense(k2);
        for k in ((k1 + 1)..k2).rev() {
            result *= self.single_slice_prop_dense(k);
        }
        result
    }

    /// Dense `e^{-dtau V_k} e^{-dtau K}` of one slice.
    pub fn single_slice_prop_dense(&self, k: usize) -> DMatrix<S> {
        let n = self.n();
        let msf = self.msf();
        let co = self.slice_coeffs(k);
        let (ovx, ovy) = (self.ov_fac(Band::X), self.ov_fac(Band::Y));
        let px = self.kernel.prop_k(Band::X);
        let py = self.kernel.prop_k(Band::Y);
        let mut result = DMatrix::zeros(msf * n, msf * n);

        set_block(&mut result, 0, 0, n, &rows_scaled_re(px, &co.cd, ovx));
        set_block(&mut result, 0, 1, n, &rows_scaled(py, &co.bx, -ovy));
        set_block(&mut result, 1, 0, n, &rows_scaled(px, &co.bcx, -ovx));
        set_block(&mut result, 1, 1, n, &rows_scaled_re(py, &co.cmd, ovy));
        if msf == 4 {
            let ax = co.ax.as_ref().expect("three-component coefficients");
            set_block(&mut result, 0, 3, n, &rows_scaled_re(py, ax, -ovy));
            set_block(&mut result, 1, 2, n, &rows_scaled_re(px, ax, ovx));
            set_block(&mut result, 2, 1, n, &rows_scaled_re(py, ax, ovy));
            set_block(&mut result, 3, 0, n, &rows_scaled_re(px, ax, -ovx));
            set_block(&mut result, 2, 2, n, &rows_scaled_re(px, &co.cd, ovx));
            set_block(&mut result, 2, 3, n, &rows_scaled(py, &co.bcx, -ovy));
            set_block(&mut result, 3, 2, n, &rows_scaled(px, &co.bx, -ovx));
            set_block(&mut result, 3, 3, n, &rows_scaled_re(py, &co.cmd, ovy));
        }
        result
    }

    /// The per-site update matrix
    /// `Delta^i = (e^{-dtau V_new} e^{+dtau V_old})_{ii} - I`,
    /// restricted to the MSF x MSF block of site `site`.
    pub fn delta_for_site(
        &self,
        new_phi: Phi<OPDIM>,
        new_cdwl: i32,
        k: usize,
        site: usize,
    ) -> DMatrix<S> {
        let f = self.field;
        let ev_old = self.ev_matrix(
            1.0,
            f.phi(site, k),
            f.cosh_phi(site, k),
            f.sinh_phi(site, k),
            f.cosh_cdwl(site, k),
            f.sinh_cdwl(site, k),
        );
        let (c_phi_new, s_phi_new) = f.cosh_sinh_term_phi(new_phi);
        let (c_cdwl_new, s_cdwl_new) = if f.has_cdw() {
            f.cosh_sinh_term_cdwl(new_cdwl)
        } else {
            (1.0, 0.0)
        };
        let ev_new = self.ev_matrix(
            -1.0,
            new_phi,
            c_phi_new,
            s_phi_new,
            c_cdwl_new,
            s_cdwl_new,
        );
        let mut delta = ev_new * ev_old;
        for i in 0..self.msf() {
            delta[(i, i)] -= S::from_real(1.0);
        }
        delta
    }

    /// Single-site block of `e^{sign dtau V}` from cached hyperbolic
    /// terms.
    fn ev_matrix(
        &self,
        sign: f64,
        phi: Phi<OPDIM>,
        c_phi: f64,
        s_phi: f64,
        c_cdwl: f64,
        s_cdwl: f64,
    ) -> DMatrix<S> {
        let msf = self.msf();
        let sc = s_phi * c_cdwl;
        let phi1 = if OPDIM > 1 { phi[1] } else { 0.0 };
        let mut ev = DMatrix::from_element(msf, msf, S::from_real(0.0));
        ev[(0, 0)] = S::from_real(c_phi * c_cdwl - sign * s_cdwl);
        ev[(1, 1)] = S::from_real(c_phi * c_cdwl + sign * s_cdwl);
        ev[(0, 1)] = S::from_re_im(sign * phi[0] * sc, -sign * phi1 * sc);
        ev[(1, 0)] = S::from_re_im(sign * phi[0] * sc, sign * phi1 * sc);
        if msf == 4 {
            let a = sign * phi[2] * sc;
            ev[(2, 2)] = ev[(0, 0)];
            ev[(3, 3)] = ev[(1, 1)];
            ev[(0, 3)] = S::from_real(a);
            ev[(3, 0)] = S::from_real(a);
            ev[(1, 2)] = S::from_real(-a);
            ev[(2, 1)] = S::from_real(-a);
            ev[(2, 3)] = S::from_re_im(sign * phi[0] * sc, sign * phi1 * sc);
            ev[(3, 2)] = S::from_re_im(sign * phi[0] * sc, -sign * phi1 * sc);
        }
        ev
    }

    /// Dense `e^{sign dtau V_k}` over the whole lattice, assembled by
    /// hermitian eigendecomposition. Reference implementation used by
    /// tests only.
    pub fn potential_exponential_dense(&self, sign: f64, k: usize) -> DMatrix<S> {
        let n = self.n();
        let msf = self.msf();
        let f = self.field;
        let lambda = self.pars.lambda;
        let sqrt_dtau_cdw_u = self.pars.dtau.sqrt() * self.pars.cdw_u;

        let mut v = DMatrix::from_element(msf * n, msf * n, S::from_real(0.0));
        let mut d = DMatrix::from_element(msf * n, msf * n, S::from_real(0.0));
        for site in 0..n {
            let phi0 = f.phi_comp(site, 0, k);
            let phi1 = if OPDIM > 1 {
                f.phi_comp(site, 1, k)
            } else {
                0.0
            };
            let b = S::from_re_im(phi0, -phi1);
            let bc = S::from_re_im(phi0, phi1);
            v[(site, n + site)] = b;
            v[(n + site, site)] = bc;
            if msf == 4 {
                let a = S::from_real(f.phi_comp(site, 2, k));
                v[(2 * n + site, 3 * n + site)] = bc;
                v[(3 * n + site, 2 * n + site)] = b;
                v[(site, 3 * n + site)] = a;
                v[(n + site, 2 * n + site)] = -a;
                v[(2 * n + site, n + site)] = -a;
                v[(3 * n + site, site)] = a;
            }
            let dv = S::from_real(sqrt_dtau_cdw_u * cdwl_eta(f.cdwl(site, k)));
            d[(site, site)] = dv;
            d[(n + site, n + site)] = -dv;
            if msf == 4 {
                d[(2 * n + site, 2 * n + site)] = dv;
                d[(3 * n + site, 3 * n + site)] = -dv;
            }
        }
        v *= S::from_real(lambda);

        let exp_vphi_half = crate::hopping::compute_propagator(-sign * 0.5 * self.pars.dtau, &v);
        let exp_d = crate::hopping::compute_propagator(sign, &d);
        &exp_vphi_half * exp_d * exp_vphi_half
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::scalar::max_abs_diff;
    use num_complex::Complex64;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn setup(
        opdim: usize,
        checkerboard: bool,
        cdw_u: f64,
    ) -> (ModelParams, KineticKernel<Complex64>) {
        let cfg = ModelConfig {
            l: Some(4),
            beta: Some(1.0),
            dtau: Some(0.1),
            s: Some(5),
            r: Some(0.5),
            opdim: Some(opdim),
            checkerboard: Some(checkerboard),
            cdw_u: Some(cdw_u),
            mu: Some(-0.3),
            ..Default::default()
        };
        let pars = ModelParams::resolve(&cfg).unwrap();
        let kernel = KineticKernel::<Complex64>::new(&pars);
        (pars, kernel)
    }

    fn random_field<const OPDIM: usize>(pars: &ModelParams) -> FieldConfig<OPDIM> {
        let mut field = FieldConfig::<OPDIM>::new(pars);
        let mut rng = Pcg64::seed_from_u64(99);
        field.init_random(&mut rng);
        field
    }

    #[test]
    fn left_multiply_identity_matches_dense_bmat() {
        let (pars, kernel) = setup(2, false, 0.0);
        let field = random_field::<2>(&pars);
        let ctx = BmatContext::new(&pars, &kernel, &field);
        let size = pars.matrix_size_factor() * pars.num_sites();
        let id = DMatrix::<Complex64>::identity(size, size);
        for k in 1..=3 {
            let dense = ctx.bmat_dense(k, k - 1);
            let left = ctx.left_multiply_b(&id, k, k - 1);
            let right = ctx.right_multiply_b(&id, k, k - 1);
            assert!(max_abs_diff(&dense, &left) < 1e-10);
            assert!(max_abs_diff(&dense, &right) < 1e-10);
        }
    }

    #[test]
    fn opdim3_multiplication_matches_dense_bmat() {
        let (pars, kernel) = setup(3, false, 0.4);
        let field = random_field::<3>(&pars);
        let ctx = BmatContext::new(&pars, &kernel, &field);
        let size = pars.matrix_size_factor() * pars.num_sites();
        let id = DMatrix::<Complex64>::identity(size, size);
        let dense = ctx.bmat_dense(2, 0);
        let left = ctx.left_multiply_b(&id, 2, 0);
        let right = ctx.right_multiply_b(&id, 2, 0);
        assert!(max_abs_diff(&dense, &left) < 1e-9);
        assert!(max_abs_diff(&dense, &right) < 1e-9);
    }

    #[test]
    fn inverse_multiplication_inverts_bmat() {
        let (pars, kernel) = setup(2, false, 0.3);
        let field = random_field::<2>(&pars);
        let ctx = BmatContext::new(&pars, &kernel, &field);
        let size = pars.matrix_size_factor() * pars.num_sites();
        let id = DMatrix::<Complex64>::identity(size, size);
        let b = ctx.left_multiply_b(&id, 2, 1);
        let binv_b = ctx.left_multiply_b_inv(&b, 2, 1);
        assert!(max_abs_diff(&binv_b, &id) < 1e-8);
        let b_binv = ctx.right_multiply_b_inv(&b, 2, 1);
        assert!(max_abs_diff(&b_binv, &id) < 1e-8);
    }

    #[test]
    fn checkerboard_bmat_close_to_dense() {
        let (pars, kernel) = setup(2, true, 0.0);
        let field = random_field::<2>(&pars);
        let ctx = BmatContext::new(&pars, &kernel, &field);
        let size = pars.matrix_size_factor() * pars.num_sites();
        let id = DMatrix::<Complex64>::identity(size, size);
        let dense = ctx.bmat_dense(1, 0);
        let cb = ctx.left_multiply_b(&id, 1, 0);
        // Trotter error of the symmetric break-up at dtau = 0.1
        assert!(max_abs_diff(&dense, &cb) < 1e-2);
    }

    #[test]
    fn delta_matches_dense_potential_exponentials() {
        let (pars, kernel) = setup(3, false, 0.4);
        let field = random_field::<3>(&pars);
        let ctx = BmatContext::new(&pars, &kernel, &field);
        let n = pars.num_sites();
        let k = 2;
        let site = 5;

        // propose a changed field at one site, then compare the analytic
        // per-site delta against the dense exponentials
        let new_phi = Phi::<3>::new(0.3, -0.8, 0.55);
        let new_cdwl = -2;

        let delta = ctx.delta_for_site(new_phi, new_cdwl, k, site);

        let ev_old_dense = ctx.potential_exponential_dense(1.0, k);
        let mut field_new = field.clone();
        field_new.set_phi(site, k, new_phi);
        field_new.set_cdwl(site, k, new_cdwl);
        field_new.update_cosh_sinh_terms(site, k);
        let ctx_new = BmatContext::new(&pars, &kernel, &field_new);
        let ev_new_dense = ctx_new.potential_exponential_dense(-1.0, k);

        let prod = &ev_new_dense * &ev_old_dense;
        let msf = pars.matrix_size_factor();
        let mut delta_ref = DMatrix::<Complex64>::zeros(msf, msf);
        for a in 0..msf {
            for b in 0..msf {
                delta_ref[(a, b)] = prod[(site + a * n, site + b * n)];
            }
        }
        for i in 0..msf {
            delta_ref[(i, i)] -= Complex64::new(1.0, 0.0);
        }
        assert!(max_abs_diff(&delta, &delta_ref) < 1e-9);
    }
}
