//! Kinetic (hopping) part of the one-slice propagator.
//!
//! Two operating modes are dispatched once at replica creation: a dense
//! mode that multiplies precomputed `e^{+-dtau K}` matrices, and the
//! symmetric checkerboard break-up into 4-site plaquette factors
//! (`e^{-dtau/2 K_B} e^{-dtau K_A} e^{-dtau/2 K_B}`). A weak orbital
//! magnetic field enters through Peierls phases; with the field on, the
//! analytic two-rotation form of a plaquette factor no longer applies
//! and precomputed 4x4 plaquette exponentials are used instead.

use nalgebra::{DMatrix, Matrix4, RowDVector, SymmetricEigen};
use std::f64::consts::PI;

use lattice::{Dir, Plaquette, SquareLattice};

use crate::config::ModelParams;
use crate::scalar::GreenScalar;

/// The two fermion bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    X,
    Y,
}

impl Band {
    pub const BOTH: [Band; 2] = [Band::X, Band::Y];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Band::X => 0,
            Band::Y => 1,
        }
    }
}

/// `e^{-scalar * K}` of a hermitian matrix via eigendecomposition.
pub fn compute_propagator<S: GreenScalar>(scalar: f64, matrix: &DMatrix<S>) -> DMatrix<S> {
    let eig = SymmetricEigen::new(matrix.clone());
    let mut scaled = eig.eigenvectors.clone();
    for j in 0..scaled.ncols() {
        let f = S::from_real((-scalar * eig.eigenvalues[j]).exp());
        for i in 0..scaled.nrows() {
            scaled[(i, j)] *= f;
        }
    }
    &scaled * eig.eigenvectors.adjoint()
}

/// Exponent prefactors the plaquette cache is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaqExp {
    FullMinus,
    HalfMinus,
    FullPlus,
    HalfPlus,
}

impl PlaqExp {
    fn index(self) -> usize {
        match self {
            PlaqExp::FullMinus => 0,
            PlaqExp::HalfMinus => 1,
            PlaqExp::FullPlus => 2,
            PlaqExp::HalfPlus => 3,
        }
    }

    fn prefactor(self, dtau: f64) -> f64 {
        match self {
            PlaqExp::FullMinus => -dtau,
            PlaqExp::HalfMinus => -0.5 * dtau,
            PlaqExp::FullPlus => dtau,
            PlaqExp::HalfPlus => 0.5 * dtau,
        }
    }

    fn of(sign: i32, half: bool) -> Self {
        match (sign, half) {
            (-1, false) => PlaqExp::FullMinus,
            (-1, true) => PlaqExp::HalfMinus,
            (1, false) => PlaqExp::FullPlus,
            (1, true) => PlaqExp::HalfPlus,
            _ => unreachable!("hopping exponent sign must be +-1"),
        }
    }
}

/// 4x4 plaquette exponentials, indexed `[prefactor][band][subgroup]`,
/// each vector parallel to `SquareLattice::plaquettes(subgroup)`.
struct PlaquetteCache<S: GreenScalar> {
    mats: Vec<Vec<Matrix4<S>>>,
}

impl<S: GreenScalar> PlaquetteCache<S> {
    fn slot(exp: PlaqExp, band: Band, subgroup: usize) -> usize {
        (exp.index() * 2 + band.index()) * 2 + subgroup
    }

    fn get(&self, exp: PlaqExp, band: Band, subgroup: usize) -> &[Matrix4<S>] {
        &self.mats[Self::slot(exp, band, subgroup)]
    }
}

/// Precomputed representations of `e^{+-dtau K_band}` and its half-step
/// variants, in dense and checkerboard form.
pub struct KineticKernel<S: GreenScalar> {
    lat: SquareLattice,
    checkerboard: bool,
    flux: bool,
    /// Flux quantum per plaquette of the whole torus, +1/N or 0.
    zmag: f64,
    hop_hor: [f64; 2],
    hop_ver: [f64; 2],
    // dense propagators, also used by the reference B-matrix
    prop_k: [DMatrix<S>; 2],
    prop_k_inv: [DMatrix<S>; 2],
    prop_k_half: [DMatrix<S>; 2],
    prop_k_half_inv: [DMatrix<S>; 2],
    // checkerboard bond constants (no flux)
    cosh_hor: [f64; 2],
    sinh_hor: [f64; 2],
    cosh_ver: [f64; 2],
    sinh_ver: [f64; 2],
    cosh_hor_half: [f64; 2],
    sinh_hor_half: [f64; 2],
    cosh_ver_half: [f64; 2],
    sinh_ver_half: [f64; 2],
    plaquettes: [Vec<Plaquette>; 2],
    plaq_cache: Option<PlaquetteCache<S>>,
    bc: lattice::BoundaryCondition,
}

impl<S: GreenScalar> KineticKernel<S> {
    pub fn new(pars: &ModelParams) -> Self {
        let lat = SquareLattice::new(pars.l);
        let n = pars.num_sites();
        let zmag = if pars.weak_zflux { 1.0 / n as f64 } else { 0.0 };
        let hop_hor = [pars.txhor, pars.tyhor];
        let hop_ver = [pars.txver, pars.tyver];

        // dense hopping matrices K_band, hermitian; the chemical
        // potential is a scalar factor applied by the B-matrix factory
        // so that dense and checkerboard mode share one code path
        let mut prop_k: Vec<DMatrix<S>> = Vec::with_capacity(2);
        let mut prop_k_inv: Vec<DMatrix<S>> = Vec::with_capacity(2);
        let mut prop_k_half: Vec<DMatrix<S>> = Vec::with_capacity(2);
        let mut prop_k_half_inv: Vec<DMatrix<S>> = Vec::with_capacity(2);
        for band in Band::BOTH {
            let b = band.index();
            let mut k = DMatrix::<S>::zeros(n, n);
            for site in 0..n {
                let (ix, iy) = lat.coords(site);
                for dir in Dir::ALL {
                    let neigh = lat.neigh(dir, site);
                    let hop = match dir {
                        Dir::XPlus | Dir::XMinus => hop_hor[b],
                        Dir::YPlus | Dir::YMinus => hop_ver[b],
                    } * lat.bond_sign(pars.bc, site, dir);

                    let phase = if zmag != 0.0 {
                        let arg = match dir {
                            Dir::XPlus => -2.0 * PI * zmag * iy as f64,
                            Dir::XMinus => 2.0 * PI * zmag * iy as f64,
                            Dir::YPlus if iy == pars.l - 1 => {
                                2.0 * PI * zmag * pars.l as f64 * ix as f64
                            }
                            Dir::YMinus if iy == 0 => {
                                -2.0 * PI * zmag * pars.l as f64 * ix as f64
                            }
                            _ => 0.0,
                        };
                        S::from_re_im(arg.cos(), arg.sin())
                    } else {
                        S::from_real(1.0)
                    };

                    k[(site, neigh)] -= phase * S::from_real(hop);
                }
            }
            prop_k.push(compute_propagator(pars.dtau, &k));
            prop_k_inv.push(compute_propagator(-pars.dtau, &k));
            prop_k_half.push(compute_propagator(pars.dtau / 2.0, &k));
            prop_k_half_inv.push(compute_propagator(-pars.dtau / 2.0, &k));
        }

        let mk = |t: &[f64; 2], factor: f64, f: fn(f64) -> f64| {
            [f(-factor * t[0]), f(-factor * t[1])]
        };
        let dtau = pars.dtau;

        let plaquettes = [lat.plaquettes(0), lat.plaquettes(1)];

        let mut kernel = KineticKernel {
            checkerboard: pars.checkerboard,
            flux: zmag != 0.0,
            zmag,
            hop_hor,
            hop_ver,
            prop_k: [prop_k.remove(0), prop_k.remove(0)],
            prop_k_inv: [prop_k_inv.remove(0), prop_k_inv.remove(0)],
            prop_k_half: [prop_k_half.remove(0), prop_k_half.remove(0)],
            prop_k_half_inv: [prop_k_half_inv.remove(0), prop_k_half_inv.remove(0)],
            cosh_hor: mk(&hop_hor, dtau, f64::cosh),
            sinh_hor: mk(&hop_hor, dtau, f64::sinh),
            cosh_ver: mk(&hop_ver, dtau, f64::cosh),
            sinh_ver: mk(&hop_ver, dtau, f64::sinh),
            cosh_hor_half: mk(&hop_hor, 0.5 * dtau, f64::cosh),
            sinh_hor_half: mk(&hop_hor, 0.5 * dtau, f64::sinh),
            cosh_ver_half: mk(&hop_ver, 0.5 * dtau, f64::cosh),
            sinh_ver_half: mk(&hop_ver, 0.5 * dtau, f64::sinh),
            plaquettes,
            plaq_cache: None,
            bc: pars.bc,
            lat,
        };

        if kernel.checkerboard && kernel.flux {
            kernel.precalc_plaquette_exponentials(pars);
        }

        kernel
    }

    pub fn lattice(&self) -> &SquareLattice {
        &self.lat
    }

    pub fn is_checkerboard(&self) -> bool {
        self.checkerboard
    }

    pub fn prop_k(&self, band: Band) -> &DMatrix<S> {
        &self.prop_k[band.index()]
    }

    /// 4x4 hermitian hopping matrix of one plaquette including Peierls
    /// phases and APBC signs, in site order (i, j, k, l).
    fn plaquette_hopping(&self, band: Band, p: &Plaquette, l: usize) -> Matrix4<S> {
        let b = band.index();
        let mut hh = self.hop_hor[b];
        let mut hv = self.hop_ver[b];
        if self.bc.flips_x() && p.ix == l - 1 {
            hh = -hh;
        }
        if self.bc.flips_y() && p.iy == l - 1 {
            hv = -hv;
        }

        let phase = |arg: f64| S::from_re_im(arg.cos(), arg.sin());
        let (j1, k2) = (p.j % l, p.k / l);
        let ph_ij = phase(-2.0 * PI * self.zmag * p.iy as f64);
        let ph_kl = phase(-2.0 * PI * self.zmag * k2 as f64);
        let (ph_ik, ph_jl) = if p.iy == l - 1 {
            (
                phase(2.0 * PI * self.zmag * l as f64 * p.ix as f64),
                phase(2.0 * PI * self.zmag * l as f64 * j1 as f64),
            )
        } else {
            (S::from_real(1.0), S::from_real(1.0))
        };

        let zero = S::from_real(0.0);
        let mut hop = Matrix4::from_element(zero);
        hop[(0, 1)] = ph_ij * S::from_real(hh);
        hop[(0, 2)] = ph_ik * S::from_real(hv);
        hop[(1, 3)] = ph_jl * S::from_real(hv);
        hop[(2, 3)] = ph_kl * S::from_real(hh);
        let upper = hop;
        hop += upper.adjoint();
        -hop
    }

    fn precalc_plaquette_exponentials(&mut self, pars: &ModelParams) {
        let l = pars.l;
        let exps = [
            PlaqExp::FullMinus,
            PlaqExp::HalfMinus,
            PlaqExp::FullPlus,
            PlaqExp::HalfPlus,
        ];
        let mut mats: Vec<Vec<Matrix4<S>>> = vec![Vec::new(); 16];
        for exp in exps {
            let prefactor = exp.prefactor(pars.dtau);
            for band in Band::BOTH {
                for subgroup in 0..2 {
                    let store: Vec<Matrix4<S>> = self.plaquettes[subgroup]
                        .iter()
                        .map(|p| {
                            let hop = self.plaquette_hopping(band, p, l);
                            let eig = SymmetricEigen::new(hop);
                            let mut scaled = eig.eigenvectors.clone();
                            for j in 0..4 {
                                let f = S::from_real((prefactor * eig.eigenvalues[j]).exp());
                                for i in 0..4 {
                                    scaled[(i, j)] *= f;
                                }
                            }
                            scaled * eig.eigenvectors.adjoint()
                        })
                        .collect();
                    mats[PlaquetteCache::<S>::slot(exp, band, subgroup)] = store;
                }
            }
        }
        self.plaq_cache = Some(PlaquetteCache { mats });
    }

    /// Apply the analytic bond factors of one plaquette subgroup from
    /// the left: rows (i, j, k, l) of `result` are mixed.
    fn apply_bond_factors_left(
        &self,
        result: &mut DMatrix<S>,
        subgroup: usize,
        ch_hor: f64,
        sh_hor: f64,
        ch_ver: f64,
        sh_ver: f64,
    ) {
        let l = self.lat.extent();
        for p in &self.plaquettes[subgroup] {
            let mut b_sh_hor = sh_hor;
            let mut b_sh_ver = sh_ver;
            if self.bc.flips_x() && p.ix == l - 1 {
                b_sh_hor = -b_sh_hor;
            }
            if self.bc.flips_y() && p.iy == l - 1 {
                b_sh_ver = -b_sh_ver;
            }

            let cc = S::from_real(ch_hor * ch_ver);
            let ch = S::from_real(ch_ver * b_sh_hor);
            let cv = S::from_real(ch_hor * b_sh_ver);
            let ss = S::from_real(b_sh_hor * b_sh_ver);

            let ri = result.row(p.i).clone_owned();
            let rj = result.row(p.j).clone_owned();
            let rk = result.row(p.k).clone_owned();
            let rl = result.row(p.l).clone_owned();

            result
                .row_mut(p.i)
                .copy_from(&(&ri * cc + &rj * ch + &rk * cv + &rl * ss));
            result
                .row_mut(p.j)
                .copy_from(&(&ri * ch + &rj * cc + &rk * ss + &rl * cv));
            result
                .row_mut(p.k)
                .copy_from(&(&ri * cv + &rj * ss + &rk * cc + &rl * ch));
            result
                .row_mut(p.l)
                .copy_from(&(&ri * ss + &rj * cv + &rk * ch + &rl * cc));
        }
    }

    /// As [`apply_bond_factors_left`] but from the right: columns are
    /// mixed.
    fn apply_bond_factors_right(
        &self,
        result: &mut DMatrix<S>,
        subgroup: usize,
        ch_hor: f64,
        sh_hor: f64,
        ch_ver: f64,
        sh_ver: f64,
    ) {
        let l = self.lat.extent();
        for p in &self.plaquettes[subgroup] {
            let mut b_sh_hor = sh_hor;
            let mut b_sh_ver = sh_ver;
            if self.bc.flips_x() && p.ix == l - 1 {
                b_sh_hor = -b_sh_hor;
            }
            if self.bc.flips_y() && p.iy == l - 1 {
                b_sh_ver = -b_sh_ver;
            }

            let cc = S::from_real(ch_hor * ch_ver);
            let ch = S::from_real(ch_ver * b_sh_hor);
            let cv = S::from_real(ch_hor * b_sh_ver);
            let ss = S::from_real(b_sh_hor * b_sh_ver);

            let ci = result.column(p.i).clone_owned();
            let cj = result.column(p.j).clone_owned();
            let ck = result.column(p.k).clone_owned();
            let cl = result.column(p.l).clone_owned();

            result
                .column_mut(p.i)
                .copy_from(&(&ci * cc + &cj * ch + &ck * cv + &cl * ss));
            result
                .column_mut(p.j)
                .copy_from(&(&ci * ch + &cj * cc + &ck * ss + &cl * cv));
            result
                .column_mut(p.k)
                .copy_from(&(&ci * cv + &cj * ss + &ck * cc + &cl * ch));
            result
                .column_mut(p.l)
                .copy_from(&(&ci * ss + &cj * cv + &ck * ch + &cl * cc));
        }
    }

    /// Apply precomputed 4x4 plaquette exponentials from the left.
    fn apply_plaquette_factors_left(
        &self,
        result: &mut DMatrix<S>,
        subgroup: usize,
        exp: PlaqExp,
        band: Band,
    ) {
        let cache = self
            .plaq_cache
            .as_ref()
            .expect("plaquette cache is built whenever the flux is on");
        let mats = cache.get(exp, band, subgroup);
        for (p, mat) in self.plaquettes[subgroup].iter().zip(mats) {
            let ri = result.row(p.i).clone_owned();
            let rj = result.row(p.j).clone_owned();
            let rk = result.row(p.k).clone_owned();
            let rl = result.row(p.l).clone_owned();
            let rows = [&ri, &rj, &rk, &rl];
            let targets = [p.i, p.j, p.k, p.l];
            for (a, &target) in targets.iter().enumerate() {
                let mut new_row = RowDVector::<S>::zeros(result.ncols());
                for (b, &row) in rows.iter().enumerate() {
                    new_row += row * mat[(a, b)];
                }
                result.row_mut(target).copy_from(&new_row);
            }
        }
    }

    /// Apply precomputed 4x4 plaquette exponentials from the right.
    fn apply_plaquette_factors_right(
        &self,
        result: &mut DMatrix<S>,
        subgroup: usize,
        exp: PlaqExp,
        band: Band,
    ) {
        let cache = self
            .plaq_cache
            .as_ref()
            .expect("plaquette cache is built whenever the flux is on");
        let mats = cache.get(exp, band, subgroup);
        for (p, mat) in self.plaquettes[subgroup].iter().zip(mats) {
            let ci = result.column(p.i).clone_owned();
            let cj = result.column(p.j).clone_owned();
            let ck = result.column(p.k).clone_owned();
            let cl = result.column(p.l).clone_owned();
            let cols = [&ci, &cj, &ck, &cl];
            let targets = [p.i, p.j, p.k, p.l];
            for (b, &target) in targets.iter().enumerate() {
                let mut new_col = nalgebra::DVector::<S>::zeros(result.nrows());
                for (a, &col) in cols.iter().enumerate() {
                    new_col += col * mat[(a, b)];
                }
                result.column_mut(target).copy_from(&new_col);
            }
        }
    }

    /// `e^{sign * dtau * K_band} * A`.
    pub fn lmult_hopping_exp(&self, a: DMatrix<S>, band: Band, sign: i32) -> DMatrix<S> {
        debug_assert!(sign == 1 || sign == -1);
        if !self.checkerboard {
            let prop = if sign == -1 {
                &self.prop_k[band.index()]
            } else {
                &self.prop_k_inv[band.index()]
            };
            return prop * a;
        }
        let b = band.index();
        let mut result = a;
        if !self.flux {
            let s = sign as f64;
            self.apply_bond_factors_left(
                &mut result,
                1,
                self.cosh_hor_half[b],
                s * self.sinh_hor_half[b],
                self.cosh_ver_half[b],
                s * self.sinh_ver_half[b],
            );
            self.apply_bond_factors_left(
                &mut result,
                0,
                self.cosh_hor[b],
                s * self.sinh_hor[b],
                self.cosh_ver[b],
                s * self.sinh_ver[b],
            );
            self.apply_bond_factors_left(
                &mut result,
                1,
                self.cosh_hor_half[b],
                s * self.sinh_hor_half[b],
                self.cosh_ver_half[b],
                s * self.sinh_ver_half[b],
            );
        } else {
            self.apply_plaquette_factors_left(&mut result, 1, PlaqExp::of(sign, true), band);
            self.apply_plaquette_factors_left(&mut result, 0, PlaqExp::of(sign, false), band);
            self.apply_plaquette_factors_left(&mut result, 1, PlaqExp::of(sign, true), band);
        }
        result
    }

    /// `A * e^{sign * dtau * K_band}`.
    pub fn rmult_hopping_exp(&self, a: DMatrix<S>, band: Band, sign: i32) -> DMatrix<S> {
        debug_assert!(sign == 1 || sign == -1);
        if !self.checkerboard {
            let prop = if sign == -1 {
                &self.prop_k[band.index()]
            } else {
                &self.prop_k_inv[band.index()]
            };
            return a * prop;
        }
        let b = band.index();
        let mut result = a;
        if !self.flux {
            let s = sign as f64;
            self.apply_bond_factors_right(
                &mut result,
                1,
                self.cosh_hor_half[b],
                s * self.sinh_hor_half[b],
                self.cosh_ver_half[b],
                s * self.sinh_ver_half[b],
            );
            self.apply_bond_factors_right(
                &mut result,
                0,
                self.cosh_hor[b],
                s * self.sinh_hor[b],
                self.cosh_ver[b],
                s * self.sinh_ver[b],
            );
            self.apply_bond_factors_right(
                &mut result,
                1,
                self.cosh_hor_half[b],
                s * self.sinh_hor_half[b],
                self.cosh_ver_half[b],
                s * self.sinh_ver_half[b],
            );
        } else {
            self.apply_plaquette_factors_right(&mut result, 1, PlaqExp::of(sign, true), band);
            self.apply_plaquette_factors_right(&mut result, 0, PlaqExp::of(sign, false), band);
            self.apply_plaquette_factors_right(&mut result, 1, PlaqExp::of(sign, true), band);
        }
        result
    }

    /// `e^{-dtau/2 K_band} * A`, used by the symmetric Green shift.
    pub fn lmult_hopping_exp_half(&self, a: DMatrix<S>, band: Band) -> DMatrix<S> {
        if !self.checkerboard {
            return &self.prop_k_half[band.index()] * a;
        }
        let b = band.index();
        let mut result = a;
        if !self.flux {
            self.apply_bond_factors_left(
                &mut result,
                1,
                self.cosh_hor_half[b],
                -self.sinh_hor_half[b],
                self.cosh_ver_half[b],
                -self.sinh_ver_half[b],
            );
            self.apply_bond_factors_left(
                &mut result,
                0,
                self.cosh_hor_half[b],
                -self.sinh_hor_half[b],
                self.cosh_ver_half[b],
                -self.sinh_ver_half[b],
            );
        } else {
            self.apply_plaquette_factors_left(&mut result, 1, PlaqExp::HalfMinus, band);
            self.apply_plaquette_factors_left(&mut result, 0, PlaqExp::HalfMinus, band);
        }
        result
    }

    /// `A * e^{+dtau/2 K_band}`, used by the symmetric Green shift.
    pub fn rmult_hopping_exp_half_inv(&self, a: DMatrix<S>, band: Band) -> DMatrix<S> {
        if !self.checkerboard {
            return a * &self.prop_k_half_inv[band.index()];
        }
        let b = band.index();
        let mut result = a;
        if !self.flux {
            self.apply_bond_factors_right(
                &mut result,
                1,
                self.cosh_hor_half[b],
                self.sinh_hor_half[b],
                self.cosh_ver_half[b],
                self.sinh_ver_half[b],
            );
            self.apply_bond_factors_right(
                &mut result,
                0,
                self.cosh_hor_half[b],
                self.sinh_hor_half[b],
                self.cosh_ver_half[b],
                self.sinh_ver_half[b],
            );
        } else {
            self.apply_plaquette_factors_right(&mut result, 1, PlaqExp::HalfPlus, band);
            self.apply_plaquette_factors_right(&mut result, 0, PlaqExp::HalfPlus, band);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::scalar::max_abs_diff;

    fn params(l: usize, checkerboard: bool) -> ModelParams {
        let cfg = ModelConfig {
            l: Some(l),
            beta: Some(1.0),
            dtau: Some(0.1),
            s: Some(5),
            r: Some(1.0),
            opdim: Some(2),
            checkerboard: Some(checkerboard),
            txhor: Some(-1.0),
            txver: Some(-0.5),
            tyhor: Some(0.5),
            tyver: Some(1.0),
            ..Default::default()
        };
        ModelParams::resolve(&cfg).unwrap()
    }

    #[test]
    fn dense_propagator_inverts() {
        let pars = params(4, false);
        let kernel = KineticKernel::<f64>::new(&pars);
        let n = pars.num_sites();
        let id = DMatrix::<f64>::identity(n, n);
        let forward = kernel.lmult_hopping_exp(id.clone(), Band::X, -1);
        let back = kernel.lmult_hopping_exp(forward, Band::X, 1);
        assert!(max_abs_diff(&back, &id) < 1e-10);
    }

    #[test]
    fn checkerboard_factors_invert() {
        let pars = params(4, true);
        let kernel = KineticKernel::<f64>::new(&pars);
        let n = pars.num_sites();
        let id = DMatrix::<f64>::identity(n, n);
        let forward = kernel.lmult_hopping_exp(id.clone(), Band::Y, -1);
        let back = kernel.lmult_hopping_exp(forward, Band::Y, 1);
        assert!(max_abs_diff(&back, &id) < 1e-10);
    }

    #[test]
    fn checkerboard_left_and_right_multiplication_agree() {
        // E * I == I * E for the same break-up
        let pars = params(4, true);
        let kernel = KineticKernel::<f64>::new(&pars);
        let n = pars.num_sites();
        let id = DMatrix::<f64>::identity(n, n);
        let left = kernel.lmult_hopping_exp(id.clone(), Band::X, -1);
        let right = kernel.rmult_hopping_exp(id, Band::X, -1);
        assert!(max_abs_diff(&left, &right) < 1e-12);
    }

    #[test]
    fn checkerboard_approximates_dense_propagator() {
        // the symmetric break-up carries O(dtau^3) error per factor
        let pars = params(4, true);
        let kernel = KineticKernel::<f64>::new(&pars);
        let n = pars.num_sites();
        let id = DMatrix::<f64>::identity(n, n);
        let cb = kernel.lmult_hopping_exp(id, Band::X, -1);
        let dense = kernel.prop_k(Band::X).clone();
        assert!(max_abs_diff(&cb, &dense) < 1e-3);
    }

    #[test]
    fn propagator_of_zero_matrix_is_identity() {
        let k = DMatrix::<f64>::zeros(6, 6);
        let p = compute_propagator(0.3, &k);
        assert!(max_abs_diff(&p, &DMatrix::identity(6, 6)) < 1e-13);
    }
}
