//! Observables computed from the equal-time Green's function and the
//! bosonic field during measurement sweeps.
//!
//! `measure` adds the contribution of one timeslice to the
//! accumulators; `finish_measurements` normalizes by the number of
//! included slices. The Green's function is symmetrized by half-step
//! hopping factors from both sides before fermionic observables are
//! read off.

use itertools::iproduct;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use std::f64::consts::PI;

use crate::config::ModelParams;
use crate::fields::Phi;
use crate::hopping::Band;
use crate::replica::Replica;
use crate::scalar::{block, set_block, GreenScalar};

/// Accumulators and published per-sweep averages.
#[derive(Debug, Clone)]
pub struct Observables<const OPDIM: usize> {
    slices_included: usize,
    mean_phi_acc: Phi<OPDIM>,
    associated_energy_acc: f64,
    green_k0_acc: f64,
    green_local_acc: f64,
    k_occ_x_acc: DVector<f64>,
    k_occ_y_acc: DVector<f64>,

    /// Mean field vector over sites and slices.
    pub mean_phi: Phi<OPDIM>,
    /// |mean phi|.
    pub norm_mean_phi: f64,
    /// Sum of |phi|^2 per site and slice, halved.
    pub associated_energy: f64,
    /// k = 0 component of the Green's function.
    pub green_k0: f64,
    /// Tr G / (4 N), both spin sectors included.
    pub green_local: f64,
    /// Momentum-space occupation per band.
    pub k_occ_x: DVector<f64>,
    pub k_occ_y: DVector<f64>,
    /// Whether a finished measurement pass has been published.
    pub valid: bool,
}

impl<const OPDIM: usize> Observables<OPDIM> {
    pub fn new(pars: &ModelParams) -> Self {
        let n = pars.num_sites();
        Observables {
            slices_included: 0,
            mean_phi_acc: Phi::<OPDIM>::zeros(),
            associated_energy_acc: 0.0,
            green_k0_acc: 0.0,
            green_local_acc: 0.0,
            k_occ_x_acc: DVector::zeros(n),
            k_occ_y_acc: DVector::zeros(n),
            mean_phi: Phi::<OPDIM>::zeros(),
            norm_mean_phi: 0.0,
            associated_energy: 0.0,
            green_k0: 0.0,
            green_local: 0.0,
            k_occ_x: DVector::zeros(n),
            k_occ_y: DVector::zeros(n),
            valid: false,
        }
    }

    fn reset(&mut self, n: usize) {
        self.slices_included = 0;
        self.mean_phi_acc = Phi::<OPDIM>::zeros();
        self.associated_energy_acc = 0.0;
        self.green_k0_acc = 0.0;
        self.green_local_acc = 0.0;
        self.k_occ_x_acc = DVector::zeros(n);
        self.k_occ_y_acc = DVector::zeros(n);
        self.valid = false;
    }
}

impl<S: GreenScalar, const OPDIM: usize> Replica<S, OPDIM> {
    pub fn init_measurements(&mut self) {
        let n = self.pars.num_sites();
        self.obs.reset(n);
    }

    pub fn measure(&mut self, timeslice: usize) {
        let n = self.pars.num_sites();
        self.obs.slices_included += 1;

        for site in 0..n {
            let phi = self.field.phi(site, timeslice);
            self.obs.mean_phi_acc += phi;
            self.obs.associated_energy_acc += phi.norm_squared();
        }

        if self.pars.turnoff_fermions {
            return;
        }

        let gshifted = self.shift_green_symmetric();
        let msf = self.pars.matrix_size_factor();

        // k = 0 sector and local Green's function; for one or two
        // order-parameter components the conjugate block doubles the
        // real part
        let sum: Complex64 = gshifted
            .iter()
            .map(|&z| Complex64::new(z.real(), z.imaginary()))
            .sum();
        let trace: Complex64 = (0..gshifted.nrows())
            .map(|i| {
                let z = gshifted[(i, i)];
                Complex64::new(z.real(), z.imaginary())
            })
            .sum();
        if msf == 4 {
            self.obs.green_k0_acc += sum.re;
            self.obs.green_local_acc += trace.re / (4.0 * n as f64);
        } else {
            self.obs.green_k0_acc += 2.0 * sum.re;
            self.obs.green_local_acc += 2.0 * trace.re / (4.0 * n as f64);
        }

        // momentum-space occupation; anti-periodic boundaries offset
        // the allowed k-components by half a step
        let l = self.pars.l;
        let offset_x = if self.pars.bc.flips_x() { 0.5 } else { 0.0 };
        let offset_y = if self.pars.bc.flips_y() { 0.5 } else { 0.0 };

        let sector = |rb: usize, cb: usize, i: usize, j: usize| -> Complex64 {
            let z = gshifted[(i + rb * n, j + cb * n)];
            Complex64::new(z.real(), z.imaginary())
        };

        for ksite in 0..n {
            let kx = -PI + (((ksite % l) as f64) + offset_x) * 2.0 * PI / l as f64;
            let ky = -PI + (((ksite / l) as f64) + offset_y) * 2.0 * PI / l as f64;
            let mut occ_x = 0.0;
            let mut occ_y = 0.0;
            for (i, j) in iproduct!(0..n, 0..n) {
                let (ix, iy) = ((i % l) as f64, (i / l) as f64);
                let (jx, jy) = ((j % l) as f64, (j / l) as f64);
                let arg = kx * (ix - jx) + ky * (iy - jy);
                let phase = Complex64::new(0.0, arg).exp();

                let (x_up, x_down, y_up, y_down) = if msf == 4 {
                    (
                        sector(0, 0, i, j),
                        sector(2, 2, i, j),
                        sector(3, 3, i, j),
                        sector(1, 1, i, j),
                    )
                } else {
                    // the lower sectors are the complex conjugates of
                    // the upper ones
                    (
                        sector(0, 0, i, j),
                        sector(0, 0, i, j).conj(),
                        sector(1, 1, i, j).conj(),
                        sector(1, 1, i, j),
                    )
                };
                occ_x += (phase * (x_up + x_down)).re;
                occ_y += (phase * (y_up + y_down)).re;
            }
            self.obs.k_occ_x_acc[ksite] += occ_x;
            self.obs.k_occ_y_acc[ksite] += occ_y;
        }
    }

    pub fn finish_measurements(&mut self) {
        let n = self.pars.num_sites() as f64;
        let slices = self.obs.slices_included as f64;
        debug_assert!(self.obs.slices_included > 0);

        self.obs.mean_phi = self.obs.mean_phi_acc / (n * slices);
        self.obs.norm_mean_phi = self.obs.mean_phi.norm();
        self.obs.associated_energy = self.obs.associated_energy_acc / (2.0 * n * slices);

        if !self.pars.turnoff_fermions {
            self.obs.green_k0 = self.obs.green_k0_acc / slices;
            self.obs.green_local = self.obs.green_local_acc / slices;
            for ksite in 0..self.pars.num_sites() {
                // 2 and not 1: both spin projections contribute
                self.obs.k_occ_x[ksite] = 2.0 - self.obs.k_occ_x_acc[ksite] / (slices * n);
                self.obs.k_occ_y[ksite] = 2.0 - self.obs.k_occ_y_acc[ksite] / (slices * n);
            }
        }
        self.obs.valid = true;
    }

    /// `e^{-dtau/2 K} G e^{+dtau/2 K}`: symmetrize the Green's function
    /// so observables see the time-symmetric Trotter splitting. The
    /// chemical-potential factors from the two sides cancel.
    pub fn shift_green_symmetric(&self) -> DMatrix<S> {
        let n = self.pars.num_sites();
        let msf = self.pars.matrix_size_factor();
        let band_of = |b: usize| if b % 2 == 0 { Band::X } else { Band::Y };

        let mut temp = DMatrix::from_element(msf * n, msf * n, S::from_real(0.0));
        for row in 0..msf {
            for col in 0..msf {
                let shifted = self.kernel.rmult_hopping_exp_half_inv(
                    block(&self.g, row, col, n).clone_owned(),
                    band_of(col),
                );
                set_block(&mut temp, row, col, n, &shifted);
            }
        }
        let mut out = DMatrix::from_element(msf * n, msf * n, S::from_real(0.0));
        for row in 0..msf {
            for col in 0..msf {
                let shifted = self
                    .kernel
                    .lmult_hopping_exp_half(block(&temp, row, col, n).clone_owned(), band_of(row));
                set_block(&mut out, row, col, n, &shifted);
            }
        }
        out
    }
}
