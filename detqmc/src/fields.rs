//! Auxiliary field state: the continuous order-parameter field phi, the
//! discrete four-valued CDW field, and the cached hyperbolic terms both
//! enter the potential exponential through.

use nalgebra::SVector;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ModelParams;

/// Initial phi components are drawn uniformly from this range.
const PHI_LOW: f64 = -1.0;
const PHI_HIGH: f64 = 1.0;

/// eta(l) of the four-valued Hirsch decoupling; antisymmetric in l.
pub fn cdwl_eta(l: i32) -> f64 {
    let a = (3.0 + 6.0_f64.sqrt()) / 6.0;
    let b = (6.0 + 2.0 * 6.0_f64.sqrt()).sqrt() / 6.0;
    let magnitude = match l.abs() {
        1 => (a - b).sqrt(),
        2 => (a + b).sqrt(),
        _ => unreachable!("cdwl field out of range: {}", l),
    };
    (l.signum() as f64) * magnitude
}

/// gamma(l), the vertex weight of the four-valued decoupling.
pub fn cdwl_gamma(l: i32) -> f64 {
    match l.abs() {
        1 => 1.0 + 6.0_f64.sqrt() / 3.0,
        2 => 1.0 - 6.0_f64.sqrt() / 3.0,
        _ => unreachable!("cdwl field out of range: {}", l),
    }
}

/// Draw one of the four CDW values with equal weight.
pub fn draw_cdwl<R: Rng>(rng: &mut R) -> i32 {
    let r: f64 = rng.gen();
    if r <= 0.25 {
        2
    } else if r <= 0.5 {
        -2
    } else if r <= 0.75 {
        1
    } else {
        -1
    }
}

/// The mutable auxiliary field configuration.
///
/// Layout: slices k = 0..=m are allocated, slices 1..=m are used; the
/// slice at k = 0 is identified with k = m through the periodic time
/// chain. Sites are indexed as in [`lattice::SquareLattice`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig<const OPDIM: usize> {
    n: usize,
    m: usize,
    lambda_dtau: f64,
    sqrt_dtau_cdw_u: f64,
    has_cdw: bool,
    phi: Vec<f64>,
    cdwl: Vec<i32>,
    cosh_phi: Vec<f64>,
    sinh_phi: Vec<f64>,
    cosh_cdwl: Vec<f64>,
    sinh_cdwl: Vec<f64>,
}

pub type Phi<const OPDIM: usize> = SVector<f64, OPDIM>;

impl<const OPDIM: usize> FieldConfig<OPDIM> {
    pub fn new(pars: &ModelParams) -> Self {
        assert_eq!(pars.opdim, OPDIM);
        let n = pars.num_sites();
        let m = pars.m;
        let slices = m + 1;
        FieldConfig {
            n,
            m,
            lambda_dtau: pars.lambda * pars.dtau,
            sqrt_dtau_cdw_u: pars.dtau.sqrt() * pars.cdw_u,
            has_cdw: pars.cdw_u != 0.0,
            phi: vec![0.0; n * OPDIM * slices],
            cdwl: vec![1; n * slices],
            cosh_phi: vec![1.0; n * slices],
            sinh_phi: vec![0.0; n * slices],
            cosh_cdwl: vec![1.0; n * slices],
            sinh_cdwl: vec![0.0; n * slices],
        }
    }

    /// Fill slices 1..=m with random phi components and CDW values.
    pub fn init_random<R: Rng>(&mut self, rng: &mut R) {
        for k in 1..=self.m {
            for site in 0..self.n {
                let base = self.phi_index(site, 0, k);
                for dim in 0..OPDIM {
                    self.phi[base + dim] = rng.gen_range(PHI_LOW..PHI_HIGH);
                }
                let idx = self.site_index(site, k);
                self.cdwl[idx] = draw_cdwl(rng);
                self.update_cosh_sinh_terms(site, k);
            }
        }
    }

    /// Fill slices 1..=m with the constant configuration phi = e_0.
    pub fn init_constant(&mut self) {
        for k in 1..=self.m {
            for site in 0..self.n {
                let base = self.phi_index(site, 0, k);
                self.phi[base] = 1.0;
                for dim in 1..OPDIM {
                    self.phi[base + dim] = 0.0;
                }
                let idx = self.site_index(site, k);
                self.cdwl[idx] = 1;
                self.update_cosh_sinh_terms(site, k);
            }
        }
    }

    pub fn num_sites(&self) -> usize {
        self.n
    }

    pub fn num_slices(&self) -> usize {
        self.m
    }

    pub fn has_cdw(&self) -> bool {
        self.has_cdw
    }

    #[inline]
    fn phi_index(&self, site: usize, dim: usize, k: usize) -> usize {
        debug_assert!(site < self.n && dim < OPDIM && k <= self.m);
        (k * self.n + site) * OPDIM + dim
    }

    #[inline]
    fn site_index(&self, site: usize, k: usize) -> usize {
        debug_assert!(site < self.n && k <= self.m);
        k * self.n + site
    }

    #[inline]
    pub fn phi(&self, site: usize, k: usize) -> Phi<OPDIM> {
        let base = self.phi_index(site, 0, k);
        Phi::<OPDIM>::from_fn(|dim, _| self.phi[base + dim])
    }

    #[inline]
    pub fn phi_comp(&self, site: usize, dim: usize, k: usize) -> f64 {
        self.phi[self.phi_index(site, dim, k)]
    }

    pub fn set_phi(&mut self, site: usize, k: usize, phi: Phi<OPDIM>) {
        let base = self.phi_index(site, 0, k);
        for dim in 0..OPDIM {
            self.phi[base + dim] = phi[dim];
        }
    }

    /// Add a constant displacement to every component of every site and
    /// slice in 1..=m.
    pub fn shift_all(&mut self, delta: Phi<OPDIM>) {
        for k in 1..=self.m {
            for site in 0..self.n {
                let base = self.phi_index(site, 0, k);
                for dim in 0..OPDIM {
                    self.phi[base + dim] += delta[dim];
                }
            }
        }
    }

    #[inline]
    pub fn cdwl(&self, site: usize, k: usize) -> i32 {
        self.cdwl[self.site_index(site, k)]
    }

    pub fn set_cdwl(&mut self, site: usize, k: usize, l: i32) {
        debug_assert!(matches!(l, -2 | -1 | 1 | 2));
        let idx = self.site_index(site, k);
        self.cdwl[idx] = l;
    }

    #[inline]
    pub fn cosh_phi(&self, site: usize, k: usize) -> f64 {
        self.cosh_phi[self.site_index(site, k)]
    }

    #[inline]
    pub fn sinh_phi(&self, site: usize, k: usize) -> f64 {
        self.sinh_phi[self.site_index(site, k)]
    }

    #[inline]
    pub fn cosh_cdwl(&self, site: usize, k: usize) -> f64 {
        self.cosh_cdwl[self.site_index(site, k)]
    }

    #[inline]
    pub fn sinh_cdwl(&self, site: usize, k: usize) -> f64 {
        self.sinh_cdwl[self.site_index(site, k)]
    }

    /// cosh(lambda dtau |phi|) and sinh(lambda dtau |phi|)/|phi| for an
    /// arbitrary field vector (not necessarily the stored one).
    pub fn cosh_sinh_term_phi(&self, phi: Phi<OPDIM>) -> (f64, f64) {
        let norm = phi.norm();
        if norm == 0.0 {
            // sinh(x)/x -> 1 limit
            (1.0, self.lambda_dtau)
        } else {
            let arg = self.lambda_dtau * norm;
            (arg.cosh(), arg.sinh() / norm)
        }
    }

    /// cosh and sinh of sqrt(dtau) * cdwU * eta(l).
    pub fn cosh_sinh_term_cdwl(&self, l: i32) -> (f64, f64) {
        let arg = self.sqrt_dtau_cdw_u * cdwl_eta(l);
        (arg.cosh(), arg.sinh())
    }

    pub fn update_cosh_sinh_terms(&mut self, site: usize, k: usize) {
        self.update_cosh_sinh_terms_phi(site, k);
        if self.has_cdw {
            self.update_cosh_sinh_terms_cdwl(site, k);
        }
    }

    pub fn update_cosh_sinh_terms_phi(&mut self, site: usize, k: usize) {
        let (c, s) = self.cosh_sinh_term_phi(self.phi(site, k));
        let idx = self.site_index(site, k);
        self.cosh_phi[idx] = c;
        self.sinh_phi[idx] = s;
    }

    pub fn update_cosh_sinh_terms_cdwl(&mut self, site: usize, k: usize) {
        let (c, s) = self.cosh_sinh_term_cdwl(self.cdwl(site, k));
        let idx = self.site_index(site, k);
        self.cosh_cdwl[idx] = c;
        self.sinh_cdwl[idx] = s;
    }

    /// Refresh every phi cache entry (used after global moves).
    pub fn update_all_cosh_sinh_terms_phi(&mut self) {
        for k in 1..=self.m {
            for site in 0..self.n {
                self.update_cosh_sinh_terms_phi(site, k);
            }
        }
    }

    /// Refresh all cache entries from the current field values.
    pub fn update_all_cosh_sinh_terms(&mut self) {
        for k in 1..=self.m {
            for site in 0..self.n {
                self.update_cosh_sinh_terms(site, k);
            }
        }
    }

    /// Sum of |phi|^2 over sites and slices 1..=m.
    pub fn sum_phi_squared(&self) -> f64 {
        let mut total = 0.0;
        for k in 1..=self.m {
            for site in 0..self.n {
                total += self.phi(site, k).norm_squared();
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn test_params(opdim: usize) -> ModelParams {
        use crate::config::ModelConfig;
        let cfg = ModelConfig {
            l: Some(4),
            beta: Some(2.0),
            dtau: Some(0.1),
            s: Some(10),
            r: Some(1.0),
            opdim: Some(opdim),
            cdw_u: Some(0.5),
            ..Default::default()
        };
        ModelParams::resolve(&cfg).unwrap()
    }

    #[test]
    fn eta_is_antisymmetric_and_gamma_is_even() {
        for l in [1, 2] {
            assert_relative_eq!(cdwl_eta(l), -cdwl_eta(-l));
            assert_relative_eq!(cdwl_gamma(l), cdwl_gamma(-l));
        }
        assert!(cdwl_eta(2).abs() > cdwl_eta(1).abs());
        assert_relative_eq!(cdwl_gamma(1), 1.0 + 6.0_f64.sqrt() / 3.0);
        assert_relative_eq!(cdwl_gamma(2), 1.0 - 6.0_f64.sqrt() / 3.0);
    }

    #[test]
    fn caches_follow_field_values() {
        let pars = test_params(2);
        let mut field = FieldConfig::<2>::new(&pars);
        let mut rng = Pcg64::seed_from_u64(17);
        field.init_random(&mut rng);

        for k in 1..=field.num_slices() {
            for site in 0..field.num_sites() {
                let phi = field.phi(site, k);
                let arg = pars.lambda * pars.dtau * phi.norm();
                assert_relative_eq!(field.cosh_phi(site, k), arg.cosh(), epsilon = 1e-14);
                assert_relative_eq!(
                    field.sinh_phi(site, k),
                    arg.sinh() / phi.norm(),
                    epsilon = 1e-14
                );
                let l = field.cdwl(site, k);
                assert!(matches!(l, -2 | -1 | 1 | 2));
                let carg = pars.dtau.sqrt() * pars.cdw_u * cdwl_eta(l);
                assert_relative_eq!(field.cosh_cdwl(site, k), carg.cosh(), epsilon = 1e-14);
                assert_relative_eq!(field.sinh_cdwl(site, k), carg.sinh(), epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn constant_field_points_along_first_component() {
        let pars = test_params(3);
        let mut field = FieldConfig::<3>::new(&pars);
        field.init_constant();
        let phi = field.phi(3, 1);
        assert_relative_eq!(phi[0], 1.0);
        assert_relative_eq!(phi[1], 0.0);
        assert_relative_eq!(phi[2], 0.0);
    }

    #[test]
    fn global_shift_moves_every_slice() {
        let pars = test_params(2);
        let mut field = FieldConfig::<2>::new(&pars);
        field.init_constant();
        let before = field.phi(0, 3);
        field.shift_all(Phi::<2>::new(0.25, -0.5));
        let after = field.phi(0, 3);
        assert_relative_eq!(after[0] - before[0], 0.25);
        assert_relative_eq!(after[1] - before[1], -0.5);
    }
}
