//! The bosonic action of the order-parameter field and its closed-form
//! change under a single-site proposal.

use lattice::{Dir, SquareLattice, TimeChain};

use crate::config::ModelParams;
use crate::fields::{FieldConfig, Phi};

/// Full phi^4 action over all sites and slices. Reference
/// implementation used by global moves and tests; local updates go
/// through [`delta_s_phi`].
pub fn phi_action<const OPDIM: usize>(
    pars: &ModelParams,
    field: &FieldConfig<OPDIM>,
    lat: &SquareLattice,
    chain: &TimeChain,
) -> f64 {
    let dtau = pars.dtau;
    let c = pars.c;
    let mut action = 0.0;
    for k in 1..=pars.m {
        for site in 0..pars.num_sites() {
            let phi = field.phi(site, k);
            if !pars.phi2bosons {
                let time_derivative = (phi - field.phi(site, chain.prev(k))) / dtau;
                action += (dtau / (2.0 * c * c)) * time_derivative.norm_squared();

                // count only bonds in the plus directions so that no
                // bond enters twice
                let xdiff = phi - field.phi(lat.neigh(Dir::XPlus, site), k);
                action += 0.5 * dtau * xdiff.norm_squared();
                let ydiff = phi - field.phi(lat.neigh(Dir::YPlus, site), k);
                action += 0.5 * dtau * ydiff.norm_squared();
            }

            let phisq = phi.norm_squared();
            action += 0.5 * dtau * pars.r * phisq;
            if !pars.phi2bosons {
                action += 0.25 * dtau * pars.u * phisq * phisq;
            }
        }
    }
    action
}

/// Change of the bosonic action when `phi(site, k)` is replaced by
/// `new_phi`, touching only the time and space neighbors of that single
/// entry.
pub fn delta_s_phi<const OPDIM: usize>(
    pars: &ModelParams,
    field: &FieldConfig<OPDIM>,
    lat: &SquareLattice,
    chain: &TimeChain,
    site: usize,
    k: usize,
    new_phi: Phi<OPDIM>,
) -> f64 {
    let dtau = pars.dtau;
    let old_phi = field.phi(site, k);
    let phi_diff = new_phi - old_phi;
    let old_sq = old_phi.norm_squared();
    let new_sq = new_phi.norm_squared();
    let sq_diff = new_sq - old_sq;

    if pars.phi2bosons {
        return dtau * 0.5 * pars.r * sq_diff;
    }

    let pow4_diff = new_sq * new_sq - old_sq * old_sq;

    let phi_earlier = field.phi(site, chain.prev(k));
    let phi_later = field.phi(site, chain.next(k));
    let phi_time_neigh = phi_later + phi_earlier;

    let mut phi_space_neigh = Phi::<OPDIM>::zeros();
    for neigh in lat.neighbors(site) {
        phi_space_neigh += field.phi(neigh, k);
    }

    let c = pars.c;
    let z = (2 * pars.d) as f64;
    let delta1 = (1.0 / (c * c * dtau)) * (sq_diff - phi_time_neigh.dot(&phi_diff));
    let delta2 = 0.5 * dtau * (z * sq_diff - 2.0 * phi_space_neigh.dot(&phi_diff));
    let delta3 = dtau * (0.5 * pars.r * sq_diff + 0.25 * pars.u * pow4_diff);

    delta1 + delta2 + delta3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn setup(phi2bosons: bool) -> (ModelParams, FieldConfig<2>, SquareLattice, TimeChain) {
        let cfg = ModelConfig {
            l: Some(4),
            beta: Some(1.0),
            dtau: Some(0.1),
            s: Some(5),
            r: Some(0.7),
            u: Some(0.9),
            c: Some(1.3),
            opdim: Some(2),
            phi2bosons: Some(phi2bosons),
            ..Default::default()
        };
        let pars = ModelParams::resolve(&cfg).unwrap();
        let mut field = FieldConfig::<2>::new(&pars);
        let mut rng = Pcg64::seed_from_u64(23);
        field.init_random(&mut rng);
        let lat = SquareLattice::new(pars.l);
        let chain = TimeChain::new(pars.m);
        (pars, field, lat, chain)
    }

    #[test]
    fn closed_form_delta_matches_action_difference() {
        let (pars, mut field, lat, chain) = setup(false);
        let mut rng = Pcg64::seed_from_u64(42);
        for _ in 0..20 {
            let site = rng.gen_range(0..pars.num_sites());
            let k = rng.gen_range(1..=pars.m);
            let new_phi = Phi::<2>::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));

            let before = phi_action(&pars, &field, &lat, &chain);
            let delta = delta_s_phi(&pars, &field, &lat, &chain, site, k, new_phi);
            field.set_phi(site, k, new_phi);
            field.update_cosh_sinh_terms_phi(site, k);
            let after = phi_action(&pars, &field, &lat, &chain);

            assert_relative_eq!(after - before, delta, epsilon = 1e-9, max_relative = 1e-7);
        }
    }

    #[test]
    fn mass_only_action_ignores_gradients() {
        let (pars, mut field, lat, chain) = setup(true);
        let site = 3;
        let k = 2;
        let new_phi = Phi::<2>::new(0.4, -0.1);
        let before = phi_action(&pars, &field, &lat, &chain);
        let delta = delta_s_phi(&pars, &field, &lat, &chain, site, k, new_phi);
        let old_sq = field.phi(site, k).norm_squared();
        assert_relative_eq!(
            delta,
            pars.dtau * 0.5 * pars.r * (new_phi.norm_squared() - old_sq),
            epsilon = 1e-12
        );
        field.set_phi(site, k, new_phi);
        let after = phi_action(&pars, &field, &lat, &chain);
        assert_relative_eq!(after - before, delta, epsilon = 1e-9);
    }
}
