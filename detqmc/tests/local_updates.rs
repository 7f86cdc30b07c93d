//! Local update identities: the cheap per-site determinant ratio must
//! agree with full from-scratch determinants, and the three Green
//! update strategies must produce the same chain.

use detqmc::bmat::BmatContext;
use detqmc::config::{ModelConfig, ModelParams, UpdateMethod};
use detqmc::fields::{FieldConfig, Phi};
use detqmc::hopping::KineticKernel;
use detqmc::replica::Replica;
use detqmc::scalar::max_abs_diff;
use nalgebra::DMatrix;
use num_complex::Complex64;
use rand::SeedableRng;
use rand_pcg::Pcg64;

fn small_params(update_method: UpdateMethod, delay_steps: usize) -> ModelParams {
    ModelParams::resolve(&ModelConfig {
        l: Some(4),
        m: Some(8),
        dtau: Some(0.1),
        s: Some(4),
        r: Some(1.0),
        u: Some(1.0),
        lambda: Some(1.0),
        opdim: Some(3),
        update_method: Some(update_method),
        delay_steps: Some(delay_steps),
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn local_determinant_ratio_matches_full_determinants() {
    let pars = small_params(UpdateMethod::Woodbury, 0);
    let kernel = KineticKernel::<Complex64>::new(&pars);
    let mut field = FieldConfig::<3>::new(&pars);
    let mut rng = Pcg64::seed_from_u64(815);
    field.init_random(&mut rng);

    let n = pars.num_sites();
    let msf = pars.matrix_size_factor();
    let size = msf * n;
    let k = 3;
    let site = 7;
    let new_phi = Phi::<3>::new(0.25, -0.6, 0.4);

    let (det_m, weight_old) = {
        let ctx = BmatContext::new(&pars, &kernel, &field);

        // G(k) and the local update matrix M
        let mut product = ctx.bmat_dense(k, 0);
        product *= ctx.bmat_dense(pars.m, k);
        let g = (DMatrix::<Complex64>::identity(size, size) + &product)
            .try_inverse()
            .unwrap();

        let delta = ctx.delta_for_site(new_phi, field.cdwl(site, k), k, site);
        let mut g_sub = DMatrix::<Complex64>::zeros(msf, msf);
        for a in 0..msf {
            for b in 0..msf {
                g_sub[(a, b)] = g[(site + a * n, site + b * n)];
            }
        }
        let m = DMatrix::<Complex64>::identity(msf, msf)
            + (DMatrix::<Complex64>::identity(msf, msf) - g_sub) * delta;

        let weight_old =
            (DMatrix::<Complex64>::identity(size, size) + product).determinant();
        (m.determinant(), weight_old)
    };

    // fresh weight with the changed field
    field.set_phi(site, k, new_phi);
    field.update_cosh_sinh_terms(site, k);
    let ctx = BmatContext::new(&pars, &kernel, &field);
    let mut product = ctx.bmat_dense(k, 0);
    product *= ctx.bmat_dense(pars.m, k);
    let weight_new = (DMatrix::<Complex64>::identity(size, size) + product).determinant();

    let ratio = weight_new / weight_old;
    assert!(
        (ratio - det_m).norm() / det_m.norm() < 1e-8,
        "det M = {}, from-scratch ratio = {}",
        det_m,
        ratio
    );
}

#[test]
fn delayed_updates_match_woodbury() {
    let mut woodbury =
        Replica::<Complex64, 3>::new(small_params(UpdateMethod::Woodbury, 0), 5555).unwrap();
    let mut delayed =
        Replica::<Complex64, 3>::new(small_params(UpdateMethod::Delayed, 4), 5555).unwrap();

    woodbury.sweep(false).unwrap();
    delayed.sweep(false).unwrap();

    // identical seeds drive identical proposals; only the Green update
    // arithmetic differs
    assert!(max_abs_diff(&woodbury.g, &delayed.g) < 1e-8);
    for k in 1..=woodbury.pars.m {
        for site in 0..woodbury.pars.num_sites() {
            assert_eq!(woodbury.field.phi(site, k), delayed.field.phi(site, k));
        }
    }
}

#[test]
fn iterative_updates_match_woodbury() {
    let mut woodbury =
        Replica::<Complex64, 3>::new(small_params(UpdateMethod::Woodbury, 0), 303).unwrap();
    let mut iterative =
        Replica::<Complex64, 3>::new(small_params(UpdateMethod::Iterative, 0), 303).unwrap();

    woodbury.sweep(false).unwrap();
    iterative.sweep(false).unwrap();

    assert!(max_abs_diff(&woodbury.g, &iterative.g) < 1e-8);
}

#[test]
fn box_updates_move_the_field() {
    let mut replica =
        Replica::<Complex64, 3>::new(small_params(UpdateMethod::Woodbury, 0), 101).unwrap();
    let before: Vec<Phi<3>> = (0..replica.pars.num_sites())
        .map(|site| replica.field.phi(site, 1))
        .collect();
    replica.sweep(false).unwrap();
    replica.sweep(false).unwrap();
    let moved = (0..replica.pars.num_sites())
        .any(|site| (replica.field.phi(site, 1) - before[site]).norm() > 0.0);
    assert!(moved, "two sweeps accepted no local update");
}
