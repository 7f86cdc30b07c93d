//! Detailed-balance smoke test: with the mass-only bosonic action and
//! fermions off, every field component is an independent Gaussian with
//! variance 1/(dtau r). The sampled second moment has to converge to
//! it.

use detqmc::config::{ModelConfig, ModelParams};
use detqmc::replica::Replica;

#[test]
fn box_updates_sample_the_gaussian_distribution() {
    let dtau = 0.5;
    let r = 2.0;
    let pars = ModelParams::resolve(&ModelConfig {
        l: Some(2),
        m: Some(4),
        dtau: Some(dtau),
        s: Some(2),
        r: Some(r),
        opdim: Some(1),
        turnoff_fermions: Some(true),
        phi2bosons: Some(true),
        ..Default::default()
    })
    .unwrap();
    let mut replica = Replica::<f64, 1>::new(pars, 20240817).unwrap();

    // equilibrate
    for _ in 0..500 {
        replica.sweep(false).unwrap();
    }

    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for _ in 0..4000 {
        replica.sweep(false).unwrap();
        for k in 1..=replica.pars.m {
            for site in 0..replica.pars.num_sites() {
                sum_sq += replica.field.phi(site, k).norm_squared();
                count += 1;
            }
        }
    }

    let sampled_variance = sum_sq / count as f64;
    let expected_variance = 1.0 / (dtau * r);
    let relative_error = (sampled_variance - expected_variance).abs() / expected_variance;
    assert!(
        relative_error < 0.1,
        "sampled variance {} vs expected {}",
        sampled_variance,
        expected_variance
    );
}

#[test]
fn mean_field_is_symmetric_around_zero() {
    let pars = ModelParams::resolve(&ModelConfig {
        l: Some(2),
        m: Some(4),
        dtau: Some(0.5),
        s: Some(2),
        r: Some(2.0),
        opdim: Some(1),
        turnoff_fermions: Some(true),
        phi2bosons: Some(true),
        ..Default::default()
    })
    .unwrap();
    let mut replica = Replica::<f64, 1>::new(pars, 4242).unwrap();

    for _ in 0..500 {
        replica.sweep(false).unwrap();
    }
    let mut sum = 0.0;
    let mut count = 0usize;
    for _ in 0..4000 {
        replica.sweep(false).unwrap();
        for k in 1..=replica.pars.m {
            for site in 0..replica.pars.num_sites() {
                sum += replica.field.phi_comp(site, 0, k);
                count += 1;
            }
        }
    }
    let mean = sum / count as f64;
    // zero within a generous statistical band
    assert!(mean.abs() < 0.1, "sampled mean {}", mean);
}
