//! Global move properties: bosonic invariance of the Wolff flip and the
//! over-relaxation reflection, and Green consistency when global moves
//! are interleaved with stabilized sweeps.

use detqmc::action::phi_action;
use detqmc::config::{ModelConfig, ModelParams};
use detqmc::replica::Replica;
use detqmc::scalar::max_abs_diff;
use num_complex::Complex64;

fn bosonic_params() -> ModelParams {
    ModelParams::resolve(&ModelConfig {
        l: Some(4),
        m: Some(10),
        dtau: Some(0.1),
        s: Some(5),
        r: Some(0.5),
        u: Some(1.0),
        c: Some(1.0),
        opdim: Some(3),
        turnoff_fermions: Some(true),
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn wolff_flip_preserves_the_bosonic_action() {
    let mut replica = Replica::<Complex64, 3>::new(bosonic_params(), 2718).unwrap();
    for _ in 0..10 {
        let before = phi_action(&replica.pars, &replica.field, &replica.lat, &replica.chain);
        let size = replica.build_and_flip_cluster(false);
        let after = phi_action(&replica.pars, &replica.field, &replica.lat, &replica.chain);
        assert!(size >= 1);
        assert!(
            (before - after).abs() < 1e-10,
            "cluster flip changed the action by {}",
            after - before
        );
    }
}

#[test]
fn over_relaxation_preserves_the_bosonic_action() {
    let mut replica = Replica::<Complex64, 3>::new(bosonic_params(), 161).unwrap();
    let before = phi_action(&replica.pars, &replica.field, &replica.lat, &replica.chain);
    replica.over_relaxation_sweep();
    let after = phi_action(&replica.pars, &replica.field, &replica.lat, &replica.chain);
    assert!((before - after).abs() < 1e-9);
}

#[test]
fn cluster_sizes_are_bounded_by_the_space_time_volume() {
    let mut replica = Replica::<Complex64, 3>::new(bosonic_params(), 99).unwrap();
    let volume = replica.pars.num_sites() * replica.pars.m;
    for _ in 0..20 {
        let size = replica.build_and_flip_cluster(false);
        assert!(size >= 1 && size <= volume);
    }
}

#[test]
fn global_moves_keep_green_consistent() {
    let pars = ModelParams::resolve(&ModelConfig {
        l: Some(4),
        m: Some(8),
        dtau: Some(0.1),
        s: Some(4),
        r: Some(1.0),
        opdim: Some(2),
        global_shift: Some(true),
        wolff_cluster_update: Some(true),
        global_update_interval: Some(1),
        ..Default::default()
    })
    .unwrap();
    let mut replica = Replica::<Complex64, 2>::new(pars, 424242).unwrap();

    let mut attempted_any = false;
    for _ in 0..6 {
        replica.sweep(false).unwrap();
        let reference = replica
            .green_from_scratch(replica.current_timeslice)
            .unwrap();
        assert!(
            max_abs_diff(&replica.g, &reference) < 1e-7,
            "G inconsistent after sweep with global moves"
        );
        attempted_any = attempted_any
            || replica.stats.attempted_global_shifts > 0
            || replica.stats.attempted_wolff_cluster_updates > 0;
    }
    assert!(attempted_any, "no global move was ever attempted");
}

#[test]
fn wolff_only_changes_the_field_through_accepted_moves() {
    // with fermions on, a rejected cluster must restore phi exactly
    let pars = ModelParams::resolve(&ModelConfig {
        l: Some(2),
        m: Some(4),
        dtau: Some(0.1),
        s: Some(2),
        r: Some(1.0),
        opdim: Some(2),
        wolff_cluster_update: Some(true),
        global_update_interval: Some(1),
        ..Default::default()
    })
    .unwrap();
    let mut replica = Replica::<Complex64, 2>::new(pars, 7).unwrap();
    for _ in 0..20 {
        replica.sweep(false).unwrap();
        // consistency between field and Green survives accept as well
        // as reject paths
        let reference = replica
            .green_from_scratch(replica.current_timeslice)
            .unwrap();
        assert!(max_abs_diff(&replica.g, &reference) < 1e-7);
    }
    assert!(replica.stats.attempted_wolff_cluster_updates > 0);
}
