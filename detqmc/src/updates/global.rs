//! Global Monte Carlo moves touching every site and slice at once: a
//! uniform field shift, the Wolff single-cluster flip on the space-time
//! graph, their combination, and the purely bosonic over-relaxation
//! sweep.
//!
//! The fermion weight of a global move cannot use the local
//! Sherman-Morrison shortcut; the UdV chain is rebuilt and the weight
//! ratio is evaluated from the singular values of G^{-1}. The singular
//! values are sorted, so comparing them term by term in the log domain
//! never mixes very large with very small scales.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::action::phi_action;
use crate::error::Result;
use crate::fields::{FieldConfig, Phi};
use crate::replica::Replica;
use crate::scalar::GreenScalar;
use crate::udv::Udv;
use crate::updates::random_direction;

/// Snapshot taken before a global move, restored on rejection.
pub(crate) struct GlobalMoveBackup<S: GreenScalar, const OPDIM: usize> {
    field: FieldConfig<OPDIM>,
    g: DMatrix<S>,
    g_inv_sv: DVector<f64>,
    storage: Vec<Udv<S>>,
}

impl<S: GreenScalar, const OPDIM: usize> Replica<S, OPDIM> {
    /// Run the enabled global moves. Called after each completed up
    /// sweep, when the UdV storage is in its freshly rebuilt up-form.
    pub(crate) fn global_move(&mut self) -> Result<()> {
        if !self.pars.phi_fixed
            && self.performed_sweeps % self.pars.global_update_interval as u64 == 0
        {
            if self.pars.global_shift {
                self.attempt_global_shift_move()?;
            }
            if self.pars.wolff_cluster_update {
                self.attempt_wolff_cluster_update()?;
            }
            if self.pars.wolff_cluster_shift_update {
                self.attempt_wolff_cluster_shift_update()?;
            }
        }
        if self.pars.turnoff_fermions && self.pars.over_relaxation {
            for _ in 0..self.pars.repeat_over_relaxation {
                self.over_relaxation_sweep();
            }
        }
        Ok(())
    }

    fn store_backups(&mut self) {
        self.backup = Some(GlobalMoveBackup {
            field: self.field.clone(),
            g: self.g.clone(),
            g_inv_sv: self.g_inv_sv.clone(),
            storage: self.storage.clone(),
        });
    }

    fn restore_backups(&mut self) {
        if let Some(backup) = self.backup.take() {
            self.field = backup.field;
            self.g = backup.g;
            self.g_inv_sv = backup.g_inv_sv;
            self.storage = backup.storage;
        }
    }

    /// exp(sum_j log d_new[j] - log d_old[j]) with the |..|^2 doubling
    /// of the conjugate block for one- and two-component order
    /// parameters.
    fn fermion_weight_ratio(&self, old_sv: &DVector<f64>) -> f64 {
        let mut log_prob = 0.0;
        for j in 0..self.g_inv_sv.len() {
            log_prob += self.g_inv_sv[j].ln() - old_sv[j].ln();
        }
        let prob = log_prob.exp();
        if self.pars.opdim < 3 {
            prob * prob
        } else {
            prob
        }
    }

    fn attempt_wolff_cluster_update(&mut self) -> Result<()> {
        if !self.pars.turnoff_fermions {
            debug_assert_eq!(self.current_timeslice, self.pars.m);
        }
        self.store_backups();
        let old_sv = self.g_inv_sv.clone();

        let mut cluster_sizes = Vec::new();
        for _ in 0..self.pars.repeat_wolff_per_sweep {
            cluster_sizes.push(self.build_and_flip_cluster(true));
        }

        // the bosonic action is invariant under the flip; only the
        // fermion determinant decides
        let mut prob_fermion = 1.0;
        if !self.pars.turnoff_fermions {
            self.setup_udv_storage_and_calculate_green()?;
            prob_fermion = self.fermion_weight_ratio(&old_sv);
        }

        self.stats.attempted_wolff_cluster_updates += 1;
        if prob_fermion >= 1.0 || self.rng.gen::<f64>() < prob_fermion {
            self.stats.accepted_wolff_cluster_updates += 1;
            for size in cluster_sizes {
                self.stats.added_wolff_cluster_size += size as f64;
            }
            self.backup = None;
        } else {
            self.restore_backups();
        }
        Ok(())
    }

    fn attempt_global_shift_move(&mut self) -> Result<()> {
        if !self.pars.turnoff_fermions {
            debug_assert_eq!(self.current_timeslice, self.pars.m);
        }
        let old_scalar_action = phi_action(&self.pars, &self.field, &self.lat, &self.chain);
        self.store_backups();
        let old_sv = self.g_inv_sv.clone();

        self.add_global_random_displacement();

        let mut prob_fermion = 1.0;
        if !self.pars.turnoff_fermions {
            self.field.update_all_cosh_sinh_terms_phi();
            self.setup_udv_storage_and_calculate_green()?;
            prob_fermion = self.fermion_weight_ratio(&old_sv);
        }

        let new_scalar_action = phi_action(&self.pars, &self.field, &self.lat, &self.chain);
        let prob_scalar = (-(new_scalar_action - old_scalar_action)).exp();
        let prob = prob_scalar * prob_fermion;

        self.stats.attempted_global_shifts += 1;
        if prob >= 1.0 || self.rng.gen::<f64>() < prob {
            self.stats.accepted_global_shifts += 1;
            self.backup = None;
        } else {
            self.restore_backups();
        }
        Ok(())
    }

    fn attempt_wolff_cluster_shift_update(&mut self) -> Result<()> {
        if !self.pars.turnoff_fermions {
            debug_assert_eq!(self.current_timeslice, self.pars.m);
            // a rejection must undo the cluster flips as well
            self.store_backups();
        }
        let old_sv = self.g_inv_sv.clone();

        let mut cluster_sizes = Vec::new();
        for _ in 0..self.pars.repeat_wolff_per_sweep {
            // cosh/sinh terms are refreshed once after the shift below
            cluster_sizes.push(self.build_and_flip_cluster(false));
        }

        if self.pars.turnoff_fermions {
            // purely bosonic: the cluster part is rejection-free, only
            // the shift can be undone
            self.store_backups();
        }

        let old_scalar_action = phi_action(&self.pars, &self.field, &self.lat, &self.chain);
        self.add_global_random_displacement();
        let new_scalar_action = phi_action(&self.pars, &self.field, &self.lat, &self.chain);
        let prob_scalar = (-(new_scalar_action - old_scalar_action)).exp();

        let mut prob_fermion = 1.0;
        if !self.pars.turnoff_fermions {
            self.field.update_all_cosh_sinh_terms_phi();
            self.setup_udv_storage_and_calculate_green()?;
            prob_fermion = self.fermion_weight_ratio(&old_sv);
        }

        let prob = prob_scalar * prob_fermion;

        self.stats.attempted_wolff_cluster_shift_updates += 1;
        if prob >= 1.0 || self.rng.gen::<f64>() < prob {
            self.stats.accepted_wolff_cluster_shift_updates += 1;
            for size in cluster_sizes {
                self.stats.added_wolff_cluster_size += size as f64;
            }
            self.backup = None;
        } else {
            self.restore_backups();
        }
        Ok(())
    }

    /// Shift every field component by a constant drawn uniformly from
    /// the box proposal window.
    fn add_global_random_displacement(&mut self) {
        let mut delta = Phi::<OPDIM>::zeros();
        for dim in 0..OPDIM {
            delta[dim] = self.rng.gen_range(-self.ad.phi_delta..self.ad.phi_delta);
        }
        self.field.shift_all(delta);
    }

    /// Grow a Wolff cluster from a random space-time seed and reflect
    /// every visited spin about the plane orthogonal to a random
    /// direction. Returns the cluster size.
    pub fn build_and_flip_cluster(&mut self, update_cosh_sinh: bool) -> usize {
        let n = self.pars.num_sites();
        let m = self.pars.m;
        let dtau = self.pars.dtau;
        let dir = random_direction::<OPDIM, _>(&mut self.rng);

        let projected = |field: &FieldConfig<OPDIM>, site: usize, k: usize| -> f64 {
            field.phi(site, k).dot(&dir)
        };

        // visited flags for (site, slice), slices 1..=m
        let mut visited = vec![false; n * (m + 1)];
        let mut pending: Vec<(usize, usize)> = Vec::new();

        let seed_k = self.rng.gen_range(1..=m);
        let seed_site = self.rng.gen_range(0..n);
        let flipped =
            self.field.phi(seed_site, seed_k) - dir * (2.0 * projected(&self.field, seed_site, seed_k));
        self.field.set_phi(seed_site, seed_k, flipped);
        if update_cosh_sinh {
            self.field.update_cosh_sinh_terms_phi(seed_site, seed_k);
        }
        visited[seed_k * n + seed_site] = true;
        pending.push((seed_site, seed_k));
        let mut cluster_size = 1;

        while let Some((site, k)) = pending.pop() {
            // newly added sites are already flipped, so a bond to an
            // unvisited neighbor activates on a negative argument
            let proj_here = projected(&self.field, site, k);

            for neigh in self.lat.neighbors(site).collect::<Vec<_>>() {
                if visited[k * n + neigh] {
                    continue;
                }
                let bond_arg = 2.0 * dtau * proj_here * projected(&self.field, neigh, k);
                if bond_arg < 0.0 && self.rng.gen::<f64>() <= 1.0 - bond_arg.exp() {
                    let flipped = self.field.phi(neigh, k)
                        - dir * (2.0 * projected(&self.field, neigh, k));
                    self.field.set_phi(neigh, k, flipped);
                    if update_cosh_sinh {
                        self.field.update_cosh_sinh_terms_phi(neigh, k);
                    }
                    visited[k * n + neigh] = true;
                    pending.push((neigh, k));
                    cluster_size += 1;
                }
            }

            for neigh_k in [self.chain.next(k), self.chain.prev(k)] {
                if visited[neigh_k * n + site] {
                    continue;
                }
                let bond_arg = (2.0 / dtau) * proj_here * projected(&self.field, site, neigh_k);
                if bond_arg < 0.0 && self.rng.gen::<f64>() <= 1.0 - bond_arg.exp() {
                    let flipped = self.field.phi(site, neigh_k)
                        - dir * (2.0 * projected(&self.field, site, neigh_k));
                    self.field.set_phi(site, neigh_k, flipped);
                    if update_cosh_sinh {
                        self.field.update_cosh_sinh_terms_phi(site, neigh_k);
                    }
                    visited[neigh_k * n + site] = true;
                    pending.push((site, neigh_k));
                    cluster_size += 1;
                }
            }
        }

        cluster_size
    }

    /// Microcanonical over-relaxation: reflect each spin about the
    /// local effective field. Leaves the bosonic action unchanged, so
    /// it is rejection-free; only meaningful with fermions off.
    pub fn over_relaxation_sweep(&mut self) {
        debug_assert!(self.pars.turnoff_fermions);
        let n = self.pars.num_sites();
        let dtau = self.pars.dtau;
        let c = self.pars.c;

        for k in 1..=self.pars.m {
            for site in 0..n {
                let old_phi = self.field.phi(site, k);

                let mut b_eff = (self.field.phi(site, self.chain.prev(k))
                    + self.field.phi(site, self.chain.next(k)))
                    / (c * c * dtau);
                for neigh in self.lat.neighbors(site).collect::<Vec<_>>() {
                    b_eff += self.field.phi(neigh, k) * dtau;
                }

                let new_phi =
                    -old_phi + b_eff * (2.0 * old_phi.dot(&b_eff) / b_eff.dot(&b_eff));
                self.field.set_phi(site, k, new_phi);
            }
        }
    }
}
