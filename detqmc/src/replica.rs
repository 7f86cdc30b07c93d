//! A single DQMC replica: field configuration, Green's function state,
//! the stabilized UdV sweep machinery, and the sweep drivers.
//!
//! Sweeps alternate between moving down (tau = beta -> 0) and up
//! (tau = 0 -> beta) through the imaginary-time slices. Between
//! stabilization checkpoints the Green's function is propagated by
//! cheap wrap steps; at every s-th slice it is rebuilt from freshly
//! advanced UdV factorizations, which bounds the accumulated rounding
//! error.

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::io::Write;
use tracing::{error, info};

use lattice::{SquareLattice, TimeChain};

use crate::bmat::BmatContext;
use crate::config::{GreenUpdateType, ModelParams};
use crate::error::{QmcError, Result};
use crate::fields::FieldConfig;
use crate::green::{green_from_eye_and_udv, green_from_udv};
use crate::hopping::KineticKernel;
use crate::measure::Observables;
use crate::scalar::GreenScalar;
use crate::udv::{identity_storage, udv_decompose, Udv};
use crate::updates::global::GlobalMoveBackup;
use crate::updates::{AdjustmentState, UpdateStatistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SweepDirection {
    Up,
    Down,
}

pub struct Replica<S: GreenScalar, const OPDIM: usize> {
    pub pars: ModelParams,
    pub lat: SquareLattice,
    pub chain: TimeChain,
    pub kernel: KineticKernel<S>,
    pub field: FieldConfig<OPDIM>,
    pub rng: Pcg64,
    /// Equal-time Green's function at `current_timeslice`.
    pub g: DMatrix<S>,
    /// Singular values of G^{-1} from the latest stable assembly.
    pub g_inv_sv: DVector<f64>,
    pub current_timeslice: usize,
    /// UdV checkpoints; up-sweep form holds B(s l, 0), down-sweep form
    /// holds B(beta, s l).
    pub storage: Vec<Udv<S>>,
    pub last_sweep_dir: SweepDirection,
    pub ad: AdjustmentState,
    pub stats: UpdateStatistics,
    pub performed_sweeps: u64,
    pub obs: Observables<OPDIM>,
    pub(crate) backup: Option<GlobalMoveBackup<S, OPDIM>>,
}

impl<S: GreenScalar, const OPDIM: usize> Replica<S, OPDIM> {
    pub fn new(pars: ModelParams, seed: u64) -> Result<Self> {
        let mut rng = Pcg64::seed_from_u64(seed);
        let mut field = FieldConfig::<OPDIM>::new(&pars);
        if pars.phi_fixed {
            field.init_constant();
        } else {
            field.init_random(&mut rng);
        }
        let ad = AdjustmentState::new(pars.target_acc_ratio);
        Self::assemble(pars, field, ad, UpdateStatistics::default(), 0, rng)
    }

    /// Rebuild a replica from checkpointed parts. The hopping cache,
    /// UdV chain and Green's function are derived state and are
    /// reconstructed from the field configuration.
    pub fn from_saved(
        pars: ModelParams,
        mut field: FieldConfig<OPDIM>,
        ad: AdjustmentState,
        stats: UpdateStatistics,
        performed_sweeps: u64,
        rng: Pcg64,
    ) -> Result<Self> {
        field.update_all_cosh_sinh_terms();
        Self::assemble(pars, field, ad, stats, performed_sweeps, rng)
    }

    fn assemble(
        pars: ModelParams,
        field: FieldConfig<OPDIM>,
        ad: AdjustmentState,
        stats: UpdateStatistics,
        performed_sweeps: u64,
        rng: Pcg64,
    ) -> Result<Self> {
        if pars.opdim != OPDIM {
            return Err(QmcError::ParameterInvalid {
                name: "opdim",
                reason: format!("replica instantiated for {} components", OPDIM),
            });
        }
        if pars.needs_complex() != S::COMPLEX {
            return Err(QmcError::ParameterInvalid {
                name: "opdim",
                reason: "scalar type does not match the required Green sector".into(),
            });
        }

        let lat = SquareLattice::new(pars.l);
        let chain = TimeChain::new(pars.m);
        let kernel = KineticKernel::new(&pars);

        let size = if pars.turnoff_fermions {
            0
        } else {
            pars.matrix_size_factor() * pars.num_sites()
        };
        let n_chk = pars.num_checkpoints();
        let obs = Observables::new(&pars);

        let mut replica = Replica {
            lat,
            chain,
            kernel,
            field,
            rng,
            g: DMatrix::zeros(size, size),
            g_inv_sv: DVector::zeros(size),
            current_timeslice: pars.m,
            storage: identity_storage(n_chk, size),
            last_sweep_dir: SweepDirection::Up,
            ad,
            stats,
            performed_sweeps,
            obs,
            backup: None,
            pars,
        };
        replica.setup_udv_storage_and_calculate_green()?;
        Ok(replica)
    }

    #[inline]
    pub fn green_size(&self) -> usize {
        self.pars.matrix_size_factor() * self.pars.num_sites()
    }

    #[inline]
    pub(crate) fn bmat(&self) -> BmatContext<'_, S, OPDIM> {
        BmatContext::new(&self.pars, &self.kernel, &self.field)
    }

    /// Rebuild the whole UdV chain in up-sweep form from the current
    /// field configuration and assemble G(beta). Used at startup, after
    /// a restart, and after every global move.
    pub fn setup_udv_storage_and_calculate_green(&mut self) -> Result<()> {
        if self.pars.turnoff_fermions {
            return Ok(());
        }
        let n_chk = self.pars.num_checkpoints();
        let s = self.pars.s;
        let m = self.pars.m;
        let size = self.green_size();

        let mut storage = identity_storage::<S>(n_chk, size);
        {
            let ctx = self.bmat();
            let id = DMatrix::<S>::identity(size, size);
            storage[1] = udv_decompose(ctx.left_multiply_b(&id, s, 0))?;
            for l in 1..n_chk {
                let k_l = s * l;
                let k_lp1 = if l < n_chk - 1 { s * (l + 1) } else { m };
                let mut x = ctx.left_multiply_b(&storage[l].u, k_lp1, k_l);
                crate::scalar::scale_cols_real(&mut x, &storage[l].d);
                let temp = udv_decompose(x)?;
                storage[l + 1] = Udv {
                    u: temp.u,
                    d: temp.d,
                    v: &temp.v * &storage[l].v,
                };
            }
        }
        let assembly = green_from_eye_and_udv(&storage[n_chk])?;
        self.g = assembly.g;
        self.g_inv_sv = assembly.g_inv_sv;
        self.storage = storage;
        self.current_timeslice = m;
        self.last_sweep_dir = SweepDirection::Up;
        Ok(())
    }

    /// G(k+1) <- B_{k+1} G(k) B_{k+1}^{-1} (accumulates rounding).
    fn wrap_up_green(&mut self, k: usize) {
        debug_assert_eq!(self.current_timeslice, k);
        let new_g = {
            let ctx = self.bmat();
            let tmp = ctx.right_multiply_bk_inv(&self.g, k + 1);
            ctx.left_multiply_bk(&tmp, k + 1)
        };
        self.g = new_g;
        self.current_timeslice = k + 1;
    }

    /// G(k-1) <- B_k^{-1} G(k) B_k (accumulates rounding).
    fn wrap_down_green(&mut self, k: usize) {
        debug_assert_eq!(self.current_timeslice, k);
        let new_g = {
            let ctx = self.bmat();
            let tmp = ctx.right_multiply_bk(&self.g, k);
            ctx.left_multiply_bk_inv(&tmp, k)
        };
        self.g = new_g;
        self.current_timeslice = k - 1;
    }

    /// Refresh G at slice (l+1)s [or m] from a freshly advanced
    /// factorization.
    ///
    /// Preconditions: `storage[l+1]` holds B(beta, (l+1) s dtau) from
    /// the previous down sweep, `storage[l]` holds B(l s dtau, 0).
    /// Postcondition: `storage[l+1]` holds B((l+1) s dtau, 0).
    fn advance_up_green(&mut self, l: usize) -> Result<()> {
        let n_chk = self.pars.num_checkpoints();
        let s = self.pars.s;
        let k_l = s * l;
        let k_lp1 = if l < n_chk - 1 { s * (l + 1) } else { self.pars.m };
        debug_assert_eq!(self.current_timeslice, k_lp1);

        let temp = {
            let ctx = self.bmat();
            let mut x = ctx.left_multiply_b(&self.storage[l].u, k_lp1, k_l);
            crate::scalar::scale_cols_real(&mut x, &self.storage[l].d);
            let mut temp = udv_decompose(x)?;
            temp.v = &temp.v * &self.storage[l].v;
            temp
        };
        let assembly = green_from_udv(&self.storage[l + 1], &temp)?;
        self.g = assembly.g;
        self.g_inv_sv = assembly.g_inv_sv;
        self.storage[l + 1] = temp;
        self.current_timeslice = k_lp1;
        Ok(())
    }

    /// Refresh G at slice (l-1)s from a freshly advanced factorization.
    ///
    /// Preconditions: `storage[l]` holds B(beta, k_l dtau),
    /// `storage[l-1]` holds B((l-1) s dtau, 0) from the previous up
    /// sweep. Postcondition: `storage[l-1]` holds B(beta, (l-1) s dtau).
    fn advance_down_green(&mut self, l: usize) -> Result<()> {
        let n_chk = self.pars.num_checkpoints();
        let s = self.pars.s;
        let k_l = if l < n_chk { s * l } else { self.pars.m };
        let k_lm1 = s * (l - 1);
        debug_assert_eq!(self.current_timeslice, k_lm1);

        let udv_left = {
            let ctx = self.bmat();
            let mut y = ctx.right_multiply_b(&self.storage[l].v, k_l, k_lm1);
            crate::scalar::scale_rows_real(&mut y, &self.storage[l].d);
            let mut udv_left = udv_decompose(y)?;
            udv_left.u = &self.storage[l].u * &udv_left.u;
            udv_left
        };
        let assembly = green_from_udv(&udv_left, &self.storage[l - 1])?;
        self.g = assembly.g;
        self.g_inv_sv = assembly.g_inv_sv;
        self.storage[l - 1] = udv_left;
        self.current_timeslice = k_lm1;
        Ok(())
    }

    fn sweep_up(&mut self, take_measurements: bool, thermalization: bool) -> Result<()> {
        if take_measurements {
            self.init_measurements();
        }
        let n_chk = self.pars.num_checkpoints();
        let s = self.pars.s;
        let m = self.pars.m;

        // the storage holds B(beta, l s dtau) for every l from the
        // preceding down sweep; reset the tau = 0 checkpoint
        self.storage[0] = Udv::identity(self.green_size());

        for l in 0..=n_chk.saturating_sub(2) {
            for k in (l * s + 1)..=((l + 1) * s) {
                self.wrap_up_green(k - 1);
                self.update_in_slice(k, thermalization);
                if take_measurements {
                    self.measure(k);
                }
            }
            self.advance_up_green(l)?;
        }
        for k in ((n_chk - 1) * s + 1)..=m {
            self.wrap_up_green(k - 1);
            self.update_in_slice(k, thermalization);
            if take_measurements {
                self.measure(k);
            }
        }
        self.advance_up_green(n_chk - 1)?;

        if take_measurements {
            self.finish_measurements();
        }
        Ok(())
    }

    fn sweep_down(&mut self, take_measurements: bool, thermalization: bool) -> Result<()> {
        if take_measurements {
            self.init_measurements();
        }
        let n_chk = self.pars.num_checkpoints();
        let s = self.pars.s;
        let m = self.pars.m;

        // slices above the last checkpoint may be fewer than s
        for k in ((n_chk - 1) * s + 1..=m).rev() {
            self.update_in_slice(k, thermalization);
            if take_measurements {
                self.measure(k);
            }
            self.wrap_down_green(k);
        }
        self.storage[n_chk] = Udv::identity(self.green_size());
        for l in (1..=n_chk - 1).rev() {
            self.advance_down_green(l + 1)?;
            for k in ((l - 1) * s + 1..=l * s).rev() {
                self.update_in_slice(k, thermalization);
                if take_measurements {
                    self.measure(k);
                }
                self.wrap_down_green(k);
            }
        }
        // refresh G at tau = 0 so the next up sweep starts clean
        self.advance_down_green(1)?;

        if take_measurements {
            self.finish_measurements();
        }
        Ok(())
    }

    /// One full stabilized sweep, alternating direction. The global
    /// updater runs after each completed up sweep: its from-scratch
    /// rebuild leaves up-form storage with G(beta), which is only
    /// consistent at an up-sweep boundary.
    pub fn sweep(&mut self, take_measurements: bool) -> Result<()> {
        self.sweep_dispatch(take_measurements, false)
    }

    /// Thermalization sweep: same control flow, but the slice update
    /// feeds the acceptance ratios into the adjustment state.
    pub fn sweep_thermalization(&mut self) -> Result<()> {
        self.sweep_dispatch(false, true)
    }

    fn sweep_dispatch(&mut self, take_measurements: bool, thermalization: bool) -> Result<()> {
        let result = if self.pars.turnoff_fermions {
            // no Green's function to maintain; the simple slice loop is
            // exact here
            if self.last_sweep_dir == SweepDirection::Up {
                self.global_move()?;
                self.sweep_simple_core(take_measurements, thermalization)?;
                self.last_sweep_dir = SweepDirection::Down;
                Ok(())
            } else {
                self.sweep_simple_core(take_measurements, thermalization)?;
                self.last_sweep_dir = SweepDirection::Up;
                Ok(())
            }
        } else if self.last_sweep_dir == SweepDirection::Up {
            let r = self.sweep_down(take_measurements, thermalization);
            if r.is_ok() {
                self.last_sweep_dir = SweepDirection::Down;
            }
            r
        } else {
            let mut r = self.sweep_up(take_measurements, thermalization);
            if r.is_ok() {
                self.last_sweep_dir = SweepDirection::Up;
                r = self.global_move();
            }
            r
        };

        match result {
            Ok(()) => {
                self.performed_sweeps += 1;
                Ok(())
            }
            Err(err) => {
                error!("numerical failure during sweep: {}", err);
                self.dump_field_to_disk();
                Err(err)
            }
        }
    }

    /// Naive sweep recomputing G from scratch at every slice. Reference
    /// path (`green_update_type = simple`) and test harness.
    pub fn sweep_simple(&mut self, take_measurements: bool) -> Result<()> {
        self.sweep_simple_core(take_measurements, false)?;
        self.performed_sweeps += 1;
        Ok(())
    }

    pub fn sweep_simple_thermalization(&mut self) -> Result<()> {
        self.sweep_simple_core(false, true)?;
        self.performed_sweeps += 1;
        Ok(())
    }

    fn sweep_simple_core(&mut self, take_measurements: bool, thermalization: bool) -> Result<()> {
        if take_measurements {
            self.init_measurements();
        }
        for k in 1..=self.pars.m {
            if !self.pars.turnoff_fermions {
                self.g = self.green_from_scratch(k)?;
                self.current_timeslice = k;
            }
            self.update_in_slice(k, thermalization);
            if take_measurements {
                self.measure(k);
            }
        }
        if take_measurements {
            self.finish_measurements();
        }
        Ok(())
    }

    /// Dense reference `G(k) = [I + B(k,0) B(m,k)]^{-1}`.
    pub fn green_from_scratch(&self, k: usize) -> Result<DMatrix<S>> {
        let ctx = self.bmat();
        let size = self.green_size();
        let m = self.pars.m;
        let mut product = ctx.bmat_dense(k, 0);
        if k < m {
            product *= ctx.bmat_dense(m, k);
        }
        (DMatrix::identity(size, size) + product)
            .try_inverse()
            .ok_or_else(|| {
                QmcError::NumericalFailure("singular 1 + B in naive Green computation".into())
            })
    }

    /// Run a sweep according to the configured Green update scheme.
    pub fn run_sweep(&mut self, scheme: GreenUpdateType, take_measurements: bool) -> Result<()> {
        match scheme {
            GreenUpdateType::Simple => self.sweep_simple(take_measurements),
            GreenUpdateType::Stabilized => self.sweep(take_measurements),
        }
    }

    pub fn run_sweep_thermalization(&mut self, scheme: GreenUpdateType) -> Result<()> {
        match scheme {
            GreenUpdateType::Simple => self.sweep_simple_thermalization(),
            GreenUpdateType::Stabilized => self.sweep_thermalization(),
        }
    }

    /// Called once when thermalization completes.
    pub fn thermalization_over(&mut self) {
        info!(
            "after thermalization: phi_delta = {:.4}, recent local acceptance = {:.4}",
            self.ad.phi_delta,
            self.ad.recent_box_acc_ratio()
        );
        if self.pars.global_shift {
            info!(
                "global shift acceptance ratio = {:.4}",
                self.stats.global_shift_acc_ratio()
            );
        }
        if self.pars.wolff_cluster_update {
            info!(
                "wolff cluster acceptance ratio = {:.4}, average accepted size = {:.1}",
                self.stats.wolff_acc_ratio(),
                self.stats
                    .average_accepted_cluster_size(self.pars.repeat_wolff_per_sweep)
            );
        }
    }

    // --- replica exchange surface ---

    pub fn exchange_parameter(&self) -> f64 {
        self.pars.r
    }

    pub fn set_exchange_parameter(&mut self, r: f64) {
        self.pars.r = r;
    }

    /// (dtau/2) sum |phi|^2, the piece of the action that couples to r.
    pub fn exchange_action_contribution(&self) -> f64 {
        0.5 * self.pars.dtau * self.field.sum_phi_squared()
    }

    /// Write the field configuration slice by slice for post-mortem
    /// inspection after a numerical breakdown. Best effort.
    fn dump_field_to_disk(&self) {
        for k in 0..=self.pars.m {
            let fname = format!("phi_k{}.dat", k);
            let mut out = match std::fs::File::create(&fname) {
                Ok(f) => f,
                Err(e) => {
                    error!("could not create {}: {}", fname, e);
                    return;
                }
            };
            for site in 0..self.pars.num_sites() {
                let mut line = String::new();
                for dim in 0..OPDIM {
                    if dim > 0 {
                        line.push(' ');
                    }
                    line.push_str(&format!("{:e}", self.field.phi_comp(site, dim, k)));
                }
                if writeln!(out, "{}", line).is_err() {
                    return;
                }
            }
        }
    }
}
