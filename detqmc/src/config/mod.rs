//! Configuration management for DQMC simulations.
//!
//! This module handles the YAML-backed configuration structures,
//! command-line overrides, validation of the parameter set, and the
//! metadata emission used by `info.dat` and the stream headers.

mod args;

pub use args::{Cli, Command, CompareArgs, RunArgs};

use crate::error::{QmcError, Result};
use lattice::BoundaryCondition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Proposal kind used for the local phi updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpinProposalMethod {
    #[default]
    Box,
    Rotate,
    Scale,
    RotateThenScale,
    RotateAndScale,
}

impl SpinProposalMethod {
    pub fn needs_three_components(self) -> bool {
        !matches!(self, SpinProposalMethod::Box)
    }
}

/// Strategy used to fold an accepted local update into the Green's
/// function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMethod {
    Iterative,
    #[default]
    Woodbury,
    Delayed,
}

/// Whether sweeps recompute the Green's function naively each slice or
/// run the numerically stabilized wrap/advance machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GreenUpdateType {
    Simple,
    #[default]
    Stabilized,
}

/// Model parameters as they appear in the YAML configuration file.
/// Every recognized option is optional here; resolution against
/// defaults and consistency checks happen in [`ModelParams::resolve`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub l: Option<usize>,
    pub d: Option<usize>,
    pub opdim: Option<usize>,
    pub beta: Option<f64>,
    pub m: Option<usize>,
    pub dtau: Option<f64>,
    pub s: Option<usize>,
    pub r: Option<f64>,
    pub u: Option<f64>,
    pub lambda: Option<f64>,
    pub c: Option<f64>,
    pub cdw_u: Option<f64>,
    pub txhor: Option<f64>,
    pub txver: Option<f64>,
    pub tyhor: Option<f64>,
    pub tyver: Option<f64>,
    pub mu: Option<f64>,
    pub mux: Option<f64>,
    pub muy: Option<f64>,
    pub bc: Option<String>,
    pub spin_proposal_method: Option<SpinProposalMethod>,
    pub update_method: Option<UpdateMethod>,
    pub delay_steps: Option<usize>,
    pub acc_ratio: Option<f64>,
    pub repeat_update_in_slice: Option<usize>,
    pub repeat_wolff_per_sweep: Option<usize>,
    pub global_update_interval: Option<usize>,
    pub global_shift: Option<bool>,
    pub wolff_cluster_update: Option<bool>,
    pub wolff_cluster_shift_update: Option<bool>,
    pub over_relaxation: Option<bool>,
    pub repeat_over_relaxation: Option<usize>,
    pub turnoff_fermions: Option<bool>,
    pub phi2bosons: Option<bool>,
    pub phi_fixed: Option<bool>,
    pub checkerboard: Option<bool>,
    pub weak_zflux: Option<bool>,
    pub adapt_scale_variance: Option<bool>,
}

/// Monte Carlo driver parameters from the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McConfig {
    pub sweeps: Option<usize>,
    pub thermalization: Option<usize>,
    pub save_interval: Option<usize>,
    pub measure_interval: Option<usize>,
    pub rng_seed: Option<u64>,
    pub green_update_type: Option<GreenUpdateType>,
    pub state_file: Option<String>,
    pub jk_blocks: Option<usize>,
    pub save_config_stream: Option<bool>,
    pub max_walltime_secs: Option<u64>,
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub mc: McConfig,
}

/// Fully resolved, validated model parameters. Immutable after
/// construction apart from the replica-exchange hook on `r`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    pub l: usize,
    pub d: usize,
    pub opdim: usize,
    pub beta: f64,
    pub m: usize,
    pub dtau: f64,
    pub s: usize,
    pub r: f64,
    pub u: f64,
    pub lambda: f64,
    pub c: f64,
    pub cdw_u: f64,
    pub txhor: f64,
    pub txver: f64,
    pub tyhor: f64,
    pub tyver: f64,
    pub mux: f64,
    pub muy: f64,
    pub bc: BoundaryCondition,
    pub spin_proposal_method: SpinProposalMethod,
    pub update_method: UpdateMethod,
    pub delay_steps: usize,
    pub target_acc_ratio: f64,
    pub repeat_update_in_slice: usize,
    pub repeat_wolff_per_sweep: usize,
    pub global_update_interval: usize,
    pub global_shift: bool,
    pub wolff_cluster_update: bool,
    pub wolff_cluster_shift_update: bool,
    pub over_relaxation: bool,
    pub repeat_over_relaxation: usize,
    pub turnoff_fermions: bool,
    pub phi2bosons: bool,
    pub phi_fixed: bool,
    pub checkerboard: bool,
    pub weak_zflux: bool,
    pub adapt_scale_variance: bool,
    /// Names that were given explicitly (file or CLI), kept for
    /// metadata output and for rejecting ambiguous input.
    pub specified: BTreeSet<String>,
}

impl ModelParams {
    /// Resolve a raw configuration against defaults and validate it.
    pub fn resolve(cfg: &ModelConfig) -> Result<Self> {
        let mut specified = BTreeSet::new();
        macro_rules! note {
            ($field:ident) => {
                if cfg.$field.is_some() {
                    specified.insert(stringify!($field).to_string());
                }
            };
        }
        note!(l);
        note!(d);
        note!(opdim);
        note!(beta);
        note!(m);
        note!(dtau);
        note!(s);
        note!(r);
        note!(u);
        note!(lambda);
        note!(c);
        note!(cdw_u);
        note!(txhor);
        note!(txver);
        note!(tyhor);
        note!(tyver);
        note!(mu);
        note!(mux);
        note!(muy);
        note!(bc);
        note!(spin_proposal_method);
        note!(update_method);
        note!(delay_steps);
        note!(acc_ratio);
        note!(repeat_update_in_slice);
        note!(repeat_wolff_per_sweep);
        note!(global_update_interval);
        note!(global_shift);
        note!(wolff_cluster_update);
        note!(wolff_cluster_shift_update);
        note!(over_relaxation);
        note!(repeat_over_relaxation);
        note!(turnoff_fermions);
        note!(phi2bosons);
        note!(phi_fixed);
        note!(checkerboard);
        note!(weak_zflux);
        note!(adapt_scale_variance);

        let l = cfg.l.ok_or(QmcError::ParameterMissing("l"))?;
        let d = cfg.d.unwrap_or(2);
        if d != 2 {
            return Err(QmcError::ParameterInvalid {
                name: "d",
                reason: format!("only the square lattice (d = 2) is supported, got {}", d),
            });
        }
        let opdim = cfg.opdim.unwrap_or(3);
        if !(1..=3).contains(&opdim) {
            return Err(QmcError::ParameterInvalid {
                name: "opdim",
                reason: format!("must be 1, 2 or 3, got {}", opdim),
            });
        }

        let dtau = cfg.dtau.ok_or(QmcError::ParameterMissing("dtau"))?;
        let s = cfg.s.ok_or(QmcError::ParameterMissing("s"))?;
        if dtau <= 0.0 {
            return Err(QmcError::ParameterInvalid {
                name: "dtau",
                reason: "must be positive".into(),
            });
        }
        if s == 0 {
            return Err(QmcError::ParameterInvalid {
                name: "s",
                reason: "must be positive".into(),
            });
        }

        // Exactly one of `m` and `beta` determines the discretization.
        let (m, beta) = match (cfg.m, cfg.beta) {
            (Some(_), Some(_)) => {
                return Err(QmcError::ParameterConflict(
                    "specify only one of the parameters `m` and `beta`".into(),
                ))
            }
            (None, None) => {
                return Err(QmcError::ParameterConflict(
                    "specify either parameter `m` or `beta`".into(),
                ))
            }
            (Some(m), None) => (m, m as f64 * dtau),
            (None, Some(beta)) => {
                if beta <= 0.0 {
                    return Err(QmcError::ParameterInvalid {
                        name: "beta",
                        reason: "must be positive".into(),
                    });
                }
                // may yield a slightly lower inverse temperature if
                // dtau does not divide beta evenly
                let m = (beta / dtau) as usize;
                (m, m as f64 * dtau)
            }
        };
        if m == 0 {
            return Err(QmcError::ParameterInvalid {
                name: "m",
                reason: "must be positive".into(),
            });
        }
        if m % s != 0 || m / s < 2 {
            return Err(QmcError::ParameterInvalid {
                name: "s",
                reason: format!("m = {} and s = {} do not agree (need s | m and m/s >= 2)", m, s),
            });
        }

        let checkerboard = cfg.checkerboard.unwrap_or(false);
        if checkerboard && l % 2 != 0 {
            return Err(QmcError::ParameterInvalid {
                name: "checkerboard",
                reason: format!("checkerboard break-up needs an even lattice extent, got L = {}", l),
            });
        }

        let spin_proposal_method = cfg.spin_proposal_method.unwrap_or_default();
        if spin_proposal_method.needs_three_components() && opdim != 3 {
            return Err(QmcError::ParameterInvalid {
                name: "spin_proposal_method",
                reason: "rotate/scale proposals need opdim = 3".into(),
            });
        }

        let weak_zflux = cfg.weak_zflux.unwrap_or(false);
        if weak_zflux && opdim == 3 {
            // phase convention of the flux in the conjugate sectors is
            // not fixed for the O(3) model
            return Err(QmcError::ParameterInvalid {
                name: "weak_zflux",
                reason: "magnetic flux is only supported for opdim = 1 or 2".into(),
            });
        }

        let delay_steps = cfg.delay_steps.unwrap_or(0);
        let update_method = match cfg.update_method {
            Some(u) => u,
            None if delay_steps > 0 => UpdateMethod::Delayed,
            None => UpdateMethod::default(),
        };
        if update_method == UpdateMethod::Delayed && delay_steps == 0 {
            return Err(QmcError::ParameterInvalid {
                name: "delay_steps",
                reason: "delayed updates need delay_steps >= 1".into(),
            });
        }

        let target_acc_ratio = cfg.acc_ratio.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&target_acc_ratio) {
            return Err(QmcError::ParameterInvalid {
                name: "acc_ratio",
                reason: "target acceptance ratio must lie in [0, 1]".into(),
            });
        }

        let bc = match cfg.bc.as_deref() {
            None | Some("pbc") => BoundaryCondition::Periodic,
            Some("apbc-x") => BoundaryCondition::AntiPeriodicX,
            Some("apbc-y") => BoundaryCondition::AntiPeriodicY,
            Some("apbc-xy") => BoundaryCondition::AntiPeriodicXy,
            Some(other) => {
                return Err(QmcError::ParameterInvalid {
                    name: "bc",
                    reason: format!(
                        "unknown boundary condition `{}` (expected pbc, apbc-x, apbc-y, apbc-xy)",
                        other
                    ),
                })
            }
        };

        // mux and muy supersede mu only when both are given
        let mu = cfg.mu.unwrap_or(0.0);
        let (mux, muy) = if cfg.mux.is_some() && cfg.muy.is_some() {
            (cfg.mux.unwrap_or(mu), cfg.muy.unwrap_or(mu))
        } else {
            (mu, mu)
        };

        let global_update_interval = cfg.global_update_interval.unwrap_or(1).max(1);

        Ok(ModelParams {
            l,
            d,
            opdim,
            beta,
            m,
            dtau,
            s,
            r: cfg.r.ok_or(QmcError::ParameterMissing("r"))?,
            u: cfg.u.unwrap_or(1.0),
            lambda: cfg.lambda.unwrap_or(1.0),
            c: cfg.c.unwrap_or(1.0),
            cdw_u: cfg.cdw_u.unwrap_or(0.0),
            txhor: cfg.txhor.unwrap_or(-1.0),
            txver: cfg.txver.unwrap_or(-0.5),
            tyhor: cfg.tyhor.unwrap_or(0.5),
            tyver: cfg.tyver.unwrap_or(1.0),
            mux,
            muy,
            bc,
            spin_proposal_method,
            update_method,
            delay_steps,
            target_acc_ratio,
            repeat_update_in_slice: cfg.repeat_update_in_slice.unwrap_or(1).max(1),
            repeat_wolff_per_sweep: cfg.repeat_wolff_per_sweep.unwrap_or(1).max(1),
            global_update_interval,
            global_shift: cfg.global_shift.unwrap_or(false),
            wolff_cluster_update: cfg.wolff_cluster_update.unwrap_or(false),
            wolff_cluster_shift_update: cfg.wolff_cluster_shift_update.unwrap_or(false),
            over_relaxation: cfg.over_relaxation.unwrap_or(false),
            repeat_over_relaxation: cfg.repeat_over_relaxation.unwrap_or(1).max(1),
            turnoff_fermions: cfg.turnoff_fermions.unwrap_or(false),
            phi2bosons: cfg.phi2bosons.unwrap_or(false),
            phi_fixed: cfg.phi_fixed.unwrap_or(false),
            checkerboard,
            weak_zflux,
            adapt_scale_variance: cfg.adapt_scale_variance.unwrap_or(true),
            specified,
        })
    }

    pub fn num_sites(&self) -> usize {
        self.l * self.l
    }

    /// Number of stabilization checkpoints, `ceil(m / s)`.
    pub fn num_checkpoints(&self) -> usize {
        self.m.div_ceil(self.s)
    }

    /// 2 for one or two order-parameter components, 4 for three.
    pub fn matrix_size_factor(&self) -> usize {
        if self.opdim == 3 {
            4
        } else {
            2
        }
    }

    /// Whether the Green's function needs complex arithmetic.
    pub fn needs_complex(&self) -> bool {
        self.opdim >= 2 || self.weak_zflux
    }

    /// Ordered name/value pairs describing this parameter set.
    pub fn metadata(&self) -> Vec<(String, String)> {
        let mut meta: Vec<(String, String)> = Vec::new();
        macro_rules! put {
            ($name:expr, $value:expr) => {
                meta.push(($name.to_string(), format!("{}", $value)));
            };
        }
        put!("l", self.l);
        put!("d", self.d);
        put!("opdim", self.opdim);
        put!("beta", self.beta);
        put!("m", self.m);
        put!("dtau", self.dtau);
        put!("s", self.s);
        put!("r", self.r);
        put!("u", self.u);
        put!("lambda", self.lambda);
        put!("c", self.c);
        put!("cdw_u", self.cdw_u);
        put!("txhor", self.txhor);
        put!("txver", self.txver);
        put!("tyhor", self.tyhor);
        put!("tyver", self.tyver);
        put!("mux", self.mux);
        put!("muy", self.muy);
        put!(
            "bc",
            match self.bc {
                BoundaryCondition::Periodic => "pbc",
                BoundaryCondition::AntiPeriodicX => "apbc-x",
                BoundaryCondition::AntiPeriodicY => "apbc-y",
                BoundaryCondition::AntiPeriodicXy => "apbc-xy",
            }
        );
        put!("spin_proposal_method", format!("{:?}", self.spin_proposal_method));
        put!("update_method", format!("{:?}", self.update_method));
        put!("delay_steps", self.delay_steps);
        put!("target_acc_ratio", self.target_acc_ratio);
        put!("repeat_update_in_slice", self.repeat_update_in_slice);
        put!("repeat_wolff_per_sweep", self.repeat_wolff_per_sweep);
        put!("global_update_interval", self.global_update_interval);
        put!("global_shift", self.global_shift);
        put!("wolff_cluster_update", self.wolff_cluster_update);
        put!("wolff_cluster_shift_update", self.wolff_cluster_shift_update);
        put!("over_relaxation", self.over_relaxation);
        put!("turnoff_fermions", self.turnoff_fermions);
        put!("phi2bosons", self.phi2bosons);
        put!("phi_fixed", self.phi_fixed);
        put!("checkerboard", self.checkerboard);
        put!("weak_zflux", self.weak_zflux);
        meta
    }
}

/// Resolved Monte Carlo driver parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McParams {
    pub sweeps: usize,
    pub thermalization: usize,
    pub save_interval: usize,
    pub measure_interval: usize,
    pub rng_seed: Option<u64>,
    pub green_update_type: GreenUpdateType,
    pub state_file: String,
    pub jk_blocks: usize,
    pub save_config_stream: bool,
    pub max_walltime_secs: Option<u64>,
}

impl McParams {
    pub fn resolve(cfg: &McConfig) -> Result<Self> {
        let sweeps = cfg.sweeps.ok_or(QmcError::ParameterMissing("sweeps"))?;
        let thermalization = cfg
            .thermalization
            .ok_or(QmcError::ParameterMissing("thermalization"))?;
        let save_interval = cfg.save_interval.unwrap_or(100).max(1);
        let measure_interval = cfg.measure_interval.unwrap_or(1).max(1);
        Ok(McParams {
            sweeps,
            thermalization,
            save_interval,
            measure_interval,
            rng_seed: cfg.rng_seed,
            green_update_type: cfg.green_update_type.unwrap_or_default(),
            state_file: cfg
                .state_file
                .clone()
                .unwrap_or_else(|| "simulation.state".to_string()),
            jk_blocks: cfg.jk_blocks.unwrap_or(1).max(1),
            save_config_stream: cfg.save_config_stream.unwrap_or(false),
            max_walltime_secs: cfg.max_walltime_secs,
        })
    }

    pub fn metadata(&self) -> Vec<(String, String)> {
        let mut meta: Vec<(String, String)> = Vec::new();
        meta.push(("sweeps".into(), self.sweeps.to_string()));
        meta.push(("thermalization".into(), self.thermalization.to_string()));
        meta.push(("save_interval".into(), self.save_interval.to_string()));
        meta.push(("measure_interval".into(), self.measure_interval.to_string()));
        if let Some(seed) = self.rng_seed {
            meta.push(("rng_seed".into(), seed.to_string()));
        }
        meta.push((
            "green_update_type".into(),
            format!("{:?}", self.green_update_type),
        ));
        meta.push(("jk_blocks".into(), self.jk_blocks.to_string()));
        meta
    }
}
