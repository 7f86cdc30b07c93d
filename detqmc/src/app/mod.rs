//! Simulation driver: stages, wall-time bookkeeping, periodic
//! checkpointing and result output, and the scalar-type dispatch that
//! picks the replica instantiation from the resolved parameters.

mod compare;
mod driver;

pub use compare::run_compare;
pub use driver::{init_logging, RunOutcome, Simulation};

use num_complex::Complex64;
use std::path::Path;

use crate::config::{McParams, ModelParams, SimConfig};
use crate::error::Result;
use crate::state::{peek_state_head, SimState};

/// Start a fresh simulation from a resolved configuration.
pub fn run_from_config(config: &SimConfig) -> Result<RunOutcome> {
    let model = ModelParams::resolve(&config.model)?;
    let mc = McParams::resolve(&config.mc)?;
    match (model.opdim, model.needs_complex()) {
        (1, false) => Simulation::<f64, 1>::new(model, mc)?.run(),
        (1, true) => Simulation::<Complex64, 1>::new(model, mc)?.run(),
        (2, _) => Simulation::<Complex64, 2>::new(model, mc)?.run(),
        (3, _) => Simulation::<Complex64, 3>::new(model, mc)?.run(),
        _ => unreachable!("opdim validated during parameter resolution"),
    }
}

/// Resume a simulation from a saved state archive.
pub fn resume_from_state(path: &Path) -> Result<RunOutcome> {
    let head = peek_state_head(path)?;
    match (head.model.opdim, head.model.needs_complex()) {
        (1, false) => Simulation::<f64, 1>::from_state(SimState::<1>::load(path)?)?.run(),
        (1, true) => Simulation::<Complex64, 1>::from_state(SimState::<1>::load(path)?)?.run(),
        (2, _) => Simulation::<Complex64, 2>::from_state(SimState::<2>::load(path)?)?.run(),
        (3, _) => Simulation::<Complex64, 3>::from_state(SimState::<3>::load(path)?)?.run(),
        _ => unreachable!("opdim validated during parameter resolution"),
    }
}
