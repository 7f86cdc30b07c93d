//! Command-line argument parsing for the DQMC driver.

use clap::{Args, Parser, Subcommand};

use super::SimConfig;

/// Determinantal quantum Monte Carlo for lattice fermion-boson models
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run (or resume) a simulation
    Run(RunArgs),
    /// Compare checkerboard and dense Green's functions on identical
    /// field configurations
    Compare(CompareArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "simulation.yaml")]
    pub config_file: String,

    /// Resume from a previously saved state archive
    #[arg(long)]
    pub resume: Option<String>,

    /// Override log output file (default stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Override lattice extent L
    #[arg(long)]
    pub l: Option<usize>,

    /// Override number of order-parameter components
    #[arg(long)]
    pub opdim: Option<usize>,

    /// Override inverse temperature
    #[arg(long)]
    pub beta: Option<f64>,

    /// Override number of imaginary-time slices
    #[arg(long)]
    pub m: Option<usize>,

    /// Override imaginary-time step
    #[arg(long)]
    pub dtau: Option<f64>,

    /// Override stabilization interval
    #[arg(long)]
    pub s: Option<usize>,

    /// Override tuning parameter r
    #[arg(long)]
    pub r: Option<f64>,

    /// Override quartic coupling u
    #[arg(long)]
    pub u: Option<f64>,

    /// Override Yukawa coupling lambda
    #[arg(long)]
    pub lambda: Option<f64>,

    /// Enable the checkerboard hopping break-up
    #[arg(long)]
    pub checkerboard: bool,

    /// Override measurement sweep count
    #[arg(long)]
    pub sweeps: Option<usize>,

    /// Override thermalization sweep count
    #[arg(long)]
    pub thermalization: Option<usize>,

    /// Override state/results save interval (in sweeps)
    #[arg(long)]
    pub save_interval: Option<usize>,

    /// Override random number generator seed
    #[arg(long)]
    pub rng_seed: Option<u64>,
}

impl RunArgs {
    /// Fold command-line overrides into the file-based configuration.
    pub fn apply_overrides(&self, config: &mut SimConfig) {
        let model = &mut config.model;
        if self.l.is_some() {
            model.l = self.l;
        }
        if self.opdim.is_some() {
            model.opdim = self.opdim;
        }
        if self.beta.is_some() {
            model.beta = self.beta;
            model.m = None;
        }
        if self.m.is_some() {
            model.m = self.m;
            model.beta = None;
        }
        if self.dtau.is_some() {
            model.dtau = self.dtau;
        }
        if self.s.is_some() {
            model.s = self.s;
        }
        if self.r.is_some() {
            model.r = self.r;
        }
        if self.u.is_some() {
            model.u = self.u;
        }
        if self.lambda.is_some() {
            model.lambda = self.lambda;
        }
        if self.checkerboard {
            model.checkerboard = Some(true);
        }

        let mc = &mut config.mc;
        if self.sweeps.is_some() {
            mc.sweeps = self.sweeps;
        }
        if self.thermalization.is_some() {
            mc.thermalization = self.thermalization;
        }
        if self.save_interval.is_some() {
            mc.save_interval = self.save_interval;
        }
        if self.rng_seed.is_some() {
            mc.rng_seed = self.rng_seed;
        }
    }
}

#[derive(Args, Debug)]
pub struct CompareArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "simulation.yaml")]
    pub config_file: String,

    /// Number of paired sweeps to run before comparing
    #[arg(long, default_value_t = 2)]
    pub sweeps: usize,

    /// Random number generator seed shared by both replicas
    #[arg(long, default_value_t = 5555)]
    pub rng_seed: u64,
}
