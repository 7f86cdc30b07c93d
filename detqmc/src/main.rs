use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use std::fs;
use std::process::ExitCode;
use tracing::{error, info};

use detqmc::app::{init_logging, resume_from_state, run_from_config, run_compare, RunOutcome};
use detqmc::config::{Cli, Command, CompareArgs, RunArgs, SimConfig};
use detqmc::QmcError;

fn load_config(path: &str) -> Result<SimConfig> {
    let content = fs::read_to_string(path)
        .wrap_err_with(|| format!("unable to read configuration file: {}", path))?;
    serde_yml::from_str::<SimConfig>(&content).wrap_err("failed to parse configuration file")
}

fn run(args: &RunArgs) -> Result<ExitCode> {
    let outcome = if let Some(state_file) = &args.resume {
        info!("resuming from state archive {}", state_file);
        resume_from_state(std::path::Path::new(state_file))
    } else {
        let mut config = load_config(&args.config_file)?;
        args.apply_overrides(&mut config);
        run_from_config(&config)
    };

    match outcome {
        Ok(RunOutcome::Finished) => Ok(ExitCode::SUCCESS),
        Ok(RunOutcome::Stopped) => {
            // distinguishable from success so schedulers can requeue
            Ok(ExitCode::from(3))
        }
        Err(err @ (QmcError::ParameterMissing(_)
        | QmcError::ParameterConflict(_)
        | QmcError::ParameterInvalid { .. })) => {
            error!("{}", err);
            Ok(ExitCode::from(1))
        }
        Err(err) => {
            error!("{}", err);
            Ok(ExitCode::from(2))
        }
    }
}

fn compare(args: &CompareArgs) -> Result<ExitCode> {
    let config = load_config(&args.config_file)?;
    match run_compare(&config, args.sweeps, args.rng_seed) {
        Ok(diff) => {
            info!("comparison finished, max deviation {:e}", diff);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!("{}", err);
            Ok(ExitCode::from(2))
        }
    }
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    match &cli.command {
        Command::Run(args) => {
            init_logging(args.output.as_ref());
            run(args)
        }
        Command::Compare(args) => {
            init_logging(None);
            compare(args)
        }
    }
}
