//! The outer Monte Carlo loop: thermalization and measurement stages,
//! wall-time-bounded checkpointing, and graceful shutdown on an abort
//! sentinel file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::{
    fmt::layer, fmt::time::uptime, layer::SubscriberExt, util::SubscriberInitExt, Registry,
};

use crate::config::{McParams, ModelParams};
use crate::error::Result;
use crate::replica::Replica;
use crate::scalar::GreenScalar;
use crate::state::{write_info_file, SimState, STATE_FORMAT_VERSION};
use crate::stream::ConfigStreamWriter;

/// Cooperative shutdown starts this many minutes before the granted
/// wall time runs out.
const SAFETY_MINUTES: u64 = 35;

/// Route log output to stdout or a file. Timestamps show elapsed run
/// time, the same quantity the driver budgets against the granted
/// wall time.
pub fn init_logging(log_file: Option<&String>) {
    match log_file {
        Some(path) => match File::create(path) {
            Ok(log) => {
                Registry::default()
                    .with(
                        layer()
                            .with_writer(std::sync::Arc::new(log))
                            .with_timer(uptime())
                            .with_ansi(false),
                    )
                    .init();
                info!("log output goes to {}", path);
            }
            Err(err) => eprintln!("could not create log file {}: {}", path, err),
        },
        None => {
            Registry::default()
                .with(layer().with_writer(std::io::stdout).with_timer(uptime()))
                .init();
        }
    }
}

/// How a simulation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All requested sweeps completed.
    Finished,
    /// Wall time nearly exhausted or an abort file was found; state has
    /// been saved for a later resume.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Thermalization,
    Measurement,
    Finished,
}

/// Buffered scalar timeseries, flushed to disk by `save_results`.
#[derive(Default)]
struct SeriesBuffers {
    norm_mean_phi: Vec<f64>,
    associated_energy: Vec<f64>,
    green_k0: Vec<f64>,
    green_local: Vec<f64>,
}

impl SeriesBuffers {
    fn entries(&mut self) -> [(&'static str, &mut Vec<f64>); 4] {
        [
            ("norm_mean_phi", &mut self.norm_mean_phi),
            ("associated_energy", &mut self.associated_energy),
            ("green_k0", &mut self.green_k0),
            ("green_local", &mut self.green_local),
        ]
    }
}

pub struct Simulation<S: GreenScalar, const OPDIM: usize> {
    replica: Replica<S, OPDIM>,
    mc: McParams,
    sweeps_done: usize,
    sweeps_done_thermalization: usize,
    sw_counter: usize,
    total_walltime_secs: u64,
    walltime_secs_last_save: u64,
    granted_walltime_secs: u64,
    jobid: String,
    started: Instant,
    stream: Option<ConfigStreamWriter>,
    series: SeriesBuffers,
}

impl<S: GreenScalar, const OPDIM: usize> Simulation<S, OPDIM> {
    pub fn new(model: ModelParams, mc: McParams) -> Result<Self> {
        let seed = match mc.rng_seed {
            Some(seed) => seed,
            None => {
                let seed = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                info!("no rng seed specified, using wall clock: {}", seed);
                seed
            }
        };
        let replica = Replica::new(model, seed)?;
        Self::assemble(replica, mc, 0, 0, 0, 0)
    }

    pub fn from_state(state: SimState<OPDIM>) -> Result<Self> {
        let replica = Replica::from_saved(
            state.model,
            state.field,
            state.ad,
            state.stats,
            state.performed_sweeps,
            state.rng,
        )?;
        info!(
            "state restored: {} thermalization and {} measurement sweeps done",
            state.sweeps_done_thermalization, state.sweeps_done
        );
        Self::assemble(
            replica,
            state.mc,
            state.sweeps_done,
            state.sweeps_done_thermalization,
            state.sw_counter,
            state.total_walltime_secs,
        )
    }

    fn assemble(
        replica: Replica<S, OPDIM>,
        mc: McParams,
        sweeps_done: usize,
        sweeps_done_thermalization: usize,
        sw_counter: usize,
        total_walltime_secs: u64,
    ) -> Result<Self> {
        let granted_walltime_secs = std::env::var("PBS_WALLTIME")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .or(mc.max_walltime_secs)
            .unwrap_or(u64::MAX);
        let jobid = std::env::var("SLURM_JOBID").unwrap_or_else(|_| "nojobid".to_string());
        info!("granted walltime: {} seconds, job id: {}", granted_walltime_secs, jobid);

        let stream = if mc.save_config_stream {
            Some(ConfigStreamWriter::new(
                Path::new("configs"),
                &replica.pars,
                true,
                true,
            )?)
        } else {
            None
        };

        Ok(Simulation {
            replica,
            mc,
            sweeps_done,
            sweeps_done_thermalization,
            sw_counter,
            total_walltime_secs,
            walltime_secs_last_save: 0,
            granted_walltime_secs,
            jobid,
            started: Instant::now(),
            stream,
            series: SeriesBuffers::default(),
        })
    }

    pub fn replica(&self) -> &Replica<S, OPDIM> {
        &self.replica
    }

    fn cur_walltime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn should_stop(&self) -> bool {
        if self
            .granted_walltime_secs
            .checked_sub(SAFETY_MINUTES * 60)
            .map(|limit| self.cur_walltime_secs() > limit)
            .unwrap_or(true)
        {
            info!(
                "granted walltime will be exceeded in less than {} minutes",
                SAFETY_MINUTES
            );
            return true;
        }
        let abort1 = PathBuf::from(format!("ABORT.{}", self.jobid));
        let abort2 = PathBuf::from(format!("../ABORT.{}", self.jobid));
        if abort1.exists() || abort2.exists() {
            info!("found abort file {}", abort1.display());
            return true;
        }
        false
    }

    /// Thermalization and measurement stages; returns how the run
    /// ended. Shutdown conditions are only checked on even sweep
    /// counts so an up/down sweep pair always completes before the
    /// state is serialized.
    pub fn run(&mut self) -> Result<RunOutcome> {
        let mut stage = if self.sweeps_done_thermalization < self.mc.thermalization {
            info!(
                "thermalization for {} sweeps...",
                self.mc.thermalization
            );
            Stage::Thermalization
        } else if self.sweeps_done < self.mc.sweeps {
            info!("measurements for {} sweeps...", self.mc.sweeps);
            Stage::Measurement
        } else {
            Stage::Finished
        };

        while stage != Stage::Finished {
            if self.sw_counter % 2 == 0 && self.should_stop() {
                info!("saving state / results and exiting gracefully");
                if stage == Stage::Measurement {
                    self.save_results()?;
                }
                self.save_state()?;
                return Ok(RunOutcome::Stopped);
            }

            match stage {
                Stage::Thermalization => {
                    self.replica
                        .run_sweep_thermalization(self.mc.green_update_type)?;
                    self.sweeps_done_thermalization += 1;
                    self.sw_counter += 1;
                    if self.sw_counter == self.mc.save_interval {
                        self.sw_counter = 0;
                        self.save_state()?;
                        info!(
                            "thermalization sweep {}: state saved",
                            self.sweeps_done_thermalization
                        );
                    }
                    if self.sweeps_done_thermalization == self.mc.thermalization {
                        info!("thermalization finished");
                        self.replica.thermalization_over();
                        self.sw_counter = 0;
                        info!("measurements for {} sweeps...", self.mc.sweeps);
                        stage = Stage::Measurement;
                    }
                }
                Stage::Measurement => {
                    self.sw_counter += 1;
                    let take_measurements = self.sw_counter % self.mc.measure_interval == 0;
                    self.replica
                        .run_sweep(self.mc.green_update_type, take_measurements)?;
                    if take_measurements {
                        self.record_measurements()?;
                    }
                    self.sweeps_done += 1;
                    if self.sw_counter == self.mc.save_interval {
                        self.sw_counter = 0;
                        self.save_results()?;
                        self.save_state()?;
                        info!("measurement sweep {}: results and state saved", self.sweeps_done);
                    }
                    if self.sweeps_done == self.mc.sweeps {
                        self.sw_counter = 0;
                        stage = Stage::Finished;
                    }
                }
                Stage::Finished => {}
            }
        }

        self.save_results()?;
        self.save_state()?;
        info!("measurements finished");
        Ok(RunOutcome::Finished)
    }

    fn record_measurements(&mut self) -> Result<()> {
        let obs = &self.replica.obs;
        self.series.norm_mean_phi.push(obs.norm_mean_phi);
        self.series.associated_energy.push(obs.associated_energy);
        if !self.replica.pars.turnoff_fermions {
            self.series.green_k0.push(obs.green_k0);
            self.series.green_local.push(obs.green_local);
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.append(&self.replica.field)?;
        }
        Ok(())
    }

    /// Append the buffered timeseries to their files and write vector
    /// observable snapshots. Best-effort output: failures are logged at
    /// the call site and do not corrupt the simulation state.
    pub fn save_results(&mut self) -> Result<()> {
        for (name, values) in self.series.entries() {
            if values.is_empty() {
                continue;
            }
            let path = format!("{}.series", name);
            let mut out = BufWriter::new(
                OpenOptions::new().create(true).append(true).open(&path)?,
            );
            for value in values.iter() {
                writeln!(out, "{:e}", value)?;
            }
            values.clear();
        }

        if !self.replica.pars.turnoff_fermions && self.replica.obs.valid {
            for (name, values) in [
                ("k_occ_x", &self.replica.obs.k_occ_x),
                ("k_occ_y", &self.replica.obs.k_occ_y),
            ] {
                let mut out = BufWriter::new(File::create(format!("{}.values", name))?);
                for value in values.iter() {
                    writeln!(out, "{:e}", value)?;
                }
            }
        }
        Ok(())
    }

    /// Serialize the full simulation state and refresh `info.dat`.
    pub fn save_state(&mut self) -> Result<()> {
        let cwts = self.cur_walltime_secs();
        self.total_walltime_secs += cwts - self.walltime_secs_last_save;
        self.walltime_secs_last_save = cwts;

        let state = SimState {
            version: STATE_FORMAT_VERSION,
            model: self.replica.pars.clone(),
            mc: self.mc.clone(),
            field: self.replica.field.clone(),
            ad: self.replica.ad.clone(),
            stats: self.replica.stats.clone(),
            performed_sweeps: self.replica.performed_sweeps,
            sweeps_done: self.sweeps_done,
            sweeps_done_thermalization: self.sweeps_done_thermalization,
            sw_counter: self.sw_counter,
            total_walltime_secs: self.total_walltime_secs,
            rng: self.replica.rng.clone(),
        };
        state.save(Path::new(&self.mc.state_file))?;

        let current = vec![
            (
                "sweeps_done_thermalization".to_string(),
                self.sweeps_done_thermalization.to_string(),
            ),
            ("sweeps_done".to_string(), self.sweeps_done.to_string()),
            (
                "total_walltime_secs".to_string(),
                self.total_walltime_secs.to_string(),
            ),
        ];
        write_info_file(
            Path::new("info.dat"),
            &self.replica.pars.metadata(),
            &self.mc.metadata(),
            &current,
        )?;
        Ok(())
    }
}
