use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use partisim_core::{BackendSelection, EngineConfig, SteppingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// One worker thread per compartment.
    Cpu,
    /// Whole world resident on the GPU.
    Gpu,
}

/// Headless partisim runner.
#[derive(Debug, Clone, Parser)]
#[command(name = "partisim", version, about)]
pub struct Cli {
    /// JSON file with an `EngineConfig`; missing fields take their defaults.
    #[arg(long, env = "PARTISIM_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = BackendKind::Cpu, env = "PARTISIM_BACKEND")]
    pub backend: BackendKind,

    /// Number of compartments for the CPU backend.
    #[arg(long, default_value_t = 4, env = "PARTISIM_WORKERS")]
    pub workers: usize,

    #[arg(long, default_value_t = 100)]
    pub steps: u64,

    /// Aggregate a snapshot every N steps; 0 disables periodic snapshots.
    #[arg(long, default_value_t = 0)]
    pub snapshot_every: u64,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub entities: Option<usize>,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    /// Reflect at the world edges instead of wrapping.
    #[arg(long)]
    pub walls: bool,

    /// Let workers run ahead freely instead of pumping them.
    #[arg(long)]
    pub continuous: bool,

    #[arg(long)]
    pub max_running_threads: Option<usize>,

    #[arg(long)]
    pub worker_timeout_ms: Option<u64>,

    /// Write the run summary as JSON to this path.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl Cli {
    /// Load the config file, if any, then apply flag overrides and validate.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("opening config file {}", path.display()))?;
                serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => EngineConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.rng_seed = Some(seed);
        }
        if let Some(entities) = self.entities {
            config.initial_entities = entities;
        }
        if let Some(width) = self.width {
            config.world_width = width;
        }
        if let Some(height) = self.height {
            config.world_height = height;
        }
        if self.walls {
            config.wraparound = false;
        }
        if self.continuous {
            config.stepping = SteppingMode::Continuous;
        }
        if self.max_running_threads.is_some() {
            config.max_running_threads = self.max_running_threads;
        }
        if let Some(timeout) = self.worker_timeout_ms {
            config.per_worker_timeout_ms = timeout;
        }
        config.validate().context("invalid engine configuration")?;
        Ok(config)
    }

    #[must_use]
    pub fn selection(&self) -> BackendSelection {
        match self.backend {
            BackendKind::Cpu => BackendSelection::PartitionedCpu {
                workers: self.workers,
            },
            BackendKind::Gpu => BackendSelection::GpuResident,
        }
    }
}
