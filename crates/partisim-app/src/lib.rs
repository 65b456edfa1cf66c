//! Session wiring for the partisim binary: backend selection, the external
//! command bus and the headless run loop.

pub mod cli;
pub mod session;

use std::fs::File;
use std::io::BufWriter;

use anyhow::{Context, Result};
use tracing::info;

pub use cli::{BackendKind, Cli};
pub use session::{RunSummary, Session};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Open a session from the command line, run it and optionally write the report.
pub fn run(cli: &Cli) -> Result<RunSummary> {
    let config = cli.engine_config()?;
    let mut session =
        Session::open(config, cli.selection()).context("failed to open the engine session")?;
    let summary = session
        .run_to_completion(cli.steps, cli.snapshot_every)
        .context("simulation run failed")?;
    info!(
        backend = %summary.backend,
        reached = summary.reached_step,
        commands = summary.commands_applied,
        "run finished"
    );
    if let Some(path) = &cli.report {
        let file = File::create(path)
            .with_context(|| format!("creating report file {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)
            .with_context(|| format!("writing report file {}", path.display()))?;
    }
    Ok(summary)
}
