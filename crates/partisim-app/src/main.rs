use anyhow::Result;
use clap::Parser;
use partisim_app::{Cli, init_tracing, run};
use tracing::info;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    info!(backend = ?cli.backend, steps = cli.steps, "starting partisim session");
    run(&cli)?;
    Ok(())
}
