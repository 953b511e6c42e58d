mod analysis;
mod checkpoint;
mod config;
mod engine;
mod infection;
mod manager;
mod metrics;
mod model;
mod oracle;
mod persona;
mod scheduler;
mod stats;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a new run from a freshly generated population.
    Create,

    /// Continue a run from one of its per-day checkpoints.
    Resume {
        #[arg(long)]
        run_idx: usize,

        /// Day to resume from (defaults to the latest checkpoint).
        #[arg(long)]
        day: Option<usize>,
    },

    /// Export per-run reports and summarize finished runs.
    Analyze,

    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Create => mgr.create_run()?,
        Command::Resume { run_idx, day } => mgr.resume_run(run_idx, day)?,
        Command::Analyze => mgr.analyze_sim()?,
        Command::Clean => mgr.clean_sim()?,
    }

    Ok(())
}
