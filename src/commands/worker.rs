//! Implementation of the `worker` command.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::tasks::registry;

/// Arguments for the `worker` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The path to the job configuration.
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,
}

/// Runs the `worker` command.
pub fn worker(args: Args) -> Result<()> {
    let marker = blockwise_engine::worker::run_job(&args.config, &registry())?;
    info!(
        "job {id} of task `{name}` processed {n} block(s)",
        id = marker.job_id,
        name = marker.task_name,
        n = marker.blocks
    );
    Ok(())
}
