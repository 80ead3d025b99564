//! Implementation of the `plan` command.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use blockwise_engine::Block;
use blockwise_engine::Blocking;
use blockwise_engine::JobGroup;
use blockwise_engine::partition_blocks;
use clap::Parser;
use serde::Serialize;

use crate::config::load;

/// Arguments for the `plan` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The shape of the volume, one extent per axis.
    #[arg(long, required = true, num_args = 1.., value_name = "EXTENT")]
    pub shape: Vec<u64>,
}

/// The plan printed by the `plan` command.
#[derive(Debug, Serialize)]
struct Plan {
    /// The number of blocks along each axis.
    blocks_per_axis: Vec<u64>,
    /// The blocks of the volume.
    blocks: Vec<Block>,
    /// The job groups of a first attempt.
    jobs: Vec<JobGroup>,
}

/// Runs the `plan` command.
pub fn plan(args: Args, config: Option<&Path>) -> Result<()> {
    let config = load(config)?;
    let blocking = Blocking::new(&args.shape, &config.block_shape, config.roi())
        .context("failed to block the volume")?;

    let plan = Plan {
        blocks_per_axis: blocking.blocks_per_axis().to_vec(),
        jobs: partition_blocks(&blocking.block_ids(), config.max_jobs),
        blocks: blocking.blocks().collect(),
    };

    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
