//! Implementation of the `status` command.

use std::path::Path;

use anyhow::Result;
use anyhow::bail;
use blockwise_engine::layout::TaskLayout;
use blockwise_engine::marker::MarkerStore;
use clap::Parser;
use colored::Colorize;

use crate::config::load;

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The name of the task.
    #[arg(long, value_name = "NAME")]
    pub task: String,

    /// The identifier of the task instance.
    #[arg(long, value_name = "ID")]
    pub identifier: Option<String>,

    /// The attempt to report on.
    ///
    /// Defaults to the latest attempt.
    #[arg(long, value_name = "N")]
    pub attempt: Option<u32>,
}

/// Runs the `status` command.
pub fn status(args: Args, config: Option<&Path>) -> Result<()> {
    let config = load(config)?;
    let layout = TaskLayout::new(&config.tmp_folder, &args.task, args.identifier);
    let task_id = layout.task_id();

    if layout.completion_log().exists() {
        println!("task `{task_id}` is {done}", done = "complete".green().bold());
    }

    let attempts = layout.attempts()?;
    let attempt = match (args.attempt, attempts.last()) {
        (Some(attempt), _) if attempts.contains(&attempt) => attempt,
        (Some(attempt), _) => bail!("task `{task_id}` has no attempt {attempt}"),
        (None, Some(latest)) => *latest,
        (None, None) => {
            println!("task `{task_id}` has not been run");
            return Ok(());
        }
    };

    let attempt = layout.attempt(attempt);
    let markers = MarkerStore::new(attempt.markers_dir(), layout.task_name());
    let ids = attempt.job_ids()?;
    let finished = ids.iter().filter(|id| markers.exists(**id)).count();

    println!(
        "attempt {n} of task `{task_id}`: {finished} of {total} job(s) finished",
        n = attempt.attempt(),
        total = ids.len()
    );

    for id in ids {
        let status = match markers.read(id)? {
            Some(marker) if marker.leader => format!("{} (leader)", "finished".green()),
            Some(_) => "finished".green().to_string(),
            None => "pending".yellow().to_string(),
        };
        println!("  job {id}: {status}");
    }

    Ok(())
}
