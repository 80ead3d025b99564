//! Implementation of the `run` command.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use blockwise_engine::ClusterTask;
use blockwise_engine::TaskParams;
use blockwise_engine::TaskSpec;
use clap::Parser;
use serde_json::Map;
use serde_json::Value;
use tracing::info;

use crate::config::load;
use crate::tasks::registry;

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The name of the task to run.
    #[arg(long, value_name = "NAME")]
    pub task: String,

    /// The identifier distinguishing this instance of the task.
    #[arg(long, value_name = "ID")]
    pub identifier: Option<String>,

    /// The shape of the volume, one extent per axis.
    #[arg(long, required = true, num_args = 1.., value_name = "EXTENT")]
    pub shape: Vec<u64>,

    /// The path to the input dataset container.
    #[arg(long, value_name = "PATH")]
    pub input_path: PathBuf,

    /// The key of the input dataset within its container.
    #[arg(long, value_name = "KEY")]
    pub input_key: String,

    /// The path to the output dataset container.
    #[arg(long, value_name = "PATH", requires = "output_key")]
    pub output_path: Option<PathBuf>,

    /// The key of the output dataset within its container.
    #[arg(long, value_name = "KEY", requires = "output_path")]
    pub output_key: Option<String>,

    /// A task-specific parameter as `key=value`.
    ///
    /// The value is parsed as JSON and is otherwise taken as a string.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// An artifact that must exist before the task may run.
    #[arg(long, value_name = "PATH")]
    pub dependency: Option<PathBuf>,
}

/// Parses a `key=value` task parameter.
fn parse_param(s: &str) -> Result<(String, Value)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("parameter `{s}` is not of the form `key=value`"))?;

    if key.is_empty() {
        return Err(anyhow!("parameter `{s}` has an empty key"));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Runs the `run` command.
pub async fn run(args: Args, config: Option<&Path>) -> Result<()> {
    let config = Arc::new(load(config)?);
    let registry = Arc::new(registry());
    let backend = config.create_backend(registry.clone())?;

    let params = TaskParams::builder()
        .input_path(args.input_path)
        .input_key(args.input_key)
        .maybe_output_path(args.output_path)
        .maybe_output_key(args.output_key)
        .extra(args.params.into_iter().collect::<Map<_, _>>())
        .build();

    let spec = TaskSpec::builder()
        .name(args.task)
        .maybe_identifier(args.identifier)
        .shape(args.shape)
        .params(params)
        .maybe_dependency(args.dependency)
        .build();

    let mut task = ClusterTask::new(spec, config, backend, &registry)?;
    let report = task
        .run()
        .await
        .with_context(|| format!("task `{id}` failed", id = task.task_id()))?;

    if report.skipped {
        info!("nothing to do for task `{id}`", id = report.task_id);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
