//! Implementation of the `config` command.

use std::path::Path;

use anyhow::Result;
use blockwise_engine::Config;
use clap::Parser;
use clap::Subcommand;

use crate::config::load;

/// Arguments for the `config` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The config subcommand to run.
    #[command(subcommand)]
    command: ConfigSubcommand,
}

/// Subcommands for the `config` command.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Generates a default configuration file.
    Init,

    /// Displays the current configuration.
    Resolve,
}

/// Runs the `config` command.
pub fn config(args: Args, path: Option<&Path>) -> Result<()> {
    let config = match args.command {
        ConfigSubcommand::Init => Config::default(),
        ConfigSubcommand::Resolve => load(path)?,
    };

    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
