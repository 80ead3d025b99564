//! The blockwise command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use blockwise::commands;
use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use git_testament::git_testament;
use git_testament::render_testament;
use tracing_log::AsTrace;

git_testament!(TESTAMENT);

#[derive(Subcommand)]
enum Commands {
    /// Prints the blocks of a volume and how they are grouped into jobs.
    Plan(commands::plan::Args),

    /// Runs a task over every block of a volume.
    Run(commands::run::Args),

    /// Executes a single job from its job configuration.
    ///
    /// This is invoked by the execution backends and is not usually run by
    /// hand.
    Worker(commands::worker::Args),

    /// Reports the progress of a task instance.
    Status(commands::status::Args),

    /// Displays or initializes the engine configuration.
    Config(commands::config::Args),
}

#[derive(Parser)]
#[command(author, version = render_testament!(TESTAMENT), propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// The path to the engine configuration file.
    ///
    /// Defaults to `blockwise.toml` in the working directory, if present.
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity,
}

pub async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Plan(args) => commands::plan::plan(args, config),
        Commands::Run(args) => commands::run::run(args, config).await,
        Commands::Worker(args) => commands::worker::worker(args),
        Commands::Status(args) => commands::status::status(args, config),
        Commands::Config(args) => commands::config::config(args, config),
    }
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
