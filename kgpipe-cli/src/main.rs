//! kgpipe CLI - run and inspect the build → import → deploy pipeline.

use clap::{Parser, Subcommand};
use colored::Colorize;
use kgpipe::config::PipelineConfig;
use kgpipe::core::StageName;
use kgpipe::events::LoggingEventSink;
use kgpipe::pipeline::Orchestrator;
use kgpipe::process::{TcpProbe, TokioLauncher};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

/// Staged orchestrator for knowledge-graph pipelines.
#[derive(Parser)]
#[command(name = "kgpipe")]
#[command(author, version)]
#[command(about = "Build, import, and serve a knowledge graph over one shared volume")]
#[command(propagate_version = true)]
#[command(after_help = "Exit codes:
  0    pipeline healthy, deploy up
  10   build failed
  20   import failed
  30   deploy failed
  1    orchestrator or configuration error
  130  cancelled")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to kgpipe.toml (defaults to ./kgpipe.toml when present)
    #[arg(short, long, global = true, env = "KGPIPE_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run build, import, and deploy in sequence
    Up {
        /// Destroy and recreate the shared volume first
        #[arg(long)]
        reset: bool,

        /// Stay in the foreground and stop deploy on Ctrl-C
        #[arg(long)]
        attach: bool,
    },

    /// Show the last run record
    #[command(visible_alias = "st")]
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a stage's captured output
    Logs {
        /// Stage to show: build, import, or deploy
        stage: StageName,

        /// Only print the last N lines
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },

    /// Stop the deploy server
    Down {
        /// Also destroy the shared volume
        #[arg(long)]
        purge: bool,
    },

    /// Destroy and recreate the shared volume without running
    Reset,
}

fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<PipelineConfig> {
    let cwd = std::env::current_dir()?;
    Ok(PipelineConfig::discover(path, &cwd)?)
}

fn orchestrator(config: PipelineConfig) -> anyhow::Result<Orchestrator> {
    Ok(Orchestrator::standard(
        config,
        Arc::new(TokioLauncher::new()),
        Arc::new(TcpProbe::default()),
    )?
    .with_events(Arc::new(LoggingEventSink::debug())))
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Up { reset, attach } => commands::up::run(orchestrator(config)?, reset, attach).await,
        Commands::Status { json } => commands::status::run(&orchestrator(config)?, json).await,
        Commands::Logs { stage, tail } => commands::logs::run(&config, stage, tail),
        Commands::Down { purge } => commands::down::run(&orchestrator(config)?, purge).await,
        Commands::Reset => commands::reset::run(&orchestrator(config)?).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_up_flags() {
        let cli = Cli::try_parse_from(["kgpipe", "up", "--reset", "--attach"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Up {
                reset: true,
                attach: true
            }
        ));
    }

    #[test]
    fn test_parse_logs_stage() {
        let cli = Cli::try_parse_from(["kgpipe", "logs", "import", "-n", "5"]).unwrap();
        match cli.command {
            Commands::Logs { stage, tail } => {
                assert_eq!(stage, StageName::Import);
                assert_eq!(tail, Some(5));
            }
            _ => panic!("expected logs"),
        }
        assert!(Cli::try_parse_from(["kgpipe", "logs", "serve"]).is_err());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["kgpipe", "-v", "-q", "status"]).is_err());
    }
}
