//! Patchwright CLI — the main entry point.
//!
//! Commands:
//! - `run`         — Execute one task instance end to end
//! - `check-tools` — Validate tool bundle directories
//! - `inspect`     — Summarize a recorded trajectory file

use clap::{Parser, Subcommand};

mod commands;

use commands::check_tools::CheckToolsArgs;
use commands::inspect::InspectArgs;
use commands::run::RunArgs;

#[derive(Parser)]
#[command(
    name = "patchwright",
    about = "Patchwright — an autonomous program repair agent",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task instance against the local sandbox
    Run(RunArgs),

    /// Validate tool bundle directories without starting a run
    CheckTools(CheckToolsArgs),

    /// Summarize a recorded trajectory file
    Inspect(InspectArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::CheckTools(args) => commands::check_tools::run(args),
        Commands::Inspect(args) => commands::inspect::run(args),
    }
}
