mod commands;
mod logging;
mod registry;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "rowpipe",
    version,
    about = "Streaming row pipelines: read, transform and write files"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Keep file output in memory and report what would be written
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate pipeline configuration without running it
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// List available transforms
    Transforms,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { pipeline, dry_run } => commands::run::execute(&pipeline, dry_run).await,
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Transforms => commands::transforms::execute(),
    }
}
