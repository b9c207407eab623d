//! Keel CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod executor;
mod handlers;


use commands::{Commands, ConfigCommands};
use config::CliConfig;
use executor::RunOptions;

#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about = "Run build-and-publish pipelines locally", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = CliConfig::load()?;

    match cli.command {
        Commands::Init { force } => {
            handlers::init(&std::env::current_dir()?, force)?;
        }
        Commands::Validate { file } => handlers::validate(file.as_deref())?,
        Commands::Run {
            file,
            workspace,
            secrets,
            timeout,
            env,
            json,
        } => {
            let options = RunOptions {
                workspace,
                secrets,
                timeout_seconds: timeout,
                variables: env,
                quiet: false,
            };
            return handlers::run_pipeline(&config, file.as_deref(), options, json).await;
        }
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
