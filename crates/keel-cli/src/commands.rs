//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter keel.yaml
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate pipeline configuration
    Validate {
        /// Path to pipeline file
        file: Option<PathBuf>,
    },

    /// Run a pipeline locally
    Run {
        /// Path to pipeline file
        file: Option<PathBuf>,

        /// Directory stages run in
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Credentials file (YAML or JSON)
        #[arg(short, long)]
        secrets: Option<PathBuf>,

        /// Default stage timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Extra pipeline variable, KEY=VALUE
        #[arg(short, long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the JSON Schema of the pipeline file format
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}
