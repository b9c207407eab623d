//! CLI configuration management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Timeout for stages that do not set one.
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    /// Shell for stages that do not name one.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Credentials file consulted after the environment.
    #[serde(default)]
    pub secrets_file: Option<PathBuf>,
    /// Prefix for credential environment variables.
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
    /// Default workspace; the current directory when unset.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn default_shell() -> String {
    keel_core::pipeline::DEFAULT_SHELL.to_string()
}

fn default_env_prefix() -> String {
    "KEEL_CRED_".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            shell: default_shell(),
            secrets_file: None,
            env_prefix: default_env_prefix(),
            workspace: None,
        }
    }
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, using defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| format!("Invalid config file {}: {}", path.display(), e).into())
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dirs = directories::ProjectDirs::from("dev", "keel", "keel")
            .ok_or("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "default_timeout_seconds" => {
                let seconds: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout: {}", value))?;
                if seconds == 0 {
                    return Err("Timeout must be positive".to_string());
                }
                self.default_timeout_seconds = seconds;
            }
            "shell" => self.shell = value.to_string(),
            "secrets_file" => self.secrets_file = Some(PathBuf::from(value)),
            "env_prefix" => self.env_prefix = value.to_string(),
            "workspace" => self.workspace = Some(PathBuf::from(value)),
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}
