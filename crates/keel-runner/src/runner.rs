//! Core executor trait and types.

use async_trait::async_trait;
use keel_core::interpolation::Redactor;
use keel_core::pipeline::{DEFAULT_SHELL, StageSpec};
use keel_core::run::ExecutionResult;
use keel_core::secrets::ResolvedCredential;
use keel_core::{Result, RunId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Output line from stage execution, already redacted.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stage: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Everything a stage needs at execution time.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub workspace: PathBuf,
    /// Non-secret variables: pipeline environment overlaid with the stage's.
    pub environment: BTreeMap<String, String>,
    pub credentials: Vec<ResolvedCredential>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl StageContext {
    /// Redactor covering every credential resolved for this stage.
    pub fn redactor(&self) -> Redactor {
        Redactor::new(self.credentials.iter().flat_map(|c| c.secret_values()))
    }

    /// Variables to set on the child process, credentials last.
    pub fn process_env(&self, stage: &StageSpec) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("KEEL_STAGE".to_string(), stage.name.clone()));
        env.push(("KEEL_RUN_ID".to_string(), self.run_id.to_string()));
        for credential in &self.credentials {
            env.extend(credential.env_bindings());
        }
        env
    }
}

/// Runs a single stage to completion.
///
/// A non-zero exit, a timeout or a cancellation is reported through the
/// returned result's status. `Err` is reserved for failures to run the
/// stage at all, such as a missing shell.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        stage: &StageSpec,
        ctx: &StageContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<ExecutionResult>;
}

/// Configuration for stage execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub workspace: PathBuf,
    /// Timeout for stages and pipelines that do not set one.
    pub default_timeout: Duration,
    /// Shell for stages that do not name one.
    pub shell: String,
    /// How long to keep draining output after the process has exited.
    pub output_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            default_timeout: Duration::from_secs(3600), // 1 hour default
            shell: DEFAULT_SHELL.to_string(),
            output_grace: Duration::from_secs(5),
        }
    }
}

impl RunnerConfig {
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}
