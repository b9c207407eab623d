//! Post-run hooks.

use crate::runner::{OutputLine, RunnerConfig, StageContext, StageExecutor};
use async_trait::async_trait;
use keel_core::pipeline::{PipelineSpec, PostActions, StageSpec};
use keel_core::run::RunReport;
use keel_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Called exactly once per run, after the last stage.
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_success(&self, report: &RunReport) -> Result<()>;

    async fn on_failure(&self, report: &RunReport) -> Result<()>;
}

pub struct NoopHooks;

#[async_trait]
impl RunHooks for NoopHooks {
    async fn on_success(&self, _report: &RunReport) -> Result<()> {
        Ok(())
    }

    async fn on_failure(&self, _report: &RunReport) -> Result<()> {
        Ok(())
    }
}

/// Runs the pipeline's `post.success` / `post.failure` commands.
///
/// The commands see the pipeline environment plus `KEEL_PIPELINE_STATUS`
/// and, on failure, `KEEL_FAILED_STAGE`. They never receive credentials.
pub struct PostCommandHooks {
    executor: Arc<dyn StageExecutor>,
    post: PostActions,
    environment: BTreeMap<String, String>,
    workspace: PathBuf,
    timeout: Duration,
    output_tx: Option<mpsc::Sender<OutputLine>>,
}

impl PostCommandHooks {
    pub fn new(executor: Arc<dyn StageExecutor>, spec: &PipelineSpec, config: &RunnerConfig) -> Self {
        Self {
            executor,
            post: spec.post().clone(),
            environment: spec.environment().clone(),
            workspace: config.workspace.clone(),
            timeout: spec.default_timeout().unwrap_or(config.default_timeout),
            output_tx: None,
        }
    }

    /// Stream hook output to `tx` as well.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    async fn run_post(&self, name: &str, command: &str, report: &RunReport) -> Result<()> {
        let stage = StageSpec::new(name, command);

        let mut environment = self.environment.clone();
        environment.insert(
            "KEEL_PIPELINE_STATUS".to_string(),
            if report.is_success() { "success" } else { "failure" }.to_string(),
        );
        if let Some(cause) = &report.failure {
            environment.insert("KEEL_FAILED_STAGE".to_string(), cause.stage().to_string());
        }

        let ctx = StageContext {
            run_id: report.run_id,
            workspace: self.workspace.clone(),
            environment,
            credentials: Vec::new(),
            timeout: self.timeout,
            cancel: CancellationToken::new(),
        };

        let tx = match &self.output_tx {
            Some(tx) => tx.clone(),
            None => mpsc::channel(1).0,
        };

        info!(hook = %name, "Running post command");
        let result = self.executor.execute(&stage, &ctx, tx).await?;
        if result.is_success() {
            Ok(())
        } else {
            warn!(hook = %name, status = ?result.status, exit_code = ?result.exit_code, "Post command failed");
            Err(Error::StageFailed {
                stage: name.to_string(),
                exit_code: result.exit_code,
            })
        }
    }
}

#[async_trait]
impl RunHooks for PostCommandHooks {
    async fn on_success(&self, report: &RunReport) -> Result<()> {
        match &self.post.success {
            Some(command) => self.run_post("post-success", command, report).await,
            None => Ok(()),
        }
    }

    async fn on_failure(&self, report: &RunReport) -> Result<()> {
        match &self.post.failure {
            Some(command) => self.run_post("post-failure", command, report).await,
            None => Ok(()),
        }
    }
}
