//! Sequential, fail-fast pipeline execution.

use crate::hooks::{NoopHooks, RunHooks};
use crate::runner::{OutputLine, RunnerConfig, StageContext, StageExecutor};
use chrono::Utc;
use keel_core::RunId;
use keel_core::pipeline::{PipelineSpec, StageSpec};
use keel_core::run::{
    ExecutionResult, FailureCause, PipelineState, PipelineStatus, RunReport, StageStatus,
};
use keel_core::secrets::ResolvedCredential;
use keel_secrets::CredentialResolver;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs the stages of a pipeline one at a time, in declaration order.
///
/// The first stage that does not succeed ends the run unless it is marked
/// best-effort; later stages are reported as skipped. Exactly one of
/// [`RunHooks::on_success`] and [`RunHooks::on_failure`] is called per run.
pub struct PipelineRunner {
    executor: Arc<dyn StageExecutor>,
    resolver: Arc<dyn CredentialResolver>,
    hooks: Arc<dyn RunHooks>,
    config: RunnerConfig,
    state: watch::Sender<PipelineState>,
}

impl PipelineRunner {
    pub fn new(
        executor: Arc<dyn StageExecutor>,
        resolver: Arc<dyn CredentialResolver>,
        config: RunnerConfig,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Pending);
        Self {
            executor,
            resolver,
            hooks: Arc::new(NoopHooks),
            config,
            state,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Observe pipeline state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Run without streaming output.
    pub async fn run(&self, spec: &PipelineSpec, cancel: CancellationToken) -> RunReport {
        let (tx, _) = mpsc::channel(1);
        self.run_with_output(spec, cancel, tx).await
    }

    /// Run, streaming every redacted output line to `output_tx`.
    pub async fn run_with_output(
        &self,
        spec: &PipelineSpec,
        cancel: CancellationToken,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> RunReport {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let stages: Vec<&StageSpec> = spec.stages().collect();
        let default_timeout = spec.default_timeout().unwrap_or(self.config.default_timeout);

        info!(run_id = %run_id, pipeline = %spec.name(), stages = stages.len(), "Starting pipeline run");
        self.state.send_replace(PipelineState::Pending);

        let mut results: Vec<ExecutionResult> = Vec::new();
        let mut failure: Option<FailureCause> = None;

        for (index, stage) in stages.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                warn!(run_id = %run_id, stage = %stage.name, "Run cancelled before stage started");
                failure = Some(FailureCause::StageCancelled {
                    stage: stage.name.clone(),
                });
                break;
            }

            self.state.send_replace(PipelineState::Running {
                stage_index: index,
                stage: stage.name.clone(),
            });

            let credentials = match self.resolve_credentials(stage).await {
                Ok(credentials) => credentials,
                Err(cause) => {
                    failure = Some(cause);
                    break;
                }
            };

            let timeout = stage.timeout(default_timeout);
            let ctx = StageContext {
                run_id,
                workspace: self.config.workspace.clone(),
                environment: spec.stage_environment(stage),
                credentials,
                timeout,
                cancel: cancel.clone(),
            };

            let stage_started = Utc::now();
            let result = match self.executor.execute(stage, &ctx, output_tx.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    error!(stage = %stage.name, error = %e, "Stage could not be started");
                    ExecutionResult::new(
                        &stage.name,
                        StageStatus::Failed,
                        None,
                        ctx.redactor().redact(&format!("failed to start stage: {}", e)),
                        stage_started,
                    )
                }
            };

            info!(
                run_id = %run_id,
                stage = %stage.name,
                status = ?result.status,
                exit_code = ?result.exit_code,
                duration_ms = result.duration_ms,
                "Stage completed"
            );

            let cause = match result.status {
                StageStatus::Succeeded => None,
                StageStatus::Cancelled => Some(FailureCause::StageCancelled {
                    stage: stage.name.clone(),
                }),
                _ if stage.best_effort => {
                    warn!(stage = %stage.name, status = ?result.status, "Best-effort stage failed, continuing");
                    None
                }
                StageStatus::TimedOut => Some(FailureCause::StageTimedOut {
                    stage: stage.name.clone(),
                    seconds: timeout.as_secs(),
                }),
                _ => Some(FailureCause::StageFailed {
                    stage: stage.name.clone(),
                    exit_code: result.exit_code,
                }),
            };

            results.push(result);

            if cause.is_some() {
                failure = cause;
                break;
            }
        }

        // attempted stages always form a prefix of the declared order
        let skipped: Vec<String> = stages
            .iter()
            .skip(results.len())
            .map(|s| s.name.clone())
            .collect();

        let status = if failure.is_none() {
            PipelineStatus::Success
        } else {
            PipelineStatus::Failure
        };

        let completed_at = Utc::now();
        let report = RunReport {
            run_id,
            pipeline: spec.name().to_string(),
            status,
            results,
            skipped,
            failure,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
        };

        let hook = match status {
            PipelineStatus::Success => self.hooks.on_success(&report).await,
            PipelineStatus::Failure => self.hooks.on_failure(&report).await,
        };
        if let Err(e) = hook {
            warn!(run_id = %run_id, error = %e, "Post-run hook failed");
        }

        info!(
            run_id = %run_id,
            pipeline = %report.pipeline,
            status = ?report.status,
            duration_ms = report.duration_ms,
            "Pipeline run completed"
        );
        self.state
            .send_replace(PipelineState::Completed { status });

        report
    }

    async fn resolve_credentials(
        &self,
        stage: &StageSpec,
    ) -> Result<Vec<ResolvedCredential>, FailureCause> {
        let mut resolved = Vec::with_capacity(stage.credentials.len());
        for reference in &stage.credentials {
            match self.resolver.resolve(reference).await {
                Ok(credential) => resolved.push(credential),
                Err(e) => {
                    error!(stage = %stage.name, credential = %reference.id, error = %e, "Credential resolution failed");
                    return Err(FailureCause::CredentialNotFound {
                        stage: stage.name.clone(),
                        credential: reference.id.clone(),
                    });
                }
            }
        }
        Ok(resolved)
    }
}
