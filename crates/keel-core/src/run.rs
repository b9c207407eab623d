//! Run and execution result types.

use crate::ids::RunId;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded
                | StageStatus::Failed
                | StageStatus::TimedOut
                | StageStatus::Cancelled
                | StageStatus::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }
}

/// Outcome of one attempted stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stage: String,
    pub status: StageStatus,
    /// `None` when the process was killed or never started.
    pub exit_code: Option<i32>,
    /// Interleaved stdout and stderr, with secrets redacted.
    pub output: String,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn new(
        stage: impl Into<String>,
        status: StageStatus,
        exit_code: Option<i32>,
        output: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            stage: stage.into(),
            status,
            exit_code,
            output,
            duration_ms,
            started_at,
            completed_at,
        }
    }

    /// Result for a process that exited on its own.
    pub fn from_exit_code(
        stage: impl Into<String>,
        exit_code: Option<i32>,
        output: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        let status = if exit_code == Some(0) {
            StageStatus::Succeeded
        } else {
            StageStatus::Failed
        };
        Self::new(stage, status, exit_code, output, started_at)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failure,
}

/// Pipeline-level state, as observed while a run progresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PipelineState {
    Pending,
    Running { stage_index: usize, stage: String },
    Completed { status: PipelineStatus },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed { .. })
    }
}

/// Why a run ended in failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum FailureCause {
    StageFailed {
        stage: String,
        exit_code: Option<i32>,
    },
    StageTimedOut {
        stage: String,
        seconds: u64,
    },
    StageCancelled {
        stage: String,
    },
    CredentialNotFound {
        stage: String,
        credential: String,
    },
}

impl FailureCause {
    pub fn stage(&self) -> &str {
        match self {
            FailureCause::StageFailed { stage, .. }
            | FailureCause::StageTimedOut { stage, .. }
            | FailureCause::StageCancelled { stage }
            | FailureCause::CredentialNotFound { stage, .. } => stage,
        }
    }
}

impl From<FailureCause> for Error {
    fn from(cause: FailureCause) -> Self {
        match cause {
            FailureCause::StageFailed { stage, exit_code } => Error::StageFailed { stage, exit_code },
            FailureCause::StageTimedOut { stage, seconds } => Error::StageTimeout { stage, seconds },
            FailureCause::StageCancelled { stage } => Error::Cancelled { stage },
            FailureCause::CredentialNotFound { credential, .. } => {
                Error::CredentialNotFound(credential)
            }
        }
    }
}

/// Everything a single pipeline run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: PipelineStatus,
    /// One entry per attempted stage, in execution order.
    pub results: Vec<ExecutionResult>,
    /// Stages that were never attempted.
    pub skipped: Vec<String>,
    pub failure: Option<FailureCause>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }

    pub fn result(&self, stage: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    /// Per-stage breakdown covering attempted and skipped stages.
    pub fn breakdown(&self) -> Vec<(String, StageStatus)> {
        self.results
            .iter()
            .map(|r| (r.stage.clone(), r.status))
            .chain(
                self.skipped
                    .iter()
                    .map(|name| (name.clone(), StageStatus::Skipped)),
            )
            .collect()
    }

    pub fn statuses(&self) -> Vec<StageStatus> {
        self.results.iter().map(|r| r.status).collect()
    }

    /// Convert a failed run into its typed error.
    pub fn into_result(self) -> crate::Result<RunReport> {
        match (&self.status, &self.failure) {
            (PipelineStatus::Failure, Some(cause)) => Err(cause.clone().into()),
            (PipelineStatus::Failure, None) => Err(Error::Internal(format!(
                "pipeline '{}' failed without a recorded cause",
                self.pipeline
            ))),
            (PipelineStatus::Success, _) => Ok(self),
        }
    }
}
