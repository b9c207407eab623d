//! Shell-based stage execution on the host.

use crate::runner::{OutputLine, OutputStream, RunnerConfig, StageContext, StageExecutor};
use async_trait::async_trait;
use chrono::Utc;
use keel_core::Result;
use keel_core::interpolation::{InterpolationContext, Redactor};
use keel_core::pipeline::StageSpec;
use keel_core::run::{ExecutionResult, StageStatus};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

/// Runs stage commands through `<shell> -c` on the host.
pub struct ShellRunner {
    config: RunnerConfig,
}

enum Outcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, stage: &StageSpec, ctx: &StageContext) -> Command {
        let interpolation = InterpolationContext::new(ctx.environment.clone());
        let script = interpolation.interpolate(&stage.command);
        let work_dir = stage
            .working_dir
            .as_ref()
            .map(|dir| ctx.workspace.join(interpolation.interpolate(dir)))
            .unwrap_or_else(|| ctx.workspace.clone());
        let shell = stage.shell.as_deref().unwrap_or(&self.config.shell);

        let mut cmd = Command::new(shell);
        cmd.arg("-c")
            .arg(&script)
            .current_dir(&work_dir)
            .envs(ctx.process_env(stage))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // own process group, so a timeout can take down the whole tree
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl StageExecutor for ShellRunner {
    async fn execute(
        &self,
        stage: &StageSpec,
        ctx: &StageContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<ExecutionResult> {
        let started_at = Utc::now();
        let redactor = ctx.redactor();

        info!(
            stage = %stage.name,
            workspace = %ctx.workspace.display(),
            timeout_secs = ctx.timeout.as_secs(),
            credentials = ctx.credentials.len(),
            "Executing stage"
        );

        let mut child = self.build_command(stage, ctx).spawn()?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| keel_core::Error::Internal("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| keel_core::Error::Internal("stderr was not captured".to_string()))?;

        let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(256);
        let stdout_handle = spawn_reader(
            stdout,
            OutputStream::Stdout,
            stage.name.clone(),
            redactor.clone(),
            line_tx.clone(),
        );
        let stderr_handle = spawn_reader(
            stderr,
            OutputStream::Stderr,
            stage.name.clone(),
            redactor,
            line_tx,
        );

        // collects every line and forwards it to the caller
        let collector = tokio::spawn(async move {
            let mut captured = Vec::new();
            while let Some(line) = line_rx.recv().await {
                captured.push(line.content.clone());
                let _ = output_tx.send(line).await;
            }
            captured
        });

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?),
            _ = tokio::time::sleep(ctx.timeout) => Outcome::TimedOut,
            _ = ctx.cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::TimedOut => {
                warn!(stage = %stage.name, timeout_secs = ctx.timeout.as_secs(), "Stage timed out, killing process");
                terminate(&mut child, pid).await;
            }
            Outcome::Cancelled => {
                warn!(stage = %stage.name, "Run cancelled, killing process");
                terminate(&mut child, pid).await;
            }
            Outcome::Exited(_) => {}
        }

        let stdout_open = !drain(stdout_handle, self.config.output_grace).await;
        let stderr_open = !drain(stderr_handle, self.config.output_grace).await;
        // a detached reader means a group member still holds the pipe, so
        // the group id cannot have been reused yet
        if (stdout_open || stderr_open) && matches!(outcome, Outcome::Exited(_)) {
            warn!(stage = %stage.name, "Stage left background processes running, killing them");
            kill_group(pid);
        }
        let captured = collector
            .await
            .map_err(|e| keel_core::Error::Internal(format!("output collector failed: {}", e)))?;
        let output = captured.join("\n");

        let result = match outcome {
            Outcome::Exited(status) => {
                ExecutionResult::from_exit_code(&stage.name, status.code(), output, started_at)
            }
            Outcome::TimedOut => {
                ExecutionResult::new(&stage.name, StageStatus::TimedOut, None, output, started_at)
            }
            Outcome::Cancelled => {
                ExecutionResult::new(&stage.name, StageStatus::Cancelled, None, output, started_at)
            }
        };

        debug!(
            stage = %stage.name,
            status = ?result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Stage finished"
        );

        Ok(result)
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: OutputStream,
    stage: String,
    redactor: Redactor,
    tx: mpsc::Sender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut line_number = 0u32;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    line_number += 1;
                    let raw = String::from_utf8_lossy(&buf);
                    let content = redactor.redact(raw.trim_end_matches(['\n', '\r']));
                    let line = OutputLine {
                        stage: stage.clone(),
                        stream,
                        content,
                        line_number,
                        timestamp: Utc::now(),
                    };
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, ?stream, "Output stream closed");
                    break;
                }
            }
        }
    })
}

/// Wait for a reader to hit EOF. A background process that inherited the
/// pipe can hold it open forever, so give up after `grace`. Returns
/// `false` when the reader had to be detached.
async fn drain(handle: JoinHandle<()>, grace: Duration) -> bool {
    let abort = handle.abort_handle();
    if timeout(grace, handle).await.is_err() {
        debug!("Output still open after process exit, detaching reader");
        abort.abort();
        return false;
    }
    true
}

/// SIGKILL every process in the stage's process group.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: kill(2) only sends a signal; the group was created by
        // `process_group(0)` in `build_command`.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Kill the stage's process group and reap the child.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);

    if let Err(e) = child.kill().await {
        // already exited through the group kill; just reap it
        debug!(error = %e, "Direct kill failed, waiting for exit");
        let _ = child.wait().await;
    }
}
