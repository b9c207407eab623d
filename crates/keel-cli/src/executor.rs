//! Local pipeline execution.
//!
//! Wires the shell executor, the credential chain and the post hooks into a
//! [`PipelineRunner`], and prints stage transitions and output as they arrive.

use crate::config::CliConfig;
use console::style;
use keel_core::Error;
use keel_core::pipeline::PipelineSpec;
use keel_core::run::{PipelineState, RunReport, StageStatus};
use keel_secrets::{ChainResolver, EnvProvider, FileProvider};
use keel_runner::{
    CancellationToken, OutputLine, OutputStream, PipelineRunner, PostCommandHooks, RunnerConfig,
    ShellRunner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Pipeline file locations checked, in order, when no path is given.
pub const PIPELINE_CANDIDATES: [&str; 4] = [
    "keel.yaml",
    "keel.yml",
    ".keel/pipeline.yaml",
    ".keel/pipeline.yml",
];

/// Options for a single local run.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub workspace: Option<PathBuf>,
    pub secrets: Option<PathBuf>,
    pub timeout_seconds: Option<u64>,
    pub variables: Vec<(String, String)>,
    pub quiet: bool,
}

/// Find the pipeline file, either the explicit path or the first candidate
/// present under `root`.
pub fn find_pipeline_file(path: Option<&Path>, root: &Path) -> Option<PathBuf> {
    if let Some(p) = path {
        return p.exists().then(|| p.to_path_buf());
    }

    PIPELINE_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.exists())
}

/// Load a pipeline, applying `--env` overrides on top of its environment.
pub fn load_pipeline(
    path: &Path,
    variables: &[(String, String)],
) -> keel_core::Result<PipelineSpec> {
    let spec = PipelineSpec::load(path)?;
    if variables.is_empty() {
        return Ok(spec);
    }

    let mut definition = spec.definition().clone();
    definition.environment.extend(variables.iter().cloned());
    PipelineSpec::new(definition)
}

/// Build the credential chain: environment first, then the credentials file.
pub async fn build_resolver(
    config: &CliConfig,
    secrets: Option<&Path>,
) -> keel_core::Result<ChainResolver> {
    let mut resolver = ChainResolver::new();
    resolver.register_provider(Arc::new(EnvProvider::new(config.env_prefix.clone())));

    if let Some(path) = secrets.or(config.secrets_file.as_deref()) {
        let provider = FileProvider::load(path).await?;
        debug!(path = %path.display(), count = provider.len(), "Loaded credentials file");
        resolver.register_provider(Arc::new(provider));
    }

    Ok(resolver)
}

/// Runner configuration from CLI config and flags.
pub fn runner_config(config: &CliConfig, options: &RunOptions) -> RunnerConfig {
    let mut runner_config = RunnerConfig::default()
        .with_default_timeout(Duration::from_secs(
            options
                .timeout_seconds
                .unwrap_or(config.default_timeout_seconds),
        ));
    runner_config.shell = config.shell.clone();

    if let Some(workspace) = options
        .workspace
        .clone()
        .or_else(|| config.workspace.clone())
    {
        runner_config = runner_config.with_workspace(workspace);
    }

    runner_config
}

/// Execute a pipeline locally until it completes or is cancelled.
pub async fn execute_pipeline(
    spec: &PipelineSpec,
    config: &CliConfig,
    options: &RunOptions,
    cancel: CancellationToken,
) -> keel_core::Result<RunReport> {
    let runner_config = runner_config(config, options);
    if !runner_config.workspace.is_dir() {
        return Err(Error::Config(format!(
            "workspace '{}' is not a directory",
            runner_config.workspace.display()
        )));
    }

    let resolver = build_resolver(config, options.secrets.as_deref()).await?;
    let executor = Arc::new(ShellRunner::new(runner_config.clone()));

    let (output_tx, output_rx) = mpsc::channel::<OutputLine>(256);
    let hooks = PostCommandHooks::new(executor.clone(), spec, &runner_config)
        .with_output(output_tx.clone());

    let runner = PipelineRunner::new(executor, Arc::new(resolver), runner_config)
        .with_hooks(Arc::new(hooks));

    if !options.quiet {
        println!(
            "\n{} Running pipeline: {}",
            style("▶").cyan().bold(),
            style(spec.name()).bold()
        );
        println!("  {} stages\n", spec.len());
    }

    let printer = tokio::spawn(print_progress(
        runner.subscribe(),
        output_rx,
        options.quiet,
    ));

    let report = runner.run_with_output(spec, cancel, output_tx).await;
    drop(runner);

    if let Err(e) = printer.await {
        warn!(error = %e, "Output printer stopped unexpectedly");
    }

    Ok(report)
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Interrupted, stopping pipeline", style("!").yellow());
            token.cancel();
        }
    });
}

async fn print_progress(
    mut state: watch::Receiver<PipelineState>,
    mut output: mpsc::Receiver<OutputLine>,
    quiet: bool,
) {
    let mut state_open = true;
    loop {
        tokio::select! {
            biased;

            line = output.recv() => match line {
                Some(line) if !quiet => print_line(&line),
                Some(_) => {}
                None => break,
            },
            changed = state.changed(), if state_open => {
                if changed.is_err() {
                    state_open = false;
                    continue;
                }
                if quiet {
                    continue;
                }
                let current = state.borrow_and_update().clone();
                if let PipelineState::Running { stage_index, stage } = current {
                    println!(
                        "{} {} {}",
                        style("━━▶").cyan(),
                        style(&stage).bold(),
                        style(format!("[{}]", stage_index + 1)).dim()
                    );
                }
            }
        }
    }
}

fn print_line(line: &OutputLine) {
    match line.stream {
        OutputStream::Stdout => println!("    {}", style(&line.content).dim()),
        OutputStream::Stderr => println!("    {}", style(&line.content).red().dim()),
    }
}

/// Print the per-stage breakdown and the final verdict.
pub fn print_summary(report: &RunReport) {
    println!();
    for (stage, status) in report.breakdown() {
        let marker = match status {
            StageStatus::Succeeded => style("✓").green(),
            StageStatus::Skipped => style("-").dim(),
            StageStatus::TimedOut | StageStatus::Cancelled => style("!").yellow(),
            _ => style("✗").red(),
        };
        let detail = match report.result(&stage) {
            Some(result) => match result.exit_code {
                Some(code) => format!(
                    "{:?}, exit {} ({:.2}s)",
                    status,
                    code,
                    result.duration_ms as f64 / 1000.0
                ),
                None => format!("{:?} ({:.2}s)", status, result.duration_ms as f64 / 1000.0),
            },
            None => format!("{:?}", status),
        };
        println!("  {} {} {}", marker, style(&stage).bold(), style(detail).dim());
    }

    println!();
    match &report.failure {
        None => println!(
            "{} Pipeline {} succeeded in {:.2}s",
            style("✓").green().bold(),
            style(&report.pipeline).bold(),
            report.duration_ms as f64 / 1000.0
        ),
        Some(cause) => println!(
            "{} Pipeline {} failed: {}",
            style("✗").red().bold(),
            style(&report.pipeline).bold(),
            Error::from(cause.clone())
        ),
    }
}
