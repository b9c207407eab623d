//! Sequencing, fail-fast, hooks and cancellation for `PipelineRunner`.

use async_trait::async_trait;
use chrono::Utc;
use keel_core::pipeline::{CredentialKind, CredentialRef, PipelineSpec, StageSpec};
use keel_core::run::{
    ExecutionResult, FailureCause, PipelineState, PipelineStatus, RunReport, StageStatus,
};
use keel_core::secrets::CredentialMaterial;
use keel_runner::{
    CancellationToken, OutputLine, PipelineRunner, PostCommandHooks, RunHooks, RunnerConfig,
    ShellRunner, StageContext, StageExecutor,
};
use keel_secrets::{ChainResolver, StaticProvider};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Returns a preset status per stage and records what it was asked to run.
#[derive(Default)]
struct ScriptedExecutor {
    outcomes: HashMap<String, StageStatus>,
    attempted: Mutex<Vec<String>>,
    seen_env: Mutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    fn new(outcomes: &[(&str, StageStatus)]) -> Self {
        Self {
            outcomes: outcomes
                .iter()
                .map(|(name, status)| (name.to_string(), *status))
                .collect(),
            ..Default::default()
        }
    }

    fn attempted(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        stage: &StageSpec,
        ctx: &StageContext,
        _output_tx: mpsc::Sender<OutputLine>,
    ) -> keel_core::Result<ExecutionResult> {
        self.attempted.lock().unwrap().push(stage.name.clone());
        self.seen_env
            .lock()
            .unwrap()
            .extend(ctx.process_env(stage));

        let status = self
            .outcomes
            .get(&stage.name)
            .copied()
            .unwrap_or(StageStatus::Succeeded);
        let exit_code = match status {
            StageStatus::Succeeded => Some(0),
            StageStatus::Failed => Some(1),
            _ => None,
        };
        Ok(ExecutionResult::new(
            &stage.name,
            status,
            exit_code,
            String::new(),
            Utc::now(),
        ))
    }
}

#[derive(Default)]
struct CountingHooks {
    success: AtomicUsize,
    failure: AtomicUsize,
}

#[async_trait]
impl RunHooks for CountingHooks {
    async fn on_success(&self, _report: &RunReport) -> keel_core::Result<()> {
        self.success.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_failure(&self, _report: &RunReport) -> keel_core::Result<()> {
        self.failure.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn four_stages() -> PipelineSpec {
    PipelineSpec::builder("java-app")
        .stage(StageSpec::new("clone", "git clone repo ."))
        .stage(StageSpec::new("build", "mvn -B package"))
        .stage(StageSpec::new("image-build", "docker build -t app ."))
        .stage(StageSpec::new("push", "docker push app"))
        .build()
        .unwrap()
}

fn empty_resolver() -> Arc<ChainResolver> {
    Arc::new(ChainResolver::new())
}

fn runner(
    executor: Arc<ScriptedExecutor>,
    hooks: Arc<CountingHooks>,
) -> PipelineRunner {
    PipelineRunner::new(executor, empty_resolver(), RunnerConfig::default()).with_hooks(hooks)
}

#[tokio::test]
async fn test_all_stages_succeed() {
    let executor = Arc::new(ScriptedExecutor::default());
    let hooks = Arc::new(CountingHooks::default());
    let runner = runner(executor.clone(), hooks.clone());

    let report = runner.run(&four_stages(), CancellationToken::new()).await;

    assert_eq!(report.status, PipelineStatus::Success);
    assert_eq!(report.results.len(), 4);
    assert!(report.skipped.is_empty());
    assert!(report.failure.is_none());
    assert_eq!(hooks.success.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.failure.load(Ordering::SeqCst), 0);
    assert_eq!(
        runner.state(),
        PipelineState::Completed {
            status: PipelineStatus::Success
        }
    );
}

#[tokio::test]
async fn test_second_stage_failure_stops_pipeline() {
    let executor = Arc::new(ScriptedExecutor::new(&[("build", StageStatus::Failed)]));
    let hooks = Arc::new(CountingHooks::default());
    let runner = runner(executor.clone(), hooks.clone());

    let report = runner.run(&four_stages(), CancellationToken::new()).await;

    assert_eq!(report.status, PipelineStatus::Failure);
    assert_eq!(executor.attempted(), vec!["clone", "build"]);
    assert_eq!(report.skipped, vec!["image-build", "push"]);
    assert_eq!(
        report.failure,
        Some(FailureCause::StageFailed {
            stage: "build".to_string(),
            exit_code: Some(1)
        })
    );
    assert_eq!(hooks.success.load(Ordering::SeqCst), 0);
    assert_eq!(hooks.failure.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_push_failure_breakdown() {
    let executor = Arc::new(ScriptedExecutor::new(&[("push", StageStatus::Failed)]));
    let hooks = Arc::new(CountingHooks::default());
    let report = runner(executor, hooks)
        .run(&four_stages(), CancellationToken::new())
        .await;

    assert_eq!(
        report.statuses(),
        vec![
            StageStatus::Succeeded,
            StageStatus::Succeeded,
            StageStatus::Succeeded,
            StageStatus::Failed
        ]
    );
    assert_eq!(report.status, PipelineStatus::Failure);
    assert!(report.clone().into_result().is_err());
}

#[tokio::test]
async fn test_timeout_is_fatal() {
    let executor = Arc::new(ScriptedExecutor::new(&[("build", StageStatus::TimedOut)]));
    let hooks = Arc::new(CountingHooks::default());
    let spec = PipelineSpec::builder("slow")
        .stage(StageSpec::new("build", "mvn package").with_timeout(Duration::from_secs(42)))
        .stage(StageSpec::new("push", "docker push"))
        .build()
        .unwrap();

    let report = runner(executor.clone(), hooks).run(&spec, CancellationToken::new()).await;

    assert_eq!(
        report.failure,
        Some(FailureCause::StageTimedOut {
            stage: "build".to_string(),
            seconds: 42
        })
    );
    assert_eq!(executor.attempted(), vec!["build"]);
}

#[tokio::test]
async fn test_best_effort_failure_continues() {
    let executor = Arc::new(ScriptedExecutor::new(&[("lint", StageStatus::Failed)]));
    let hooks = Arc::new(CountingHooks::default());
    let spec = PipelineSpec::builder("app")
        .stage(StageSpec::new("lint", "mvn checkstyle:check").best_effort())
        .stage(StageSpec::new("build", "mvn package"))
        .build()
        .unwrap();

    let report = runner(executor.clone(), hooks.clone())
        .run(&spec, CancellationToken::new())
        .await;

    assert_eq!(executor.attempted(), vec!["lint", "build"]);
    assert_eq!(report.statuses(), vec![StageStatus::Failed, StageStatus::Succeeded]);
    assert_eq!(report.status, PipelineStatus::Success);
    assert_eq!(hooks.success.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_credential_aborts_before_stage() {
    let executor = Arc::new(ScriptedExecutor::default());
    let hooks = Arc::new(CountingHooks::default());
    let spec = PipelineSpec::builder("app")
        .stage(StageSpec::new("build", "mvn package"))
        .stage(
            StageSpec::new("push", "docker push")
                .with_credential(CredentialRef::new("registry", CredentialKind::UsernamePassword)),
        )
        .build()
        .unwrap();

    let report = runner(executor.clone(), hooks.clone())
        .run(&spec, CancellationToken::new())
        .await;

    assert_eq!(executor.attempted(), vec!["build"]);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.skipped, vec!["push"]);
    assert_eq!(
        report.failure,
        Some(FailureCause::CredentialNotFound {
            stage: "push".to_string(),
            credential: "registry".to_string()
        })
    );
    assert_eq!(hooks.failure.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_credentials_reach_only_their_stage() {
    let executor = Arc::new(ScriptedExecutor::default());
    let resolver = Arc::new(ChainResolver::new().with_provider(Arc::new(
        StaticProvider::new().with("registry", CredentialMaterial::token("tok-xyz")),
    )));
    let spec = PipelineSpec::builder("app")
        .stage(StageSpec::new("build", "mvn package"))
        .stage(
            StageSpec::new("push", "docker push")
                .with_credential(CredentialRef::new("registry", CredentialKind::Token)),
        )
        .build()
        .unwrap();

    let runner = PipelineRunner::new(executor.clone(), resolver, RunnerConfig::default());
    let report = runner.run(&spec, CancellationToken::new()).await;
    assert!(report.is_success());

    let env = executor.seen_env.lock().unwrap().clone();
    let registry_bindings: Vec<_> = env.iter().filter(|(k, _)| k == "REGISTRY").collect();
    assert_eq!(registry_bindings.len(), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let executor = Arc::new(ScriptedExecutor::default());
    let hooks = Arc::new(CountingHooks::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = runner(executor.clone(), hooks.clone())
        .run(&four_stages(), cancel)
        .await;

    assert!(executor.attempted().is_empty());
    assert_eq!(report.skipped.len(), 4);
    assert_eq!(
        report.failure,
        Some(FailureCause::StageCancelled {
            stage: "clone".to_string()
        })
    );
    assert_eq!(hooks.failure.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let executor = Arc::new(ScriptedExecutor::default());
    let hooks = Arc::new(CountingHooks::default());
    let runner = runner(executor, hooks);
    let mut rx = runner.subscribe();
    assert_eq!(*rx.borrow_and_update(), PipelineState::Pending);

    runner.run(&four_stages(), CancellationToken::new()).await;

    assert!(rx.has_changed().unwrap());
    assert!(rx.borrow_and_update().is_terminal());
}

// Real processes from here on.

fn shell_runner(workspace: &std::path::Path) -> (Arc<ShellRunner>, RunnerConfig) {
    let config = RunnerConfig::default().with_workspace(workspace);
    (Arc::new(ShellRunner::new(config.clone())), config)
}

#[tokio::test]
async fn test_end_to_end_push_failure() {
    let workspace = tempfile::tempdir().unwrap();
    let (executor, config) = shell_runner(workspace.path());
    let resolver = Arc::new(ChainResolver::new().with_provider(Arc::new(
        StaticProvider::new().with(
            "registry",
            CredentialMaterial::username_password("ci-bot", "pa55-w0rd-e2e"),
        ),
    )));

    let spec = PipelineSpec::builder("java-app")
        .env("IMAGE", "registry.local/java-app")
        .stage(StageSpec::new("clone", "mkdir src && echo cloned"))
        .stage(StageSpec::new("build", "test -d src && echo built > app.jar"))
        .stage(StageSpec::new("image-build", "test -f app.jar && echo \"built ${{ IMAGE }}\""))
        .stage(
            StageSpec::new("push", "echo \"login $REGISTRY_USR $REGISTRY_PSW\"; exit 7")
                .with_credential(CredentialRef::new("registry", CredentialKind::UsernamePassword)),
        )
        .build()
        .unwrap();

    let runner = PipelineRunner::new(executor, resolver, config);
    let (tx, mut rx) = mpsc::channel(64);
    let report = runner
        .run_with_output(&spec, CancellationToken::new(), tx)
        .await;
    drop(runner);

    assert_eq!(
        report.statuses(),
        vec![
            StageStatus::Succeeded,
            StageStatus::Succeeded,
            StageStatus::Succeeded,
            StageStatus::Failed
        ]
    );
    assert_eq!(report.status, PipelineStatus::Failure);

    let push = report.result("push").unwrap();
    assert_eq!(push.exit_code, Some(7));
    assert_eq!(push.output, "login ci-bot ****");
    assert_eq!(
        report.result("image-build").unwrap().output,
        "built registry.local/java-app"
    );

    let mut streamed = Vec::new();
    while let Ok(line) = rx.try_recv() {
        streamed.push(line);
    }
    assert!(streamed.iter().any(|l| l.stage == "clone" && l.content == "cloned"));
    assert!(streamed.iter().all(|l| !l.content.contains("pa55-w0rd-e2e")));
}

#[tokio::test]
async fn test_post_command_hooks_run_matching_command() {
    let workspace = tempfile::tempdir().unwrap();
    let (executor, config) = shell_runner(workspace.path());

    let spec = PipelineSpec::builder("app")
        .stage(StageSpec::new("build", "exit 2"))
        .on_success("echo ok > post.txt")
        .on_failure("echo \"$KEEL_PIPELINE_STATUS $KEEL_FAILED_STAGE\" > post.txt")
        .build()
        .unwrap();

    let hooks = Arc::new(PostCommandHooks::new(executor.clone(), &spec, &config));
    let runner = PipelineRunner::new(executor, empty_resolver(), config).with_hooks(hooks);
    let report = runner.run(&spec, CancellationToken::new()).await;

    assert_eq!(report.status, PipelineStatus::Failure);
    let post = std::fs::read_to_string(workspace.path().join("post.txt")).unwrap();
    assert_eq!(post.trim(), "failure build");
}

#[tokio::test]
async fn test_failing_post_command_keeps_success_status() {
    let workspace = tempfile::tempdir().unwrap();
    let (executor, config) = shell_runner(workspace.path());

    let spec = PipelineSpec::builder("app")
        .stage(StageSpec::new("build", "echo built"))
        .stage(StageSpec::new("push", "echo pushed"))
        .on_success("touch post-ran; exit 3")
        .build()
        .unwrap();

    let hooks = Arc::new(PostCommandHooks::new(executor.clone(), &spec, &config));
    let runner = PipelineRunner::new(executor, empty_resolver(), config).with_hooks(hooks);
    let report = runner.run(&spec, CancellationToken::new()).await;

    assert!(workspace.path().join("post-ran").exists());
    assert_eq!(report.status, PipelineStatus::Success);
    assert_eq!(report.failure, None);
    assert_eq!(
        runner.state(),
        PipelineState::Completed {
            status: PipelineStatus::Success
        }
    );
}

#[tokio::test]
async fn test_cancellation_stops_running_stage() {
    let workspace = tempfile::tempdir().unwrap();
    let (executor, config) = shell_runner(workspace.path());
    let spec = PipelineSpec::builder("app")
        .stage(StageSpec::new("hang", "sleep 30"))
        .stage(StageSpec::new("after", "touch after.txt"))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let runner = PipelineRunner::new(executor, empty_resolver(), config);
    let report = runner.run(&spec, cancel).await;

    assert_eq!(report.statuses(), vec![StageStatus::Cancelled]);
    assert_eq!(report.skipped, vec!["after"]);
    assert!(!workspace.path().join("after.txt").exists());
}
