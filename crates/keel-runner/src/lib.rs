//! Stage execution and pipeline sequencing for Keel.

pub mod hooks;
pub mod pipeline;
pub mod runner;
pub mod shell;

pub use hooks::{NoopHooks, PostCommandHooks, RunHooks};
pub use pipeline::PipelineRunner;
pub use runner::{OutputLine, OutputStream, RunnerConfig, StageContext, StageExecutor};
pub use shell::ShellRunner;
pub use tokio_util::sync::CancellationToken;
