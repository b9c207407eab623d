//! Pipeline definition types.
//!
//! [`PipelineDefinition`] mirrors the user-authored YAML file. It is only
//! ever turned into a [`PipelineSpec`] through validation, so a
//! `PipelineSpec` in hand is always well formed and is never mutated after
//! construction.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default shell used to run stage commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Raw pipeline file contents, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Default timeout applied to stages that do not set their own.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub post: PostActions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StageSpec {
    pub name: String,
    #[serde(alias = "run")]
    pub command: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub credentials: Vec<CredentialRef>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Directory relative to the workspace.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// A failing best-effort stage is recorded but does not stop the run.
    #[serde(default)]
    pub best_effort: bool,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            shell: None,
            credentials: Vec::new(),
            environment: BTreeMap::new(),
            timeout_seconds: None,
            working_dir: None,
            best_effort: false,
        }
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credentials.push(credential);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Stage timeout, falling back to `default` when unset.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    #[default]
    UsernamePassword,
    Token,
}

/// A named credential a stage needs, resolved only at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CredentialRef {
    pub id: String,
    #[serde(default)]
    pub kind: CredentialKind,
    /// Environment variable the secret is bound to.
    #[serde(default)]
    pub variable: Option<String>,
}

impl CredentialRef {
    pub fn new(id: impl Into<String>, kind: CredentialKind) -> Self {
        Self {
            id: id.into(),
            kind,
            variable: None,
        }
    }

    pub fn bind_as(mut self, variable: impl Into<String>) -> Self {
        self.variable = Some(variable.into());
        self
    }

    /// Variable name used when exposing this credential to a process.
    pub fn binding_name(&self) -> String {
        self.variable
            .clone()
            .unwrap_or_else(|| env_var_name(&self.id))
    }
}

/// Upper-case an identifier and replace characters not valid in
/// environment variable names with `_`.
pub fn env_var_name(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Commands run once after the pipeline completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PostActions {
    #[serde(default)]
    pub success: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
}

/// A validated, immutable pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PipelineDefinition", into = "PipelineDefinition")]
pub struct PipelineSpec {
    definition: PipelineDefinition,
}

impl PipelineSpec {
    /// Validate a definition.
    pub fn new(definition: PipelineDefinition) -> Result<Self> {
        validate(&definition)?;
        Ok(Self { definition })
    }

    pub fn builder(name: impl Into<String>) -> PipelineSpecBuilder {
        PipelineSpecBuilder::new(name)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse pipeline: {}", e)))?;
        Self::new(definition)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn description(&self) -> Option<&str> {
        self.definition.description.as_deref()
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> impl ExactSizeIterator<Item = &StageSpec> {
        self.definition.stages.iter()
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.definition.stages.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.definition.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.stages.is_empty()
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.definition.environment
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.definition.timeout_seconds.map(Duration::from_secs)
    }

    pub fn post(&self) -> &PostActions {
        &self.definition.post
    }

    /// Global environment overlaid with the stage's overrides.
    pub fn stage_environment(&self, stage: &StageSpec) -> BTreeMap<String, String> {
        let mut env = self.definition.environment.clone();
        env.extend(stage.environment.clone());
        env
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }
}

impl TryFrom<PipelineDefinition> for PipelineSpec {
    type Error = Error;

    fn try_from(definition: PipelineDefinition) -> Result<Self> {
        Self::new(definition)
    }
}

impl From<PipelineSpec> for PipelineDefinition {
    fn from(spec: PipelineSpec) -> Self {
        spec.definition
    }
}

/// Incremental construction of a [`PipelineSpec`].
#[derive(Debug, Clone)]
pub struct PipelineSpecBuilder {
    definition: PipelineDefinition,
}

impl PipelineSpecBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: PipelineDefinition {
                name: name.into(),
                description: None,
                environment: BTreeMap::new(),
                timeout_seconds: None,
                stages: Vec::new(),
                post: PostActions::default(),
            },
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.definition.environment.insert(key.into(), value.into());
        self
    }

    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.definition.stages.push(stage);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.definition.timeout_seconds = Some(timeout.as_secs().max(1));
        self
    }

    pub fn on_success(mut self, command: impl Into<String>) -> Self {
        self.definition.post.success = Some(command.into());
        self
    }

    pub fn on_failure(mut self, command: impl Into<String>) -> Self {
        self.definition.post.failure = Some(command.into());
        self
    }

    pub fn build(self) -> Result<PipelineSpec> {
        PipelineSpec::new(self.definition)
    }
}

fn validate(definition: &PipelineDefinition) -> Result<()> {
    if definition.name.trim().is_empty() {
        return Err(Error::Config("pipeline name must not be empty".to_string()));
    }
    if definition.stages.is_empty() {
        return Err(Error::Config(format!(
            "pipeline '{}' has no stages",
            definition.name
        )));
    }
    if definition.timeout_seconds == Some(0) {
        return Err(Error::Config(
            "pipeline timeout_seconds must be positive".to_string(),
        ));
    }
    validate_env_keys(&definition.environment, "pipeline environment")?;

    let mut seen = HashSet::new();
    for stage in &definition.stages {
        if stage.name.trim().is_empty() {
            return Err(Error::Config("stage name must not be empty".to_string()));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(Error::Config(format!("duplicate stage name '{}'", stage.name)));
        }
        if stage.command.trim().is_empty() {
            return Err(Error::Config(format!(
                "stage '{}' has an empty command",
                stage.name
            )));
        }
        if stage.timeout_seconds == Some(0) {
            return Err(Error::Config(format!(
                "stage '{}' timeout_seconds must be positive",
                stage.name
            )));
        }
        if matches!(&stage.shell, Some(shell) if shell.trim().is_empty()) {
            return Err(Error::Config(format!(
                "stage '{}' has an empty shell",
                stage.name
            )));
        }
        validate_env_keys(&stage.environment, &format!("stage '{}' environment", stage.name))?;

        for credential in &stage.credentials {
            if credential.id.trim().is_empty() {
                return Err(Error::Config(format!(
                    "stage '{}' references a credential with an empty identifier",
                    stage.name
                )));
            }
            if matches!(&credential.variable, Some(var) if var.trim().is_empty()) {
                return Err(Error::Config(format!(
                    "credential '{}' in stage '{}' has an empty variable name",
                    credential.id, stage.name
                )));
            }
        }
    }

    Ok(())
}

fn validate_env_keys(env: &BTreeMap<String, String>, scope: &str) -> Result<()> {
    for key in env.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(Error::Config(format!(
                "{} has an invalid variable name '{}'",
                scope, key
            )));
        }
    }
    Ok(())
}

/// JSON Schema of the pipeline file format.
pub fn pipeline_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(PipelineDefinition);
    serde_json::to_value(schema).unwrap_or_default()
}
