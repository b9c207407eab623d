//! Credential provider trait and implementations.

use async_trait::async_trait;
use keel_core::Result;
use keel_core::pipeline::{CredentialKind, CredentialRef, env_var_name};
use keel_core::secrets::{CredentialMaterial, SecretValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// A source of credential material.
///
/// `Ok(None)` means the provider does not know the identifier, letting a
/// resolver move on to the next provider. `Err` means the provider itself
/// failed.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn lookup(&self, reference: &CredentialRef) -> Result<Option<CredentialMaterial>>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Reads credentials from the process environment.
///
/// For identifier `docker-hub` and prefix `KEEL_CRED_`:
/// - username/password: `KEEL_CRED_DOCKER_HUB_USR` and `KEEL_CRED_DOCKER_HUB_PSW`
/// - token: `KEEL_CRED_DOCKER_HUB`
pub struct EnvProvider {
    prefix: String,
}

impl EnvProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, id: &str) -> String {
        format!("{}{}", self.prefix, env_var_name(id))
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new("")
    }
}

#[async_trait]
impl CredentialProvider for EnvProvider {
    async fn lookup(&self, reference: &CredentialRef) -> Result<Option<CredentialMaterial>> {
        let base = self.var_name(&reference.id);
        let material = match reference.kind {
            CredentialKind::UsernamePassword => {
                let username = std::env::var(format!("{}_USR", base)).ok();
                let password = std::env::var(format!("{}_PSW", base)).ok();
                match (username, password) {
                    (Some(username), Some(password)) => {
                        Some(CredentialMaterial::username_password(username, password))
                    }
                    _ => None,
                }
            }
            CredentialKind::Token => std::env::var(&base).ok().map(CredentialMaterial::token),
        };
        Ok(material)
    }

    fn name(&self) -> &str {
        "env"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UsernamePasswordEntry {
    username: String,
    password: SecretValue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenEntry {
    token: SecretValue,
}

/// One entry of a credentials file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CredentialEntry {
    UsernamePassword(UsernamePasswordEntry),
    Token(TokenEntry),
}

impl From<CredentialEntry> for CredentialMaterial {
    fn from(entry: CredentialEntry) -> Self {
        match entry {
            CredentialEntry::UsernamePassword(UsernamePasswordEntry { username, password }) => {
                CredentialMaterial::UsernamePassword { username, password }
            }
            CredentialEntry::Token(TokenEntry { token }) => CredentialMaterial::Token(token),
        }
    }
}

/// Credentials held in memory, for tests and embedding.
#[derive(Default)]
pub struct StaticProvider {
    credentials: HashMap<String, CredentialMaterial>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, material: CredentialMaterial) -> Self {
        self.credentials.insert(id.into(), material);
        self
    }

    pub fn from_map(credentials: HashMap<String, CredentialMaterial>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn lookup(&self, reference: &CredentialRef) -> Result<Option<CredentialMaterial>> {
        Ok(self.credentials.get(&reference.id).cloned())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// File-backed credentials, for local runs.
///
/// The file maps identifiers to `{ username, password }` or `{ token }`
/// objects and is read as JSON when it has a `.json` extension, YAML
/// otherwise.
pub struct FileProvider {
    inner: StaticProvider,
}

impl FileProvider {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            keel_core::Error::CredentialProviderFailed {
                provider: "file".to_string(),
                message: format!("failed to read {}: {}", path.display(), e),
            }
        })?;

        let is_json = path.extension().is_some_and(|ext| ext == "json");
        Self::parse(&content, is_json)
    }

    fn parse(content: &str, is_json: bool) -> Result<Self> {
        let entries: HashMap<String, CredentialEntry> = if is_json {
            serde_json::from_str(content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(content).map_err(|e| e.to_string())
        }
        .map_err(|message| keel_core::Error::CredentialProviderFailed {
            provider: "file".to_string(),
            message: format!("failed to parse credentials: {}", message),
        })?;

        let credentials = entries
            .into_iter()
            .map(|(id, entry)| (id, entry.into()))
            .collect();

        Ok(Self {
            inner: StaticProvider::from_map(credentials),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.credentials.is_empty()
    }
}

#[async_trait]
impl CredentialProvider for FileProvider {
    async fn lookup(&self, reference: &CredentialRef) -> Result<Option<CredentialMaterial>> {
        self.inner.lookup(reference).await
    }

    fn name(&self) -> &str {
        "file"
    }
}
