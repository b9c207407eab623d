//! Resolved credential material.
//!
//! Secret strings are wrapped in [`SecretValue`] so that `Debug` output,
//! and therefore any `tracing` field that formats one, never contains the
//! plaintext.

use crate::pipeline::{CredentialKind, CredentialRef};
use serde::Deserialize;
use std::fmt;

/// Placeholder substituted for secret values in captured output.
pub const REDACTED: &str = "****";

/// A secret string whose `Debug` representation is redacted.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Callers must only hand it to a child process
    /// environment or the redactor.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue({})", REDACTED)
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Secret fields for one credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialMaterial {
    UsernamePassword {
        username: String,
        password: SecretValue,
    },
    Token(SecretValue),
}

impl CredentialMaterial {
    pub fn username_password(username: impl Into<String>, password: impl Into<SecretValue>) -> Self {
        CredentialMaterial::UsernamePassword {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn token(token: impl Into<SecretValue>) -> Self {
        CredentialMaterial::Token(token.into())
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            CredentialMaterial::UsernamePassword { .. } => CredentialKind::UsernamePassword,
            CredentialMaterial::Token(_) => CredentialKind::Token,
        }
    }
}

/// A credential reference paired with the material it resolved to.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub reference: CredentialRef,
    pub material: CredentialMaterial,
}

impl ResolvedCredential {
    pub fn new(reference: CredentialRef, material: CredentialMaterial) -> Self {
        Self {
            reference,
            material,
        }
    }

    /// Environment variables that expose this credential to a stage.
    ///
    /// Username/password pairs bound as `VAR` yield `VAR_USR`, `VAR_PSW`
    /// and `VAR` (`user:password`). Tokens yield `VAR`.
    pub fn env_bindings(&self) -> Vec<(String, String)> {
        let var = self.reference.binding_name();
        match &self.material {
            CredentialMaterial::UsernamePassword { username, password } => vec![
                (format!("{}_USR", var), username.clone()),
                (format!("{}_PSW", var), password.expose().to_string()),
                (var, format!("{}:{}", username, password.expose())),
            ],
            CredentialMaterial::Token(token) => vec![(var, token.expose().to_string())],
        }
    }

    /// Every string that must be redacted from output.
    pub fn secret_values(&self) -> Vec<String> {
        match &self.material {
            CredentialMaterial::UsernamePassword { username, password } => vec![
                format!("{}:{}", username, password.expose()),
                password.expose().to_string(),
            ],
            CredentialMaterial::Token(token) => vec![token.expose().to_string()],
        }
    }
}
