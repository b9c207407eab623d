//! Error types for Keel.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Invalid pipeline definition: {0}")]
    Config(String),

    // Credential errors
    #[error("Credential not found: {0}")]
    CredentialNotFound(String),

    #[error("Credential provider '{provider}' failed: {message}")]
    CredentialProviderFailed { provider: String, message: String },

    // Stage errors
    #[error("Stage '{stage}' failed with exit code {exit_code:?}")]
    StageFailed {
        stage: String,
        exit_code: Option<i32>,
    },

    #[error("Stage '{stage}' timed out after {seconds} seconds")]
    StageTimeout { stage: String, seconds: u64 },

    #[error("Run cancelled during stage '{stage}'")]
    Cancelled { stage: String },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Whether the error was raised before any stage could execute.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}
