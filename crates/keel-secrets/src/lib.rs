//! Credential resolution for Keel.
//!
//! Stages name the credentials they need; a [`CredentialResolver`] turns
//! those names into secret material just before the stage runs.

pub mod providers;
pub mod resolver;

pub use providers::{CredentialProvider, EnvProvider, FileProvider, StaticProvider};
pub use resolver::{ChainResolver, CredentialResolver};
