//! Resolving credential references against a chain of providers.

use crate::providers::CredentialProvider;
use async_trait::async_trait;
use keel_core::Result;
use keel_core::pipeline::CredentialRef;
use keel_core::secrets::ResolvedCredential;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns a credential reference into secret material.
///
/// Implementations must never log or print the resolved values.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve one reference, failing with `CredentialNotFound` when no
    /// source can supply it.
    async fn resolve(&self, reference: &CredentialRef) -> Result<ResolvedCredential>;

    /// Resolve every reference, stopping at the first failure.
    async fn resolve_all(&self, references: &[CredentialRef]) -> Result<Vec<ResolvedCredential>> {
        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            resolved.push(self.resolve(reference).await?);
        }
        Ok(resolved)
    }
}

/// Consults providers in registration order; the first one that knows the
/// identifier wins.
#[derive(Default)]
pub struct ChainResolver {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&mut self, provider: Arc<dyn CredentialProvider>) {
        info!(provider = %provider.name(), "Registering credential provider");
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.register_provider(provider);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

#[async_trait]
impl CredentialResolver for ChainResolver {
    async fn resolve(&self, reference: &CredentialRef) -> Result<ResolvedCredential> {
        for provider in &self.providers {
            let Some(material) = provider.lookup(reference).await? else {
                continue;
            };

            if material.kind() != reference.kind {
                return Err(keel_core::Error::CredentialNotFound(format!(
                    "{} (provider '{}' holds a {:?} credential, stage expects {:?})",
                    reference.id,
                    provider.name(),
                    material.kind(),
                    reference.kind
                )));
            }

            debug!(credential = %reference.id, provider = %provider.name(), "Credential resolved");
            return Ok(ResolvedCredential::new(reference.clone(), material));
        }

        Err(keel_core::Error::CredentialNotFound(reference.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StaticProvider;
    use keel_core::pipeline::CredentialKind;
    use keel_core::secrets::CredentialMaterial;

    fn registry() -> CredentialRef {
        CredentialRef::new("registry", CredentialKind::UsernamePassword)
    }

    #[tokio::test]
    async fn test_resolve_from_first_provider_that_knows_id() {
        let resolver = ChainResolver::new()
            .with_provider(Arc::new(StaticProvider::new()))
            .with_provider(Arc::new(StaticProvider::new().with(
                "registry",
                CredentialMaterial::username_password("bot", "pw-second"),
            )));

        let resolved = resolver.resolve(&registry()).await.unwrap();
        assert_eq!(
            resolved.material,
            CredentialMaterial::username_password("bot", "pw-second")
        );
        assert_eq!(resolved.reference, registry());
    }

    #[tokio::test]
    async fn test_unknown_credential_not_found() {
        let resolver = ChainResolver::new().with_provider(Arc::new(StaticProvider::new()));

        let err = resolver.resolve(&registry()).await.unwrap_err();
        assert!(matches!(err, keel_core::Error::CredentialNotFound(ref id) if id == "registry"));
    }

    #[tokio::test]
    async fn test_empty_chain_not_found() {
        let err = ChainResolver::new().resolve(&registry()).await.unwrap_err();
        assert!(matches!(err, keel_core::Error::CredentialNotFound(_)));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_not_found() {
        let resolver = ChainResolver::new().with_provider(Arc::new(
            StaticProvider::new().with("registry", CredentialMaterial::token("tok")),
        ));

        let err = resolver.resolve(&registry()).await.unwrap_err();
        assert!(matches!(err, keel_core::Error::CredentialNotFound(_)));
        assert!(!err.to_string().contains("tok\""));
    }

    #[tokio::test]
    async fn test_resolve_all_stops_at_first_missing() {
        let resolver = ChainResolver::new().with_provider(Arc::new(
            StaticProvider::new().with("npm", CredentialMaterial::token("tok")),
        ));
        let refs = vec![
            CredentialRef::new("npm", CredentialKind::Token),
            CredentialRef::new("missing", CredentialKind::Token),
        ];

        let err = resolver.resolve_all(&refs).await.unwrap_err();
        assert!(matches!(err, keel_core::Error::CredentialNotFound(ref id) if id == "missing"));
    }
}
