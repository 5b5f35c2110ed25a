use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::RetryConfig;
use crate::errors::{EngineError, EngineResult};
use crate::types::{Address, Bytes, ResolvedVerifier, VerifierRequirement};

/// Resolves an identity lookup string to a verifier (e.g. an eth address)
/// for a given algorithm. The backing implementation may consult remote
/// nodes; this trait is the seam the engine depends on.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_verifier(
        &self,
        lookup: &str,
        algorithm: &str,
        verifier_type: &str,
    ) -> EngineResult<String>;
}

/// Key management seam. Resolution maps an identifier to a key handle plus
/// its public verifier; signing happens against the handle so raw key
/// material never crosses this boundary.
#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn resolve_key(
        &self,
        identifier: &str,
        algorithm: &str,
        verifier_type: &str,
    ) -> EngineResult<KeyMapping>;

    async fn sign(
        &self,
        key: &KeyMapping,
        payload_type: &str,
        payload: &[u8],
    ) -> EngineResult<Bytes>;

    async fn resolve_eth_address(&self, identifier: &str) -> EngineResult<Address>;
}

#[derive(Clone, Debug)]
pub struct KeyMapping {
    pub identifier: String,
    pub key_handle: String,
    pub verifier: String,
}

/// Read-mostly cache in front of an [`IdentityResolver`]. Verifier bindings
/// are stable for the lifetime of a network identity, so entries are never
/// evicted.
pub struct CachingIdentityResolver {
    inner: Arc<dyn IdentityResolver>,
    cache: RwLock<HashMap<(String, String, String), String>>,
}

impl CachingIdentityResolver {
    pub fn new(inner: Arc<dyn IdentityResolver>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(
        &self,
        lookup: &str,
        algorithm: &str,
        verifier_type: &str,
    ) -> EngineResult<String> {
        let key = (
            lookup.to_string(),
            algorithm.to_string(),
            verifier_type.to_string(),
        );
        if let Some(found) = self.cache.read().get(&key) {
            return Ok(found.clone());
        }
        let verifier = self
            .inner
            .resolve_verifier(lookup, algorithm, verifier_type)
            .await?;
        self.cache.write().insert(key, verifier.clone());
        Ok(verifier)
    }

    /// Resolves one requirement with bounded retries, surfacing
    /// `VerifierUnreachable` once the budget is spent.
    pub async fn resolve_with_retry(
        &self,
        requirement: &VerifierRequirement,
        retry: &RetryConfig,
    ) -> EngineResult<ResolvedVerifier> {
        let mut last_err = None;
        for attempt in 0..retry.max_attempts {
            match self
                .resolve(
                    &requirement.lookup,
                    &requirement.algorithm,
                    &requirement.verifier_type,
                )
                .await
            {
                Ok(verifier) => {
                    return Ok(ResolvedVerifier {
                        lookup: requirement.lookup.clone(),
                        algorithm: requirement.algorithm.clone(),
                        verifier_type: requirement.verifier_type.clone(),
                        verifier,
                    });
                }
                Err(err) if err.is_transient() => {
                    warn!(lookup = %requirement.lookup, attempt, %err, "verifier resolution retry");
                    last_err = Some(err);
                    tokio::time::sleep(retry.delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(EngineError::VerifierUnreachable(format!(
            "{} ({})",
            requirement.lookup,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl IdentityResolver for CountingResolver {
        async fn resolve_verifier(
            &self,
            lookup: &str,
            _algorithm: &str,
            _verifier_type: &str,
        ) -> EngineResult<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(EngineError::Transient("resolver offline".into()));
            }
            Ok(format!("0xverifier-{lookup}"))
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            factor: 1.0,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn caches_resolved_verifiers() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let resolver = CachingIdentityResolver::new(inner.clone());
        let first = resolver.resolve("alice@node1", "ecdsa", "eth").await.unwrap();
        let second = resolver.resolve("alice@node1", "ecdsa", "eth").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let resolver = CachingIdentityResolver::new(inner);
        let requirement = VerifierRequirement {
            lookup: "bob@node2".into(),
            algorithm: "ecdsa".into(),
            verifier_type: "eth".into(),
        };
        let resolved = resolver
            .resolve_with_retry(&requirement, &fast_retry())
            .await
            .unwrap();
        assert_eq!(resolved.verifier, "0xverifier-bob@node2");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unreachable() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        let resolver = CachingIdentityResolver::new(inner);
        let requirement = VerifierRequirement {
            lookup: "carol@node3".into(),
            algorithm: "ecdsa".into(),
            verifier_type: "eth".into(),
        };
        let err = resolver
            .resolve_with_retry(&requirement, &fast_retry())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::VerifierUnreachable(_)));
    }
}
