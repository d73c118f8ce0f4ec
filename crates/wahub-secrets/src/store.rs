//! The TTL-cached secret store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{SecretsError, SecretsResult};
use crate::provider::{EnvSecretProvider, SecretProvider};

/// Well-known secret names.
pub mod names {
    /// Proxy vendor zone password.
    pub const PROXY_PASSWORD: &str = "PROXY_PASSWORD";
    /// 32-byte session backup encryption key (hex encoded).
    pub const SESSION_ENCRYPTION_KEY: &str = "SESSION_ENCRYPTION_KEY";
    /// API key for the LLM-backed country fallback oracle.
    pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
}

/// Default time a resolved secret stays cached.
const DEFAULT_TTL: Duration = Duration::from_secs(600);

struct CachedSecret {
    value: String,
    fetched_at: Instant,
}

/// Lazily resolving, TTL-cached secret store.
pub struct SecretStore {
    backend: Arc<dyn SecretProvider>,
    fallback: EnvSecretProvider,
    cache: DashMap<String, CachedSecret>,
    ttl: Duration,
}

impl SecretStore {
    /// Create a store over the given backend with the default TTL.
    #[must_use]
    pub fn new(backend: Arc<dyn SecretProvider>) -> Self {
        Self::with_ttl(backend, DEFAULT_TTL)
    }

    /// Create a store with an explicit cache TTL.
    #[must_use]
    pub fn with_ttl(backend: Arc<dyn SecretProvider>, ttl: Duration) -> Self {
        Self {
            backend,
            fallback: EnvSecretProvider,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve a secret, consulting the cache, the backend, and finally the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::NotFound`] when no tier has a value and
    /// [`SecretsError::Placeholder`] when the resolved value is not a real
    /// credential. Backend failures fall through to the environment and
    /// only surface if that tier also has nothing.
    pub async fn get(&self, name: &str) -> SecretsResult<String> {
        if let Some(cached) = self.cache.get(name)
            && cached.fetched_at.elapsed() < self.ttl
        {
            return Ok(cached.value.clone());
        }

        let resolved = match self.backend.fetch(name).await {
            Ok(value) => value,
            Err(e) => {
                warn!(secret = name, backend = self.backend.name(), error = %e,
                    "Secret backend failed, falling back to environment");
                None
            }
        };

        let value = match resolved {
            Some(value) => value,
            None => self
                .fallback
                .fetch(name)
                .await?
                .ok_or_else(|| SecretsError::NotFound(name.to_string()))?,
        };

        if is_placeholder(&value) {
            return Err(SecretsError::Placeholder(name.to_string()));
        }

        debug!(secret = name, "Secret resolved");
        self.cache.insert(
            name.to_string(),
            CachedSecret {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Resolve every listed secret, failing on the first missing or
    /// placeholder value. Called at startup before any component that
    /// depends on credentials is constructed.
    ///
    /// # Errors
    ///
    /// See [`Self::get`].
    pub async fn require_valid(&self, secret_names: &[&str]) -> SecretsResult<()> {
        for name in secret_names {
            self.get(name).await?;
        }
        Ok(())
    }

    /// Drop a cached value so the next [`Self::get`] re-resolves it.
    pub fn invalidate(&self, name: &str) {
        self.cache.remove(name);
    }

    /// Drop all cached values.
    pub fn teardown(&self) {
        self.cache.clear();
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("backend", &self.backend.name())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

/// Detect values that are clearly not real credentials.
fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    lower == "changeme"
        || lower == "change-me"
        || lower == "placeholder"
        || lower == "todo"
        || lower == "xxx"
        || (lower.starts_with('<') && lower.ends_with('>'))
        || (lower.starts_with("your") && lower.ends_with("here"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticSecretProvider;

    #[tokio::test]
    async fn test_resolves_from_backend() {
        let backend = StaticSecretProvider::new().with("PROXY_PASSWORD", "s3cret");
        let store = SecretStore::new(Arc::new(backend));
        assert_eq!(store.get("PROXY_PASSWORD").await.unwrap(), "s3cret");
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_found() {
        let store = SecretStore::new(Arc::new(StaticSecretProvider::new()));
        let err = store.get("NO_SUCH_SECRET_WAHUB_TEST").await.unwrap_err();
        assert!(matches!(err, SecretsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_placeholder_rejected() {
        for bad in ["", "changeme", "your-key-here", "<insert key>", "TODO"] {
            let backend = StaticSecretProvider::new().with("K", bad);
            let store = SecretStore::new(Arc::new(backend));
            let err = store.get("K").await.unwrap_err();
            assert!(matches!(err, SecretsError::Placeholder(_)), "value {bad:?}");
        }
    }

    #[tokio::test]
    async fn test_cache_serves_until_invalidated() {
        let backend = StaticSecretProvider::new().with("K", "v1");
        let store = SecretStore::new(Arc::new(backend));
        assert_eq!(store.get("K").await.unwrap(), "v1");

        // The cache answers even though the backend would still say v1
        store.cache.insert(
            "K".to_string(),
            CachedSecret {
                value: "cached".to_string(),
                fetched_at: Instant::now(),
            },
        );
        assert_eq!(store.get("K").await.unwrap(), "cached");

        store.invalidate("K");
        assert_eq!(store.get("K").await.unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_expired_cache_refetches() {
        let backend = StaticSecretProvider::new().with("K", "fresh");
        let store = SecretStore::with_ttl(Arc::new(backend), Duration::from_secs(0));
        assert_eq!(store.get("K").await.unwrap(), "fresh");
        // TTL zero: every get goes to the backend again
        assert_eq!(store.get("K").await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_require_valid_fails_fast() {
        let backend = StaticSecretProvider::new()
            .with("GOOD", "value")
            .with("BAD", "changeme");
        let store = SecretStore::new(Arc::new(backend));
        let err = store.require_valid(&["GOOD", "BAD"]).await.unwrap_err();
        assert!(matches!(err, SecretsError::Placeholder(name) if name == "BAD"));
    }
}
