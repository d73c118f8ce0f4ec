//! Secret backends.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::SecretsResult;

/// A backend that can resolve secret values by name.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// The backend name, for logs.
    fn name(&self) -> &str;

    /// Fetch a secret. `Ok(None)` means the backend has no value for the
    /// name; the store will then try the environment.
    async fn fetch(&self, name: &str) -> SecretsResult<Option<String>>;
}

/// A provider backed by the process environment.
///
/// Used both as the default backend and as the store's fallback tier.
#[derive(Debug, Default)]
pub struct EnvSecretProvider;

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn fetch(&self, name: &str) -> SecretsResult<Option<String>> {
        Ok(std::env::var(name).ok())
    }
}

/// A deterministic in-memory provider for tests.
#[derive(Debug, Default)]
pub struct StaticSecretProvider {
    values: HashMap<String, String>,
}

impl StaticSecretProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, name: &str) -> SecretsResult<Option<String>> {
        Ok(self.values.get(name).cloned())
    }
}
