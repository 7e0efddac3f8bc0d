//! Text generation adapters
//!
//! Reflection synthesis and user profiles can call an LLM when one is
//! configured; the deterministic heuristics in the workers remain the
//! contract and generator output is best-effort. Generator instances
//! are cached per tenant and invalidated when persisted configuration
//! changes.

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::Result;
#[cfg(feature = "remote")]
use crate::error::MnemaError;

/// Trait for text generators
pub trait Generator: Send + Sync {
    /// Generate a short completion for a prompt
    fn generate(&self, prompt: &str) -> Result<String>;

    /// Adapter name for logs
    fn name(&self) -> &str;
}

/// OpenAI-compatible chat completion client
#[cfg(feature = "remote")]
pub struct RemoteGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[cfg(feature = "remote")]
impl RemoteGenerator {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    async fn generate_async(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": 160,
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|e| MnemaError::Unavailable {
                message: e.to_string(),
                retryable: true,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(MnemaError::Unavailable {
                message: format!("generator API error {}", status),
                retryable: status.is_server_error(),
            });
        }

        let data: serde_json::Value = response.json().await.map_err(|e| {
            MnemaError::Unavailable {
                message: format!("invalid generator response: {}", e),
                retryable: false,
            }
        })?;

        data["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MnemaError::Unavailable {
                message: "empty generator response".to_string(),
                retryable: false,
            })
    }
}

#[cfg(feature = "remote")]
impl Generator for RemoteGenerator {
    fn generate(&self, prompt: &str) -> Result<String> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.generate_async(prompt))
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Per-tenant generator cache with an explicit invalidation entrypoint
#[derive(Default)]
pub struct GeneratorCache {
    generators: DashMap<String, Arc<dyn Generator>>,
    /// Fallback used when a tenant has no dedicated instance
    default: parking_lot::RwLock<Option<Arc<dyn Generator>>>,
}

impl GeneratorCache {
    fn key(tenant_id: &Option<String>) -> String {
        tenant_id.clone().unwrap_or_default()
    }

    pub fn set_default(&self, generator: Option<Arc<dyn Generator>>) {
        *self.default.write() = generator;
    }

    pub fn put(&self, tenant_id: &Option<String>, generator: Arc<dyn Generator>) {
        self.generators.insert(Self::key(tenant_id), generator);
    }

    /// Generator for a tenant, falling back to the default instance
    pub fn get(&self, tenant_id: &Option<String>) -> Option<Arc<dyn Generator>> {
        self.generators
            .get(&Self::key(tenant_id))
            .map(|g| g.clone())
            .or_else(|| self.default.read().clone())
    }

    /// Drop a tenant's cached instance after a persisted-config change
    pub fn invalidate(&self, tenant_id: &Option<String>) {
        self.generators.remove(&Self::key(tenant_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedGenerator(String);

    impl Generator for CannedGenerator {
        fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
        fn name(&self) -> &str {
            "canned"
        }
    }

    #[test]
    fn test_cache_tenant_overrides_default() {
        let cache = GeneratorCache::default();
        cache.set_default(Some(Arc::new(CannedGenerator("default".to_string()))));
        cache.put(
            &Some("u1".to_string()),
            Arc::new(CannedGenerator("tenant".to_string())),
        );

        let tenant = cache.get(&Some("u1".to_string())).unwrap();
        assert_eq!(tenant.generate("x").unwrap(), "tenant");

        let other = cache.get(&Some("u2".to_string())).unwrap();
        assert_eq!(other.generate("x").unwrap(), "default");
    }

    #[test]
    fn test_invalidate_falls_back_to_default() {
        let cache = GeneratorCache::default();
        cache.set_default(Some(Arc::new(CannedGenerator("default".to_string()))));
        cache.put(
            &Some("u1".to_string()),
            Arc::new(CannedGenerator("tenant".to_string())),
        );

        cache.invalidate(&Some("u1".to_string()));
        let generator = cache.get(&Some("u1".to_string())).unwrap();
        assert_eq!(generator.generate("x").unwrap(), "default");
    }

    #[test]
    fn test_no_generator_configured() {
        let cache = GeneratorCache::default();
        assert!(cache.get(&None).is_none());
    }
}
