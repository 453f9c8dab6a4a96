//! Manager configuration.

use std::time::Duration;

use kindling_engine::{DEFAULT_ENGINE_BINARY, DEFAULT_ENGINE_URL};

use crate::session::CompletionHeuristic;

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Engine binary name or path (default: ollama)
    pub engine_binary: String,
    /// Engine server URL
    pub engine_url: String,
    /// Default model to provision and serve
    pub default_model: String,
    /// Per-request deadline for the persistent channel
    pub request_timeout: Duration,
    /// Deadline for the first call after engine startup (warm-up)
    pub warmup_timeout: Duration,
    /// Hard deadline for one-shot fallback invocations
    pub fallback_timeout: Duration,
    /// Overall deadline for a model download
    pub download_timeout: Duration,
    /// TTL for cached responses
    pub response_ttl: Duration,
    /// TTL for the model catalog snapshot (shorter: installed models
    /// change more often than prompts repeat)
    pub catalog_ttl: Duration,
    /// Fallback attempts after a persistent-channel failure
    pub retry_attempts: u32,
    /// How to decide a session response is complete
    pub completion: CompletionHeuristic,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            engine_binary: DEFAULT_ENGINE_BINARY.to_string(),
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            default_model: "phi3:mini".to_string(),
            request_timeout: Duration::from_secs(8),
            warmup_timeout: Duration::from_secs(60),
            fallback_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(600),
            response_ttl: Duration::from_secs(300),
            catalog_ttl: Duration::from_secs(30),
            retry_attempts: 1,
            completion: CompletionHeuristic::FirstChunk,
        }
    }
}

impl ManagerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(binary) = std::env::var("KINDLING_ENGINE") {
            config.engine_binary = binary;
        }
        if let Ok(url) = std::env::var("KINDLING_ENGINE_URL") {
            config.engine_url = url;
        }
        if let Ok(model) = std::env::var("KINDLING_MODEL") {
            config.default_model = model;
        }
        if let Some(secs) = env_secs("KINDLING_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = secs;
        }
        if let Some(secs) = env_secs("KINDLING_CACHE_TTL_SECS") {
            config.response_ttl = secs;
        }
        if let Ok(attempts) = std::env::var("KINDLING_RETRY_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                config.retry_attempts = n;
            }
        }

        config
    }

    /// Create a builder for configuration.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

fn env_secs(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

/// Builder for manager configuration.
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    pub fn engine_binary(mut self, binary: impl Into<String>) -> Self {
        self.config.engine_binary = binary.into();
        self
    }

    pub fn engine_url(mut self, url: impl Into<String>) -> Self {
        self.config.engine_url = url.into();
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.config.default_model = model.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn warmup_timeout(mut self, timeout: Duration) -> Self {
        self.config.warmup_timeout = timeout;
        self
    }

    pub fn fallback_timeout(mut self, timeout: Duration) -> Self {
        self.config.fallback_timeout = timeout;
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    pub fn response_ttl(mut self, ttl: Duration) -> Self {
        self.config.response_ttl = ttl;
        self
    }

    pub fn catalog_ttl(mut self, ttl: Duration) -> Self {
        self.config.catalog_ttl = ttl;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    pub fn completion(mut self, heuristic: CompletionHeuristic) -> Self {
        self.config.completion = heuristic;
        self
    }

    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.engine_binary, "ollama");
        assert_eq!(config.request_timeout, Duration::from_secs(8));
        assert!(config.warmup_timeout > config.request_timeout);
        assert!(config.catalog_ttl < config.response_ttl);
    }

    #[test]
    fn test_builder() {
        let config = ManagerConfig::builder()
            .default_model("llama3:8b")
            .request_timeout(Duration::from_secs(3))
            .retry_attempts(2)
            .completion(CompletionHeuristic::IdleTimeout(Duration::from_millis(
                400,
            )))
            .build();
        assert_eq!(config.default_model, "llama3:8b");
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.retry_attempts, 2);
        assert!(matches!(
            config.completion,
            CompletionHeuristic::IdleTimeout(_)
        ));
    }
}
