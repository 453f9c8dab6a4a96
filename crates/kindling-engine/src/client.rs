//! HTTP client for the engine server.
//!
//! The server's surface is treated as a black box: a health ping on the
//! base URL and a model listing endpoint. No wire format of our own.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::catalog::{ModelDescriptor, ModelStatus};
use crate::error::EngineError;
use crate::DEFAULT_ENGINE_URL;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
// Listings are larger than a ping but still must not hang initialization
// on a server that accepts connections and then stalls.
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// The engine's HTTP surface, as seen by provisioning and the catalog.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Check that the server is up and answering.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Fetch the list of locally installed models.
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, EngineError>;

    /// Base URL the client talks to, for error messages.
    fn base_url(&self) -> &str;
}

/// Client for the engine's HTTP endpoints.
pub struct EngineClient {
    client: reqwest::Client,
    base_url: String,
}

impl EngineClient {
    /// Create a client for the default local URL.
    pub fn new() -> Self {
        Self::with_url(DEFAULT_ENGINE_URL)
    }

    /// Create a client for a custom URL.
    pub fn with_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for EngineClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn ping(&self) -> Result<(), EngineError> {
        let response = self
            .client
            .get(&self.base_url)
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    EngineError::Unreachable(self.base_url.clone())
                } else {
                    EngineError::Http(e)
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Unreachable(self.base_url.clone()))
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, EngineError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    EngineError::Unreachable(self.base_url.clone())
                } else {
                    EngineError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(EngineError::Unreachable(self.base_url.clone()));
        }

        // Parse defensively: a changed or empty listing format yields an
        // empty list with a warning, never a hard failure. "No models" is a
        // legitimate state for callers.
        let payload: Value = response.json().await?;
        Ok(parse_listing(payload))
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Wire shape of the engine's tags listing.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: Option<String>,
    #[serde(default)]
    size: u64,
}

/// Extract model descriptors from the listing payload.
fn parse_listing(payload: Value) -> Vec<ModelDescriptor> {
    let listing: TagsResponse = match serde_json::from_value(payload) {
        Ok(listing) => listing,
        Err(e) => {
            warn!("unexpected model listing format ({}), treating as no models", e);
            return Vec::new();
        }
    };

    listing
        .models
        .into_iter()
        .filter_map(|entry| {
            // Entries missing a name are skipped, not fatal.
            let name = entry.name?;
            let size_label = if entry.size == 0 {
                String::new()
            } else {
                human_size(entry.size)
            };
            Some(ModelDescriptor {
                name,
                size_label,
                status: ModelStatus::Ready,
            })
        })
        .collect()
}

/// Render a byte count the way the engine's own listing does ("3.8 GB").
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_url() {
        let client = EngineClient::new();
        assert_eq!(client.base_url(), "http://127.0.0.1:11434");
    }

    #[test]
    fn test_parse_listing() {
        let payload = json!({
            "models": [
                {"name": "phi3:mini", "size": 2_300_000_000u64},
                {"name": "llama3:8b", "size": 4_700_000_000u64},
            ]
        });
        let models = parse_listing(payload);
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "phi3:mini");
        assert_eq!(models[0].status, ModelStatus::Ready);
        assert!(models[0].size_label.ends_with("GB"));
    }

    #[test]
    fn test_parse_listing_defensive() {
        assert!(parse_listing(json!({})).is_empty());
        assert!(parse_listing(json!({"models": "garbage"})).is_empty());
        assert!(parse_listing(json!({"models": []})).is_empty());
        // Entries missing a name are skipped, not fatal.
        let models = parse_listing(json!({"models": [{"size": 12}, {"name": "a"}]}));
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "a");
        assert!(models[0].size_label.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_models_times_out_on_stalled_server() {
        // A server that accepts connections but never answers must not
        // block callers past the request timeout.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let client = EngineClient::with_url(format!("http://{}", addr));
        let err = client.list_models().await.unwrap_err();
        assert!(matches!(err, EngineError::Unreachable(_)));
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(2_300_000_000), "2.1 GB");
    }
}
