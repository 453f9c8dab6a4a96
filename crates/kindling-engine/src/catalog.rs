//! Cached snapshot of locally installed models.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::EngineApi;
use crate::error::EngineError;

/// One locally available model, as parsed from the engine's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: String,
    pub size_label: String,
    pub status: ModelStatus,
}

/// Lifecycle status of a model in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Available,
    Downloading,
    Ready,
    Error,
}

struct Snapshot {
    models: Arc<Vec<ModelDescriptor>>,
    fetched_at: Instant,
}

/// Queries and caches the engine's model listing.
///
/// The TTL is short compared to the response cache: installed models change
/// more often than prompts repeat. Refreshes replace the whole snapshot
/// atomically so concurrent readers never observe a half-updated list.
pub struct ModelCatalog {
    engine: Arc<dyn EngineApi>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl ModelCatalog {
    pub fn new(engine: Arc<dyn EngineApi>, ttl: Duration) -> Self {
        Self {
            engine,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// List installed models, hitting the engine only when the cached
    /// snapshot is missing, expired, or `force_refresh` is set.
    pub async fn list(
        &self,
        force_refresh: bool,
    ) -> Result<Arc<Vec<ModelDescriptor>>, EngineError> {
        if !force_refresh {
            let guard = self.snapshot.read().await;
            if let Some(snap) = guard.as_ref() {
                if snap.fetched_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&snap.models));
                }
            }
        }

        let models = Arc::new(self.engine.list_models().await?);
        if models.is_empty() {
            warn!("engine reports no installed models");
        } else {
            debug!("catalog refreshed: {} models", models.len());
        }

        let mut guard = self.snapshot.write().await;
        *guard = Some(Snapshot {
            models: Arc::clone(&models),
            fetched_at: Instant::now(),
        });
        Ok(models)
    }

    /// Look up one model by name. Accepts either an exact tag ("phi3:mini")
    /// or a bare base name ("phi3") matching any installed tag.
    pub async fn get(&self, name: &str) -> Result<Option<ModelDescriptor>, EngineError> {
        let models = self.list(false).await?;
        Ok(find_model(&models, name))
    }

    /// Drop the cached snapshot so the next listing hits the engine.
    pub async fn invalidate(&self) {
        let mut guard = self.snapshot.write().await;
        *guard = None;
        debug!("catalog invalidated");
    }
}

pub(crate) fn find_model(models: &[ModelDescriptor], name: &str) -> Option<ModelDescriptor> {
    let base = name.split(':').next().unwrap_or(name);
    models
        .iter()
        .find(|m| m.name == name || m.name.starts_with(&format!("{}:", base)))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticEngine;

    fn descriptor(name: &str) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            size_label: "2.1 GB".to_string(),
            status: ModelStatus::Ready,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_is_cached_within_ttl() {
        let engine = Arc::new(StaticEngine::with_models(vec![descriptor("phi3:mini")]));
        let catalog = ModelCatalog::new(engine.clone(), Duration::from_secs(30));

        catalog.list(false).await.unwrap();
        catalog.list(false).await.unwrap();
        assert_eq!(engine.list_calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        catalog.list(false).await.unwrap();
        assert_eq!(engine.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_and_invalidate() {
        let engine = Arc::new(StaticEngine::with_models(vec![descriptor("phi3:mini")]));
        let catalog = ModelCatalog::new(engine.clone(), Duration::from_secs(30));

        catalog.list(false).await.unwrap();
        catalog.list(true).await.unwrap();
        assert_eq!(engine.list_calls(), 2);

        catalog.invalidate().await;
        catalog.list(false).await.unwrap();
        assert_eq!(engine.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_get_matches_base_name() {
        let engine = Arc::new(StaticEngine::with_models(vec![descriptor("phi3:mini")]));
        let catalog = ModelCatalog::new(engine, Duration::from_secs(30));

        assert!(catalog.get("phi3:mini").await.unwrap().is_some());
        assert!(catalog.get("phi3").await.unwrap().is_some());
        assert!(catalog.get("llama3").await.unwrap().is_none());
    }
}
