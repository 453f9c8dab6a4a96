//! Provisioning checks: engine binary, server, and a usable model.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::catalog::{find_model, ModelCatalog, ModelDescriptor};
use crate::client::EngineApi;
use crate::download::{DownloadJob, DownloadTracker};
use crate::error::ProvisionError;
use crate::process::ProcessSpawner;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_WAIT: Duration = Duration::from_secs(10);
const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Caller-supplied callback that picks an alternative model when the
/// configured default is missing. At most one per checker.
pub type ModelSelector = Box<dyn Fn(&[ModelDescriptor]) -> Option<String> + Send + Sync>;

/// Verifies the engine binary is invocable, the server is reachable, and
/// at least one usable model is installed.
pub struct ProvisionChecker {
    binary: String,
    spawner: Arc<dyn ProcessSpawner>,
    engine: Arc<dyn EngineApi>,
    selector: Option<ModelSelector>,
}

impl ProvisionChecker {
    pub fn new(
        binary: impl Into<String>,
        spawner: Arc<dyn ProcessSpawner>,
        engine: Arc<dyn EngineApi>,
    ) -> Self {
        Self {
            binary: binary.into(),
            spawner,
            engine,
            selector: None,
        }
    }

    /// Register a selection callback consulted when the default model is
    /// not installed.
    pub fn with_selector(mut self, selector: ModelSelector) -> Self {
        self.set_selector(selector);
        self
    }

    /// Setter form of [`Self::with_selector`].
    pub fn set_selector(&mut self, selector: ModelSelector) {
        self.selector = Some(selector);
    }

    /// Run all provisioning checks. On success returns the name of the
    /// usable model (the default, a selected alternative, or the default
    /// after a triggered download).
    pub async fn ensure_provisioned(
        &self,
        default_model: &str,
        catalog: &ModelCatalog,
        tracker: &DownloadTracker,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String, ProvisionError> {
        self.check_binary().await?;
        self.check_server(cancel).await?;
        self.check_model(default_model, catalog, tracker, cancel)
            .await
    }

    /// Version-probe the engine binary. Absence is fatal: the caller must
    /// direct an install, we only return the guidance.
    async fn check_binary(&self) -> Result<(), ProvisionError> {
        let args = vec!["--version".to_string()];
        let mut handle = match self.spawner.spawn(&self.binary, &args) {
            Ok(handle) => handle,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProvisionError::EngineMissing {
                    binary: self.binary.clone(),
                });
            }
            Err(e) => return Err(ProvisionError::Io(e)),
        };

        match timeout(VERSION_PROBE_TIMEOUT, handle.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!("engine binary '{}' is invocable", self.binary);
                Ok(())
            }
            _ => Err(ProvisionError::EngineMissing {
                binary: self.binary.clone(),
            }),
        }
    }

    /// Check the server is reachable, starting it if necessary. A start
    /// that collides with "address already in use" is success: another
    /// instance is serving, and the health poll below decides either way.
    async fn check_server(&self, cancel: &watch::Receiver<bool>) -> Result<(), ProvisionError> {
        if self.engine.ping().await.is_ok() {
            debug!("engine server already running at {}", self.engine.base_url());
            return Ok(());
        }

        info!("engine server not reachable, starting it");
        let args = vec!["serve".to_string()];
        match self.spawner.spawn_service(&self.binary, &args) {
            Ok(_) => {}
            // The server may already be starting elsewhere; keep polling.
            Err(e) => warn!("could not start engine server: {}", e),
        }

        let start = Instant::now();
        while start.elapsed() < SERVER_WAIT {
            if *cancel.borrow() {
                return Err(ProvisionError::Cancelled);
            }
            if self.engine.ping().await.is_ok() {
                info!("engine server is ready");
                return Ok(());
            }
            // May be mid-startup; retry rather than error immediately.
            sleep(SERVER_POLL_INTERVAL).await;
        }

        Err(ProvisionError::ServerUnreachable(
            self.engine.base_url().to_string(),
        ))
    }

    /// Ensure a usable model exists. Success is only reported once one
    /// does: either the default is installed, the selector picked an
    /// installed alternative, or a download of the default completed.
    async fn check_model(
        &self,
        default_model: &str,
        catalog: &ModelCatalog,
        tracker: &DownloadTracker,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String, ProvisionError> {
        let models = catalog.list(true).await?;

        if find_model(&models, default_model).is_some() {
            return Ok(default_model.to_string());
        }

        if let Some(selector) = &self.selector {
            if let Some(choice) = selector(&models) {
                if find_model(&models, &choice).is_some() {
                    info!("default model missing, selected '{}' instead", choice);
                    return Ok(choice);
                }
                warn!("selected model '{}' is not installed, ignoring", choice);
            }
            if models.is_empty() {
                return Err(ProvisionError::NoUsableModel);
            }
        }

        info!(
            "default model '{}' missing, downloading it",
            default_model
        );
        let mut on_progress = |job: &DownloadJob| {
            debug!("download progress: {:.0}% ({:?})", job.percent, job.state)
        };
        tracker
            .download(default_model, catalog, &mut on_progress, cancel)
            .await?;

        let models = catalog.list(true).await?;
        if find_model(&models, default_model).is_some() {
            Ok(default_model.to_string())
        } else {
            Err(ProvisionError::NoUsableModel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelStatus;
    use crate::testing::{ScriptBehavior, ScriptedSpawner, StaticEngine};

    fn descriptor(name: &str) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            size_label: String::new(),
            status: ModelStatus::Ready,
        }
    }

    fn harness(
        models: Vec<ModelDescriptor>,
    ) -> (Arc<ScriptedSpawner>, Arc<StaticEngine>, ModelCatalog, DownloadTracker) {
        let spawner = Arc::new(ScriptedSpawner::new());
        let engine = Arc::new(StaticEngine::with_models(models));
        let catalog = ModelCatalog::new(engine.clone(), Duration::from_secs(30));
        let tracker =
            DownloadTracker::new("ollama", spawner.clone(), Duration::from_secs(600));
        (spawner, engine, catalog, tracker)
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let (spawner, engine, catalog, tracker) = harness(vec![descriptor("phi3:mini")]);
        spawner.push(ScriptBehavior::SpawnError(io::ErrorKind::NotFound));
        let checker = ProvisionChecker::new("ollama", spawner, engine);

        let (_tx, rx) = watch::channel(false);
        let err = checker
            .ensure_provisioned("phi3:mini", &catalog, &tracker, &rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::EngineMissing { .. }));
        // The guidance is part of the error, not a bare message.
        assert!(err.to_string().contains("Install it"));
    }

    #[tokio::test]
    async fn test_default_model_present() {
        let (spawner, engine, catalog, tracker) = harness(vec![descriptor("phi3:mini")]);
        spawner.push(ScriptBehavior::exit_ok()); // version probe
        let checker = ProvisionChecker::new("ollama", spawner.clone(), engine);

        let (_tx, rx) = watch::channel(false);
        let model = checker
            .ensure_provisioned("phi3:mini", &catalog, &tracker, &rx)
            .await
            .unwrap();
        assert_eq!(model, "phi3:mini");
        // Server was reachable: no `serve` spawn.
        assert_eq!(spawner.spawned_commands(), vec!["ollama --version"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_spawns_serve_then_fails() {
        let (spawner, engine, catalog, tracker) = harness(vec![descriptor("phi3:mini")]);
        engine.set_healthy(false);
        spawner.push(ScriptBehavior::exit_ok()); // version probe
        let checker = ProvisionChecker::new("ollama", spawner.clone(), engine);

        let (_tx, rx) = watch::channel(false);
        let err = checker
            .ensure_provisioned("phi3:mini", &catalog, &tracker, &rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ServerUnreachable(_)));
        assert!(spawner
            .spawned_commands()
            .contains(&"ollama serve".to_string()));
    }

    #[tokio::test]
    async fn test_selector_picks_alternative() {
        let (spawner, engine, catalog, tracker) = harness(vec![descriptor("llama3:8b")]);
        spawner.push(ScriptBehavior::exit_ok());
        let checker = ProvisionChecker::new("ollama", spawner, engine)
            .with_selector(Box::new(|models| models.first().map(|m| m.name.clone())));

        let (_tx, rx) = watch::channel(false);
        let model = checker
            .ensure_provisioned("phi3:mini", &catalog, &tracker, &rx)
            .await
            .unwrap();
        assert_eq!(model, "llama3:8b");
    }

    #[tokio::test]
    async fn test_no_models_and_no_selection() {
        let (spawner, engine, catalog, tracker) = harness(vec![]);
        spawner.push(ScriptBehavior::exit_ok());
        let checker = ProvisionChecker::new("ollama", spawner, engine)
            .with_selector(Box::new(|_| None));

        let (_tx, rx) = watch::channel(false);
        let err = checker
            .ensure_provisioned("phi3:mini", &catalog, &tracker, &rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NoUsableModel));
    }

    #[tokio::test]
    async fn test_missing_default_triggers_download() {
        let (spawner, engine, catalog, tracker) = harness(vec![]);
        spawner.push(ScriptBehavior::exit_ok()); // version probe
        spawner.push(ScriptBehavior::OneShot {
            stdout: vec!["pulling manifest 100%".to_string()],
            stderr: vec![],
            code: 0,
        }); // pull
        engine.push_listing(vec![]); // before the download
        engine.push_listing(vec![descriptor("phi3:mini")]); // after it
        let checker = ProvisionChecker::new("ollama", spawner.clone(), engine);

        let (_tx, rx) = watch::channel(false);
        let model = checker
            .ensure_provisioned("phi3:mini", &catalog, &tracker, &rx)
            .await
            .unwrap();
        assert_eq!(model, "phi3:mini");
        assert!(spawner
            .spawned_commands()
            .contains(&"ollama pull phi3:mini".to_string()));
    }
}
