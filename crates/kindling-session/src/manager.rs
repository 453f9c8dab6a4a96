//! Session manager: the orchestrator tying provisioning, the persistent
//! session, the fallback path, and the caches together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use kindling_engine::{
    DownloadError, DownloadJob, DownloadTracker, EngineApi, EngineClient, ModelCatalog,
    ModelDescriptor, ModelSelector, ProcessSpawner, ProvisionChecker, ProvisionError,
    TokioSpawner,
};

use crate::cache::ResponseCache;
use crate::config::ManagerConfig;
use crate::fallback::{FallbackInvoker, InvokeError};
use crate::session::{PersistentSession, SessionError};

/// Lifecycle state of the manager. `Sending` and `Degraded` are
/// per-request annotations; `Degraded` is never user-visible beyond
/// logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Provisioning,
    Ready,
    Sending,
    Degraded,
}

/// Which channel produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Cache,
    Session,
    Fallback,
}

/// One completed generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub duration_ms: u64,
    pub channel: Channel,
}

/// Errors surfaced by `generate`.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// Provisioning failed. `EngineMissing` inside is fatal and carries
    /// installation guidance; it must reach the caller untouched.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Both the persistent channel and the fallback were exhausted.
    #[error("all channels failed; session: {session}; fallback: {fallback}")]
    AllChannelsFailed {
        session: SessionError,
        fallback: InvokeError,
    },

    /// The manager has been shut down.
    #[error("manager is shut down")]
    ShutDown,
}

/// Owns the state machine around one persistent session plus the caches.
///
/// All state lives on the instance (no process-wide globals), so multiple
/// independent managers can coexist in tests. Requests against the one
/// session are serialized by the session slot's lock: writing a second
/// prompt before the first response resolves would corrupt the channel.
pub struct SessionManager {
    config: ManagerConfig,
    spawner: Arc<dyn ProcessSpawner>,
    cache: ResponseCache,
    catalog: ModelCatalog,
    checker: ProvisionChecker,
    tracker: DownloadTracker,
    fallback: FallbackInvoker,
    /// At most one live session process per manager instance.
    session: Mutex<Option<PersistentSession>>,
    /// The usable model settled on during provisioning.
    active_model: RwLock<String>,
    state: RwLock<ManagerState>,
    initialized: Mutex<bool>,
    /// Set after the first successful call; later calls use the shorter
    /// per-request deadline instead of the warm-up one.
    warmed_up: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl SessionManager {
    /// Create a manager with production backends.
    pub fn new(config: ManagerConfig) -> Self {
        let engine: Arc<dyn EngineApi> = Arc::new(EngineClient::with_url(&config.engine_url));
        Self::with_backends(config, Arc::new(TokioSpawner::new()), engine)
    }

    /// Create a manager over explicit backends. Tests use this with the
    /// scripted spawner and a static engine.
    pub fn with_backends(
        config: ManagerConfig,
        spawner: Arc<dyn ProcessSpawner>,
        engine: Arc<dyn EngineApi>,
    ) -> Self {
        let catalog = ModelCatalog::new(Arc::clone(&engine), config.catalog_ttl);
        let checker =
            ProvisionChecker::new(config.engine_binary.clone(), Arc::clone(&spawner), engine);
        let tracker = DownloadTracker::new(
            config.engine_binary.clone(),
            Arc::clone(&spawner),
            config.download_timeout,
        );
        let fallback = FallbackInvoker::new(config.engine_binary.clone(), Arc::clone(&spawner));
        let cache = ResponseCache::new(config.response_ttl);
        let (shutdown, _) = watch::channel(false);

        Self {
            active_model: RwLock::new(config.default_model.clone()),
            config,
            spawner,
            cache,
            catalog,
            checker,
            tracker,
            fallback,
            session: Mutex::new(None),
            state: RwLock::new(ManagerState::Uninitialized),
            initialized: Mutex::new(false),
            warmed_up: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Register a callback that picks an alternative model when the
    /// configured default is not installed. Must be called before
    /// `initialize`.
    pub fn with_model_selector(mut self, selector: ModelSelector) -> Self {
        self.checker.set_selector(selector);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.read().expect("state lock poisoned")
    }

    /// The model settled on during provisioning: the configured default,
    /// or a selector-chosen alternative. Before `initialize` this is the
    /// configured default.
    pub fn active_model(&self) -> String {
        self.active_model.read().expect("model lock poisoned").clone()
    }

    /// Run provisioning and optimistically pre-start the default session.
    /// Idempotent; `generate` calls this on first use.
    pub async fn initialize(&self) -> Result<(), ProvisionError> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }
        if *self.shutdown.borrow() {
            return Err(ProvisionError::Cancelled);
        }

        self.set_state(ManagerState::Provisioning);
        let cancel = self.shutdown.subscribe();
        let usable = match self
            .checker
            .ensure_provisioned(
                &self.config.default_model,
                &self.catalog,
                &self.tracker,
                &cancel,
            )
            .await
        {
            Ok(model) => model,
            Err(e) => {
                self.set_state(ManagerState::Uninitialized);
                return Err(e);
            }
        };

        if usable != self.config.default_model {
            info!("provisioned with model '{}' instead of default", usable);
        }
        *self.active_model.write().expect("model lock poisoned") = usable.clone();

        // Optimistic pre-start: failure here is absorbed by the first
        // generate(), which starts its own session.
        match PersistentSession::start(self.spawner.as_ref(), &self.config.engine_binary, &usable)
        {
            Ok(session) => {
                *self.session.lock().await = Some(session);
            }
            Err(e) => warn!("could not pre-start session: {}", e),
        }

        self.set_state(ManagerState::Ready);
        *initialized = true;
        Ok(())
    }

    /// Generate a response: cache first, then the persistent session,
    /// then one transparent fallback retry. Only `EngineMissing` and
    /// `AllChannelsFailed` ever reach the caller as failures.
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<Generation, GenerateError> {
        if *self.shutdown.borrow() {
            return Err(GenerateError::ShutDown);
        }
        let started = Instant::now();

        if let Some(text) = self.cache.get(model, prompt) {
            debug!("cache hit for '{}'", model);
            return Ok(Generation {
                text,
                duration_ms: started.elapsed().as_millis() as u64,
                channel: Channel::Cache,
            });
        }

        self.initialize().await?;

        self.set_state(ManagerState::Sending);
        let (text, channel) = match self.send_via_session(model, prompt, context).await {
            Ok(text) => (text, Channel::Session),
            Err(session_err) => {
                // Degraded: retried transparently, logged but not surfaced.
                warn!(
                    "persistent channel failed for '{}' ({}), falling back",
                    model, session_err
                );
                self.set_state(ManagerState::Degraded);
                match self.invoke_fallback(model, prompt, context).await {
                    Ok(text) => (text, Channel::Fallback),
                    Err(InvokeError::Cancelled) => {
                        // Cancelled only ever comes from the shutdown
                        // watch; report the shutdown, not a channel error.
                        return Err(GenerateError::ShutDown);
                    }
                    Err(fallback_err) => {
                        self.set_state(ManagerState::Ready);
                        return Err(GenerateError::AllChannelsFailed {
                            session: session_err,
                            fallback: fallback_err,
                        });
                    }
                }
            }
        };

        self.cache.put(model, prompt, &text, None);
        self.warmed_up.store(true, Ordering::SeqCst);
        self.set_state(ManagerState::Ready);

        Ok(Generation {
            text,
            duration_ms: started.elapsed().as_millis() as u64,
            channel,
        })
    }

    /// List installed models from the catalog snapshot. "No models" is a
    /// legitimate state, so listing failures degrade to an empty list.
    pub async fn list_models(&self) -> Vec<ModelDescriptor> {
        match self.catalog.list(false).await {
            Ok(models) => models.as_ref().clone(),
            Err(e) => {
                warn!("model listing failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Download a model, reporting job progress to `on_progress`.
    pub async fn download_model(
        &self,
        name: &str,
        on_progress: &mut (dyn FnMut(&DownloadJob) + Send),
    ) -> Result<(), DownloadError> {
        if *self.shutdown.borrow() {
            return Err(DownloadError::Cancelled);
        }
        let cancel = self.shutdown.subscribe();
        self.tracker
            .download(name, &self.catalog, on_progress, &cancel)
            .await
    }

    /// Stop the active session and cancel in-flight fallback/download
    /// waits, killing their processes. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("shutting down session manager");

        let mut slot = self.session.lock().await;
        if let Some(mut session) = slot.take() {
            session.stop().await;
        }
        self.set_state(ManagerState::Uninitialized);
    }

    /// Send through the persistent session, starting or replacing it as
    /// needed. Holding the slot lock across the send serializes requests
    /// against the single session.
    async fn send_via_session(
        &self,
        model: &str,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<String, SessionError> {
        let mut slot = self.session.lock().await;

        let needs_new = match slot.as_mut() {
            Some(session) => session.model_name() != model || !session.is_alive(),
            None => true,
        };
        if needs_new {
            // Terminate the old process before spawning the replacement:
            // at most one live session process per manager.
            if let Some(mut old) = slot.take() {
                old.stop().await;
            }
            let fresh =
                PersistentSession::start(self.spawner.as_ref(), &self.config.engine_binary, model)?;
            *slot = Some(fresh);
        }

        let deadline = if self.warmed_up.load(Ordering::SeqCst) {
            self.config.request_timeout
        } else {
            // Engine warm-up: the first call absorbs model load latency.
            self.config.warmup_timeout
        };

        let Some(session) = slot.as_mut() else {
            return Err(SessionError::SpawnFailed("session slot empty".to_string()));
        };
        let cancel = self.shutdown.subscribe();
        let result = session
            .send(prompt, context, deadline, self.config.completion, &cancel)
            .await;

        // A dead process must not linger in the slot, or the next send
        // would write to a dead pipe instead of starting fresh.
        if matches!(result, Err(SessionError::ProcessDied(_))) {
            if let Some(mut dead) = slot.take() {
                dead.stop().await;
            }
        }
        result
    }

    async fn invoke_fallback(
        &self,
        model: &str,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<String, InvokeError> {
        let cancel = self.shutdown.subscribe();
        let attempts = self.config.retry_attempts.max(1);
        let mut last_err = InvokeError::SpawnFailed("no attempts made".to_string());

        for attempt in 1..=attempts {
            match self
                .fallback
                .invoke(model, prompt, context, self.config.fallback_timeout, &cancel)
                .await
            {
                Ok(text) => return Ok(text),
                Err(InvokeError::Cancelled) => return Err(InvokeError::Cancelled),
                Err(e) => {
                    debug!("fallback attempt {}/{} failed: {}", attempt, attempts, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn set_state(&self, state: ManagerState) {
        let mut guard = self.state.write().expect("state lock poisoned");
        if *guard != state {
            debug!("manager state: {:?} -> {:?}", *guard, state);
            *guard = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let manager = SessionManager::new(ManagerConfig::default());
        assert_eq!(manager.state(), ManagerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_generate_after_shutdown() {
        let manager = SessionManager::new(ManagerConfig::default());
        manager.shutdown().await;
        let err = manager.generate("phi3:mini", "hello", None).await.unwrap_err();
        assert!(matches!(err, GenerateError::ShutDown));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = SessionManager::new(ManagerConfig::default());
        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Uninitialized);
    }
}
