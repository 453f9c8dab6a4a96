//! Persistent engine session: one long-lived subprocess reused across
//! prompts for low first-token latency.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use kindling_engine::process::{terminate_with_grace, ProcessHandle, ProcessSpawner};

const POLL_TICK: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_millis(500);

/// How to decide that a session response is complete.
///
/// The engine's interactive channel has no end-of-response marker, so
/// completion is a heuristic by design: `FirstChunk` treats the first
/// non-empty stdout chunk as the whole answer (and cannot distinguish a
/// short answer from the first fragment of a long streamed one);
/// `IdleTimeout` accumulates output until the stream goes quiet for the
/// given window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionHeuristic {
    FirstChunk,
    IdleTimeout(Duration),
}

/// Errors from the persistent channel.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session process exited or its pipes broke.
    #[error("session process for '{0}' died")]
    ProcessDied(String),

    /// The prompt could not be written to the session's stdin.
    #[error("failed to write prompt to session: {0}")]
    WriteFailed(String),

    /// No response within the bounded wait window; the channel should be
    /// treated as degraded.
    #[error("session response timed out after {0:?}")]
    Timeout(Duration),

    /// The session process could not be started.
    #[error("failed to start session: {0}")]
    SpawnFailed(String),

    /// The manager was shut down mid-send.
    #[error("send cancelled by shutdown")]
    Cancelled,
}

/// A long-lived subprocess bound to one model, with piped stdio.
pub struct PersistentSession {
    model_name: String,
    process: Box<dyn ProcessHandle>,
    ready: bool,
    stopped: bool,
    started_at: Instant,
}

impl PersistentSession {
    /// Spawn one subprocess bound to `model`.
    pub fn start(
        spawner: &dyn ProcessSpawner,
        binary: &str,
        model: &str,
    ) -> Result<Self, SessionError> {
        let args = vec!["run".to_string(), model.to_string()];
        let process = spawner
            .spawn(binary, &args)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        info!("started session for '{}' (pid {})", model, process.id());
        Ok(Self {
            model_name: model.to_string(),
            process,
            ready: true,
            stopped: false,
            started_at: Instant::now(),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Check the underlying process is still running. A dead process
    /// clears readiness so the owner starts a fresh session instead of
    /// writing to a dead pipe.
    pub fn is_alive(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        match self.process.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(
                    "session for '{}' exited unexpectedly (code {:?})",
                    self.model_name, status.code
                );
                self.ready = false;
                false
            }
            Err(e) => {
                warn!("session for '{}' unreachable: {}", self.model_name, e);
                self.ready = false;
                false
            }
        }
    }

    /// Send a prompt and wait for a response, racing three observers:
    /// output (per the completion heuristic), the deadline, and process
    /// exit.
    pub async fn send(
        &mut self,
        prompt: &str,
        context: Option<&str>,
        deadline: Duration,
        heuristic: CompletionHeuristic,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::ProcessDied(self.model_name.clone()));
        }

        let full_prompt = compose_prompt(prompt, context);
        if let Err(e) = self.process.write_line(&full_prompt).await {
            self.ready = false;
            return Err(SessionError::WriteFailed(e.to_string()));
        }

        let started = Instant::now();
        let mut collected = String::new();
        let mut last_output = started;

        loop {
            if *cancel.borrow() {
                return Err(SessionError::Cancelled);
            }
            if started.elapsed() >= deadline {
                debug!(
                    "session for '{}' produced no answer within {:?}",
                    self.model_name, deadline
                );
                return Err(SessionError::Timeout(deadline));
            }

            match timeout(POLL_TICK, self.process.read_stdout_line()).await {
                Ok(Ok(Some(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match heuristic {
                        CompletionHeuristic::FirstChunk => {
                            return Ok(line.trim().to_string());
                        }
                        CompletionHeuristic::IdleTimeout(_) => {
                            if !collected.is_empty() {
                                collected.push('\n');
                            }
                            collected.push_str(line.trim_end());
                            last_output = Instant::now();
                        }
                    }
                }
                Ok(Ok(None)) | Ok(Err(_)) => {
                    self.ready = false;
                    return Err(SessionError::ProcessDied(self.model_name.clone()));
                }
                Err(_) => {
                    // No output this tick: check for exit, then for the
                    // idle window having elapsed.
                    if let Ok(Some(_)) = self.process.try_wait() {
                        self.ready = false;
                        return Err(SessionError::ProcessDied(self.model_name.clone()));
                    }
                    if let CompletionHeuristic::IdleTimeout(idle) = heuristic {
                        if !collected.is_empty() && last_output.elapsed() >= idle {
                            return Ok(collected.trim().to_string());
                        }
                    }
                }
            }
        }
    }

    /// Stop the session. Idempotent: stopping an already-stopped or
    /// crashed session is a no-op.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.ready = false;

        debug!(
            "stopping session for '{}' after {:?}",
            self.model_name,
            self.started_at.elapsed()
        );
        terminate_with_grace(self.process.as_mut(), STOP_GRACE).await;
    }
}

fn compose_prompt(prompt: &str, context: Option<&str>) -> String {
    // Context is an opaque string prepended to the prompt.
    match context {
        Some(ctx) if !ctx.is_empty() => format!("{}\n\n{}", ctx, prompt),
        _ => prompt.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_engine::testing::{ScriptBehavior, ScriptedSpawner};

    fn no_cancel() -> watch::Receiver<bool> {
        // A dropped sender leaves the last value in place.
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn test_send_first_chunk() {
        let spawner = ScriptedSpawner::new();
        spawner.push(ScriptBehavior::EchoOnWrite("hi".to_string()));
        let mut session = PersistentSession::start(&spawner, "ollama", "phi3:mini").unwrap();

        let cancel = no_cancel();
        let text = session
            .send(
                "hello",
                None,
                Duration::from_secs(5),
                CompletionHeuristic::FirstChunk,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(text, "hi");
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout() {
        let spawner = ScriptedSpawner::new();
        spawner.push(ScriptBehavior::Silent);
        let mut session = PersistentSession::start(&spawner, "ollama", "phi3:mini").unwrap();

        let cancel = no_cancel();
        let err = session
            .send(
                "hello",
                None,
                Duration::from_millis(300),
                CompletionHeuristic::FirstChunk,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_send_to_dead_process() {
        let spawner = ScriptedSpawner::new();
        spawner.push(ScriptBehavior::ExitOnWrite { code: 1 });
        let mut session = PersistentSession::start(&spawner, "ollama", "phi3:mini").unwrap();

        let cancel = no_cancel();
        let err = session
            .send(
                "hello",
                None,
                Duration::from_secs(5),
                CompletionHeuristic::FirstChunk,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProcessDied(_)));
        // Readiness cleared so the owner starts fresh next time.
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let spawner = ScriptedSpawner::new();
        spawner.push(ScriptBehavior::EchoOnWrite("hi".to_string()));
        let mut session = PersistentSession::start(&spawner, "ollama", "phi3:mini").unwrap();

        session.stop().await;
        session.stop().await;
        assert_eq!(spawner.live_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_after_crash() {
        let spawner = ScriptedSpawner::new();
        spawner.push(ScriptBehavior::exit_ok());
        let mut session = PersistentSession::start(&spawner, "ollama", "phi3:mini").unwrap();

        assert!(!session.is_alive());
        session.stop().await;
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_collects_stream() {
        let spawner = ScriptedSpawner::new();
        spawner.push(ScriptBehavior::EchoOnWrite("chunk".to_string()));
        let mut session = PersistentSession::start(&spawner, "ollama", "phi3:mini").unwrap();

        let cancel = no_cancel();
        let text = session
            .send(
                "hello",
                None,
                Duration::from_secs(5),
                CompletionHeuristic::IdleTimeout(Duration::from_millis(200)),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(text, "chunk");
    }

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt("p", None), "p");
        assert_eq!(compose_prompt("p", Some("")), "p");
        assert_eq!(compose_prompt("p", Some("ctx")), "ctx\n\np");
    }
}
