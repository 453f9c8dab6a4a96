//! One-shot fallback invocations for when the persistent channel is
//! unavailable or too slow.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use kindling_engine::process::{terminate_with_grace, ProcessSpawner};

const READ_TICK: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_millis(500);
const STDERR_TAIL_LINES: usize = 8;

/// Errors from one-shot invocations. All are recoverable from the
/// caller's perspective; none crash the manager.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The invocation exceeded its hard deadline and was killed.
    #[error("one-shot invocation timed out after {0:?}")]
    Timeout(Duration),

    /// The process exited with a failure status.
    #[error("engine exited with code {code:?}: {stderr_tail}")]
    NonZeroExit {
        code: Option<i32>,
        stderr_tail: String,
    },

    /// The process could not be started.
    #[error("failed to spawn engine process: {0}")]
    SpawnFailed(String),

    /// The manager was shut down mid-invocation.
    #[error("invocation cancelled by shutdown")]
    Cancelled,
}

/// Issues a fully independent process per prompt. Never holds a
/// persistent handle; every invocation is guaranteed to terminate (by
/// timeout-kill) before returning.
pub struct FallbackInvoker {
    binary: String,
    spawner: Arc<dyn ProcessSpawner>,
}

impl FallbackInvoker {
    pub fn new(binary: impl Into<String>, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            binary: binary.into(),
            spawner,
        }
    }

    /// Run one prompt through a single-shot process under a hard deadline.
    pub async fn invoke(
        &self,
        model: &str,
        prompt: &str,
        context: Option<&str>,
        deadline: Duration,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String, InvokeError> {
        let full_prompt = match context {
            Some(ctx) if !ctx.is_empty() => format!("{}\n\n{}", ctx, prompt),
            _ => prompt.to_string(),
        };
        let args = vec!["run".to_string(), model.to_string(), full_prompt];

        let mut handle = self
            .spawner
            .spawn(&self.binary, &args)
            .map_err(|e| InvokeError::SpawnFailed(e.to_string()))?;
        debug!("one-shot invocation of '{}' (pid {})", model, handle.id());

        let started = Instant::now();
        let mut output: Vec<String> = Vec::new();

        // Collect stdout to EOF, or kill on deadline/cancellation.
        loop {
            if *cancel.borrow() {
                terminate_with_grace(handle.as_mut(), KILL_GRACE).await;
                return Err(InvokeError::Cancelled);
            }
            if started.elapsed() >= deadline {
                warn!(
                    "one-shot invocation of '{}' exceeded {:?}, killing",
                    model, deadline
                );
                terminate_with_grace(handle.as_mut(), KILL_GRACE).await;
                return Err(InvokeError::Timeout(deadline));
            }

            match timeout(READ_TICK, handle.read_stdout_line()).await {
                Ok(Ok(Some(line))) => output.push(line),
                Ok(Ok(None)) => break,
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }

        // Grab a bounded stderr tail for error reporting.
        let mut stderr_tail: Vec<String> = Vec::new();
        while stderr_tail.len() < STDERR_TAIL_LINES {
            match timeout(READ_TICK, handle.read_stderr_line()).await {
                Ok(Ok(Some(line))) => {
                    if !line.trim().is_empty() {
                        stderr_tail.push(line.trim().to_string());
                    }
                }
                _ => break,
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let status = match timeout(remaining.max(KILL_GRACE), handle.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(InvokeError::SpawnFailed(e.to_string())),
            Err(_) => {
                terminate_with_grace(handle.as_mut(), KILL_GRACE).await;
                return Err(InvokeError::Timeout(deadline));
            }
        };

        if !status.success() {
            return Err(InvokeError::NonZeroExit {
                code: status.code,
                stderr_tail: stderr_tail.join("; "),
            });
        }

        Ok(output.join("\n").trim().to_string())
    }
}
