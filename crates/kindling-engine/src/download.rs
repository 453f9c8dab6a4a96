//! Model download tracking.
//!
//! Runs the engine's `pull` subcommand and scans its interleaved
//! stdout/stderr stream for percentage tokens. The scan is best-effort
//! text matching: a line without a parseable percentage is "no progress
//! update this tick", never a failure.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::catalog::ModelCatalog;
use crate::error::DownloadError;
use crate::process::{terminate_with_grace, ProcessHandle, ProcessSpawner};

const READ_TICK: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_millis(500);
const STDERR_TAIL_LINES: usize = 8;

/// State of an in-flight download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Transient record of one download subprocess. Discarded once completion
/// or failure has been reported to the caller.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub model_name: String,
    pub percent: f32,
    pub state: DownloadState,
}

/// Runs `pull` subprocesses and reports their progress.
pub struct DownloadTracker {
    binary: String,
    spawner: Arc<dyn ProcessSpawner>,
    timeout: Duration,
}

impl DownloadTracker {
    pub fn new(
        binary: impl Into<String>,
        spawner: Arc<dyn ProcessSpawner>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            spawner,
            timeout,
        }
    }

    /// Download `model`, invoking `on_progress` with the job record on
    /// every state or percentage change.
    ///
    /// Enforces the overall deadline by killing the subprocess, and
    /// invalidates `catalog` on success so the new model is visible on the
    /// next listing.
    pub async fn download(
        &self,
        model: &str,
        catalog: &ModelCatalog,
        on_progress: &mut (dyn FnMut(&DownloadJob) + Send),
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), DownloadError> {
        let mut job = DownloadJob {
            model_name: model.to_string(),
            percent: 0.0,
            state: DownloadState::Pending,
        };
        on_progress(&job);

        let args = vec!["pull".to_string(), model.to_string()];
        let mut handle = match self.spawner.spawn(&self.binary, &args) {
            Ok(handle) => handle,
            Err(e) => {
                job.state = DownloadState::Failed;
                on_progress(&job);
                return Err(DownloadError::SpawnFailed(e.to_string()));
            }
        };

        info!("downloading model '{}' (pid {})", model, handle.id());
        job.state = DownloadState::InProgress;
        on_progress(&job);

        let deadline = Instant::now() + self.timeout;
        let mut stderr_tail: Vec<String> = Vec::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !(stdout_done && stderr_done) {
            if *cancel.borrow() {
                job.state = DownloadState::Failed;
                on_progress(&job);
                terminate_with_grace(handle.as_mut(), KILL_GRACE).await;
                return Err(DownloadError::Cancelled);
            }
            if Instant::now() >= deadline {
                job.state = DownloadState::Failed;
                on_progress(&job);
                warn!("download of '{}' exceeded {:?}, killing", model, self.timeout);
                terminate_with_grace(handle.as_mut(), KILL_GRACE).await;
                return Err(DownloadError::Timeout(model.to_string()));
            }

            // Progress goes to stderr for most engines; read both streams,
            // a tick at a time, so neither pipe can fill up.
            if !stderr_done {
                match timeout(READ_TICK, handle.read_stderr_line()).await {
                    Ok(Ok(Some(line))) => {
                        push_tail(&mut stderr_tail, &line);
                        if let Some(pct) = extract_percent(&line) {
                            if pct != job.percent {
                                job.percent = pct;
                                on_progress(&job);
                            }
                        }
                        continue;
                    }
                    Ok(Ok(None)) => stderr_done = true,
                    Ok(Err(_)) => stderr_done = true,
                    Err(_) => {}
                }
            }
            if !stdout_done {
                match timeout(READ_TICK, handle.read_stdout_line()).await {
                    Ok(Ok(Some(line))) => {
                        if let Some(pct) = extract_percent(&line) {
                            if pct != job.percent {
                                job.percent = pct;
                                on_progress(&job);
                            }
                        }
                        continue;
                    }
                    Ok(Ok(None)) => stdout_done = true,
                    Ok(Err(_)) => stdout_done = true,
                    Err(_) => {}
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = match timeout(remaining, handle.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                job.state = DownloadState::Failed;
                on_progress(&job);
                return Err(DownloadError::Io(e));
            }
            Err(_) => {
                job.state = DownloadState::Failed;
                on_progress(&job);
                terminate_with_grace(handle.as_mut(), KILL_GRACE).await;
                return Err(DownloadError::Timeout(model.to_string()));
            }
        };

        if !status.success() {
            job.state = DownloadState::Failed;
            on_progress(&job);
            return Err(DownloadError::ProcessFailed {
                code: status.code,
                detail: stderr_tail.join("; "),
            });
        }

        job.state = DownloadState::Done;
        job.percent = 100.0;
        on_progress(&job);
        info!("model '{}' downloaded", model);

        catalog.invalidate().await;
        Ok(())
    }
}

fn push_tail(tail: &mut Vec<String>, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    if tail.len() == STDERR_TAIL_LINES {
        tail.remove(0);
    }
    tail.push(trimmed.to_string());
}

/// Scan a line for a percentage token ("42%", "99.5 %"). Returns the last
/// one found, clamped to 0..=100.
fn extract_percent(line: &str) -> Option<f32> {
    static PERCENT: OnceLock<Regex> = OnceLock::new();
    let re = PERCENT.get_or_init(|| {
        Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("percent pattern is valid")
    });

    let mut last = None;
    for caps in re.captures_iter(line) {
        if let Ok(value) = caps[1].parse::<f32>() {
            last = Some(value.clamp(0.0, 100.0));
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_percent() {
        assert_eq!(extract_percent("pulling manifest... 42%"), Some(42.0));
        assert_eq!(extract_percent("  99.5 % done"), Some(99.5));
        assert_eq!(extract_percent("no progress here"), None);
        // Multiple tokens: the most recent wins.
        assert_eq!(extract_percent("12% ... 37%"), Some(37.0));
        // Out-of-range values are clamped, not rejected.
        assert_eq!(extract_percent("999%"), Some(100.0));
    }

    #[test]
    fn test_push_tail_bounded() {
        let mut tail = Vec::new();
        for i in 0..20 {
            push_tail(&mut tail, &format!("line {}", i));
        }
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.last().unwrap(), "line 19");
    }
}
