//! Error types for engine-facing operations.

use thiserror::Error;

/// Errors from the engine's HTTP surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server is not running or not reachable.
    #[error("engine server not reachable at {0}. Start it with: ollama serve")]
    Unreachable(String),
}

/// Errors from provisioning checks.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The engine binary is not installed. Fatal: the manager cannot
    /// proceed without a caller-directed install step.
    #[error(
        "inference engine '{binary}' not found. Install it from \
         https://ollama.com/download, then re-run"
    )]
    EngineMissing { binary: String },

    /// The engine server never became reachable.
    #[error("engine server not reachable at {0} after startup attempts")]
    ServerUnreachable(String),

    /// No model is installed and none could be selected or downloaded.
    #[error("no usable model installed. Pull one with: ollama pull <model>")]
    NoUsableModel,

    /// Downloading the default model failed.
    #[error("model download failed: {0}")]
    Download(#[from] DownloadError),

    /// Engine HTTP error during provisioning.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The manager was shut down mid-provisioning.
    #[error("provisioning cancelled by shutdown")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from model downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The download exceeded its overall deadline and was killed.
    #[error("download of '{0}' timed out")]
    Timeout(String),

    /// The download process exited with a failure.
    #[error("download process failed (exit code {code:?}): {detail}")]
    ProcessFailed { code: Option<i32>, detail: String },

    /// The download process could not be started.
    #[error("failed to spawn download process: {0}")]
    SpawnFailed(String),

    /// The manager was shut down while the download was in flight.
    #[error("download cancelled by shutdown")]
    Cancelled,

    /// I/O error while talking to the download process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
