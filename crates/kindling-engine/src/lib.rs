//! Engine-facing plumbing for Kindling.
//!
//! This crate owns everything that talks to the local inference engine
//! directly: the subprocess abstraction, the HTTP client for the engine's
//! server, provisioning checks, the model catalog, and model downloads.
//! The engine itself is an opaque external program reachable two ways: a
//! command-line invocation (`run`, `pull`, `serve`) and an HTTP endpoint
//! (model listing, health ping).

pub mod catalog;
pub mod client;
pub mod download;
pub mod error;
pub mod process;
pub mod provision;
pub mod testing;

pub use catalog::{ModelCatalog, ModelDescriptor, ModelStatus};
pub use client::{EngineApi, EngineClient};
pub use download::{DownloadJob, DownloadState, DownloadTracker};
pub use error::{DownloadError, EngineError, ProvisionError};
pub use process::{ExitStatus, ProcessHandle, ProcessSpawner, Signal, TokioSpawner};
pub use provision::{ModelSelector, ProvisionChecker};

/// Default URL of the local engine server.
pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:11434";

/// Default engine binary name.
pub const DEFAULT_ENGINE_BINARY: &str = "ollama";
