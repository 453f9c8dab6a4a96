//! # Kindling Session Orchestration
//!
//! This crate keeps a local inference engine warm: it provisions the
//! engine, holds one persistent subprocess session for low first-token
//! latency, falls back to one-shot invocations when the persistent channel
//! misbehaves, and caches recent results.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  Prompt      │ --> │ SessionManager  │ --> │ PersistentSession│
//! │  source      │     │ (state machine) │     │ (one subprocess) │
//! └──────────────┘     └────────┬────────┘     └──────────────────┘
//!                          │         │ on timeout/failure
//!                     ┌────┴────┐ ┌──┴──────────────┐
//!                     │  Cache  │ │ FallbackInvoker │
//!                     └─────────┘ │ (one-shot proc) │
//!                                 └─────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use kindling_session::{ManagerConfig, SessionManager};
//!
//! let manager = SessionManager::new(ManagerConfig::default());
//! manager.initialize().await?;
//! let out = manager.generate("phi3:mini", "hello", None).await?;
//! println!("{} ({} ms)", out.text, out.duration_ms);
//! ```

mod cache;
mod config;
mod fallback;
mod manager;
mod session;

pub use cache::ResponseCache;
pub use config::{ManagerConfig, ManagerConfigBuilder};
pub use fallback::{FallbackInvoker, InvokeError};
pub use manager::{Channel, GenerateError, Generation, ManagerState, SessionManager};
pub use session::{CompletionHeuristic, PersistentSession, SessionError};

// Re-export engine types callers need for provisioning and listings.
pub use kindling_engine::{
    DownloadError, DownloadJob, DownloadState, EngineApi, EngineClient, ModelDescriptor,
    ModelSelector, ModelStatus, ProvisionError, DEFAULT_ENGINE_BINARY, DEFAULT_ENGINE_URL,
};
