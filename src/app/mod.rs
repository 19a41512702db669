//! Core engine logic for modelvault
//!
//! This module contains the main engine components: the transfer client
//! abstraction, chunk scheduler, integrity verifier, content-addressed
//! storage, admission queue, session manager, and the progress event bus.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modelvault::app::{
//!     AllowAll, ArtifactRef, DownloadRequest, EngineConfig, HttpTransferClient, SessionManager,
//!     Sha256Hash,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(HttpTransferClient::new()?);
//! let manager = SessionManager::new(EngineConfig::default(), client, Arc::new(AllowAll)).await?;
//!
//! let artifact = ArtifactRef {
//!     model_id: "llama-3-8b".into(),
//!     variant_id: "Q4_K_M".into(),
//!     source_url: "https://models.example.com/llama-3-8b.Q4_K_M.gguf".parse()?,
//!     total_bytes: 4_920_000_000,
//!     expected_hash: Sha256Hash::from_hex(
//!         "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
//!     )?,
//! };
//! let session_id = manager
//!     .start(DownloadRequest::new(artifact, "local-user"))
//!     .await?;
//!
//! let mut events = manager.events().subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{}: {} / {} bytes", event.session_id, event.downloaded_bytes, event.total_bytes);
//!     if event.session_id == session_id && event.status.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunks;
pub mod cleanup;
pub mod client;
pub mod events;
pub mod gguf;
pub mod hash;
pub mod models;
pub mod queue;
pub mod session;
pub mod state;
pub mod storage;
pub mod verify;

// Re-export main public API
pub use chunks::{ChunkConfig, ChunkScheduler, RunOutcome, RunSignal, SpeedWindow};
pub use cleanup::{suggest_cleanup, CleanupConfig, HardwareProfile};
pub use client::{ByteRange, ByteStream, ClientConfig, HttpTransferClient, SourceInfo, TransferClient};
pub use events::{CompletionNotice, EventBus, EventConfig, ProgressEvent};
pub use hash::Sha256Hash;
pub use models::{
    ArtifactRef, Chunk, ChunkStatus, CleanupReason, CleanupSuggestion, DownloadRequest,
    DownloadSession, InstalledModel, ModelFormat, ModelMetadata, ModelOrigin, Priority,
    SessionRecord, SessionStatus, UsageStats,
};
pub use queue::{AdmissionQueue, AllowAll, QueueConfig, QueueStats, QuotaGate, QuotaVerdict};
pub use session::{EngineConfig, SessionManager};
pub use state::SessionStore;
pub use storage::{StorageConfig, StorageManager, StorageStats, VerificationReport};
pub use verify::{Verifier, VerifyConfig};
