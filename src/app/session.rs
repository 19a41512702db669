//! Download session manager
//!
//! Owns the per-download state machine (`Queued → Downloading → (Paused ⇄
//! Downloading) → Verifying → Installing → Completed`, with `Failed` on
//! unrecoverable error and `Cancelled` from any non-terminal state) and
//! composes the chunk scheduler, the integrity verifier, and the storage
//! manager. The manager and the scheduler are the only mutators of session
//! records.
//!
//! Admission is driven by the [`AdmissionQueue`] arbiter: `start` enqueues
//! and returns immediately without touching the network; sessions begin
//! downloading only when a global slot frees up. Completed and cancelled
//! sessions are archived to history; failed sessions stay live so the
//! explicit `retry` operation can re-queue them while preserving completed
//! chunks.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::chunks::{ChunkConfig, ChunkScheduler, RunOutcome, RunSignal};
use crate::app::cleanup::{suggest_cleanup, CleanupConfig, HardwareProfile};
use crate::app::events::{progress_event, CompletionNotice, EventBus, EventConfig};
use crate::app::models::{
    CleanupSuggestion, DownloadRequest, DownloadSession, InstalledModel, ModelFormat, ModelOrigin,
    SessionRecord, SessionStatus, UsageStats,
};
use crate::app::queue::{AdmissionQueue, QueueConfig, QuotaGate, QuotaVerdict};
use crate::app::state::SessionStore;
use crate::app::storage::{StorageConfig, StorageManager};
use crate::app::verify::{Verifier, VerifyConfig};
use crate::app::client::TransferClient;
use crate::errors::{Result, SessionError, SessionResult, StorageError, VerifyError};

/// Unified engine configuration, immutable once sessions are running
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Chunk scheduler settings
    pub chunk: ChunkConfig,
    /// Admission queue settings
    pub queue: QueueConfig,
    /// Storage settings
    pub storage: StorageConfig,
    /// Verification settings
    pub verify: VerifyConfig,
    /// Cleanup scoring settings
    pub cleanup: CleanupConfig,
    /// Event bus settings
    pub events: EventConfig,
    /// Registry name recorded in manifest origins
    pub registry: String,
}

/// Per-session control handle
struct SessionHandle {
    record: Arc<Mutex<SessionRecord>>,
    control: watch::Sender<RunSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// The download session manager
///
/// One instance per process; cheap to share via `Arc`.
pub struct SessionManager {
    config: EngineConfig,
    storage: Arc<StorageManager>,
    store: Arc<SessionStore>,
    client: Arc<dyn TransferClient>,
    quota: Arc<dyn QuotaGate>,
    events: Arc<EventBus>,
    queue: Arc<AdmissionQueue>,
    verifier: Verifier,
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
}

impl SessionManager {
    /// Construct the engine, open storage, and recover persisted sessions
    pub async fn new(
        config: EngineConfig,
        client: Arc<dyn TransferClient>,
        quota: Arc<dyn QuotaGate>,
    ) -> Result<Arc<Self>> {
        let storage = Arc::new(StorageManager::new(config.storage.clone()).await?);
        let store = Arc::new(SessionStore::open(storage.root()).await?);
        let events = Arc::new(EventBus::new(config.events.clone()));
        let queue = Arc::new(AdmissionQueue::with_config(config.queue.clone()));
        let verifier = Verifier::with_config(config.verify.clone());

        let manager = Arc::new(Self {
            config,
            storage,
            store,
            client,
            quota,
            events,
            queue,
            verifier,
            sessions: RwLock::new(HashMap::new()),
        });
        manager.recover().await?;
        Ok(manager)
    }

    /// The storage manager, for library operations (list, remove, verify)
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// The event bus, for observers
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The admission queue, for stats
    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    /// Submit a download request
    ///
    /// Validates the request, consults the quota gate and the disk-space
    /// pre-check, then enqueues. Never blocks on network I/O; the transfer
    /// starts when a global slot is free.
    pub async fn start(self: &Arc<Self>, request: DownloadRequest) -> SessionResult<Uuid> {
        if request.artifact.total_bytes == 0 {
            return Err(SessionError::Rejected {
                reason: "artifact size must be known and non-zero".into(),
            });
        }
        if request.artifact.model_id.is_empty() {
            return Err(SessionError::Rejected {
                reason: "artifact model id must not be empty".into(),
            });
        }

        if let QuotaVerdict::Deny(reason) = self.quota.can_start_download(&request.user_id).await {
            return Err(SessionError::QuotaDenied { reason });
        }

        if !self
            .storage
            .has_room(request.artifact.total_bytes)
            .await
            .map_err(SessionError::Storage)?
        {
            let stats = self.storage.stats().await.map_err(SessionError::Storage)?;
            return Err(SessionError::Storage(StorageError::InsufficientSpace {
                required: request.artifact.total_bytes,
                available: stats.free_disk_bytes,
            }));
        }

        let mut session = DownloadSession::new(&request, PathBuf::new());
        session.destination_path = self.storage.partial_path(&session.id);
        let session_id = session.id;
        let priority = session.priority;

        let record = SessionRecord {
            session,
            chunks: Vec::new(),
        };
        self.store.save(&record).await?;
        self.emit_transition(&record, None);

        self.install_handle(record).await;
        self.queue.push(session_id, priority).await?;
        info!(%session_id, ?priority, "download queued");

        self.pump_admissions().await;
        Ok(session_id)
    }

    /// Signal an active session to pause at the next chunk boundary
    ///
    /// In-flight chunks finish; the session reaches `Paused` once no chunk
    /// is mid-transfer.
    pub async fn pause(&self, session_id: &Uuid) -> SessionResult<()> {
        let handle = self.handle(session_id).await?;
        let status = handle.record.lock().await.session.status;
        if status != SessionStatus::Downloading {
            return Err(SessionError::InvalidTransition {
                operation: "pause",
                status: status.to_string(),
            });
        }
        handle.control.send_replace(RunSignal::Pause);
        debug!(%session_id, "pause signalled");
        Ok(())
    }

    /// Re-admit a paused session, reusing persisted chunk state
    ///
    /// No byte range already marked completed is ever re-fetched.
    pub async fn resume(self: &Arc<Self>, session_id: &Uuid) -> SessionResult<()> {
        let handle = self.handle(session_id).await?;
        let (status, priority) = {
            let r = handle.record.lock().await;
            (r.session.status, r.session.priority)
        };
        if status != SessionStatus::Paused {
            return Err(SessionError::InvalidTransition {
                operation: "resume",
                status: status.to_string(),
            });
        }
        self.queue.push(*session_id, priority).await?;
        info!(%session_id, "resume queued");
        self.pump_admissions().await;
        Ok(())
    }

    /// Cancel a session from any non-terminal state
    ///
    /// Queued and paused sessions are cleaned up immediately; an active
    /// session is signalled and cleans up cooperatively at the next
    /// boundary. Partial artifacts are removed either way.
    pub async fn cancel(&self, session_id: &Uuid) -> SessionResult<()> {
        let handle = self.handle(session_id).await?;
        let status = handle.record.lock().await.session.status;
        match status {
            SessionStatus::Queued => {
                // Remove from the queue if it has not been admitted yet;
                // losing the race just means the cancel signal handles it
                if self.queue.remove_queued(session_id).await.is_ok() {
                    self.finish_cancelled(&handle).await;
                } else {
                    handle.control.send_replace(RunSignal::Cancel);
                }
                Ok(())
            }
            SessionStatus::Paused | SessionStatus::Failed => {
                self.finish_cancelled(&handle).await;
                Ok(())
            }
            SessionStatus::Downloading | SessionStatus::Verifying | SessionStatus::Installing => {
                handle.control.send_replace(RunSignal::Cancel);
                debug!(%session_id, "cancel signalled");
                Ok(())
            }
            _ => Err(SessionError::InvalidTransition {
                operation: "cancel",
                status: status.to_string(),
            }),
        }
    }

    /// Re-queue a failed session, preserving completed chunks
    pub async fn retry(self: &Arc<Self>, session_id: &Uuid) -> SessionResult<()> {
        let handle = self.handle(session_id).await?;
        let priority = {
            let mut r = handle.record.lock().await;
            if r.session.status != SessionStatus::Failed {
                return Err(SessionError::InvalidTransition {
                    operation: "retry",
                    status: r.session.status.to_string(),
                });
            }
            r.session.status = SessionStatus::Queued;
            r.session.retry_count += 1;
            r.session.error_message = None;
            r.session.completed_at = None;
            self.store.save(&r).await?;
            r.session.priority
        };
        handle.control.send_replace(RunSignal::Run);
        self.queue.push(*session_id, priority).await?;
        info!(%session_id, "retry queued");
        self.pump_admissions().await;
        Ok(())
    }

    /// Snapshot one session's record
    pub async fn get_session(&self, session_id: &Uuid) -> SessionResult<SessionRecord> {
        if let Some(handle) = self.sessions.read().await.get(session_id) {
            return Ok(handle.record.lock().await.clone());
        }
        self.store
            .load(session_id)
            .await
            .map_err(|_| SessionError::NotFound {
                session_id: *session_id,
            })
    }

    /// Snapshot every live session
    pub async fn list_sessions(&self) -> Vec<SessionRecord> {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            records.push(handle.record.lock().await.clone());
        }
        records.sort_by_key(|r| r.session.queued_at);
        records
    }

    /// Compute cleanup suggestions targeting the given free-byte amount
    pub async fn suggest_cleanup(
        &self,
        target_free_bytes: u64,
        hardware: Option<HardwareProfile>,
    ) -> SessionResult<Vec<CleanupSuggestion>> {
        let models = self
            .storage
            .list_models()
            .await
            .map_err(SessionError::Storage)?;
        let hardware = hardware.unwrap_or_else(HardwareProfile::detect);
        Ok(suggest_cleanup(
            &models,
            target_free_bytes,
            &self.config.cleanup,
            &hardware,
            Utc::now(),
        ))
    }

    /// Signal every active session to pause and wait for tasks to settle
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().cloned().collect();
        for handle in &handles {
            handle.control.send_replace(RunSignal::Pause);
        }
        for handle in handles {
            let task = handle.task.lock().await.take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(error = %e, "session task join failed during shutdown");
                }
            }
        }
        info!("session manager shut down");
    }

    /// Block until no session is queued or active (test and CLI helper)
    pub async fn wait_until_idle(&self) {
        loop {
            let stats = self.queue.stats().await;
            if stats.active == 0 && stats.queued_total() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // ------------------------------------------------------------------
    // Internal machinery
    // ------------------------------------------------------------------

    async fn handle(&self, session_id: &Uuid) -> SessionResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(SessionError::NotFound {
                session_id: *session_id,
            })
    }

    async fn install_handle(&self, record: SessionRecord) -> Arc<SessionHandle> {
        let id = record.session.id;
        let (control, _) = watch::channel(RunSignal::Run);
        let handle = Arc::new(SessionHandle {
            record: Arc::new(Mutex::new(record)),
            control,
            task: Mutex::new(None),
        });
        self.sessions.write().await.insert(id, Arc::clone(&handle));
        handle
    }

    /// Recover persisted sessions after a process restart
    ///
    /// Sessions with a chunk table come back as `Paused` - resumable without
    /// re-probing the partial file; records that never planned chunks are
    /// re-queued from scratch. Terminal leftovers are archived.
    async fn recover(self: &Arc<Self>) -> Result<()> {
        let records = self.store.load_all().await?;
        let mut live_ids = HashSet::new();
        let mut requeue = Vec::new();

        for mut record in records {
            let id = record.session.id;
            let status = record.session.status;

            if status.is_terminal() {
                self.store.archive(&record).await?;
                continue;
            }
            live_ids.insert(id);

            if record.chunks.is_empty() {
                record.session.status = SessionStatus::Queued;
                let priority = record.session.priority;
                self.store.save(&record).await?;
                self.install_handle(record).await;
                requeue.push((id, priority));
                info!(session_id = %id, "recovered session re-queued");
            } else {
                record.session.status = SessionStatus::Paused;
                record.session.paused_at = Some(Utc::now());
                self.store.save(&record).await?;
                self.install_handle(record).await;
                info!(session_id = %id, "recovered session paused, awaiting resume");
            }
        }

        if let Err(e) = self.storage.cleanup_stale_partials(&live_ids).await {
            warn!(error = %e, "stale partial cleanup failed during recovery");
        }

        for (id, priority) in requeue {
            self.queue.push(id, priority).await.map_err(SessionError::Queue)?;
        }
        self.pump_admissions().await;
        Ok(())
    }

    /// Admit queued sessions while slots are free
    fn pump_admissions(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            while let Some(session_id) = this.queue.admit_next().await {
                let Ok(handle) = this.handle(&session_id).await else {
                    warn!(%session_id, "admitted session has no handle, releasing slot");
                    this.queue.release(&session_id).await;
                    continue;
                };
                handle.control.send_replace(RunSignal::Run);
                let manager = Arc::clone(&this);
                let task = tokio::spawn(async move {
                    manager.run_session(session_id).await;
                });
                *handle.task.lock().await = Some(task);
            }
        })
    }

    /// Drive one admitted session to its next settled state
    async fn run_session(self: Arc<Self>, session_id: Uuid) {
        let Ok(handle) = self.handle(&session_id).await else {
            self.queue.release(&session_id).await;
            return;
        };
        let signal = handle.control.subscribe();

        // Queued|Paused -> Downloading
        {
            let mut r = handle.record.lock().await;
            r.session.status = SessionStatus::Downloading;
            r.session.started_at.get_or_insert_with(Utc::now);
            r.session.paused_at = None;
            if let Err(e) = self.store.save(&r).await {
                error!(%session_id, error = %e, "failed to persist downloading transition");
            }
        }
        self.emit_handle_transition(&handle, None).await;

        let scheduler = ChunkScheduler::new(
            self.config.chunk.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            Arc::clone(&self.events),
        );
        let outcome = scheduler.run(Arc::clone(&handle.record), signal.clone()).await;

        match outcome {
            RunOutcome::Completed => {
                // Cancellation requested during the final chunk is honored
                // at this stage boundary
                let cancelled = *signal.borrow() == RunSignal::Cancel;
                if cancelled {
                    self.finish_cancelled(&handle).await;
                } else {
                    self.verify_and_install(&handle, &signal).await;
                }
            }
            RunOutcome::Paused => {
                let mut r = handle.record.lock().await;
                r.session.status = SessionStatus::Paused;
                r.session.paused_at = Some(Utc::now());
                if let Err(e) = self.store.save(&r).await {
                    error!(%session_id, error = %e, "failed to persist pause");
                }
                drop(r);
                self.emit_handle_transition(&handle, None).await;
                info!(%session_id, "session paused");
            }
            RunOutcome::Cancelled => {
                self.finish_cancelled(&handle).await;
            }
            RunOutcome::Failed(e) => {
                self.finish_failed(&handle, e.to_string(), false).await;
            }
        }

        self.queue.release(&session_id).await;
        self.pump_admissions().await;
    }

    /// Verifying -> Installing -> Completed, or Failed on either check
    async fn verify_and_install(
        &self,
        handle: &Arc<SessionHandle>,
        signal: &watch::Receiver<RunSignal>,
    ) {
        let (session_id, partial_path, expected_hash, artifact) = {
            let mut r = handle.record.lock().await;
            r.session.status = SessionStatus::Verifying;
            if let Err(e) = self.store.save(&r).await {
                error!(error = %e, "failed to persist verifying transition");
            }
            (
                r.session.id,
                r.session.destination_path.clone(),
                r.session.artifact.expected_hash,
                r.session.artifact.clone(),
            )
        };
        self.emit_handle_transition(handle, None).await;

        let metadata = match self
            .verifier
            .verify_artifact(&partial_path, &expected_hash)
            .await
        {
            Ok(metadata) => metadata,
            Err(e) => {
                // No partial trust for a hash-mismatched or malformed
                // artifact: delete it and force a full re-download on retry
                if let Err(io) = tokio::fs::remove_file(&partial_path).await {
                    if io.kind() != std::io::ErrorKind::NotFound {
                        warn!(error = %io, "failed to remove rejected artifact");
                    }
                }
                let wipe_chunks = matches!(
                    e,
                    VerifyError::HashMismatch { .. }
                        | VerifyError::InvalidHeader { .. }
                        | VerifyError::UnsupportedVersion { .. }
                );
                self.finish_failed(handle, e.to_string(), wipe_chunks).await;
                return;
            }
        };

        let cancelled = *signal.borrow() == RunSignal::Cancel;
        if cancelled {
            self.finish_cancelled(handle).await;
            return;
        }

        {
            let mut r = handle.record.lock().await;
            r.session.status = SessionStatus::Installing;
            if let Err(e) = self.store.save(&r).await {
                error!(error = %e, "failed to persist installing transition");
            }
        }
        self.emit_handle_transition(handle, None).await;

        let manifest = InstalledModel {
            model_id: install_key(&artifact.model_id, &artifact.variant_id),
            variant_id: artifact.variant_id.clone(),
            blob_hash: expected_hash,
            size_bytes: artifact.total_bytes,
            format: ModelFormat::Gguf,
            quantization: metadata.quantization.clone(),
            origin: ModelOrigin {
                registry: self.config.registry.clone(),
                model: artifact.model_id.clone(),
                variant: artifact.variant_id.clone(),
                source_url: artifact.source_url.clone(),
            },
            metadata: metadata.clone(),
            stats: UsageStats::new_at(Utc::now()),
        };
        let model_id = manifest.model_id.clone();

        let blob_path = match self.storage.commit(&partial_path, manifest).await {
            Ok(path) => path,
            Err(e) => {
                self.finish_failed(handle, e.to_string(), false).await;
                return;
            }
        };

        let record = {
            let mut r = handle.record.lock().await;
            r.session.status = SessionStatus::Completed;
            r.session.completed_at = Some(Utc::now());
            r.clone()
        };
        if let Err(e) = self.store.archive(&record).await {
            warn!(%session_id, error = %e, "failed to archive completed session");
        }
        self.emit_handle_transition(handle, None).await;
        self.events.emit_completion(CompletionNotice {
            model_id: model_id.clone(),
            blob_path,
            format: ModelFormat::Gguf,
            metadata,
        });
        self.drop_handle(&session_id).await;
        info!(%session_id, %model_id, "model installed");
    }

    async fn finish_cancelled(&self, handle: &Arc<SessionHandle>) {
        let record = {
            let mut r = handle.record.lock().await;
            r.session.status = SessionStatus::Cancelled;
            r.session.completed_at = Some(Utc::now());
            r.clone()
        };
        let session_id = record.session.id;

        if let Err(e) = tokio::fs::remove_file(&record.session.destination_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(%session_id, error = %e, "failed to remove cancelled partial");
            }
        }
        if let Err(e) = self.store.archive(&record).await {
            warn!(%session_id, error = %e, "failed to archive cancelled session");
        }
        self.emit_handle_transition(handle, Some("cancelled".into())).await;
        self.drop_handle(&session_id).await;
        info!(%session_id, "session cancelled");
    }

    async fn finish_failed(&self, handle: &Arc<SessionHandle>, message: String, wipe_chunks: bool) {
        let session_id = {
            let mut r = handle.record.lock().await;
            r.session.status = SessionStatus::Failed;
            r.session.error_message = Some(message.clone());
            r.session.completed_at = Some(Utc::now());
            if wipe_chunks {
                r.chunks.clear();
            }
            if let Err(e) = self.store.save(&r).await {
                error!(error = %e, "failed to persist failure");
            }
            r.session.id
        };
        self.emit_handle_transition(handle, Some(message.clone())).await;
        warn!(%session_id, %message, "session failed");
    }

    async fn drop_handle(&self, session_id: &Uuid) {
        self.sessions.write().await.remove(session_id);
        self.events.forget_session(session_id);
    }

    fn emit_transition(&self, record: &SessionRecord, message: Option<String>) {
        self.events.emit(progress_event(
            record.session.id,
            record.session.status,
            record.downloaded_bytes(),
            record.session.total_bytes(),
            record.session.bytes_per_second,
            message,
        ));
    }

    async fn emit_handle_transition(&self, handle: &Arc<SessionHandle>, message: Option<String>) {
        let record = handle.record.lock().await.clone();
        self.emit_transition(&record, message);
    }
}

/// Manifest key for an installed artifact
///
/// Variants of one base model install under distinct keys so several
/// quantizations can coexist; cleanup groups them back together via
/// `origin.model`.
fn install_key(model_id: &str, variant_id: &str) -> String {
    if variant_id.is_empty() {
        model_id.to_string()
    } else {
        format!("{model_id}@{variant_id}")
    }
}
