//! Core data models for download sessions, chunks, and installed models
//!
//! This module defines the persistent data model of the engine: the session
//! record (session + chunk table) that survives process restarts and acts as
//! the authoritative resume checkpoint, and the installed-model manifest that
//! references a content-addressed blob.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::app::hash::Sha256Hash;

/// Priority tier for download admission
///
/// Ordering is `Low < Normal < High`; the admission queue serves higher
/// tiers first, FIFO within a tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background downloads, served last
    Low,
    /// Default tier
    #[default]
    Normal,
    /// Served ahead of all queued normal/low sessions
    High,
}

/// Lifecycle status of a download session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for a download slot
    Queued,
    /// Chunk workers actively transferring
    Downloading,
    /// Paused at a chunk boundary; resumable
    Paused,
    /// All chunks complete; hash and header checks running
    Verifying,
    /// Verified; committing blob and manifest
    Installing,
    /// Blob committed and manifest written
    Completed,
    /// Unrecoverable error; see the session's error message
    Failed,
    /// Explicitly cancelled; partial data removed
    Cancelled,
}

impl SessionStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Whether the session currently occupies a download slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Downloading | SessionStatus::Verifying | SessionStatus::Installing
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Downloading => "downloading",
            SessionStatus::Paused => "paused",
            SessionStatus::Verifying => "verifying",
            SessionStatus::Installing => "installing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Reference to a remote artifact, as provided by the registry collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Catalog-facing model identifier (manifest key after install)
    pub model_id: String,
    /// Variant identifier within the model (e.g. a quantization label)
    pub variant_id: String,
    /// Source URL for the binary artifact
    pub source_url: Url,
    /// Expected artifact size in bytes
    pub total_bytes: u64,
    /// Expected SHA-256 content hash
    pub expected_hash: Sha256Hash,
}

/// A caller-submitted download request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Artifact to download
    pub artifact: ArtifactRef,
    /// Admission priority
    pub priority: Priority,
    /// User on whose behalf the download runs (passed to the quota gate)
    pub user_id: String,
}

impl DownloadRequest {
    /// Create a request with normal priority
    pub fn new(artifact: ArtifactRef, user_id: impl Into<String>) -> Self {
        Self {
            artifact,
            priority: Priority::Normal,
            user_id: user_id.into(),
        }
    }

    /// Create a request with an explicit priority
    pub fn with_priority(artifact: ArtifactRef, user_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            artifact,
            priority,
            user_id: user_id.into(),
        }
    }
}

/// Status of a single chunk within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ChunkStatus {
    /// Not yet claimed by a worker
    Pending,
    /// Claimed by a worker, transfer in flight
    Downloading,
    /// Fully transferred and durably recorded
    Completed,
    /// Exhausted its retry budget
    Failed { attempts: u32, error: String },
}

/// A contiguous byte range of the artifact, the unit of resumable transfer
///
/// The chunk set of a session always partitions `[0, total_bytes)` with no
/// gaps or overlaps; `end_byte` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of this chunk in the partition
    pub index: usize,
    /// First byte of the range
    pub start_byte: u64,
    /// One past the last byte of the range
    pub end_byte: u64,
    /// Bytes of this chunk written to the partial file so far
    pub downloaded_bytes: u64,
    /// Current status
    pub status: ChunkStatus,
}

impl Chunk {
    /// Total length of the range
    pub fn len(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    /// True for zero-length ranges (never produced by planning)
    pub fn is_empty(&self) -> bool {
        self.end_byte == self.start_byte
    }

    /// Bytes still to transfer
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.downloaded_bytes)
    }

    /// Whether the chunk is durably complete
    pub fn is_completed(&self) -> bool {
        matches!(self.status, ChunkStatus::Completed)
    }
}

/// Split `[0, total_bytes)` into fixed-size chunks
///
/// The final chunk absorbs the remainder. The returned set always partitions
/// the artifact exactly; callers rely on this for disjoint positioned writes.
pub fn plan_chunks(total_bytes: u64, chunk_size: u64) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk size must be positive");
    let mut chunks = Vec::new();
    let mut start = 0u64;
    let mut index = 0usize;
    while start < total_bytes {
        let end = (start + chunk_size).min(total_bytes);
        chunks.push(Chunk {
            index,
            start_byte: start,
            end_byte: end,
            downloaded_bytes: 0,
            status: ChunkStatus::Pending,
        });
        start = end;
        index += 1;
    }
    chunks
}

/// A download session as owned by the session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSession {
    /// Unique session identifier
    pub id: Uuid,
    /// Artifact being downloaded
    pub artifact: ArtifactRef,
    /// Current lifecycle status
    pub status: SessionStatus,
    /// Admission priority
    pub priority: Priority,
    /// Smoothed throughput over the sliding window, bytes per second
    pub bytes_per_second: f64,
    /// Number of explicit retry operations performed on this session
    pub retry_count: u32,
    /// Error message from the most recent failure, if any
    pub error_message: Option<String>,
    /// When the request entered the queue
    pub queued_at: DateTime<Utc>,
    /// When the session first entered Downloading
    pub started_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// When the session was last paused
    pub paused_at: Option<DateTime<Utc>>,
    /// Partial-file destination during transfer
    pub destination_path: PathBuf,
    /// Whether the source supports range requests (set after the probe;
    /// `false` forces single-stream mode with no mid-transfer resume)
    pub range_capable: Option<bool>,
}

impl DownloadSession {
    /// Create a fresh queued session for a request
    pub fn new(request: &DownloadRequest, destination_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            artifact: request.artifact.clone(),
            status: SessionStatus::Queued,
            priority: request.priority,
            bytes_per_second: 0.0,
            retry_count: 0,
            error_message: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            paused_at: None,
            destination_path,
            range_capable: None,
        }
    }

    /// Expected artifact size
    pub fn total_bytes(&self) -> u64 {
        self.artifact.total_bytes
    }
}

/// The durable unit of session state: session plus its chunk table
///
/// The chunk table is the authoritative resume checkpoint. On restart,
/// remaining work is re-derived from chunk status, never from re-probing the
/// partial file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The session
    pub session: DownloadSession,
    /// Chunk partition of the artifact
    pub chunks: Vec<Chunk>,
}

impl SessionRecord {
    /// Bytes downloaded, always derived as the sum over chunks
    pub fn downloaded_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.downloaded_bytes).sum()
    }

    /// Whether every chunk is durably complete
    pub fn all_chunks_completed(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(Chunk::is_completed)
    }
}

/// Binary format of an installed artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// GGUF single-file model
    Gguf,
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFormat::Gguf => write!(f, "gguf"),
        }
    }
}

/// Metadata extracted from an artifact header during verification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model architecture (e.g. "llama", "qwen2")
    pub architecture: Option<String>,
    /// Declared parameter count, when the header carries one
    pub parameter_count: Option<u64>,
    /// Maximum context length
    pub context_length: Option<u64>,
    /// Embedding dimension
    pub embedding_length: Option<u64>,
    /// Attention head count
    pub head_count: Option<u64>,
    /// Transformer block count
    pub block_count: Option<u64>,
    /// Quantization tag (e.g. "Q4_K_M")
    pub quantization: Option<String>,
}

/// Where an installed model came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOrigin {
    /// Source registry identifier
    pub registry: String,
    /// Registry-side model identifier (shared across quantizations)
    pub model: String,
    /// Registry-side variant identifier
    pub variant: String,
    /// URL the artifact was fetched from
    pub source_url: Url,
}

/// Usage statistics for an installed model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    /// When the model was installed
    pub installed_at: DateTime<Utc>,
    /// Most recent recorded use
    pub last_used_at: Option<DateTime<Utc>>,
    /// Number of recorded uses
    pub usage_count: u64,
    /// Cumulative recorded usage duration, seconds
    pub total_usage_secs: u64,
}

impl UsageStats {
    /// Fresh statistics at install time
    pub fn new_at(installed_at: DateTime<Utc>) -> Self {
        Self {
            installed_at,
            last_used_at: None,
            usage_count: 0,
            total_usage_secs: 0,
        }
    }

    /// Record one use of the model
    pub fn record_use(&mut self, duration: Duration, at: DateTime<Utc>) {
        self.last_used_at = Some(at);
        self.usage_count += 1;
        self.total_usage_secs += duration.as_secs();
    }
}

/// Manifest record for an installed model
///
/// Manifests are keyed by `model_id` and reference a blob by content hash.
/// Multiple manifests may reference one blob; blob and manifest lifecycles
/// are independent, and the blob may only be reclaimed once its last
/// referencing manifest is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledModel {
    /// Catalog-facing identifier, the manifest key
    pub model_id: String,
    /// Variant identifier (quantization label)
    pub variant_id: String,
    /// Content hash of the referenced blob
    pub blob_hash: Sha256Hash,
    /// Size of the blob in bytes
    pub size_bytes: u64,
    /// Binary format
    pub format: ModelFormat,
    /// Quantization tag, when known
    pub quantization: Option<String>,
    /// Provenance
    pub origin: ModelOrigin,
    /// Header-derived metadata
    pub metadata: ModelMetadata,
    /// Usage statistics
    pub stats: UsageStats,
}

/// Why a model is suggested for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    /// Installed but never used (past the grace period)
    NeverUsed,
    /// Idle for a long time
    NotUsedRecently,
    /// Large footprint per byte freed
    LargeSize,
    /// A better variant of the same base model is installed
    BetterVersionAvailable,
    /// Exceeds what detected hardware can run
    IncompatibleWithHardware,
    /// Duplicate quantization of an installed base model
    DuplicateQuantization,
}

/// A scored recommendation to delete an installed model
///
/// Derived on demand; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSuggestion {
    /// Manifest key of the candidate
    pub model_id: String,
    /// Blob the manifest references
    pub blob_hash: Sha256Hash,
    /// Bytes that deleting the manifest (and, if unreferenced, the blob)
    /// would reclaim
    pub size_bytes: u64,
    /// Dominant reason for the suggestion
    pub reason: CleanupReason,
    /// Weighted removal score; higher means remove first
    pub priority_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_artifact(total: u64) -> ArtifactRef {
        ArtifactRef {
            model_id: "llama-3-8b".into(),
            variant_id: "Q4_K_M".into(),
            source_url: Url::parse("https://models.example.com/llama-3-8b.Q4_K_M.gguf").unwrap(),
            total_bytes: total,
            expected_hash: Sha256Hash::digest(b"payload"),
        }
    }

    #[test]
    fn test_plan_chunks_partitions_exactly() {
        let chunks = plan_chunks(100, 32);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].start_byte, 0);
        assert_eq!(chunks[3].end_byte, 100);
        assert_eq!(chunks[3].len(), 4);

        // No gaps or overlaps
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end_byte, pair[1].start_byte);
        }
        let total: u64 = chunks.iter().map(Chunk::len).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_plan_chunks_exact_multiple() {
        let chunks = plan_chunks(64, 32);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 32));
    }

    #[test]
    fn test_plan_chunks_single() {
        let chunks = plan_chunks(10, 32);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 10);
    }

    #[test]
    fn test_downloaded_bytes_is_chunk_sum() {
        let request = DownloadRequest::new(sample_artifact(100), "user-1");
        let session = DownloadSession::new(&request, PathBuf::from("/tmp/x.part"));
        let mut record = SessionRecord {
            session,
            chunks: plan_chunks(100, 40),
        };
        record.chunks[0].downloaded_bytes = 40;
        record.chunks[1].downloaded_bytes = 13;
        assert_eq!(record.downloaded_bytes(), 53);
    }

    #[test]
    fn test_all_chunks_completed() {
        let request = DownloadRequest::new(sample_artifact(100), "user-1");
        let session = DownloadSession::new(&request, PathBuf::from("/tmp/x.part"));
        let mut record = SessionRecord {
            session,
            chunks: plan_chunks(100, 50),
        };
        assert!(!record.all_chunks_completed());
        for chunk in &mut record.chunks {
            chunk.downloaded_bytes = chunk.len();
            chunk.status = ChunkStatus::Completed;
        }
        assert!(record.all_chunks_completed());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_status_predicates() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert!(SessionStatus::Verifying.is_active());
        assert!(!SessionStatus::Queued.is_active());
    }

    #[test]
    fn test_usage_stats_recording() {
        let now = Utc::now();
        let mut stats = UsageStats::new_at(now);
        stats.record_use(Duration::from_secs(90), now);
        assert_eq!(stats.usage_count, 1);
        assert_eq!(stats.total_usage_secs, 90);
        assert_eq!(stats.last_used_at, Some(now));
    }

    #[test]
    fn test_session_record_serde_round_trip() {
        let request = DownloadRequest::new(sample_artifact(64), "user-1");
        let session = DownloadSession::new(&request, PathBuf::from("/tmp/a.part"));
        let record = SessionRecord {
            session,
            chunks: plan_chunks(64, 32),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chunks, record.chunks);
        assert_eq!(back.session.id, record.session.id);
    }
}
