//! Content-addressed blob storage with manifests and disk accounting
//!
//! Verified artifacts are committed under `blobs/<hash>` by atomic rename,
//! so two sources producing byte-identical artifacts occupy exactly one
//! blob. Manifests live under `manifests/<model_id>.json` with an
//! independent lifecycle: several manifests may reference one blob, and the
//! blob is only reclaimed when its last referencing manifest is removed.
//!
//! Accounting distinguishes committed model bytes, in-progress partial
//! bytes, and orphaned temp bytes, and raises a low-space flag below a
//! configurable free-space threshold.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use sysinfo::Disks;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::hash::Sha256Hash;
use crate::app::models::InstalledModel;
use crate::app::verify::Verifier;
use crate::constants::storage as layout;
use crate::errors::{StorageError, StorageResult};

/// Configuration for the storage manager
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Storage root; `None` selects the platform data directory
    pub root: Option<PathBuf>,
    /// Free-space threshold below which the low-space flag activates
    pub low_space_threshold: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            low_space_threshold: layout::LOW_SPACE_THRESHOLD,
        }
    }
}

/// Disk accounting snapshot for one storage root
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Capacity of the disk holding the root
    pub total_disk_bytes: u64,
    /// Free bytes on that disk
    pub free_disk_bytes: u64,
    /// Bytes attributable to committed blobs
    pub committed_bytes: u64,
    /// Bytes attributable to in-progress partial downloads
    pub partial_bytes: u64,
    /// Bytes attributable to temporary or orphaned files
    pub orphaned_bytes: u64,
    /// Number of installed model manifests
    pub model_count: usize,
    /// Whether free space is below the configured threshold
    pub low_on_space: bool,
}

/// One failed entry from a library verification sweep
#[derive(Debug, Clone)]
pub struct VerificationFailure {
    /// Manifest key of the failing model
    pub model_id: String,
    /// What went wrong
    pub reason: String,
}

/// Result of re-hashing every blob against its manifest
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    /// Manifests checked
    pub files_checked: usize,
    /// Manifests whose blob failed the check
    pub files_failed: usize,
    /// Details per failure
    pub failures: Vec<VerificationFailure>,
}

impl VerificationReport {
    /// Whether every checked blob passed
    pub fn is_successful(&self) -> bool {
        self.files_failed == 0
    }
}

/// Content-addressed storage manager
#[derive(Debug)]
pub struct StorageManager {
    root: PathBuf,
    config: StorageConfig,
}

impl StorageManager {
    /// Open (and create if needed) storage under the configured root
    pub async fn new(config: StorageConfig) -> StorageResult<Self> {
        let root = match &config.root {
            Some(root) => root.clone(),
            None => Self::default_root()?,
        };

        for dir in [
            layout::BLOBS_DIR,
            layout::MANIFESTS_DIR,
            layout::PARTIAL_DIR,
            layout::TMP_DIR,
        ] {
            fs::create_dir_all(root.join(dir))
                .await
                .map_err(|_| StorageError::RootNotAccessible { path: root.clone() })?;
        }

        info!(root = %root.display(), "storage opened");
        Ok(Self { root, config })
    }

    fn default_root() -> StorageResult<PathBuf> {
        dirs::data_local_dir()
            .map(|d| d.join("modelvault"))
            .ok_or_else(|| StorageError::RootNotAccessible {
                path: PathBuf::from("<platform data dir>"),
            })
    }

    /// The storage root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob for a content hash
    pub fn blob_path(&self, hash: &Sha256Hash) -> PathBuf {
        self.root.join(layout::BLOBS_DIR).join(hash.to_hex())
    }

    /// Partial-file path for a session
    pub fn partial_path(&self, session_id: &Uuid) -> PathBuf {
        self.root
            .join(layout::PARTIAL_DIR)
            .join(format!("{session_id}.part"))
    }

    fn manifest_path(&self, model_id: &str) -> PathBuf {
        // Manifest keys are catalog ids; flatten path separators so the key
        // can never escape the manifests directory
        let safe: String = model_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root
            .join(layout::MANIFESTS_DIR)
            .join(format!("{safe}.json"))
    }

    /// Commit a verified artifact as a blob plus manifest
    ///
    /// The artifact file is moved (renamed) into the blob store; if a blob
    /// with the same hash already exists the artifact is simply deleted -
    /// content addressing guarantees the bytes are identical. The manifest
    /// is written atomically afterwards, so a crash between the two steps
    /// leaves an unreferenced blob, never a manifest pointing at nothing.
    pub async fn commit(
        &self,
        artifact_path: &Path,
        manifest: InstalledModel,
    ) -> StorageResult<PathBuf> {
        let blob_path = self.blob_path(&manifest.blob_hash);

        if fs::try_exists(&blob_path).await? {
            debug!(hash = %manifest.blob_hash, "blob already present, deduplicating");
            fs::remove_file(artifact_path).await?;
        } else {
            fs::rename(artifact_path, &blob_path)
                .await
                .map_err(|_| StorageError::CommitFailed {
                    temp_path: artifact_path.to_path_buf(),
                    final_path: blob_path.clone(),
                })?;
        }

        self.write_manifest(&manifest).await?;
        info!(
            model_id = %manifest.model_id,
            hash = %manifest.blob_hash,
            size = manifest.size_bytes,
            "model committed"
        );
        Ok(blob_path)
    }

    async fn write_manifest(&self, manifest: &InstalledModel) -> StorageResult<()> {
        let final_path = self.manifest_path(&manifest.model_id);
        let temp_path = self
            .root
            .join(layout::TMP_DIR)
            .join(format!("manifest-{}.tmp", Uuid::new_v4()));

        let json = serde_json::to_vec_pretty(manifest)?;
        fs::write(&temp_path, &json).await?;
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|_| StorageError::CommitFailed {
                temp_path,
                final_path,
            })?;
        Ok(())
    }

    /// Load one manifest by model id
    pub async fn get_model(&self, model_id: &str) -> StorageResult<InstalledModel> {
        let path = self.manifest_path(model_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::ManifestNotFound {
                    model_id: model_id.to_string(),
                });
            }
            Err(e) => return Err(StorageError::Io(e)),
        };
        serde_json::from_slice(&bytes).map_err(|_| StorageError::ManifestCorrupted { path })
    }

    /// List every installed model
    ///
    /// Corrupt manifests are skipped with a warning; one bad record must not
    /// hide the rest of the library.
    pub async fn list_models(&self) -> StorageResult<Vec<InstalledModel>> {
        let mut models = Vec::new();
        let mut entries = fs::read_dir(self.root.join(layout::MANIFESTS_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<InstalledModel>(&bytes) {
                    Ok(model) => models.push(model),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt manifest"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable manifest"),
            }
        }

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Remove a model's manifest, reclaiming its blob when unreferenced
    ///
    /// Returns the number of bytes actually freed (0 when another manifest
    /// still references the blob).
    pub async fn remove_model(&self, model_id: &str) -> StorageResult<u64> {
        let manifest = self.get_model(model_id).await?;
        fs::remove_file(self.manifest_path(model_id)).await?;

        let still_referenced = self
            .list_models()
            .await?
            .iter()
            .any(|m| m.blob_hash == manifest.blob_hash);
        if still_referenced {
            debug!(
                model_id,
                hash = %manifest.blob_hash,
                "blob still referenced, keeping"
            );
            return Ok(0);
        }

        let blob_path = self.blob_path(&manifest.blob_hash);
        match fs::remove_file(&blob_path).await {
            Ok(()) => {
                info!(model_id, hash = %manifest.blob_hash, freed = manifest.size_bytes, "blob reclaimed");
                Ok(manifest.size_bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Record one use of a model, updating its usage statistics
    pub async fn record_usage(&self, model_id: &str, duration: Duration) -> StorageResult<()> {
        let mut manifest = self.get_model(model_id).await?;
        manifest.stats.record_use(duration, Utc::now());
        self.write_manifest(&manifest).await
    }

    /// Snapshot disk accounting for this root
    pub async fn stats(&self) -> StorageResult<StorageStats> {
        let models = self.list_models().await?;
        let committed_bytes = dir_size(&self.root.join(layout::BLOBS_DIR)).await;
        let partial_bytes = dir_size(&self.root.join(layout::PARTIAL_DIR)).await;
        let orphaned_bytes = dir_size(&self.root.join(layout::TMP_DIR)).await;
        let (total_disk_bytes, free_disk_bytes) = disk_space(&self.root);

        Ok(StorageStats {
            total_disk_bytes,
            free_disk_bytes,
            committed_bytes,
            partial_bytes,
            orphaned_bytes,
            model_count: models.len(),
            low_on_space: free_disk_bytes < self.config.low_space_threshold,
        })
    }

    /// Whether an artifact of the given size fits without crossing the
    /// low-space threshold
    ///
    /// Used as the pre-admission disk check; sessions failing it are
    /// rejected before entering the queue.
    pub async fn has_room(&self, required_bytes: u64) -> StorageResult<bool> {
        let (_, free) = disk_space(&self.root);
        Ok(free.saturating_sub(required_bytes) >= self.config.low_space_threshold)
    }

    /// Re-hash every blob against its manifest
    pub async fn verify_library(&self, verifier: &Verifier) -> StorageResult<VerificationReport> {
        let models = self.list_models().await?;
        let mut report = VerificationReport::default();

        for model in models {
            report.files_checked += 1;
            let blob_path = self.blob_path(&model.blob_hash);
            let failure = match verifier.hash_file(&blob_path).await {
                Ok(actual) if actual == model.blob_hash => None,
                Ok(actual) => Some(format!(
                    "hash mismatch: manifest says {}, blob is {}",
                    model.blob_hash, actual
                )),
                Err(e) => Some(format!("unreadable blob: {e}")),
            };
            if let Some(reason) = failure {
                warn!(model_id = %model.model_id, %reason, "library verification failure");
                report.files_failed += 1;
                report.failures.push(VerificationFailure {
                    model_id: model.model_id,
                    reason,
                });
            }
        }

        Ok(report)
    }

    /// Delete partial files whose sessions no longer exist
    ///
    /// Returns the number of files removed.
    pub async fn cleanup_stale_partials(
        &self,
        live_sessions: &HashSet<Uuid>,
    ) -> StorageResult<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(self.root.join(layout::PARTIAL_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let stem = path.file_stem().and_then(|s| s.to_str());
            let session_id = stem.and_then(|s| Uuid::parse_str(s).ok());
            let stale = match session_id {
                Some(id) => !live_sessions.contains(&id),
                None => true, // Not one of ours; a leftover temp name
            };
            if stale {
                if let Err(e) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to remove stale partial");
                } else {
                    debug!(path = %path.display(), "removed stale partial");
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

/// Sum of file sizes directly inside a directory
async fn dir_size(dir: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

/// Total and available space of the disk holding `path`
fn disk_space(path: &Path) -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.total_space(), d.available_space()))
        .unwrap_or((0, u64::MAX))
}
