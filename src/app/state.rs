//! Durable session and chunk state
//!
//! Session records (session + chunk table) are persisted as JSON, one file
//! per session, using the temp-file + rename pattern so a crash can never
//! leave a half-written record. The chunk table inside the record is the
//! authoritative resume checkpoint: restart recovery reads these files and
//! never re-probes partial downloads.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::models::SessionRecord;
use crate::constants::storage as layout;
use crate::errors::{StorageError, StorageResult};

/// Filesystem store for session records
#[derive(Debug)]
pub struct SessionStore {
    sessions_dir: PathBuf,
    history_dir: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) the store under a storage root
    pub async fn open(root: &Path) -> StorageResult<Self> {
        let sessions_dir = root.join(layout::SESSIONS_DIR);
        let history_dir = root.join(layout::HISTORY_DIR);
        fs::create_dir_all(&sessions_dir).await?;
        fs::create_dir_all(&history_dir).await?;
        Ok(Self {
            sessions_dir,
            history_dir,
        })
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }

    fn history_path(&self, id: &Uuid) -> PathBuf {
        self.history_dir.join(format!("{id}.json"))
    }

    /// Persist a record atomically (temp file + rename in the same directory)
    pub async fn save(&self, record: &SessionRecord) -> StorageResult<()> {
        let final_path = self.record_path(&record.session.id);
        let temp_path = self
            .sessions_dir
            .join(format!(".{}.json.tmp", record.session.id));

        let json = serde_json::to_vec_pretty(record)?;
        fs::write(&temp_path, &json).await?;
        fs::rename(&temp_path, &final_path).await.map_err(|_| {
            StorageError::CommitFailed {
                temp_path: temp_path.clone(),
                final_path: final_path.clone(),
            }
        })?;

        debug!(session_id = %record.session.id, "session record persisted");
        Ok(())
    }

    /// Load a record by session id
    pub async fn load(&self, id: &Uuid) -> StorageResult<SessionRecord> {
        let path = self.record_path(id);
        let bytes = fs::read(&path).await?;
        serde_json::from_slice(&bytes).map_err(StorageError::Serde)
    }

    /// Load every live (non-archived) record
    ///
    /// Unreadable records are skipped with a warning rather than failing the
    /// whole recovery pass.
    pub async fn load_all(&self) -> StorageResult<Vec<SessionRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.sessions_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<SessionRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping corrupt session record");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session record");
                }
            }
        }

        Ok(records)
    }

    /// Move a terminal record into history
    pub async fn archive(&self, record: &SessionRecord) -> StorageResult<()> {
        let live = self.record_path(&record.session.id);
        let archived = self.history_path(&record.session.id);

        // Persist the final state into history first, then drop the live
        // record; the record is never absent from both locations.
        let json = serde_json::to_vec_pretty(record)?;
        fs::write(&archived, &json).await?;
        match fs::remove_file(&live).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }

        debug!(session_id = %record.session.id, status = %record.session.status, "session archived");
        Ok(())
    }

    /// Remove a live record without archiving (cancelled before any work)
    pub async fn remove(&self, id: &Uuid) -> StorageResult<()> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Ids of all live records
    pub async fn live_ids(&self) -> StorageResult<Vec<Uuid>> {
        let records = self.load_all().await?;
        Ok(records.iter().map(|r| r.session.id).collect())
    }
}
