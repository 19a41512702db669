//! Progress event bus
//!
//! Fan-out of session status and progress to external observers (UI,
//! logging) over a broadcast channel. The bus is stateless apart from a
//! per-session throttle clock: transition events always go out, byte-level
//! progress during Downloading is rate-limited so a fast transfer cannot
//! flood subscribers. No delivery guarantee is made beyond "subscribers
//! active at emission time receive it" - a lagging receiver drops the oldest
//! events, which is acceptable for progress display.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::app::models::{ModelFormat, ModelMetadata, SessionStatus};
use crate::constants::events;

/// A progress or transition event for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Session the event belongs to
    pub session_id: Uuid,
    /// Session status at emission time
    pub status: SessionStatus,
    /// Bytes downloaded so far (sum over chunks)
    pub downloaded_bytes: u64,
    /// Expected total bytes
    pub total_bytes: u64,
    /// Smoothed throughput, bytes per second
    pub bytes_per_second: f64,
    /// Emission timestamp
    pub timestamp: DateTime<Utc>,
    /// Optional human-readable message (errors, transitions)
    pub message: Option<String>,
}

/// Completion notification for post-install collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionNotice {
    /// Manifest key of the installed model
    pub model_id: String,
    /// Path of the committed blob
    pub blob_path: std::path::PathBuf,
    /// Binary format
    pub format: ModelFormat,
    /// Header-derived metadata
    pub metadata: ModelMetadata,
}

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Broadcast channel capacity
    pub channel_capacity: usize,
    /// Minimum interval between throttled progress events per session
    pub progress_min_interval: Duration,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: events::CHANNEL_CAPACITY,
            progress_min_interval: events::PROGRESS_MIN_INTERVAL,
        }
    }
}

/// Broadcast fan-out for progress events and completion notices
#[derive(Debug)]
pub struct EventBus {
    progress_tx: broadcast::Sender<ProgressEvent>,
    completion_tx: broadcast::Sender<CompletionNotice>,
    min_interval: Duration,
    last_emit: Mutex<HashMap<Uuid, Instant>>,
}

impl EventBus {
    /// Create a bus with the given configuration
    pub fn new(config: EventConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(config.channel_capacity);
        let (completion_tx, _) = broadcast::channel(config.channel_capacity);
        Self {
            progress_tx,
            completion_tx,
            min_interval: config.progress_min_interval,
            last_emit: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Subscribe to completion notices
    pub fn subscribe_completions(&self) -> broadcast::Receiver<CompletionNotice> {
        self.completion_tx.subscribe()
    }

    /// Emit a transition event unconditionally
    ///
    /// Send errors mean "no subscribers" and are deliberately ignored.
    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.progress_tx.send(event);
    }

    /// Emit a byte-progress event, rate-limited per session
    ///
    /// Returns `true` if the event was sent, `false` if it was throttled.
    pub fn emit_throttled(&self, event: ProgressEvent) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last_emit.lock().expect("throttle clock poisoned");
            match last.get(&event.session_id) {
                Some(prev) if now.duration_since(*prev) < self.min_interval => return false,
                _ => {
                    last.insert(event.session_id, now);
                }
            }
        }
        let _ = self.progress_tx.send(event);
        true
    }

    /// Emit a completion notice (exactly once per completed session)
    pub fn emit_completion(&self, notice: CompletionNotice) {
        let _ = self.completion_tx.send(notice);
    }

    /// Drop a session's throttle clock once it reaches a terminal status
    pub fn forget_session(&self, session_id: &Uuid) {
        self.last_emit
            .lock()
            .expect("throttle clock poisoned")
            .remove(session_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventConfig::default())
    }
}

/// Build a progress event with the current timestamp
pub fn progress_event(
    session_id: Uuid,
    status: SessionStatus,
    downloaded_bytes: u64,
    total_bytes: u64,
    bytes_per_second: f64,
    message: Option<String>,
) -> ProgressEvent {
    ProgressEvent {
        session_id,
        status,
        downloaded_bytes,
        total_bytes,
        bytes_per_second,
        timestamp: Utc::now(),
        message,
    }
}
