//! Priority admission queue and global concurrency limiter
//!
//! A single arbiter instance owns the queue and the slot count - the only
//! cross-session shared mutable state in the engine. Sessions are admitted
//! in priority order (High > Normal > Low, FIFO within a tier) whenever an
//! execution slot is free. A newly submitted high-priority session jumps
//! ahead of queued lower-priority ones but never preempts a session that is
//! already downloading: priority affects queue order only, never active
//! transfers.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::app::models::Priority;
use crate::constants::queue as defaults;
use crate::errors::{QueueError, QueueResult};

/// Verdict from the license/quota collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaVerdict {
    /// The download may start
    Allow,
    /// The download is denied with a reason
    Deny(String),
}

/// Pre-admission gate consulted before a session first leaves Queued
#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// Decide whether the given user may start a download
    async fn can_start_download(&self, user_id: &str) -> QuotaVerdict;
}

/// Default gate that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl QuotaGate for AllowAll {
    async fn can_start_download(&self, _user_id: &str) -> QuotaVerdict {
        QuotaVerdict::Allow
    }
}

/// Configuration for the admission queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Global bound on simultaneously downloading sessions
    pub max_active_sessions: usize,
    /// Maximum queued (not yet admitted) sessions
    pub max_queued_sessions: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: defaults::DEFAULT_MAX_ACTIVE_SESSIONS,
            max_queued_sessions: defaults::MAX_QUEUED_SESSIONS,
        }
    }
}

/// Snapshot of queue and slot state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Sessions waiting in the high tier
    pub queued_high: usize,
    /// Sessions waiting in the normal tier
    pub queued_normal: usize,
    /// Sessions waiting in the low tier
    pub queued_low: usize,
    /// Sessions currently holding a slot
    pub active: usize,
    /// Total sessions ever admitted
    pub admitted_total: u64,
    /// Queue creation time
    pub created_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Total queued across all tiers
    pub fn queued_total(&self) -> usize {
        self.queued_high + self.queued_normal + self.queued_low
    }
}

#[derive(Debug)]
struct QueueState {
    high: VecDeque<Uuid>,
    normal: VecDeque<Uuid>,
    low: VecDeque<Uuid>,
    active: HashSet<Uuid>,
    admitted_total: u64,
    created_at: DateTime<Utc>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            active: HashSet::new(),
            admitted_total: 0,
            created_at: Utc::now(),
        }
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<Uuid> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn queued_len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn pop_highest(&mut self) -> Option<Uuid> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

/// The admission arbiter: queue plus concurrency slots
///
/// Constructed once per engine and shared by handle; there is no ambient
/// global instance.
#[derive(Debug)]
pub struct AdmissionQueue {
    config: QueueConfig,
    state: Arc<Mutex<QueueState>>,
}

impl AdmissionQueue {
    /// Create an arbiter with default configuration
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create an arbiter with custom configuration
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(QueueState::new())),
        }
    }

    /// Enqueue a session at its priority tier
    pub async fn push(&self, session_id: Uuid, priority: Priority) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.queued_len() >= self.config.max_queued_sessions {
            return Err(QueueError::QueueFull {
                capacity: self.config.max_queued_sessions,
            });
        }
        state.tier_mut(priority).push_back(session_id);
        debug!(%session_id, ?priority, "session queued");
        Ok(())
    }

    /// Admit the next session if a slot is free
    ///
    /// Returns `None` when the queue is empty or every slot is taken. The
    /// admitted session holds its slot until [`release`](Self::release).
    pub async fn admit_next(&self) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        if state.active.len() >= self.config.max_active_sessions {
            return None;
        }
        let session_id = state.pop_highest()?;
        state.active.insert(session_id);
        state.admitted_total += 1;
        debug!(%session_id, active = state.active.len(), "session admitted");
        Some(session_id)
    }

    /// Free the slot held by a session
    pub async fn release(&self, session_id: &Uuid) {
        let mut state = self.state.lock().await;
        if state.active.remove(session_id) {
            debug!(%session_id, active = state.active.len(), "slot released");
        }
    }

    /// Remove a session that is still queued (cancellation before admission)
    pub async fn remove_queued(&self, session_id: &Uuid) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        for tier in [&mut state.high, &mut state.normal, &mut state.low] {
            if let Some(pos) = tier.iter().position(|id| id == session_id) {
                tier.remove(pos);
                return Ok(());
            }
        }
        Err(QueueError::NotQueued {
            session_id: *session_id,
        })
    }

    /// Whether a session currently holds a slot
    pub async fn is_active(&self, session_id: &Uuid) -> bool {
        self.state.lock().await.active.contains(session_id)
    }

    /// Snapshot current queue statistics
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queued_high: state.high.len(),
            queued_normal: state.normal.len(),
            queued_low: state.low.len(),
            active: state.active.len(),
            admitted_total: state.admitted_total,
            created_at: Some(state.created_at),
        }
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}
