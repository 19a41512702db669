//! Cleanup suggestion scoring
//!
//! Recomputed on demand when a caller wants disk space back. Every installed
//! model gets a weighted score from four components: recency (idle time,
//! with never-used models jumping to maximal priority after a grace period),
//! size per byte freed, duplicate-quantization redundancy, and hardware
//! incompatibility. Suggestions come back sorted by score, cut off once the
//! caller's target free-byte amount would be reclaimed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::app::models::{CleanupReason, CleanupSuggestion, InstalledModel};
use crate::constants::{cleanup as weights, storage as layout};

/// Weights and saturation points for cleanup scoring
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Weight of the recency component
    pub recency_weight: f64,
    /// Weight of the size component
    pub size_weight: f64,
    /// Weight of the duplicate-quantization component
    pub redundancy_weight: f64,
    /// Weight of the hardware-incompatibility component
    pub incompat_weight: f64,
    /// Days of idleness at which recency saturates
    pub idle_saturation_days: f64,
    /// Size at which the size component saturates
    pub size_saturation: u64,
    /// Grace period before a never-used model becomes a candidate
    pub never_used_grace: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            recency_weight: weights::RECENCY_WEIGHT,
            size_weight: weights::SIZE_WEIGHT,
            redundancy_weight: weights::REDUNDANCY_WEIGHT,
            incompat_weight: weights::INCOMPAT_WEIGHT,
            idle_saturation_days: weights::IDLE_SATURATION_DAYS,
            size_saturation: weights::SIZE_SATURATION,
            never_used_grace: layout::NEVER_USED_GRACE,
        }
    }
}

/// Detected hardware characteristics relevant to cleanup scoring
#[derive(Debug, Clone, Copy)]
pub struct HardwareProfile {
    /// Total system memory in bytes
    pub total_memory_bytes: u64,
}

impl HardwareProfile {
    /// Detect the current machine's profile
    pub fn detect() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            total_memory_bytes: system.total_memory(),
        }
    }
}

/// Duplicate classification for one model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redundancy {
    Unique,
    /// Duplicate quantization; the retained variant was installed earlier
    Duplicate,
    /// Duplicate quantization; a newer variant of the same base exists
    Superseded,
}

/// Classify duplicates among manifests sharing a base model
///
/// Within each `origin.model` group holding more than one quantization, the
/// most recently used (falling back to most recently installed) variant is
/// retained; everything else is redundant.
fn classify_redundancy(models: &[InstalledModel]) -> HashMap<String, Redundancy> {
    let mut groups: HashMap<&str, Vec<&InstalledModel>> = HashMap::new();
    for model in models {
        groups
            .entry(model.origin.model.as_str())
            .or_default()
            .push(model);
    }

    let mut result = HashMap::new();
    for (_, group) in groups {
        if group.len() < 2 {
            for model in group {
                result.insert(model.model_id.clone(), Redundancy::Unique);
            }
            continue;
        }

        let keep = group
            .iter()
            .max_by_key(|m| (m.stats.last_used_at, m.stats.installed_at))
            .map(|m| m.model_id.clone())
            .unwrap_or_default();

        for model in group {
            let class = if model.model_id == keep {
                Redundancy::Unique
            } else if model.stats.installed_at < keep_installed(models, &keep) {
                Redundancy::Superseded
            } else {
                Redundancy::Duplicate
            };
            result.insert(model.model_id.clone(), class);
        }
    }
    result
}

fn keep_installed(models: &[InstalledModel], model_id: &str) -> DateTime<Utc> {
    models
        .iter()
        .find(|m| m.model_id == model_id)
        .map(|m| m.stats.installed_at)
        .unwrap_or_else(Utc::now)
}

/// Score one model; returns the total score and the dominant reason
fn score_model(
    model: &InstalledModel,
    redundancy: Redundancy,
    config: &CleanupConfig,
    hardware: &HardwareProfile,
    now: DateTime<Utc>,
) -> (f64, CleanupReason) {
    let never_used = model.stats.last_used_at.is_none();

    let recency = match model.stats.last_used_at {
        None => {
            let age = (now - model.stats.installed_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age >= config.never_used_grace {
                1.0
            } else {
                0.0
            }
        }
        Some(last_used) => {
            let idle_days = (now - last_used).num_seconds().max(0) as f64 / 86_400.0;
            (idle_days / config.idle_saturation_days).min(1.0)
        }
    };

    let size = (model.size_bytes as f64 / config.size_saturation as f64).min(1.0);

    let redundant = match redundancy {
        Redundancy::Unique => 0.0,
        Redundancy::Duplicate | Redundancy::Superseded => 1.0,
    };

    let incompatible = if model.size_bytes > hardware.total_memory_bytes {
        1.0
    } else {
        0.0
    };

    let components = [
        (
            recency * config.recency_weight,
            if never_used {
                CleanupReason::NeverUsed
            } else {
                CleanupReason::NotUsedRecently
            },
        ),
        (size * config.size_weight, CleanupReason::LargeSize),
        (
            redundant * config.redundancy_weight,
            match redundancy {
                Redundancy::Superseded => CleanupReason::BetterVersionAvailable,
                _ => CleanupReason::DuplicateQuantization,
            },
        ),
        (
            incompatible * config.incompat_weight,
            CleanupReason::IncompatibleWithHardware,
        ),
    ];

    let total: f64 = components.iter().map(|(score, _)| score).sum();
    let reason = components
        .iter()
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, reason)| *reason)
        .unwrap_or(CleanupReason::NotUsedRecently);

    (total, reason)
}

/// Produce cleanup suggestions until the target free-byte amount is covered
///
/// Models scoring zero are never suggested. When `target_free_bytes` is zero
/// every positive-scoring model is returned (a full audit).
pub fn suggest_cleanup(
    models: &[InstalledModel],
    target_free_bytes: u64,
    config: &CleanupConfig,
    hardware: &HardwareProfile,
    now: DateTime<Utc>,
) -> Vec<CleanupSuggestion> {
    let redundancy = classify_redundancy(models);

    let mut scored: Vec<CleanupSuggestion> = models
        .iter()
        .filter_map(|model| {
            let class = redundancy
                .get(&model.model_id)
                .copied()
                .unwrap_or(Redundancy::Unique);
            let (score, reason) = score_model(model, class, config, hardware, now);
            if score <= 0.0 {
                return None;
            }
            Some(CleanupSuggestion {
                model_id: model.model_id.clone(),
                blob_hash: model.blob_hash,
                size_bytes: model.size_bytes,
                reason,
                priority_score: score,
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.priority_score
            .partial_cmp(&a.priority_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if target_free_bytes == 0 {
        return scored;
    }

    let mut reclaimed = 0u64;
    let mut suggestions = Vec::new();
    for suggestion in scored {
        if reclaimed >= target_free_bytes {
            break;
        }
        reclaimed += suggestion.size_bytes;
        suggestions.push(suggestion);
    }
    suggestions
}
