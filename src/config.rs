//! Configuration management for modelvault
//!
//! Unified configuration with automatic first-run initialization,
//! zero-config defaults, and validation at load time. The TOML layer uses
//! plain integer fields (sizes in MiB, durations in milliseconds or
//! seconds) and converts into the runtime config structs; runtime configs
//! are immutable once a session starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::{
    ChunkConfig, CleanupConfig, ClientConfig, EngineConfig, EventConfig, QueueConfig,
    StorageConfig, VerifyConfig,
};
use crate::constants::{chunks, cleanup, queue, storage};
use crate::errors::{ConfigError, ConfigResult};

/// Unified application configuration for TOML serialization
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Storage root and accounting settings
    pub storage: StorageConfigToml,
    /// Chunked transfer settings
    pub chunks: ChunkConfigToml,
    /// Admission queue settings
    pub queue: QueueConfigToml,
    /// Cleanup scoring settings
    pub cleanup: CleanupConfigToml,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Registry name recorded in manifest origins
    pub registry: RegistryConfigToml,
}

/// TOML-friendly storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfigToml {
    /// Storage root path (None = platform data directory)
    pub root: Option<PathBuf>,
    /// Free-space threshold in MiB below which low-space activates
    pub low_space_threshold_mib: u64,
}

impl Default for StorageConfigToml {
    fn default() -> Self {
        Self {
            root: None,
            low_space_threshold_mib: storage::LOW_SPACE_THRESHOLD / (1024 * 1024),
        }
    }
}

/// TOML-friendly chunk scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfigToml {
    /// Chunk size in MiB
    pub chunk_size_mib: u64,
    /// Concurrent range fetches per session
    pub workers_per_session: usize,
    /// Retry attempts per chunk
    pub max_chunk_retries: u32,
    /// Base backoff delay in milliseconds
    pub retry_base_delay_ms: u64,
    /// Backoff cap in seconds
    pub retry_max_delay_secs: u64,
}

impl Default for ChunkConfigToml {
    fn default() -> Self {
        Self {
            chunk_size_mib: chunks::DEFAULT_CHUNK_SIZE / (1024 * 1024),
            workers_per_session: chunks::DEFAULT_WORKERS_PER_SESSION,
            max_chunk_retries: chunks::MAX_CHUNK_RETRIES,
            retry_base_delay_ms: chunks::RETRY_BASE_DELAY.as_millis() as u64,
            retry_max_delay_secs: chunks::RETRY_MAX_DELAY.as_secs(),
        }
    }
}

/// TOML-friendly queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfigToml {
    /// Global bound on simultaneously downloading sessions
    pub max_active_sessions: usize,
    /// Maximum queued sessions
    pub max_queued_sessions: usize,
}

impl Default for QueueConfigToml {
    fn default() -> Self {
        Self {
            max_active_sessions: queue::DEFAULT_MAX_ACTIVE_SESSIONS,
            max_queued_sessions: queue::MAX_QUEUED_SESSIONS,
        }
    }
}

/// TOML-friendly cleanup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfigToml {
    /// Days before a never-used model becomes a cleanup candidate
    pub never_used_grace_days: u64,
    /// Days of idleness at which the recency score saturates
    pub idle_saturation_days: f64,
}

impl Default for CleanupConfigToml {
    fn default() -> Self {
        Self {
            never_used_grace_days: storage::NEVER_USED_GRACE.as_secs() / 86_400,
            idle_saturation_days: cleanup::IDLE_SATURATION_DAYS,
        }
    }
}

/// Registry identity recorded on installed manifests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfigToml {
    /// Registry name
    pub name: String,
}

impl Default for RegistryConfigToml {
    fn default() -> Self {
        Self {
            name: "default".into(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an explicit path, or the default location
    /// with first-run initialization
    pub async fn load(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound {
                        path: path.to_path_buf(),
                    });
                }
                Self::read_from(path).await
            }
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::read_from(&path).await
                } else {
                    let config = Self::default();
                    config.write_to(&path).await?;
                    info!(path = %path.display(), "wrote default configuration");
                    Ok(config)
                }
            }
        }
    }

    /// Default configuration file location
    pub fn default_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|d| d.join("modelvault").join("config.toml"))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "config_dir".into(),
                value: "<none>".into(),
                reason: "no platform configuration directory".into(),
            })
    }

    async fn read_from(path: &Path) -> ConfigResult<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    async fn write_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            field: "config".into(),
            value: String::new(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Validate field ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.chunks.chunk_size_mib == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chunks.chunk_size_mib".into(),
                value: "0".into(),
                reason: "chunk size must be at least 1 MiB".into(),
            });
        }
        if self.chunks.workers_per_session == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chunks.workers_per_session".into(),
                value: "0".into(),
                reason: "at least one worker per session is required".into(),
            });
        }
        if self.chunks.max_chunk_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chunks.max_chunk_retries".into(),
                value: "0".into(),
                reason: "at least one attempt per chunk is required".into(),
            });
        }
        if self.queue.max_active_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_active_sessions".into(),
                value: "0".into(),
                reason: "at least one concurrent session is required".into(),
            });
        }
        Ok(())
    }

    /// Convert into the runtime engine configuration
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            chunk: ChunkConfig {
                chunk_size: self.chunks.chunk_size_mib * 1024 * 1024,
                workers_per_session: self.chunks.workers_per_session,
                max_chunk_retries: self.chunks.max_chunk_retries,
                retry_base_delay: Duration::from_millis(self.chunks.retry_base_delay_ms),
                retry_max_delay: Duration::from_secs(self.chunks.retry_max_delay_secs),
                ..ChunkConfig::default()
            },
            queue: QueueConfig {
                max_active_sessions: self.queue.max_active_sessions,
                max_queued_sessions: self.queue.max_queued_sessions,
            },
            storage: StorageConfig {
                root: self.storage.root.clone(),
                low_space_threshold: self.storage.low_space_threshold_mib * 1024 * 1024,
            },
            verify: VerifyConfig::default(),
            cleanup: CleanupConfig {
                never_used_grace: Duration::from_secs(
                    self.cleanup.never_used_grace_days * 86_400,
                ),
                idle_saturation_days: self.cleanup.idle_saturation_days,
                ..CleanupConfig::default()
            },
            events: EventConfig::default(),
            registry: self.registry.name.clone(),
        }
    }

    /// Runtime HTTP client configuration
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig::default()
    }
}
