//! Application constants for modelvault
//!
//! This module centralizes all constants used throughout the engine,
//! organized by functional domain for maintainability and clarity.

use std::time::Duration;

/// HTTP transfer client configuration constants
pub mod http {
    use super::Duration;

    /// Default user agent for all HTTP requests
    pub const USER_AGENT: &str = concat!("modelvault/", env!("CARGO_PKG_VERSION"));

    /// Default HTTP request timeout (per range fetch, not whole artifact)
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Connection establishment timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Connection pool idle timeout
    pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

    /// Maximum connections per host in pool
    pub const POOL_MAX_PER_HOST: usize = 8;
}

/// Chunk scheduler configuration constants
pub mod chunks {
    use super::Duration;

    /// Default chunk size for range fetches (10 MiB)
    pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

    /// Minimum permitted chunk size (1 MiB)
    pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

    /// Default number of concurrent range fetches per session
    pub const DEFAULT_WORKERS_PER_SESSION: usize = 4;

    /// Maximum retry attempts per chunk before the session fails
    pub const MAX_CHUNK_RETRIES: u32 = 3;

    /// Base delay for per-chunk exponential backoff
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

    /// Backoff multiplier applied per attempt
    pub const BACKOFF_MULTIPLIER: u32 = 2;

    /// Maximum backoff delay cap
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

    /// Jitter factor for randomizing retry delays (0.0-1.0)
    pub const BACKOFF_JITTER_FACTOR: f64 = 0.25;

    /// Width of the sliding window used for throughput estimates
    pub const SPEED_WINDOW: Duration = Duration::from_secs(10);

    /// Maximum samples retained in the throughput window
    pub const SPEED_WINDOW_SAMPLES: usize = 64;
}

/// Admission queue and concurrency limiter constants
pub mod queue {
    /// Default global bound on simultaneously downloading sessions
    pub const DEFAULT_MAX_ACTIVE_SESSIONS: usize = 4;

    /// Maximum number of sessions that may wait in the queue
    pub const MAX_QUEUED_SESSIONS: usize = 1024;
}

/// Content-addressed storage layout and accounting constants
pub mod storage {
    use super::Duration;

    /// Directory for content-addressed blobs
    pub const BLOBS_DIR: &str = "blobs";

    /// Directory for model manifests
    pub const MANIFESTS_DIR: &str = "manifests";

    /// Directory for in-progress partial downloads
    pub const PARTIAL_DIR: &str = "partial";

    /// Directory for durable session records
    pub const SESSIONS_DIR: &str = "state/sessions";

    /// Directory for archived (terminal) session records
    pub const HISTORY_DIR: &str = "state/history";

    /// Directory for temporary files during commits
    pub const TMP_DIR: &str = "tmp";

    /// Free-space threshold below which the low-space flag activates (2 GiB)
    pub const LOW_SPACE_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;

    /// Grace period before a never-used model becomes a cleanup candidate
    pub const NEVER_USED_GRACE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
}

/// Streaming verification constants
pub mod verify {
    /// Buffer size for streaming hash computation (1 MiB)
    pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;

    /// Sanity cap on metadata key-value pairs in an artifact header
    pub const MAX_METADATA_KV: u64 = 65_536;

    /// Sanity cap on declared tensor count
    pub const MAX_TENSOR_COUNT: u64 = 1 << 20;

    /// Sanity cap on a single header string (16 MiB)
    pub const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

    /// Arrays longer than this are skipped, not materialized
    pub const MAX_INLINE_ARRAY: u64 = 64;
}

/// Progress event bus constants
pub mod events {
    use super::Duration;

    /// Broadcast channel capacity for progress events
    pub const CHANNEL_CAPACITY: usize = 256;

    /// Minimum interval between throttled progress events per session
    /// (bounds emission at 10 events/sec)
    pub const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(100);
}

/// Cleanup scoring weights and parameters
pub mod cleanup {
    /// Weight of the recency component
    pub const RECENCY_WEIGHT: f64 = 0.40;

    /// Weight of the size component
    pub const SIZE_WEIGHT: f64 = 0.25;

    /// Weight of the duplicate-quantization component
    pub const REDUNDANCY_WEIGHT: f64 = 0.20;

    /// Weight of the hardware-incompatibility component
    pub const INCOMPAT_WEIGHT: f64 = 0.15;

    /// Days of idleness at which the recency component saturates
    pub const IDLE_SATURATION_DAYS: f64 = 90.0;

    /// Size at which the size component saturates (16 GiB)
    pub const SIZE_SATURATION: u64 = 16 * 1024 * 1024 * 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_constants_sane() {
        assert!(chunks::DEFAULT_CHUNK_SIZE >= chunks::MIN_CHUNK_SIZE);
        assert!(chunks::RETRY_BASE_DELAY < chunks::RETRY_MAX_DELAY);
        assert!(chunks::DEFAULT_WORKERS_PER_SESSION > 0);
    }

    #[test]
    fn test_cleanup_weights_normalized() {
        let total = cleanup::RECENCY_WEIGHT
            + cleanup::SIZE_WEIGHT
            + cleanup::REDUNDANCY_WEIGHT
            + cleanup::INCOMPAT_WEIGHT;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_event_throttle_rate() {
        let per_second = Duration::from_secs(1).as_millis() / events::PROGRESS_MIN_INTERVAL.as_millis();
        assert!(per_second <= 10);
    }
}
