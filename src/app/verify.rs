//! Integrity verification for downloaded artifacts
//!
//! Two independent checks run after a transfer completes, both streaming
//! with bounded memory: a SHA-256 digest over the full artifact compared to
//! the expected content hash, then GGUF header validation with metadata
//! extraction. Hash runs first - a corrupt download is cheaper to detect
//! than a format parse. Both failures are non-retryable; callers delete the
//! artifact and surface a session failure.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::app::gguf;
use crate::app::hash::{Sha256Hash, StreamingHasher};
use crate::app::models::ModelMetadata;
use crate::constants::verify as limits;
use crate::errors::{VerifyError, VerifyResult};

/// Configuration for streaming verification
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Read buffer size for the streaming hash pass
    pub hash_buffer_size: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            hash_buffer_size: limits::HASH_BUFFER_SIZE,
        }
    }
}

/// Streaming artifact verifier
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    config: VerifyConfig,
}

impl Verifier {
    /// Create a verifier with custom configuration
    pub fn with_config(config: VerifyConfig) -> Self {
        Self { config }
    }

    /// Compute the SHA-256 digest of a file with a bounded buffer
    pub async fn hash_file(&self, path: &Path) -> VerifyResult<Sha256Hash> {
        let mut file = File::open(path).await?;
        let mut hasher = StreamingHasher::new();
        let mut buf = vec![0u8; self.config.hash_buffer_size];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hasher.finalize())
    }

    /// Check the artifact's content hash against the expected value
    ///
    /// A mismatch extends no partial trust to the file, even if most bytes
    /// are correct; the caller must re-download from scratch.
    pub async fn verify_hash(&self, path: &Path, expected: &Sha256Hash) -> VerifyResult<()> {
        let actual = self.hash_file(path).await?;
        if actual != *expected {
            warn!(
                expected = %expected,
                actual = %actual,
                path = %path.display(),
                "artifact hash mismatch"
            );
            return Err(VerifyError::HashMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        debug!(hash = %actual, "artifact hash verified");
        Ok(())
    }

    /// Run both checks in order and return extracted metadata
    ///
    /// Hash first, then header validation. The artifact is left in place on
    /// success; deleting it on failure is the caller's responsibility since
    /// the caller owns the partial-file lifecycle.
    pub async fn verify_artifact(
        &self,
        path: &Path,
        expected: &Sha256Hash,
    ) -> VerifyResult<ModelMetadata> {
        self.verify_hash(path, expected).await?;
        let metadata = gguf::read_file_metadata(path).await?;
        debug!(
            architecture = metadata.architecture.as_deref().unwrap_or("unknown"),
            quantization = metadata.quantization.as_deref().unwrap_or("unknown"),
            "artifact header validated"
        );
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_hash_file_matches_oneshot_digest() {
        let content = vec![7u8; 3 * 1024 * 1024 + 17];
        let (_dir, path) = write_temp(&content);

        let verifier = Verifier::with_config(VerifyConfig {
            hash_buffer_size: 64 * 1024,
        });
        let hash = verifier.hash_file(&path).await.unwrap();
        assert_eq!(hash, Sha256Hash::digest(&content));
    }

    #[tokio::test]
    async fn test_verify_hash_accepts_matching() {
        let content = b"model bytes".to_vec();
        let (_dir, path) = write_temp(&content);
        let verifier = Verifier::default();
        verifier
            .verify_hash(&path, &Sha256Hash::digest(&content))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_flipped_byte_detected() {
        let mut content = vec![0u8; 1024 * 1024];
        let expected = Sha256Hash::digest(&content);
        content[512 * 1024] ^= 0x01;
        let (_dir, path) = write_temp(&content);

        let verifier = Verifier::default();
        let err = verifier.verify_hash(&path, &expected).await.unwrap_err();
        assert!(matches!(err, VerifyError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_verify_artifact_rejects_garbage_header() {
        // Correct hash, invalid format: hash passes, header parse fails
        let content = b"definitely not a gguf file".to_vec();
        let expected = Sha256Hash::digest(&content);
        let (_dir, path) = write_temp(&content);

        let verifier = Verifier::default();
        let err = verifier.verify_artifact(&path, &expected).await.unwrap_err();
        assert!(matches!(err, VerifyError::InvalidHeader { .. }));
    }

    #[tokio::test]
    async fn test_hash_checked_before_format() {
        // Wrong hash AND invalid format: the hash mismatch must win
        let content = b"garbage".to_vec();
        let (_dir, path) = write_temp(&content);

        let verifier = Verifier::default();
        let err = verifier
            .verify_artifact(&path, &Sha256Hash::digest(b"something else"))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::HashMismatch { .. }));
    }
}
