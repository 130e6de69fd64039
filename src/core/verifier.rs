use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span};

use crate::core::blockmap::BlockMap;
use crate::core::checksum::{ChecksumAlgorithm, digests_match};
use crate::core::destination::{Destination, DestinationError};
use crate::logging::LogThrottle;

/// Bytes read from a destination between progress reports.
pub const VERIFY_CHUNK_SIZE: usize = 1024 * 1024;

/// What a destination's contents are checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    /// Digest of the full image.
    Checksum {
        algorithm: ChecksumAlgorithm,
        digest: String,
    },
    /// Only the mapped ranges are read and compared.
    BlockMap(BlockMap),
}

impl Expected {
    /// A checksum using the default algorithm.
    pub fn checksum(digest: impl Into<String>) -> Self {
        Self::Checksum {
            algorithm: ChecksumAlgorithm::default(),
            digest: digest.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyProgress {
    pub bytes: u64,
    pub total: Option<u64>,
}

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub bytes_verified: u64,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("range at {start} (+{length}) mismatch: expected {expected}, got {actual}")]
    RangeMismatch {
        start: u64,
        length: u64,
        expected: String,
        actual: String,
    },

    #[error("short read: expected {expected} bytes, destination returned {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("unexpected region at {position} while verifying block map")]
    UnexpectedRegion { position: u64 },

    #[error("verifier stopped without reporting a result")]
    Aborted,

    #[error(transparent)]
    Destination(#[from] DestinationError),
}

#[derive(Debug)]
pub enum VerifyEvent {
    Progress(VerifyProgress),
    Finish(VerifyResult),
    Error(VerifyError),
}

/// Checks what was written to a single destination.
pub struct Verifier {
    destination: Arc<dyn Destination>,
    expected: Expected,
    size: Option<u64>,
    chunk_size: usize,
}

impl Verifier {
    pub fn new(destination: Arc<dyn Destination>, expected: Expected, size: Option<u64>) -> Self {
        Self {
            destination,
            expected,
            size,
            chunk_size: VERIFY_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn destination(&self) -> &Arc<dyn Destination> {
        &self.destination
    }

    /// Run verification to completion, calling `on_progress` after every chunk.
    pub async fn verify<F>(&self, mut on_progress: F) -> Result<VerifyResult, VerifyError>
    where
        F: FnMut(VerifyProgress) + Send,
    {
        let span = info_span!("verify", destination = %self.destination.name());

        async {
            let result = match &self.expected {
                Expected::Checksum { algorithm, digest } => {
                    self.verify_checksum(*algorithm, digest, &mut on_progress)
                        .await
                }
                Expected::BlockMap(block_map) => {
                    self.verify_block_map(block_map, &mut on_progress).await
                }
            };

            match &result {
                Ok(r) => info!(bytes_verified = r.bytes_verified, "Verification complete"),
                Err(e) => info!(error = %e, "Verification failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Spawn verification and report it as events. Failure is delivered as
    /// [`VerifyEvent::Error`], never as a panic.
    pub fn run(self) -> mpsc::UnboundedReceiver<VerifyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let result = self
                .verify(move |progress| {
                    let _ = progress_tx.send(VerifyEvent::Progress(progress));
                })
                .await;

            let _ = match result {
                Ok(r) => tx.send(VerifyEvent::Finish(r)),
                Err(e) => tx.send(VerifyEvent::Error(e)),
            };
        });

        rx
    }

    async fn verify_checksum(
        &self,
        algorithm: ChecksumAlgorithm,
        expected: &str,
        on_progress: &mut (dyn FnMut(VerifyProgress) + Send),
    ) -> Result<VerifyResult, VerifyError> {
        info!(algorithm = algorithm.as_str(), size = ?self.size, "Starting checksum verification");

        let mut reader = self.destination.create_read_stream(0, self.size).await?;
        let mut hasher = algorithm.hasher();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut bytes: u64 = 0;
        let throttle = LogThrottle::new(std::time::Duration::from_secs(1));

        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(DestinationError::from)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            bytes += n as u64;

            if throttle.should_log() {
                debug!(bytes, "Verification progress");
            }
            on_progress(VerifyProgress {
                bytes,
                total: self.size,
            });
        }

        if let Some(size) = self.size {
            if bytes < size {
                return Err(VerifyError::ShortRead {
                    expected: size,
                    actual: bytes,
                });
            }
        }

        let actual = hasher.finalize_hex();
        if !digests_match(expected, &actual) {
            return Err(VerifyError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        Ok(VerifyResult {
            bytes_verified: bytes,
        })
    }

    async fn verify_block_map(
        &self,
        block_map: &BlockMap,
        on_progress: &mut (dyn FnMut(VerifyProgress) + Send),
    ) -> Result<VerifyResult, VerifyError> {
        let total = block_map.mapped_bytes();
        info!(
            ranges = block_map.ranges.len(),
            mapped_bytes = total,
            "Starting block map verification"
        );

        let mut chunks = self.destination.create_sparse_read_stream(block_map).await?;
        let mut bytes: u64 = 0;

        for range in &block_map.ranges {
            let mut hasher = block_map.algorithm.hasher();
            let mut cursor = range.start;

            while cursor < range.end() {
                let chunk = match chunks.next().await {
                    Some(chunk) => chunk?,
                    None => {
                        return Err(VerifyError::ShortRead {
                            expected: total,
                            actual: bytes,
                        });
                    }
                };
                if chunk.position != cursor || chunk.end() > range.end() || chunk.data.is_empty() {
                    return Err(VerifyError::UnexpectedRegion {
                        position: chunk.position,
                    });
                }

                hasher.update(&chunk.data);
                cursor = chunk.end();
                bytes += chunk.data.len() as u64;
                on_progress(VerifyProgress {
                    bytes,
                    total: Some(total),
                });
            }

            let actual = hasher.finalize_hex();
            if !digests_match(&range.checksum, &actual) {
                return Err(VerifyError::RangeMismatch {
                    start: range.start,
                    length: range.length,
                    expected: range.checksum.clone(),
                    actual,
                });
            }
        }

        Ok(VerifyResult {
            bytes_verified: bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryDestination;

    async fn written(name: &str, content: &[u8]) -> Arc<dyn Destination> {
        let destination = MemoryDestination::with_contents(name, content.to_vec());
        destination.open().await.unwrap();
        Arc::new(destination)
    }

    #[tokio::test]
    async fn test_verify_checksum_success() {
        let content = vec![0xAB; 10 * 1024];
        let dest = written("sd-a", &content).await;

        let verifier = Verifier::new(
            dest,
            Expected::checksum(ChecksumAlgorithm::Blake3.digest(&content)),
            Some(content.len() as u64),
        )
        .with_chunk_size(4096);

        let mut reports = Vec::new();
        let result = verifier.verify(|p| reports.push(p.bytes)).await.unwrap();

        assert_eq!(result.bytes_verified, 10 * 1024);
        assert_eq!(reports, vec![4096, 8192, 10240]);
    }

    #[tokio::test]
    async fn test_verify_checksum_mismatch() {
        let dest = written("sd-a", b"corrupted content").await;

        let verifier = Verifier::new(
            dest,
            Expected::checksum(ChecksumAlgorithm::Blake3.digest(b"original content")),
            None,
        );

        let err = verifier.verify(|_| {}).await.unwrap_err();
        assert!(matches!(err, VerifyError::ChecksumMismatch { .. }));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_verify_only_reads_up_to_size() {
        // Trailing bytes beyond the image are not part of the digest.
        let dest = written("sd-a", b"imagedata-and-leftover-garbage").await;

        let verifier = Verifier::new(
            dest,
            Expected::Checksum {
                algorithm: ChecksumAlgorithm::Sha256,
                digest: ChecksumAlgorithm::Sha256.digest(b"imagedata"),
            },
            Some(9),
        );

        let result = verifier.verify(|_| {}).await.unwrap();
        assert_eq!(result.bytes_verified, 9);
    }

    #[tokio::test]
    async fn test_verify_short_destination() {
        let dest = written("sd-a", b"tiny").await;

        let verifier = Verifier::new(dest, Expected::checksum("00"), Some(100));

        let err = verifier.verify(|_| {}).await.unwrap_err();
        assert!(matches!(
            err,
            VerifyError::ShortRead {
                expected: 100,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_verify_block_map_ignores_unmapped_bytes() {
        let mut content = vec![0u8; 64];
        content[0..8].copy_from_slice(b"bootsect");
        content[32..40].copy_from_slice(b"rootfs!!");
        // Garbage in an unmapped region must not matter.
        content[20] = 0xFF;

        let map = BlockMap::new(64, ChecksumAlgorithm::Blake3)
            .with_range(0, b"bootsect")
            .with_range(32, b"rootfs!!");

        let dest = written("sd-a", &content).await;
        let verifier = Verifier::new(dest, Expected::BlockMap(map), Some(64)).with_chunk_size(3);

        let mut last = 0;
        let result = verifier.verify(|p| last = p.bytes).await.unwrap();
        assert_eq!(result.bytes_verified, 16);
        assert_eq!(last, 16);
    }

    #[tokio::test]
    async fn test_verify_block_map_range_mismatch() {
        let map = BlockMap::new(16, ChecksumAlgorithm::Blake3).with_range(8, b"expected");
        let dest = written("sd-a", b"xxxxxxxxactually").await;

        let err = Verifier::new(dest, Expected::BlockMap(map), None)
            .verify(|_| {})
            .await
            .unwrap_err();

        match err {
            VerifyError::RangeMismatch { start, length, .. } => {
                assert_eq!(start, 8);
                assert_eq!(length, 8);
            }
            other => panic!("expected RangeMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_reports_error_as_event() {
        let dest: Arc<dyn Destination> = Arc::new(MemoryDestination::new("never-opened"));

        let mut events = Verifier::new(dest, Expected::checksum("00"), None).run();

        let mut saw_error = false;
        while let Some(event) = events.recv().await {
            match event {
                VerifyEvent::Error(VerifyError::Destination(DestinationError::NotOpen { .. })) => {
                    saw_error = true
                }
                VerifyEvent::Finish(_) => panic!("verification should not finish"),
                _ => {}
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_run_emits_progress_then_finish() {
        let dest = written("sd-a", b"hello world").await;

        let mut events = Verifier::new(
            dest,
            Expected::checksum(ChecksumAlgorithm::Blake3.digest(b"hello world")),
            Some(11),
        )
        .run();

        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }

        assert!(matches!(
            collected.first(),
            Some(VerifyEvent::Progress(VerifyProgress { bytes: 11, .. }))
        ));
        assert!(matches!(
            collected.last(),
            Some(VerifyEvent::Finish(VerifyResult { bytes_verified: 11 }))
        ));
    }
}
