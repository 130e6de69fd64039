use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::adapters;
use crate::config::FlashConfig;
use crate::core::destination::{Chunk, Destination, DestinationError, WriteStream};
use crate::core::multi::{MultiDestination, MultiVerifyEvent, WriteEvent, WriteSession};
use crate::core::progress::DestinationId;
use crate::core::verifier::Expected;
use crate::logging::LogThrottle;

/// Outcome of a complete flash run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub bytes_written: u64,
    /// Digest of the source image, computed while it was streamed.
    pub checksum: String,
    /// Destinations that were written (and verified, if enabled).
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// Writes one image to every configured destination, then verifies them.
pub struct Orchestrator {
    config: FlashConfig,
}

impl Orchestrator {
    pub fn new(config: FlashConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self) -> Result<FlashReport> {
        self.config.validate()?;
        let destinations = adapters::get_destinations(
            &self.config.destinations,
            self.config.simulation,
            self.config.sync_on_finish,
        );
        self.flash(destinations).await
    }

    /// Flash the configured image to `destinations`.
    pub async fn flash(&self, destinations: Vec<Arc<dyn Destination>>) -> Result<FlashReport> {
        let span = info_span!("flash", image = %self.config.image.display());

        async {
            let start_time = Instant::now();
            let multi = MultiDestination::with_options(destinations, self.config.session_options())?;
            multi.open_all().await;

            let WriteSession { mut stream, events } = multi.write_session().await;
            let monitor = tokio::spawn(log_write_events(events).in_current_span());

            let copied = self.copy_image(&mut stream).await;
            let finished = stream.finish().await;
            monitor.await.context("Write event monitor panicked")?;

            let (bytes_written, checksum) = match (copied, finished) {
                (Ok(copied), Ok(())) => copied,
                (Err(e), _) => {
                    multi.close_all().await;
                    return Err(e);
                }
                (Ok(_), Err(e)) => {
                    multi.close_all().await;
                    bail!("Write failed on every destination: {e}");
                }
            };
            info!(
                bytes_written,
                checksum = %checksum,
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "Image written"
            );

            if self.config.verify {
                let expected = Expected::Checksum {
                    algorithm: self.config.checksum_algorithm,
                    digest: checksum.clone(),
                };
                let session = multi
                    .create_verifier(expected, Some(bytes_written))
                    .await
                    .run()
                    .await;
                log_verify_events(session.events).await;
            }

            multi.close_all().await;

            let succeeded = names(multi.active_destinations().await);
            let failed = names(multi.errored_destinations().await);
            info!(
                succeeded = succeeded.len(),
                failed = failed.len(),
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "Flash complete"
            );

            Ok(FlashReport {
                bytes_written,
                checksum,
                succeeded,
                failed,
            })
        }
        .instrument(span)
        .await
    }

    /// Stream the image into `stream`, hashing it on the way.
    async fn copy_image(&self, stream: &mut dyn WriteStream<Chunk>) -> Result<(u64, String)> {
        let image = &self.config.image;
        let mut file = File::open(image)
            .await
            .with_context(|| format!("Failed to open image {}", image.display()))?;

        let mut hasher = self.config.checksum_algorithm.hasher();
        let mut buffer = vec![0u8; self.config.chunk_size];
        let mut bytes: u64 = 0;
        let throttle = LogThrottle::new(Duration::from_secs(1));

        loop {
            let n = file
                .read(&mut buffer)
                .await
                .with_context(|| format!("Failed to read image {}", image.display()))?;
            if n == 0 {
                break;
            }

            hasher.update(&buffer[..n]);
            match stream.write(Chunk::from(&buffer[..n])).await {
                Ok(()) => {}
                Err(DestinationError::StreamClosed) => {
                    warn!(bytes, "No destination is accepting data, stopping");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            bytes += n as u64;

            if throttle.should_log() {
                debug!(bytes, "Read image");
            }
        }

        Ok((bytes, hasher.finalize_hex()))
    }
}

fn names(destinations: Vec<(DestinationId, Arc<dyn Destination>)>) -> Vec<String> {
    destinations
        .into_iter()
        .map(|(_, d)| d.name().to_string())
        .collect()
}

async fn log_write_events(mut events: mpsc::UnboundedReceiver<WriteEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            WriteEvent::Progress(progress) => {
                info!(position = progress.position, "Write progress")
            }
            WriteEvent::Fail(e) => {
                warn!(destination = e.name(), id = %e.id, error = %e.error, "Destination failed")
            }
            WriteEvent::Done => info!("All remaining destinations written"),
            WriteEvent::AllFailed => error!("Every destination failed"),
        }
    }
}

async fn log_verify_events(mut events: mpsc::UnboundedReceiver<MultiVerifyEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MultiVerifyEvent::Progress(progress) => {
                info!(bytes = progress.bytes, total = ?progress.total, "Verify progress")
            }
            MultiVerifyEvent::Error(e) => {
                warn!(destination = e.name(), id = %e.id, error = %e.error, "Verification failed")
            }
            MultiVerifyEvent::Finish => info!("Verification finished"),
        }
    }
}
