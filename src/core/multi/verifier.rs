use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use super::{ErroredSet, MultiDestinationError, SessionError, SessionOptions, supervise};
use crate::core::destination::Destination;
use crate::core::progress::{DestinationId, ProgressTracker};
use crate::core::verifier::{Verifier, VerifyError, VerifyEvent, VerifyProgress};

#[derive(Debug)]
pub enum MultiVerifyEvent {
    /// Bytes verified by the slowest verifier still running.
    Progress(VerifyProgress),
    Error(MultiDestinationError),
    /// Every verifier has finished or failed.
    Finish,
}

/// Verifies every surviving destination of a [`super::MultiDestination`] in
/// parallel.
pub struct MultiDestinationVerifier {
    verifiers: Vec<(DestinationId, Verifier)>,
    errored: ErroredSet,
    interval: Duration,
}

/// A running verification.
pub struct MultiVerifySession {
    pub events: mpsc::UnboundedReceiver<MultiVerifyEvent>,
    tracker: ProgressTracker<VerifyProgress>,
}

impl MultiVerifySession {
    /// Verifiers that have neither finished nor failed.
    pub async fn remaining(&self) -> usize {
        self.tracker.active_count().await
    }

    pub fn tracker(&self) -> &ProgressTracker<VerifyProgress> {
        &self.tracker
    }
}

impl MultiDestinationVerifier {
    pub(super) fn new(
        verifiers: Vec<(DestinationId, Verifier)>,
        errored: ErroredSet,
        options: SessionOptions,
    ) -> Self {
        Self {
            verifiers,
            errored,
            interval: options.progress_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.verifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty()
    }

    /// Start every verifier. A failing verifier is reported as
    /// [`MultiVerifyEvent::Error`], marks its destination errored and counts
    /// as done; the others carry on.
    pub async fn run(self) -> MultiVerifySession {
        let span = info_span!("verify_session", session = %Uuid::now_v7());
        info!(parent: &span, destinations = self.verifiers.len(), "Starting verification");

        let tracker = ProgressTracker::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut drivers = JoinSet::new();
        for (id, verifier) in self.verifiers {
            tracker.register(id).await;
            let driver_span = info_span!(parent: &span, "destination", %id);
            let destination = verifier.destination().clone();
            drivers.spawn(
                drive_verifier(
                    id,
                    destination,
                    verifier.run(),
                    tracker.clone(),
                    self.errored.clone(),
                    events_tx.clone(),
                )
                .instrument(driver_span),
            );
        }

        let session_tracker = tracker.clone();
        let interval = self.interval;
        tokio::spawn(
            async move {
                let progress_events = events_tx.clone();
                supervise(
                    drivers,
                    session_tracker,
                    interval,
                    |p: &VerifyProgress| p.bytes,
                    move |progress: VerifyProgress| {
                        let _ = progress_events.send(MultiVerifyEvent::Progress(progress));
                    },
                )
                .await;

                info!("Verification complete");
                let _ = events_tx.send(MultiVerifyEvent::Finish);
            }
            .instrument(span),
        );

        MultiVerifySession {
            events: events_rx,
            tracker,
        }
    }
}

async fn drive_verifier(
    id: DestinationId,
    destination: Arc<dyn Destination>,
    mut verify_events: mpsc::UnboundedReceiver<VerifyEvent>,
    tracker: ProgressTracker<VerifyProgress>,
    errored: ErroredSet,
    events: mpsc::UnboundedSender<MultiVerifyEvent>,
) {
    let error = loop {
        match verify_events.recv().await {
            Some(VerifyEvent::Progress(progress)) => tracker.update(id, progress).await,
            Some(VerifyEvent::Finish(result)) => {
                info!(bytes_verified = result.bytes_verified, "Destination verified");
                tracker.finish(id).await;
                return;
            }
            Some(VerifyEvent::Error(error)) => break error,
            None => break VerifyError::Aborted,
        }
    };

    warn!(destination = destination.name(), error = %error, "Verification failed");
    errored.write().await.insert(id);
    tracker.fail(id).await;
    let _ = events.send(MultiVerifyEvent::Error(MultiDestinationError::new(
        id,
        destination,
        SessionError::Verify(error),
    )));
}
