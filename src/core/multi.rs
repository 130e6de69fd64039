//! Fan-out of a single image stream to several destinations.
//!
//! A [`MultiDestination`] owns a fixed set of destinations, each with a stable
//! [`DestinationId`]. A write session forwards every chunk from one input to
//! every destination that has not failed, records per-destination progress in
//! a [`ProgressTracker`] and, on a timer, reports the slowest active
//! destination as the aggregate. A failing destination is reported and dropped
//! from the session; the others keep going.

mod verifier;

pub use verifier::{MultiDestinationVerifier, MultiVerifyEvent, MultiVerifySession};

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::blockmap::BlockMap;
use super::destination::{
    Chunk, Destination, DestinationError, ProgressEvent, ReadStream, SparseChunk,
    SparseReadStream, StreamItem, WriteStream,
};
use super::progress::{DestinationId, ProgressTracker, SessionStatus};
use super::verifier::{Expected, Verifier, VerifyError};

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// How often aggregate progress is recomputed and emitted.
    pub progress_interval: Duration,
    /// Chunks queued per destination before the source is held back.
    pub stream_buffer: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("at least one destination is required")]
    NoDestinations,
}

/// What went wrong on a single destination.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("write failed: {0}")]
    Write(#[from] DestinationError),

    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
}

/// A failure scoped to one destination of a multi-destination session.
#[derive(Debug, Error)]
#[error("{} ({}): {}", .destination.name(), .id, .error)]
pub struct MultiDestinationError {
    pub id: DestinationId,
    pub destination: Arc<dyn Destination>,
    #[source]
    pub error: SessionError,
}

impl MultiDestinationError {
    pub fn new(id: DestinationId, destination: Arc<dyn Destination>, error: SessionError) -> Self {
        Self {
            id,
            destination,
            error,
        }
    }

    pub fn name(&self) -> &str {
        self.destination.name()
    }
}

#[derive(Debug)]
pub enum WriteEvent {
    /// Position of the slowest destination still writing.
    Progress(ProgressEvent),
    Fail(MultiDestinationError),
    /// Every destination that did not fail has finished.
    Done,
    /// Every destination failed. Emitted instead of [`WriteEvent::Done`].
    AllFailed,
}

type ErroredSet = Arc<RwLock<BTreeSet<DestinationId>>>;

/// A composite destination writing to all of its members at once.
#[derive(Debug)]
pub struct MultiDestination {
    name: String,
    destinations: Vec<(DestinationId, Arc<dyn Destination>)>,
    errored: ErroredSet,
    options: SessionOptions,
}

impl MultiDestination {
    pub fn new(destinations: Vec<Arc<dyn Destination>>) -> Result<Self, FlashError> {
        Self::with_options(destinations, SessionOptions::default())
    }

    pub fn with_options(
        destinations: Vec<Arc<dyn Destination>>,
        options: SessionOptions,
    ) -> Result<Self, FlashError> {
        if destinations.is_empty() {
            return Err(FlashError::NoDestinations);
        }

        let name = destinations
            .iter()
            .map(|d| d.name())
            .collect::<Vec<_>>()
            .join(", ");

        Ok(Self {
            name: format!("multi({name})"),
            destinations: destinations
                .into_iter()
                .enumerate()
                .map(|(i, d)| (DestinationId(i), d))
                .collect(),
            errored: Arc::default(),
            options,
        })
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn destinations(&self) -> &[(DestinationId, Arc<dyn Destination>)] {
        &self.destinations
    }

    /// Destinations that failed during a session. Once listed here a
    /// destination takes no further part in writes or verification.
    pub async fn errored_destinations(&self) -> Vec<(DestinationId, Arc<dyn Destination>)> {
        let errored = self.errored.read().await;
        self.destinations
            .iter()
            .filter(|(id, _)| errored.contains(id))
            .cloned()
            .collect()
    }

    pub async fn active_destinations(&self) -> Vec<(DestinationId, Arc<dyn Destination>)> {
        let errored = self.errored.read().await;
        self.destinations
            .iter()
            .filter(|(id, _)| !errored.contains(id))
            .cloned()
            .collect()
    }

    /// Open every destination, returning the ones that failed. A failed open
    /// is not recorded as errored; the write session will report it when the
    /// destination refuses a stream.
    pub async fn open_all(&self) -> Vec<MultiDestinationError> {
        let failures = self.each(|d| d.open()).await;
        for failure in &failures {
            warn!(destination = failure.name(), error = %failure.error, "Failed to open destination");
        }
        failures
    }

    /// Close every destination, returning the ones that failed.
    pub async fn close_all(&self) -> Vec<MultiDestinationError> {
        let failures = self.each(|d| d.close()).await;
        for failure in &failures {
            warn!(destination = failure.name(), error = %failure.error, "Failed to close destination");
        }
        failures
    }

    async fn each<'a>(
        &'a self,
        op: impl Fn(&'a dyn Destination) -> BoxFuture<'a, Result<(), DestinationError>>,
    ) -> Vec<MultiDestinationError> {
        let results = join_all(self.destinations.iter().map(|(_, d)| op(d.as_ref()))).await;

        self.destinations
            .iter()
            .zip(results)
            .filter_map(|((id, destination), result)| {
                result.err().map(|e| {
                    MultiDestinationError::new(*id, destination.clone(), SessionError::Write(e))
                })
            })
            .collect()
    }

    async fn all_support<'a>(
        &'a self,
        query: impl Fn(&'a dyn Destination) -> BoxFuture<'a, bool>,
    ) -> bool {
        join_all(self.destinations.iter().map(|(_, d)| query(d.as_ref())))
            .await
            .into_iter()
            .all(|supported| supported)
    }

    fn first(&self) -> &dyn Destination {
        self.destinations[0].1.as_ref()
    }

    /// Start a contiguous write to every active destination.
    pub async fn write_session(&self) -> WriteSession<Chunk> {
        self.session().await
    }

    /// Start a sparse write to every active destination.
    pub async fn sparse_write_session(&self) -> WriteSession<SparseChunk> {
        self.session().await
    }

    /// Verify every destination that has not failed.
    pub async fn create_verifier(&self, expected: Expected, size: Option<u64>) -> MultiDestinationVerifier {
        let verifiers = self
            .active_destinations()
            .await
            .into_iter()
            .map(|(id, destination)| (id, Verifier::new(destination, expected.clone(), size)))
            .collect();
        MultiDestinationVerifier::new(verifiers, self.errored.clone(), self.options)
    }

    async fn session<T: StreamItem>(&self) -> WriteSession<T> {
        let span = info_span!("write_session", session = %Uuid::now_v7(), kind = T::KIND);
        let participants = self.active_destinations().await;
        info!(parent: &span, destinations = participants.len(), "Starting write session");

        let buffer = self.options.stream_buffer.max(1);
        let tracker = ProgressTracker::new();
        let (input_tx, input_rx) = mpsc::channel::<T>(buffer);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(ProgressEvent::default());

        let mut outputs = Vec::with_capacity(participants.len());
        let mut drivers = JoinSet::new();
        for (id, destination) in participants {
            tracker.register(id).await;
            let (tx, rx) = mpsc::channel(buffer);
            outputs.push(tx);

            let driver_span = info_span!(parent: &span, "destination", %id, name = %destination.name());
            drivers.spawn(
                drive_writes(
                    id,
                    destination,
                    rx,
                    tracker.clone(),
                    self.errored.clone(),
                    events_tx.clone(),
                )
                .instrument(driver_span),
            );
        }

        tokio::spawn(fan_out(input_rx, outputs).instrument(span.clone()));

        let interval = self.options.progress_interval;
        let session_tracker = tracker.clone();
        let supervisor = tokio::spawn(
            async move {
                let progress_events = events_tx.clone();
                supervise(
                    drivers,
                    session_tracker.clone(),
                    interval,
                    |p: &ProgressEvent| p.position,
                    move |progress: ProgressEvent| {
                        progress_tx.send_replace(progress);
                        let _ = progress_events.send(WriteEvent::Progress(progress));
                    },
                )
                .await;

                let succeeded = session_tracker
                    .ids_with_status(SessionStatus::Finished)
                    .await
                    .len();
                if succeeded == 0 {
                    warn!("Every destination failed");
                    let _ = events_tx.send(WriteEvent::AllFailed);
                } else {
                    info!(succeeded, "Write session complete");
                    let _ = events_tx.send(WriteEvent::Done);
                }
                succeeded
            }
            .instrument(span),
        );

        WriteSession {
            stream: MultiWriteStream {
                input: Some(input_tx),
                supervisor: Some(supervisor),
                progress: progress_rx,
                tracker,
            },
            events: events_rx,
        }
    }
}

/// A running write session: the sink to push image data into and the events
/// it produces.
pub struct WriteSession<T> {
    pub stream: MultiWriteStream<T>,
    pub events: mpsc::UnboundedReceiver<WriteEvent>,
}

/// Input side of a write session.
pub struct MultiWriteStream<T> {
    input: Option<mpsc::Sender<T>>,
    supervisor: Option<JoinHandle<usize>>,
    progress: watch::Receiver<ProgressEvent>,
    tracker: ProgressTracker<ProgressEvent>,
}

impl<T> MultiWriteStream<T> {
    /// Per-destination session records.
    pub fn tracker(&self) -> &ProgressTracker<ProgressEvent> {
        &self.tracker
    }
}

#[async_trait]
impl<T: StreamItem> WriteStream<T> for MultiWriteStream<T> {
    async fn write(&mut self, item: T) -> Result<(), DestinationError> {
        let input = self.input.as_ref().ok_or(DestinationError::StreamClosed)?;
        input
            .send(item)
            .await
            .map_err(|_| DestinationError::StreamClosed)
    }

    /// Close the input and wait for every destination to finish or fail.
    /// Fails only if no destination succeeded.
    async fn finish(&mut self) -> Result<(), DestinationError> {
        self.input.take();
        let Some(supervisor) = self.supervisor.take() else {
            return Ok(());
        };

        match supervisor.await {
            Ok(0) => Err(DestinationError::Unavailable { action: "written" }),
            Ok(_) => Ok(()),
            Err(e) => Err(io::Error::other(e).into()),
        }
    }

    fn progress(&self) -> ProgressEvent {
        *self.progress.borrow()
    }
}

async fn fan_out<T: Clone + Send>(mut input: mpsc::Receiver<T>, mut outputs: Vec<mpsc::Sender<T>>) {
    while !outputs.is_empty() {
        let Some(item) = input.recv().await else {
            break;
        };

        let sent = join_all(outputs.iter().map(|tx| tx.send(item.clone()))).await;
        let mut sent = sent.into_iter();
        // A closed channel means that destination has stopped.
        outputs.retain(|_| sent.next().is_some_and(|r| r.is_ok()));
    }

    if outputs.is_empty() {
        debug!("No destination is accepting data");
    }
}

async fn drive_writes<T: StreamItem>(
    id: DestinationId,
    destination: Arc<dyn Destination>,
    mut input: mpsc::Receiver<T>,
    tracker: ProgressTracker<ProgressEvent>,
    errored: ErroredSet,
    events: mpsc::UnboundedSender<WriteEvent>,
) {
    match pump(destination.as_ref(), &mut input, id, &tracker).await {
        Ok(progress) => {
            info!(bytes = progress.bytes_transferred, "Destination finished");
            tracker.finish(id).await;
        }
        Err(error) => {
            drop(input);
            warn!(error = %error, "Destination failed, continuing with the others");
            errored.write().await.insert(id);
            tracker.fail(id).await;
            let _ = events.send(WriteEvent::Fail(MultiDestinationError::new(
                id,
                destination,
                SessionError::Write(error),
            )));
        }
    }
}

async fn pump<T: StreamItem>(
    destination: &dyn Destination,
    input: &mut mpsc::Receiver<T>,
    id: DestinationId,
    tracker: &ProgressTracker<ProgressEvent>,
) -> Result<ProgressEvent, DestinationError> {
    let mut stream = T::open_stream(destination).await?;
    while let Some(item) = input.recv().await {
        stream.write(item).await?;
        tracker.update(id, stream.progress()).await;
    }
    stream.finish().await?;

    let progress = stream.progress();
    tracker.update(id, progress).await;
    Ok(progress)
}

/// Wait for every per-destination task, publishing the aggregate of `tracker`
/// on each tick and once more after the last task ends.
async fn supervise<P>(
    mut drivers: JoinSet<()>,
    tracker: ProgressTracker<P>,
    interval: Duration,
    key: impl Fn(&P) -> u64 + Copy + Send,
    mut publish: impl FnMut(P) + Send,
) where
    P: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            joined = drivers.join_next() => match joined {
                Some(Ok(())) => {}
                Some(Err(e)) => warn!(error = %e, "Destination task aborted"),
                None => break,
            },
            _ = ticker.tick() => {
                if let Some(progress) = tracker.aggregate(key).await {
                    publish(progress);
                }
            }
        }
    }

    if let Some(progress) = tracker.final_aggregate(key).await {
        publish(progress);
    }
}

#[async_trait]
impl Destination for MultiDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn can_read(&self) -> bool {
        self.all_support(|d| d.can_read()).await
    }

    async fn can_write(&self) -> bool {
        self.all_support(|d| d.can_write()).await
    }

    async fn can_create_read_stream(&self) -> bool {
        self.all_support(|d| d.can_create_read_stream()).await
    }

    async fn can_create_sparse_read_stream(&self) -> bool {
        self.all_support(|d| d.can_create_sparse_read_stream()).await
    }

    async fn can_create_write_stream(&self) -> bool {
        self.all_support(|d| d.can_create_write_stream()).await
    }

    async fn can_create_sparse_write_stream(&self) -> bool {
        self.all_support(|d| d.can_create_sparse_write_stream()).await
    }

    /// Succeeds if at least one destination opened.
    async fn open(&self) -> Result<(), DestinationError> {
        if self.open_all().await.len() == self.destinations.len() {
            return Err(DestinationError::Unavailable { action: "opened" });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DestinationError> {
        if self.close_all().await.len() == self.destinations.len() {
            return Err(DestinationError::Unavailable { action: "closed" });
        }
        Ok(())
    }

    async fn read(&self, buffer: &mut [u8], position: u64) -> Result<usize, DestinationError> {
        self.first().read(buffer, position).await
    }

    /// Writes to every destination in parallel and returns the first result.
    async fn write(&self, buffer: &[u8], position: u64) -> Result<usize, DestinationError> {
        join_all(self.destinations.iter().map(|(_, d)| d.write(buffer, position)))
            .await
            .into_iter()
            .next()
            .unwrap_or(Err(DestinationError::Unavailable { action: "written" }))
    }

    async fn create_read_stream(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<ReadStream, DestinationError> {
        self.first().create_read_stream(start, end).await
    }

    async fn create_sparse_read_stream(
        &self,
        block_map: &BlockMap,
    ) -> Result<SparseReadStream, DestinationError> {
        self.first().create_sparse_read_stream(block_map).await
    }

    async fn create_write_stream(&self) -> Result<Box<dyn WriteStream<Chunk>>, DestinationError> {
        Ok(Box::new(self.write_session().await.stream))
    }

    async fn create_sparse_write_stream(
        &self,
    ) -> Result<Box<dyn WriteStream<SparseChunk>>, DestinationError> {
        Ok(Box::new(self.sparse_write_session().await.stream))
    }
}
