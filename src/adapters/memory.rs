use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, sleep};

use crate::core::blockmap::BlockMap;
use crate::core::destination::{
    Chunk, Destination, DestinationError, ProgressEvent, ReadStream, SparseChunk,
    SparseReadStream, WriteStream,
};

/// Pieces handed out by sparse read streams.
const SPARSE_READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    open: bool,
    open_count: u32,
    fail_open: bool,
    fail_after: Option<u64>,
    chunk_delay: Option<Duration>,
    read_only: bool,
}

/// An in-memory destination for simulations and tests.
///
/// Behaviour can be scripted: a failing open, a write failure once a number
/// of bytes have been accepted, or a delay per chunk to model a slow card.
/// Clones share the same backing buffer.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDestination {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn with_contents(name: &str, data: Vec<u8>) -> Self {
        let destination = Self::new(name);
        destination.lock().data = data;
        destination
    }

    /// Fail the write that would take the stream past `bytes`.
    pub fn fail_after(self, bytes: u64) -> Self {
        self.lock().fail_after = Some(bytes);
        self
    }

    /// Sleep before accepting each chunk.
    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        self.lock().chunk_delay = Some(delay);
        self
    }

    pub fn failing_open(self) -> Self {
        self.lock().fail_open = true;
        self
    }

    /// Report no write capabilities.
    pub fn read_only(self) -> Self {
        self.lock().read_only = true;
        self
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Flip every bit of the byte at `offset`.
    pub fn corrupt(&self, offset: usize) {
        let mut state = self.lock();
        if let Some(byte) = state.data.get_mut(offset) {
            *byte ^= 0xFF;
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// How many times the destination has been opened.
    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    fn ensure_open(&self) -> Result<(), DestinationError> {
        if self.lock().open {
            Ok(())
        } else {
            Err(DestinationError::not_open(&self.name))
        }
    }

    fn writer(&self) -> MemoryWriter {
        let state = self.lock();
        MemoryWriter {
            state: self.state.clone(),
            fail_after: state.fail_after,
            chunk_delay: state.chunk_delay,
            bytes_transferred: 0,
            position: 0,
            finished: false,
        }
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    // A poisoned lock only means a test thread panicked mid-write.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn write_at(data: &mut Vec<u8>, position: u64, bytes: &[u8]) {
    let start = position as usize;
    let end = start + bytes.len();
    if data.len() < end {
        data.resize(end, 0);
    }
    data[start..end].copy_from_slice(bytes);
}

#[async_trait]
impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn can_read(&self) -> bool {
        true
    }

    async fn can_write(&self) -> bool {
        !self.lock().read_only
    }

    async fn can_create_read_stream(&self) -> bool {
        true
    }

    async fn can_create_sparse_read_stream(&self) -> bool {
        true
    }

    async fn can_create_write_stream(&self) -> bool {
        !self.lock().read_only
    }

    async fn can_create_sparse_write_stream(&self) -> bool {
        !self.lock().read_only
    }

    async fn open(&self) -> Result<(), DestinationError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(io::Error::other(format!("cannot open {}", self.name)).into());
        }
        if !state.open {
            state.open = true;
            state.open_count += 1;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DestinationError> {
        self.lock().open = false;
        Ok(())
    }

    async fn read(&self, buffer: &mut [u8], position: u64) -> Result<usize, DestinationError> {
        self.ensure_open()?;
        let state = self.lock();
        let start = (position as usize).min(state.data.len());
        let n = buffer.len().min(state.data.len() - start);
        buffer[..n].copy_from_slice(&state.data[start..start + n]);
        Ok(n)
    }

    async fn write(&self, buffer: &[u8], position: u64) -> Result<usize, DestinationError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if let Some(limit) = state.fail_after {
            if position + buffer.len() as u64 > limit {
                return Err(io::Error::other("injected write failure").into());
            }
        }
        write_at(&mut state.data, position, buffer);
        Ok(buffer.len())
    }

    async fn create_read_stream(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<ReadStream, DestinationError> {
        self.ensure_open()?;
        let state = self.lock();
        let len = state.data.len() as u64;
        let end = end.map_or(len, |e| e.min(len));
        let start = start.min(end);
        let snapshot = state.data[start as usize..end as usize].to_vec();
        Ok(Box::pin(io::Cursor::new(snapshot)))
    }

    async fn create_sparse_read_stream(
        &self,
        block_map: &BlockMap,
    ) -> Result<SparseReadStream, DestinationError> {
        self.ensure_open()?;
        let data = self.lock().data.clone();
        let chunks = block_map
            .pieces(SPARSE_READ_CHUNK)
            .into_iter()
            .map(move |(position, length)| {
                let start = (position as usize).min(data.len());
                let end = (start + length).min(data.len());
                Ok(SparseChunk::new(position, data[start..end].to_vec()))
            });
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn create_write_stream(&self) -> Result<Box<dyn WriteStream<Chunk>>, DestinationError> {
        self.ensure_open()?;
        Ok(Box::new(self.writer()))
    }

    async fn create_sparse_write_stream(
        &self,
    ) -> Result<Box<dyn WriteStream<SparseChunk>>, DestinationError> {
        self.ensure_open()?;
        Ok(Box::new(self.writer()))
    }
}

struct MemoryWriter {
    state: Arc<Mutex<MemoryState>>,
    fail_after: Option<u64>,
    chunk_delay: Option<Duration>,
    bytes_transferred: u64,
    position: u64,
    finished: bool,
}

impl MemoryWriter {
    async fn put(&mut self, position: u64, bytes: &[u8]) -> Result<(), DestinationError> {
        if self.finished {
            return Err(DestinationError::StreamClosed);
        }
        if let Some(delay) = self.chunk_delay {
            sleep(delay).await;
        }
        if let Some(limit) = self.fail_after {
            if self.bytes_transferred + bytes.len() as u64 > limit {
                return Err(io::Error::other("injected write failure").into());
            }
        }

        {
            let mut state = lock(&self.state);
            if !state.open {
                return Err(io::Error::from(io::ErrorKind::NotConnected).into());
            }
            write_at(&mut state.data, position, bytes);
        }

        self.bytes_transferred += bytes.len() as u64;
        self.position = position + bytes.len() as u64;
        Ok(())
    }

    fn snapshot(&self) -> ProgressEvent {
        ProgressEvent {
            bytes_transferred: self.bytes_transferred,
            position: self.position,
            total_size: None,
        }
    }
}

#[async_trait]
impl WriteStream<Chunk> for MemoryWriter {
    async fn write(&mut self, item: Chunk) -> Result<(), DestinationError> {
        let position = self.position;
        self.put(position, &item).await
    }

    async fn finish(&mut self) -> Result<(), DestinationError> {
        self.finished = true;
        Ok(())
    }

    fn progress(&self) -> ProgressEvent {
        self.snapshot()
    }
}

#[async_trait]
impl WriteStream<SparseChunk> for MemoryWriter {
    async fn write(&mut self, item: SparseChunk) -> Result<(), DestinationError> {
        self.put(item.position, &item.data).await
    }

    async fn finish(&mut self) -> Result<(), DestinationError> {
        self.finished = true;
        Ok(())
    }

    fn progress(&self) -> ProgressEvent {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_operations_require_open() {
        let dest = MemoryDestination::new("card");
        let mut buffer = [0u8; 4];

        assert!(matches!(
            dest.read(&mut buffer, 0).await,
            Err(DestinationError::NotOpen { .. })
        ));
        assert!(dest.create_write_stream().await.is_err());

        dest.open().await.unwrap();
        assert!(dest.is_open());
        assert_eq!(dest.write(b"data", 2).await.unwrap(), 4);
        assert_eq!(dest.contents(), b"\0\0data");
    }

    #[tokio::test]
    async fn test_open_and_close_are_idempotent() {
        let dest = MemoryDestination::new("card");
        dest.open().await.unwrap();
        dest.open().await.unwrap();
        assert_eq!(dest.open_count(), 1);

        dest.close().await.unwrap();
        dest.close().await.unwrap();
        assert!(!dest.is_open());
    }

    #[tokio::test]
    async fn test_write_stream_tracks_progress() {
        let dest = MemoryDestination::new("card");
        dest.open().await.unwrap();

        let mut stream = dest.create_write_stream().await.unwrap();
        stream.write(Chunk::from(&b"hello "[..])).await.unwrap();
        stream.write(Chunk::from(&b"world"[..])).await.unwrap();
        stream.finish().await.unwrap();

        assert_eq!(stream.progress().position, 11);
        assert_eq!(stream.progress().bytes_transferred, 11);
        assert_eq!(dest.contents(), b"hello world");
    }

    #[tokio::test]
    async fn test_sparse_write_skips_gaps() {
        let dest = MemoryDestination::new("card");
        dest.open().await.unwrap();

        let mut stream = dest.create_sparse_write_stream().await.unwrap();
        stream.write(SparseChunk::new(0, b"ab".to_vec())).await.unwrap();
        stream.write(SparseChunk::new(6, b"cd".to_vec())).await.unwrap();

        let progress = stream.progress();
        assert_eq!(progress.bytes_transferred, 4);
        assert_eq!(progress.position, 8);
        assert_eq!(dest.contents(), b"ab\0\0\0\0cd");
    }

    #[tokio::test]
    async fn test_fail_after_injects_error() {
        let dest = MemoryDestination::new("card").fail_after(4);
        dest.open().await.unwrap();

        let mut stream = dest.create_write_stream().await.unwrap();
        stream.write(Chunk::from(&b"1234"[..])).await.unwrap();
        let err = stream.write(Chunk::from(&b"5"[..])).await.unwrap_err();
        assert!(err.to_string().contains("injected write failure"));
    }

    #[tokio::test]
    async fn test_read_streams() {
        let dest = MemoryDestination::with_contents("card", b"0123456789".to_vec());
        dest.open().await.unwrap();

        let mut out = String::new();
        dest.create_read_stream(2, Some(6))
            .await
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "2345");

        let map = BlockMap::new(10, Default::default()).with_range(7, b"789");
        let chunks: Vec<_> = dest
            .create_sparse_read_stream(&map)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].as_ref().unwrap(),
            &SparseChunk::new(7, b"789".to_vec())
        );
    }
}
