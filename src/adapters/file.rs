use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::blockmap::BlockMap;
use crate::core::destination::{
    Chunk, Destination, DestinationError, ProgressEvent, ReadStream, SparseChunk,
    SparseReadStream, WriteStream,
};

/// Size of the reads handed out by sparse read streams (1MB)
const SPARSE_READ_CHUNK: usize = 1024 * 1024;

/// A disk image file or a block device node.
///
/// The destination holds one handle for random access while open; every
/// stream opens its own handle so streams never fight over the file cursor.
#[derive(Debug)]
pub struct FileDestination {
    path: PathBuf,
    name: String,
    /// fsync streams on finish (safer but slower)
    sync_on_finish: bool,
    handle: Mutex<Option<File>>,
}

impl FileDestination {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            sync_on_finish: true,
            handle: Mutex::new(None),
        }
    }

    pub fn with_sync(mut self, sync_on_finish: bool) -> Self {
        self.sync_on_finish = sync_on_finish;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_open(&self) -> Result<(), DestinationError> {
        if self.handle.lock().await.is_some() {
            Ok(())
        } else {
            Err(DestinationError::not_open(&self.name))
        }
    }

    async fn stream_handle(&self) -> Result<File, DestinationError> {
        self.ensure_open().await?;
        Ok(OpenOptions::new().write(true).open(&self.path).await?)
    }
}

#[async_trait]
impl Destination for FileDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn can_read(&self) -> bool {
        true
    }

    async fn can_write(&self) -> bool {
        true
    }

    async fn can_create_read_stream(&self) -> bool {
        true
    }

    async fn can_create_sparse_read_stream(&self) -> bool {
        true
    }

    async fn can_create_write_stream(&self) -> bool {
        true
    }

    async fn can_create_sparse_write_stream(&self) -> bool {
        true
    }

    async fn open(&self) -> Result<(), DestinationError> {
        let mut handle = self.handle.lock().await;
        if handle.is_none() {
            // Block devices already exist; image files may not.
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .await?;
            debug!(path = %self.path.display(), "Opened destination");
            *handle = Some(file);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DestinationError> {
        let Some(file) = self.handle.lock().await.take() else {
            return Ok(());
        };
        // The handle is released even when the final sync fails.
        if let Err(e) = file.sync_all().await {
            warn!(path = %self.path.display(), error = %e, "Failed to sync destination on close");
            return Err(e.into());
        }
        debug!(path = %self.path.display(), "Closed destination");
        Ok(())
    }

    async fn read(&self, buffer: &mut [u8], position: u64) -> Result<usize, DestinationError> {
        let mut guard = self.handle.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| DestinationError::not_open(&self.name))?;

        file.seek(SeekFrom::Start(position)).await?;
        let mut total = 0;
        while total < buffer.len() {
            let n = file.read(&mut buffer[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    async fn write(&self, buffer: &[u8], position: u64) -> Result<usize, DestinationError> {
        let mut guard = self.handle.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| DestinationError::not_open(&self.name))?;

        file.seek(SeekFrom::Start(position)).await?;
        file.write_all(buffer).await?;
        file.flush().await?;
        Ok(buffer.len())
    }

    async fn create_read_stream(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<ReadStream, DestinationError> {
        self.ensure_open().await?;
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        match end {
            Some(end) => Ok(Box::pin(file.take(end.saturating_sub(start)))),
            None => Ok(Box::pin(file)),
        }
    }

    async fn create_sparse_read_stream(
        &self,
        block_map: &BlockMap,
    ) -> Result<SparseReadStream, DestinationError> {
        self.ensure_open().await?;
        let file = File::open(&self.path).await?;
        Ok(sparse_chunks(file, block_map.pieces(SPARSE_READ_CHUNK)))
    }

    async fn create_write_stream(&self) -> Result<Box<dyn WriteStream<Chunk>>, DestinationError> {
        let file = self.stream_handle().await?;
        Ok(Box::new(FileWriteStream::new(file, self.sync_on_finish)))
    }

    async fn create_sparse_write_stream(
        &self,
    ) -> Result<Box<dyn WriteStream<SparseChunk>>, DestinationError> {
        let file = self.stream_handle().await?;
        Ok(Box::new(FileWriteStream::new(file, self.sync_on_finish)))
    }
}

fn sparse_chunks(file: File, pieces: VecDeque<(u64, usize)>) -> SparseReadStream {
    Box::pin(futures::stream::unfold(
        (file, pieces),
        |(mut file, mut pieces)| async move {
            let (position, length) = pieces.pop_front()?;
            let chunk = read_piece(&mut file, position, length).await;
            Some((chunk, (file, pieces)))
        },
    ))
}

async fn read_piece(
    file: &mut File,
    position: u64,
    length: usize,
) -> Result<SparseChunk, DestinationError> {
    let mut data = vec![0u8; length];
    file.seek(SeekFrom::Start(position)).await?;
    file.read_exact(&mut data).await?;
    Ok(SparseChunk::new(position, data))
}

struct FileWriteStream {
    file: File,
    sync_on_finish: bool,
    bytes_transferred: u64,
    position: u64,
}

impl FileWriteStream {
    fn new(file: File, sync_on_finish: bool) -> Self {
        Self {
            file,
            sync_on_finish,
            bytes_transferred: 0,
            position: 0,
        }
    }

    async fn finish_file(&mut self) -> Result<(), DestinationError> {
        self.file.flush().await?;
        if self.sync_on_finish {
            self.file.sync_all().await?;
        }
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
impl WriteStream<Chunk> for FileWriteStream {
    async fn write(&mut self, item: Chunk) -> Result<(), DestinationError> {
        self.file.write_all(&item).await?;
        self.bytes_transferred += item.len() as u64;
        self.position += item.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DestinationError> {
        self.finish_file().await
    }

    fn progress(&self) -> ProgressEvent {
        self.snapshot()
    }
}

#[async_trait]
impl WriteStream<SparseChunk> for FileWriteStream {
    async fn write(&mut self, item: SparseChunk) -> Result<(), DestinationError> {
        self.file.seek(SeekFrom::Start(item.position)).await?;
        self.file.write_all(&item.data).await?;
        self.bytes_transferred += item.data.len() as u64;
        self.position = item.end();
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DestinationError> {
        self.finish_file().await
    }

    fn progress(&self) -> ProgressEvent {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_creates_image_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("disk.img");

        let dest = FileDestination::new(&path);
        dest.open().await.unwrap();
        assert!(path.exists());
        dest.close().await.unwrap();
        dest.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_random_access_roundtrip() {
        let temp = tempdir().unwrap();
        let dest = FileDestination::new(temp.path().join("disk.img"));
        dest.open().await.unwrap();

        assert_eq!(dest.write(b"partition", 512).await.unwrap(), 9);

        let mut buffer = [0u8; 9];
        assert_eq!(dest.read(&mut buffer, 512).await.unwrap(), 9);
        assert_eq!(&buffer, b"partition");

        // Reads past the end are short, not errors.
        let mut tail = [0u8; 32];
        assert_eq!(dest.read(&mut tail, 515).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_streams_require_open() {
        let temp = tempdir().unwrap();
        let dest = FileDestination::new(temp.path().join("disk.img"));

        let err = dest.create_write_stream().await.err().unwrap();
        assert!(matches!(err, DestinationError::NotOpen { .. }));
    }

    #[tokio::test]
    async fn test_write_stream_then_read_stream() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("disk.img");
        let dest = FileDestination::new(&path).with_sync(false);
        dest.open().await.unwrap();

        let mut stream = dest.create_write_stream().await.unwrap();
        stream.write(Chunk::from(&b"hello "[..])).await.unwrap();
        stream.write(Chunk::from(&b"world"[..])).await.unwrap();
        stream.finish().await.unwrap();
        assert_eq!(stream.progress().position, 11);

        let mut reader = dest.create_read_stream(6, Some(11)).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_sparse_write_and_read() {
        let temp = tempdir().unwrap();
        let dest = FileDestination::new(temp.path().join("disk.img")).with_sync(false);
        dest.open().await.unwrap();

        let mut stream = dest.create_sparse_write_stream().await.unwrap();
        stream.write(SparseChunk::new(4096, b"rootfs".to_vec())).await.unwrap();
        stream.finish().await.unwrap();
        assert_eq!(stream.progress().bytes_transferred, 6);
        assert_eq!(stream.progress().position, 4102);

        let map = BlockMap::new(8192, Default::default()).with_range(4096, b"rootfs");
        let chunks: Vec<_> = dest
            .create_sparse_read_stream(&map)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0].as_ref().unwrap().data[..], b"rootfs");
    }
}
