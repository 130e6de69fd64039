//! Storage endpoints a flash session writes to and reads back from.
//!
//! A [`Destination`] negotiates its capabilities asynchronously: callers must
//! await the matching `can_*` query before attempting an operation, and must
//! not assume two destinations of different types share a capability set.
//! Every I/O call requires a prior [`Destination::open`].

use std::fmt;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncRead;

use super::blockmap::BlockMap;

/// A contiguous piece of the source image.
pub type Chunk = Arc<[u8]>;

/// Contents of a destination streamed from a starting offset.
pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

/// Mapped regions of a destination, in block-map order.
pub type SparseReadStream = BoxStream<'static, Result<SparseChunk, DestinationError>>;

/// A positioned region of a sparse image. Unallocated space between regions
/// is never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseChunk {
    pub position: u64,
    pub data: Chunk,
}

impl SparseChunk {
    pub fn new(position: u64, data: impl Into<Chunk>) -> Self {
        Self {
            position,
            data: data.into(),
        }
    }

    pub fn end(&self) -> u64 {
        self.position + self.data.len() as u64
    }
}

/// Snapshot of how far a single write stream has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressEvent {
    pub bytes_transferred: u64,
    pub position: u64,
    pub total_size: Option<u64>,
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("{name} is not open")]
    NotOpen { name: String },

    #[error("{name} does not support {operation}")]
    Unsupported {
        name: String,
        operation: &'static str,
    },

    #[error("write stream closed: no destination is accepting data")]
    StreamClosed,

    #[error("no destination could be {action}")]
    Unavailable { action: &'static str },

    #[error("Device appears to have been removed: {0}")]
    DeviceRemoved(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl DestinationError {
    pub fn unsupported(name: &str, operation: &'static str) -> Self {
        Self::Unsupported {
            name: name.to_string(),
            operation,
        }
    }

    pub fn not_open(name: &str) -> Self {
        Self::NotOpen {
            name: name.to_string(),
        }
    }

    pub fn is_device_removed(&self) -> bool {
        matches!(self, Self::DeviceRemoved(_))
    }
}

impl From<io::Error> for DestinationError {
    fn from(error: io::Error) -> Self {
        if is_device_removed_error(&error) {
            Self::DeviceRemoved(error)
        } else {
            Self::Io(error)
        }
    }
}

/// Check if an I/O error indicates the device has been removed
pub fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound => true,
        ErrorKind::PermissionDenied => false,
        ErrorKind::BrokenPipe => true,
        ErrorKind::ConnectionReset => true,
        ErrorKind::ConnectionAborted => true,
        ErrorKind::NotConnected => true,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO
                    | libc::ENODEV
                    | libc::ENXIO
                    | libc::ENOMEDIUM
                    | libc::EMEDIUMTYPE
                )
            } else {
                false
            }
        }
    }
}

/// Sink side of a streaming write to one destination.
///
/// `T` is [`Chunk`] for contiguous writes and [`SparseChunk`] for sparse ones.
#[async_trait]
pub trait WriteStream<T: Send + 'static>: Send {
    async fn write(&mut self, item: T) -> Result<(), DestinationError>;

    /// Flush everything written so far. No writes are accepted afterwards.
    async fn finish(&mut self) -> Result<(), DestinationError>;

    fn progress(&self) -> ProgressEvent;
}

/// A writable/readable storage endpoint taking part in a flash session.
#[async_trait]
pub trait Destination: fmt::Debug + Send + Sync {
    /// Human readable identifier used in logs and errors.
    fn name(&self) -> &str;

    async fn can_read(&self) -> bool {
        false
    }

    async fn can_write(&self) -> bool {
        false
    }

    async fn can_create_read_stream(&self) -> bool {
        false
    }

    async fn can_create_sparse_read_stream(&self) -> bool {
        false
    }

    async fn can_create_write_stream(&self) -> bool {
        false
    }

    async fn can_create_sparse_write_stream(&self) -> bool {
        false
    }

    async fn open(&self) -> Result<(), DestinationError>;

    /// Release every underlying handle. Closing twice is a no-op.
    async fn close(&self) -> Result<(), DestinationError>;

    /// Read into `buffer` starting at `position`, returning the number of
    /// bytes actually read (short only at end of device).
    async fn read(&self, buffer: &mut [u8], position: u64) -> Result<usize, DestinationError> {
        let _ = (buffer, position);
        Err(DestinationError::unsupported(self.name(), "read"))
    }

    /// Write all of `buffer` at `position`, returning the bytes written.
    async fn write(&self, buffer: &[u8], position: u64) -> Result<usize, DestinationError> {
        let _ = (buffer, position);
        Err(DestinationError::unsupported(self.name(), "write"))
    }

    /// Stream contents from `start` up to `end` (exclusive), or to the end of
    /// the device when `end` is `None`.
    async fn create_read_stream(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> Result<ReadStream, DestinationError> {
        let _ = (start, end);
        Err(DestinationError::unsupported(self.name(), "read streams"))
    }

    async fn create_sparse_read_stream(
        &self,
        block_map: &BlockMap,
    ) -> Result<SparseReadStream, DestinationError> {
        let _ = block_map;
        Err(DestinationError::unsupported(self.name(), "sparse read streams"))
    }

    async fn create_write_stream(&self) -> Result<Box<dyn WriteStream<Chunk>>, DestinationError> {
        Err(DestinationError::unsupported(self.name(), "write streams"))
    }

    async fn create_sparse_write_stream(
        &self,
    ) -> Result<Box<dyn WriteStream<SparseChunk>>, DestinationError> {
        Err(DestinationError::unsupported(self.name(), "sparse write streams"))
    }
}

/// Items a multi-destination session can fan out, tied to the destination
/// method that opens a stream accepting them.
#[async_trait]
pub trait StreamItem: Clone + Send + Sync + 'static {
    /// Label used in logs.
    const KIND: &'static str;

    async fn open_stream(
        destination: &dyn Destination,
    ) -> Result<Box<dyn WriteStream<Self>>, DestinationError>;
}

#[async_trait]
impl StreamItem for Chunk {
    const KIND: &'static str = "write";

    async fn open_stream(
        destination: &dyn Destination,
    ) -> Result<Box<dyn WriteStream<Self>>, DestinationError> {
        destination.create_write_stream().await
    }
}

#[async_trait]
impl StreamItem for SparseChunk {
    const KIND: &'static str = "sparse write";

    async fn open_stream(
        destination: &dyn Destination,
    ) -> Result<Box<dyn WriteStream<Self>>, DestinationError> {
        destination.create_sparse_write_stream().await
    }
}
