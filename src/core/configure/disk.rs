//! Narrow interface to a written disk: partition enumeration and scoped
//! filesystem sessions inside a partition.
//!
//! Partition-table parsing and FAT/ext filesystem access live outside this
//! crate; they are reached through [`Disk`] and [`PartitionFilesystem`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

/// MBR partition type bytes of the FAT family.
const FAT_PARTITION_TYPES: [u8; 6] = [0x01, 0x04, 0x06, 0x0B, 0x0C, 0x0E];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    /// 1-based partition number; logical partitions start at 5.
    pub index: u32,
    /// MBR system id byte.
    pub partition_type: u8,
}

impl PartitionInfo {
    pub fn new(index: u32, partition_type: u8) -> Self {
        Self {
            index,
            partition_type,
        }
    }

    pub fn is_fat(&self) -> bool {
        FAT_PARTITION_TYPES.contains(&self.partition_type)
    }
}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("partition {0} not found")]
    PartitionNotFound(u32),

    #[error("file {path} not found on partition {partition}")]
    FileNotFound { partition: u32, path: String },

    #[error("filesystem error on partition {partition}: {message}")]
    Filesystem { partition: u32, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Disk: Send + Sync {
    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, DiskError>;

    /// Mount the filesystem in partition `index`. The session must be closed
    /// with [`PartitionFilesystem::close`].
    async fn open_filesystem(
        &self,
        index: u32,
    ) -> Result<Box<dyn PartitionFilesystem>, DiskError>;
}

#[async_trait]
pub trait PartitionFilesystem: Send {
    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, DiskError>;

    async fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<(), DiskError>;

    async fn close(self: Box<Self>) -> Result<(), DiskError>;
}

/// Run `f` inside a filesystem session on partition `index`; the session is
/// closed whether or not `f` succeeds.
pub async fn with_partition_filesystem<T, F>(
    disk: &dyn Disk,
    index: u32,
    f: F,
) -> Result<T, DiskError>
where
    F: for<'a> FnOnce(&'a mut (dyn PartitionFilesystem + 'static)) -> BoxFuture<'a, Result<T, DiskError>>,
{
    let mut fs = disk.open_filesystem(index).await?;
    let result = f(fs.as_mut()).await;
    let closed = fs.close().await;
    let value = result?;
    closed?;
    Ok(value)
}
