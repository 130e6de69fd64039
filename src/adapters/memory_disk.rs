use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::configure::{Disk, DiskError, PartitionFilesystem, PartitionInfo};

#[derive(Debug)]
struct MemoryPartition {
    info: PartitionInfo,
    files: BTreeMap<String, Vec<u8>>,
    unreadable: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct DiskState {
    partitions: Vec<MemoryPartition>,
    /// Partition index of every session ever opened, in order.
    sessions: Vec<u32>,
    open_sessions: usize,
}

/// A disk whose partitions hold in-memory files.
///
/// Records every filesystem session so tests can assert which partitions were
/// touched and that sessions were closed.
#[derive(Debug, Clone, Default)]
pub struct MemoryDisk {
    state: Arc<Mutex<DiskState>>,
}

impl MemoryDisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(self, index: u32, partition_type: u8) -> Self {
        self.lock().partitions.push(MemoryPartition {
            info: PartitionInfo::new(index, partition_type),
            files: BTreeMap::new(),
            unreadable: BTreeSet::new(),
        });
        self
    }

    /// Add a file; the partition must already exist.
    pub fn with_file(self, index: u32, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        if let Some(partition) = self.lock().partition_mut(index) {
            partition.files.insert(path.to_string(), contents.into());
        }
        self
    }

    /// Make reads of `path` fail with a filesystem error.
    pub fn with_unreadable(self, index: u32, path: &str) -> Self {
        if let Some(partition) = self.lock().partition_mut(index) {
            partition.unreadable.insert(path.to_string());
        }
        self
    }

    pub fn file(&self, index: u32, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .partitions
            .iter()
            .find(|p| p.info.index == index)
            .and_then(|p| p.files.get(path).cloned())
    }

    pub fn sessions(&self) -> Vec<u32> {
        self.lock().sessions.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DiskState {
    fn partition_mut(&mut self, index: u32) -> Option<&mut MemoryPartition> {
        self.partitions.iter_mut().find(|p| p.info.index == index)
    }
}

#[async_trait]
impl Disk for MemoryDisk {
    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, DiskError> {
        Ok(self.lock().partitions.iter().map(|p| p.info).collect())
    }

    async fn open_filesystem(
        &self,
        index: u32,
    ) -> Result<Box<dyn PartitionFilesystem>, DiskError> {
        let mut state = self.lock();
        if state.partition_mut(index).is_none() {
            return Err(DiskError::PartitionNotFound(index));
        }
        state.sessions.push(index);
        state.open_sessions += 1;
        Ok(Box::new(MemoryFilesystem {
            disk: self.clone(),
            index,
        }))
    }
}

struct MemoryFilesystem {
    disk: MemoryDisk,
    index: u32,
}

impl MemoryFilesystem {
    fn with_partition<T>(
        &self,
        f: impl FnOnce(&mut MemoryPartition) -> Result<T, DiskError>,
    ) -> Result<T, DiskError> {
        let mut state = self.disk.lock();
        let partition = state
            .partition_mut(self.index)
            .ok_or(DiskError::PartitionNotFound(self.index))?;
        f(partition)
    }
}

#[async_trait]
impl PartitionFilesystem for MemoryFilesystem {
    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, DiskError> {
        let index = self.index;
        self.with_partition(|partition| {
            if partition.unreadable.contains(path) {
                return Err(DiskError::Filesystem {
                    partition: index,
                    message: format!("cannot read {path}"),
                });
            }
            partition
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| DiskError::FileNotFound {
                    partition: index,
                    path: path.to_string(),
                })
        })
    }

    async fn write_file(&mut self, path: &str, contents: &[u8]) -> Result<(), DiskError> {
        self.with_partition(|partition| {
            partition.files.insert(path.to_string(), contents.to_vec());
            Ok(())
        })
    }

    async fn close(self: Box<Self>) -> Result<(), DiskError> {
        let mut state = self.disk.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
        Ok(())
    }
}
