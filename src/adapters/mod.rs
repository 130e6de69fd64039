use std::path::PathBuf;
use std::sync::Arc;

use crate::core::destination::Destination;

mod file;
mod memory;
mod memory_disk;

pub use file::FileDestination;
pub use memory::MemoryDestination;
pub use memory_disk::MemoryDisk;

/// Build a destination for each path. In simulation mode nothing touches the
/// filesystem; every path becomes an in-memory destination named after it.
pub fn get_destinations(
    paths: &[PathBuf],
    simulation: bool,
    sync_on_finish: bool,
) -> Vec<Arc<dyn Destination>> {
    paths
        .iter()
        .map(|path| -> Arc<dyn Destination> {
            if simulation {
                Arc::new(MemoryDestination::new(&path.display().to_string()))
            } else {
                Arc::new(FileDestination::new(path).with_sync(sync_on_finish))
            }
        })
        .collect()
}
