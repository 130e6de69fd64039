pub mod blockmap;
pub mod checksum;
pub mod configure;
pub mod destination;
pub mod multi;
pub mod orchestrator;
pub mod progress;
pub mod verifier;

pub use blockmap::{BlockMap, MappedRange};
pub use checksum::ChecksumAlgorithm;
pub use configure::{ConfigureError, ConfigureOptions, Disk, Operation, configure};
pub use destination::{
    Chunk, Destination, DestinationError, ProgressEvent, SparseChunk, StreamItem, WriteStream,
};
pub use multi::{
    FlashError, MultiDestination, MultiDestinationError, MultiDestinationVerifier,
    MultiVerifyEvent, MultiWriteStream, SessionError, SessionOptions, WriteEvent, WriteSession,
};
pub use orchestrator::{FlashReport, Orchestrator};
pub use progress::{DestinationId, ProgressTracker, SessionStatus};
pub use verifier::{Expected, Verifier, VerifyError, VerifyEvent, VerifyProgress, VerifyResult};
