mod config;
mod directory;
mod error;
mod file_state;
mod growing;
pub mod ordering;
mod poller;
pub mod provider;
mod ranges;

#[macro_use]
extern crate tracing;

// re-export
pub use config::{HarvesterConfig, Mode};
pub use directory::{DirectoryHarvester, Harvest};
pub use error::{Error, RangeError};
pub use file_state::{Checksum, FileRecord, FileState, Snapshot, Stat};
pub use growing::GrowingFileHarvester;
pub use poller::{Poller, PollerHandle, Shutdown, Truthy};
pub use ranges::{Span, UnprocessedRanges};
