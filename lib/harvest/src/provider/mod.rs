mod glob;

use std::io;
use std::path::{Path, PathBuf};

pub use self::glob::Glob;

/// A provider returns the candidate files of one harvester. Every call is a
/// fresh listing; filtering by age or state is up to the caller.
pub trait Provider {
    /// The directory being listed, used for reporting.
    fn directory(&self) -> &Path;

    fn scan(&self) -> io::Result<Vec<PathBuf>>;
}
