use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid pattern {pattern:?}, {err}")]
    Pattern {
        pattern: String,
        err: glob::PatternError,
    },

    #[error("scan directory {path:?} failed, {err}")]
    Scan { path: PathBuf, err: io::Error },

    #[error("stat {path:?} failed, {err}")]
    Stat { path: PathBuf, err: io::Error },

    #[error("checksum {path:?} failed, {err}")]
    Checksum { path: PathBuf, err: io::Error },

    #[error("file {path:?} disappeared after being observed")]
    Vanished { path: PathBuf },
}

/// Raised when the unprocessed byte ranges of a growing file would become
/// inconsistent. Truncation is not supported, so none of these are recoverable.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RangeError {
    #[error("file shrank from {last} to {next} bytes")]
    Regression { last: u64, next: u64 },

    #[error("last observed size {last} is behind the tracked range end {end}")]
    Behind { last: u64, end: u64 },

    #[error("span [{start}, {end}) is not tracked as unprocessed")]
    Untracked { start: u64, end: u64 },

    #[error("invalid span [{start}, {end})")]
    Inverted { start: u64, end: u64 },

    #[error("span [{start}, {end}) overlaps or touches its predecessor")]
    Overlap { start: u64, end: u64 },
}
