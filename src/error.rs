use std::io;
use std::path::PathBuf;

use harvest::RangeError;
use thiserror::Error;

use crate::parser::ParseError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error, {0}")]
    Configuration(String),

    #[error("poll source {key} failed, {source}")]
    Poll { key: String, source: harvest::Error },

    #[error("open {path:?} failed, {err}")]
    Open { path: PathBuf, err: io::Error },

    #[error("parse {filename} failed, {source}")]
    Parse { filename: String, source: ParseError },

    #[error("unprocessed ranges of {filename} are inconsistent, {source}")]
    Range {
        filename: String,
        source: RangeError,
    },

    #[error("file {filename} was modified after ingestion")]
    ModifiedAfterIngestion { filename: String },

    #[error("persist state failed, {0}")]
    Persist(io::Error),
}

impl Error {
    /// Stable name of the variant, for structured output.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Poll { .. } => "poll",
            Error::Open { .. } => "open",
            Error::Parse { .. } => "parse",
            Error::Range { .. } => "range",
            Error::ModifiedAfterIngestion { .. } => "modified_after_ingestion",
            Error::Persist(_) => "persist",
        }
    }
}
