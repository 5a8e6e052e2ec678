use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::file_state::{FileState, Stat};
use crate::Error;

/// Polls one file which is appended to indefinitely.
///
/// An observation is emitted whenever the content changed since the last one,
/// which part changed is left to `UnprocessedRanges`.
pub struct GrowingFileHarvester {
    path: PathBuf,
    name: String,
    file_mod_wait: Duration,
    last: Option<FileState>,
}

impl GrowingFileHarvester {
    pub fn new(directory: impl AsRef<Path>, filename: &str, file_mod_wait: Duration) -> Self {
        GrowingFileHarvester {
            path: directory.as_ref().join(filename),
            name: filename.to_string(),
            file_mod_wait,
            last: None,
        }
    }

    /// Seed with the state persisted before a restart, so an unchanged file is
    /// not emitted again.
    pub fn with_last(mut self, last: Option<FileState>) -> Self {
        self.last = last;
        self
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn last(&self) -> Option<&FileState> {
        self.last.as_ref()
    }

    pub fn poll(&mut self) -> Result<Option<(String, FileState)>, Error> {
        self.poll_at(Utc::now())
    }

    pub fn poll_at(&mut self, now: DateTime<Utc>) -> Result<Option<(String, FileState)>, Error> {
        let stat = match Stat::of_path(&self.path) {
            Ok(stat) => stat,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return match self.last {
                    // the instrument has not started writing yet
                    None => Ok(None),
                    Some(_) => Err(Error::Vanished {
                        path: self.path.clone(),
                    }),
                };
            }
            Err(err) => {
                return Err(Error::Stat {
                    path: self.path.clone(),
                    err,
                });
            }
        };

        if !stat.settled(now, self.file_mod_wait) {
            return Ok(None);
        }

        if let Some(last) = &self.last {
            if last.same_metadata(&stat) {
                return Ok(None);
            }
        }

        let state = match stat.checksum(&self.path) {
            Ok(state) => state,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::Vanished {
                    path: self.path.clone(),
                });
            }
            Err(err) => {
                return Err(Error::Checksum {
                    path: self.path.clone(),
                    err,
                });
            }
        };

        let changed = self
            .last
            .is_none_or(|last| last.checksum != state.checksum);
        self.last = Some(state);

        if changed {
            debug!(message = "growing file changed", file = %self.name, size = state.size);
            Ok(Some((self.name.clone(), state)))
        } else {
            Ok(None)
        }
    }
}
