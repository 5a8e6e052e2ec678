use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::file_state::{FileState, Snapshot, Stat};
use crate::ordering::sort_by_name;
use crate::poller::Truthy;
use crate::provider::{Glob, Provider};
use crate::Error;

/// The delta produced by one poll of a directory.
///
/// Every entry is `(basename, observation)`, in ingestion order. The caller
/// applies observations verbatim to its records.
#[derive(Debug, Default, PartialEq)]
pub struct Harvest {
    /// Files never handed out before.
    pub new: Vec<(String, FileState)>,

    /// Ingested files whose content changed afterwards.
    pub modified: Vec<(String, FileState)>,

    /// Ingested files with new metadata but identical content. Nothing to
    /// report, only the stored observation needs updating.
    pub refreshed: Vec<(String, FileState)>,
}

impl Harvest {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.refreshed.is_empty()
    }
}

impl Truthy for Harvest {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

/// Polls a directory for settled files matching a pattern.
pub struct DirectoryHarvester<P = Glob> {
    provider: P,
    file_mod_wait: Duration,

    // names already emitted as new during the lifetime of this harvester
    sent: HashSet<String>,
    // latest observations of ingested files, ahead of what the caller applied
    observed: HashMap<String, FileState>,
}

impl DirectoryHarvester<Glob> {
    pub fn new(
        directory: impl Into<PathBuf>,
        pattern: &str,
        file_mod_wait: Duration,
    ) -> Result<Self, Error> {
        let provider = Glob::new(directory, pattern).map_err(|err| Error::Pattern {
            pattern: pattern.to_string(),
            err,
        })?;

        Ok(Self::with_provider(provider, file_mod_wait))
    }
}

impl<P: Provider> DirectoryHarvester<P> {
    pub fn with_provider(provider: P, file_mod_wait: Duration) -> Self {
        DirectoryHarvester {
            provider,
            file_mod_wait,
            sent: HashSet::new(),
            observed: HashMap::new(),
        }
    }

    /// Report `name` as new again on its next sighting, e.g. after the caller
    /// failed to open it.
    pub fn forget(&mut self, name: &str) {
        self.sent.remove(name);
        self.observed.remove(name);
    }

    pub fn poll(&mut self, known: &Snapshot) -> Result<Harvest, Error> {
        self.poll_at(known, Utc::now())
    }

    /// Classify every settled file against `known`, as of `now`.
    pub fn poll_at(&mut self, known: &Snapshot, now: DateTime<Utc>) -> Result<Harvest, Error> {
        let paths = self.provider.scan().map_err(|err| Error::Scan {
            path: self.provider.directory().to_path_buf(),
            err,
        })?;

        let mut candidates = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let name = name.to_string();

            let stat = match Stat::of_path(&path) {
                Ok(stat) => stat,
                // removed between listing and stat
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Error::Stat { path, err }),
            };

            if !stat.settled(now, self.file_mod_wait) {
                trace!(message = "file not settled yet", ?path, modified = %stat.modified);
                continue;
            }

            candidates.push((name, path, stat));
        }

        sort_by_name(&mut candidates, |(name, _, _)| name.as_str());

        let mut harvest = Harvest::default();
        for (name, path, stat) in candidates {
            match known.get(&name) {
                Some(record) if record.ingested => {
                    let latest = *self.observed.get(&name).unwrap_or(record.latest());
                    if latest.same_metadata(&stat) {
                        continue;
                    }

                    let Some(state) = checksum(stat, &path)? else {
                        continue;
                    };
                    self.observed.insert(name.clone(), state);

                    if state.checksum == latest.checksum {
                        debug!(message = "metadata changed, content did not", file = %name);
                        harvest.refreshed.push((name, state));
                    } else {
                        debug!(message = "file modified after ingestion", file = %name);
                        harvest.modified.push((name, state));
                    }
                }
                _ => {
                    if self.sent.contains(&name) {
                        continue;
                    }

                    let Some(state) = checksum(stat, &path)? else {
                        continue;
                    };

                    debug!(message = "found new file", file = %name, size = state.size);
                    self.sent.insert(name.clone());
                    harvest.new.push((name, state));
                }
            }
        }

        Ok(harvest)
    }
}

fn checksum(stat: Stat, path: &Path) -> Result<Option<FileState>, Error> {
    match stat.checksum(path) {
        Ok(state) => Ok(Some(state)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::Checksum {
            path: path.to_path_buf(),
            err,
        }),
    }
}
