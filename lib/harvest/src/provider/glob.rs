use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern, PatternError};

use super::Provider;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// A glob-based path provider
///
/// Lists the regular files directly inside `directory` whose basename matches
/// the pattern. Unlike `glob::glob` a missing or unreadable directory is an
/// error, not an empty result.
pub struct Glob {
    directory: PathBuf,
    pattern: Pattern,
}

impl Glob {
    pub fn new(directory: impl Into<PathBuf>, pattern: &str) -> Result<Self, PatternError> {
        Ok(Self {
            directory: directory.into(),
            pattern: Pattern::new(pattern)?,
        })
    }
}

impl Provider for Glob {
    fn directory(&self) -> &Path {
        &self.directory
    }

    fn scan(&self) -> io::Result<Vec<PathBuf>> {
        let mut paths = vec![];

        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();

            // follows symlinks, so a link to a regular file is harvested too
            if !path.is_file() {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!(message = "skip file with non utf8 name", ?path);
                continue;
            };

            if self.pattern.matches_with(name, MATCH_OPTIONS) {
                paths.push(path);
            }
        }

        Ok(paths)
    }
}
