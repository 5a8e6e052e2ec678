use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const fn default_frequency() -> Duration {
    Duration::from_secs(5)
}

const fn default_file_mod_wait() -> Duration {
    Duration::from_secs(30)
}

/// How the files of a source arrive.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Discrete files dropped into a directory, each one complete once settled.
    #[default]
    Directory,

    /// A single file, `pattern` is its exact name, appended to indefinitely.
    Growing,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HarvesterConfig {
    /// Directory to watch, not recursive.
    pub directory: PathBuf,

    /// Glob matched against basenames, or the exact filename in growing mode.
    pub pattern: String,

    #[serde(default)]
    pub mode: Mode,

    /// Seconds between two polls.
    #[serde(default = "default_frequency", with = "seconds")]
    pub frequency: Duration,

    /// Seconds a file must stay unmodified before it is read.
    #[serde(default = "default_file_mod_wait", with = "seconds")]
    pub file_mod_wait: Duration,
}

impl HarvesterConfig {
    pub fn directory(directory: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        HarvesterConfig {
            directory: directory.into(),
            pattern: pattern.into(),
            mode: Mode::Directory,
            frequency: default_frequency(),
            file_mod_wait: default_file_mod_wait(),
        }
    }

    pub fn growing(directory: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        HarvesterConfig {
            mode: Mode::Growing,
            ..Self::directory(directory, filename)
        }
    }

    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_file_mod_wait(mut self, file_mod_wait: Duration) -> Self {
        self.file_mod_wait = file_mod_wait;
        self
    }
}

// Durations are plain (possibly fractional) numbers of seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
