use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, Metadata};
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Known files of one source, keyed by basename.
pub type Snapshot = BTreeMap<String, FileRecord>;

/// MD5 digest of the whole file content.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Checksum(u128);

impl Checksum {
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        Self::of_reader(&mut file)
    }

    pub fn of_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let size = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(size) => size,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };

            hasher.update(&buf[..size]);
        }

        let mut digest = [0u8; 16];
        digest.copy_from_slice(&hasher.finalize());
        Ok(Checksum(u128::from_be_bytes(digest)))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(format!("checksum must be 32 hex digits, got {}", s.len()));
        }

        u128::from_str_radix(s, 16)
            .map(Checksum)
            .map_err(|err| format!("invalid checksum {s:?}, {err}"))
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Size and modification time of a file, without touching its content.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stat {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl Stat {
    pub fn of_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Self::from_metadata(&metadata)
    }

    pub fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        Ok(Stat {
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        })
    }

    /// A file is settled once nothing has written to it for `wait`. Files with a
    /// modification time in the future only settle when no wait is configured.
    pub fn settled(&self, now: DateTime<Utc>, wait: Duration) -> bool {
        match (now - self.modified).to_std() {
            Ok(elapsed) => elapsed >= wait,
            Err(_) => wait.is_zero(),
        }
    }

    /// Hash the content and build the full state.
    pub fn checksum(self, path: &Path) -> io::Result<FileState> {
        let checksum = Checksum::of_file(path)?;

        Ok(FileState {
            size: self.size,
            modified: self.modified,
            checksum,
        })
    }
}

/// What we know about the content of a file at one point in time.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct FileState {
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub checksum: Checksum,
}

impl FileState {
    #[inline]
    pub fn same_metadata(&self, stat: &Stat) -> bool {
        self.size == stat.size && self.modified == stat.modified
    }
}

/// One file under a harvester's purview.
///
/// The primary state is only ever written from harvester observations, while
/// `ingested` belongs to whoever hands the content to a parser.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FileRecord {
    pub name: String,

    #[serde(flatten)]
    pub state: FileState,

    #[serde(default)]
    pub ingested: bool,

    /// Set when the content changed after the file was ingested. The primary
    /// state keeps describing what was actually ingested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_state: Option<FileState>,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, state: FileState) -> Self {
        FileRecord {
            name: name.into(),
            state,
            ingested: false,
            modified_state: None,
        }
    }

    /// The most recent observation.
    pub fn latest(&self) -> &FileState {
        self.modified_state.as_ref().unwrap_or(&self.state)
    }
}
