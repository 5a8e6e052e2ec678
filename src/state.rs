//! Crash recoverable ingestion state.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use harvest::FileRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::parser::ParserState;

const STATE_VERSION: &str = "v1";
const TMP_FILE_NAME: &str = "state.new.json";
const STABLE_FILE_NAME: &str = "state.json";

/// `key -> filename -> entry`
pub type DriverState = BTreeMap<String, BTreeMap<String, FileEntry>>;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FileEntry {
    #[serde(flatten)]
    pub record: FileRecord,

    #[serde(default)]
    pub parser_state: ParserState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl FileEntry {
    pub fn new(record: FileRecord) -> Self {
        FileEntry {
            record,
            parser_state: ParserState::default(),
            last_error: None,
        }
    }
}

pub trait StateStore: Send + Sync + 'static {
    /// An empty state when nothing was saved yet.
    fn load(&self) -> io::Result<DriverState>;

    fn save(&self, state: &DriverState) -> io::Result<()>;
}

impl<T: StateStore> StateStore for Arc<T> {
    fn load(&self) -> io::Result<DriverState> {
        (**self).load()
    }

    fn save(&self, state: &DriverState) -> io::Result<()> {
        (**self).save(state)
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: &'a str,
    sources: &'a DriverState,
}

#[derive(Deserialize)]
struct Envelope {
    version: String,
    sources: DriverState,
}

/// Keeps the state in a single JSON file inside the data directory.
pub struct JsonFileStore {
    tmp_file_path: PathBuf,
    stable_file_path: PathBuf,
    last: Mutex<Option<DriverState>>,
}

impl JsonFileStore {
    pub fn new(data_dir: &Path) -> Self {
        JsonFileStore {
            tmp_file_path: data_dir.join(TMP_FILE_NAME),
            stable_file_path: data_dir.join(STABLE_FILE_NAME),
            last: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.stable_file_path
    }

    fn read_file(&self, path: &Path) -> io::Result<DriverState> {
        let reader = io::BufReader::new(fs::File::open(path)?);
        let envelope: Envelope = serde_json::from_reader(reader)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        if envelope.version != STATE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported state version {:?}", envelope.version),
            ));
        }

        Ok(envelope.sources)
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> io::Result<DriverState> {
        // a leftover tmp file means the last write was interrupted after the
        // data was flushed, it is newer than the stable one
        match self.read_file(&self.tmp_file_path) {
            Ok(state) => {
                info!(message = "Recovered state from interrupted process");

                if let Err(err) = fs::rename(&self.tmp_file_path, &self.stable_file_path) {
                    warn!(message = "Error persisting recovered state file", %err);
                }

                *self.last.lock() = Some(state.clone());
                return Ok(state);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                error!(
                    message = "Unable to recover state from interrupted process",
                    %err
                );
            }
        }

        match self.read_file(&self.stable_file_path) {
            Ok(state) => {
                info!(message = "Loaded state", sources = state.len());
                *self.last.lock() = Some(state.clone());
                Ok(state)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DriverState::new()),
            Err(err) => Err(err),
        }
    }

    fn save(&self, state: &DriverState) -> io::Result<()> {
        let mut last = self.last.lock();
        if last.as_ref() == Some(state) {
            return Ok(());
        }

        // If we die anywhere in here the stable file is still valid.
        let mut writer = io::BufWriter::new(fs::File::create(&self.tmp_file_path)?);
        serde_json::to_writer(
            &mut writer,
            &EnvelopeRef {
                version: STATE_VERSION,
                sources: state,
            },
        )?;
        writer.into_inner()?.sync_all()?;

        fs::rename(&self.tmp_file_path, &self.stable_file_path)?;
        *last = Some(state.clone());

        Ok(())
    }
}

/// Process local state, for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<DriverState>,
}

impl MemoryStore {
    pub fn new(state: DriverState) -> Self {
        MemoryStore {
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> DriverState {
        self.state.lock().clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> io::Result<DriverState> {
        Ok(self.snapshot())
    }

    fn save(&self, state: &DriverState) -> io::Result<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}
