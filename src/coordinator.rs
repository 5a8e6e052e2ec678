use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use harvest::{
    DirectoryHarvester, FileRecord, FileState, GrowingFileHarvester, Harvest, HarvesterConfig,
    Mode, Poller, PollerHandle, RangeError, Shutdown, Snapshot,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::parser::{ParseError, Parser, ParserFactory, ParserState};
use crate::sink::Sink;
use crate::state::{DriverState, FileEntry, StateStore};
use crate::{Error, Result};

/// What a poller observed, handled by the dispatcher in arrival order.
#[derive(Debug)]
struct Notification {
    key: String,
    kind: NotificationKind,
}

#[derive(Debug)]
enum NotificationKind {
    New(String, FileState),
    Modified(String, FileState),
    Refreshed(String, FileState),
    Grown(String, FileState),
}

#[derive(Debug, Default)]
struct SourceSlot {
    files: BTreeMap<String, FileEntry>,
    // new files handed to the dispatcher but not ingested yet
    queued: BTreeSet<String>,
    // failed to open, the harvester has to report them again
    retry: BTreeSet<String>,
    last_error: Option<String>,
}

/// State shared by the pollers and the dispatcher. Each key is guarded by its
/// own shard lock, never hold one across a call into another method.
struct Shared<F, S> {
    slots: DashMap<String, SourceSlot>,
    store: Box<dyn StateStore>,
    sink: S,
    _factory: PhantomData<fn() -> F>,
}

impl<F, S> Shared<F, S>
where
    F: ParserFactory,
    S: Sink<F::Record>,
{
    fn snapshot(&self, key: &str) -> Snapshot {
        self.slots
            .get(key)
            .map(|slot| {
                slot.files
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn latest(&self, key: &str, filename: &str) -> Option<FileState> {
        self.slots
            .get(key)
            .and_then(|slot| slot.files.get(filename).map(|entry| *entry.record.latest()))
    }

    /// False when the file is already queued.
    fn enqueue(&self, key: &str, filename: &str) -> bool {
        self.slots
            .entry(key.to_string())
            .or_default()
            .queued
            .insert(filename.to_string())
    }

    fn update<T>(
        &self,
        key: &str,
        filename: &str,
        f: impl FnOnce(&mut FileEntry) -> T,
    ) -> Option<T> {
        self.slots
            .get_mut(key)
            .and_then(|mut slot| slot.files.get_mut(filename).map(f))
    }

    /// Apply a new file observation verbatim, returning where to resume parsing.
    fn observe(&self, key: &str, filename: &str, state: FileState) -> ParserState {
        let mut slot = self.slots.entry(key.to_string()).or_default();
        let entry = slot
            .files
            .entry(filename.to_string())
            .and_modify(|entry| entry.record.state = state)
            .or_insert_with(|| FileEntry::new(FileRecord::new(filename, state)));

        entry.parser_state.clone()
    }

    /// Track the bytes a growing file gained since its last observation.
    fn observe_growth(
        &self,
        key: &str,
        filename: &str,
        state: FileState,
    ) -> std::result::Result<ParserState, RangeError> {
        let mut slot = self.slots.entry(key.to_string()).or_default();
        let previous = slot
            .files
            .get(filename)
            .map_or(0, |entry| entry.record.state.size);
        let entry = slot
            .files
            .entry(filename.to_string())
            .or_insert_with(|| FileEntry::new(FileRecord::new(filename, state)));

        let mut ranges = entry.parser_state.unprocessed.take().unwrap_or_default();
        let result = ranges.extend(previous, state.size);
        entry.parser_state.unprocessed = Some(ranges);
        result?;

        entry.record.state = state;
        Ok(entry.parser_state.clone())
    }

    fn mark_ingested(&self, key: &str, filename: &str) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.queued.remove(filename);
            if let Some(entry) = slot.files.get_mut(filename) {
                entry.record.ingested = true;
            }
        }
    }

    /// Drop a queued file which could not be opened, so it is rediscovered.
    fn dequeue(&self, key: &str, filename: &str) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            if slot.queued.remove(filename) {
                slot.retry.insert(filename.to_string());
            }
        }
    }

    fn take_retries(&self, key: &str) -> BTreeSet<String> {
        self.slots
            .get_mut(key)
            .map(|mut slot| std::mem::take(&mut slot.retry))
            .unwrap_or_default()
    }

    fn parser_state(&self, key: &str, filename: &str) -> ParserState {
        self.slots
            .get(key)
            .and_then(|slot| slot.files.get(filename).map(|entry| entry.parser_state.clone()))
            .unwrap_or_default()
    }

    fn save_parser_state(&self, key: &str, filename: &str, state: ParserState) {
        self.update(key, filename, |entry| entry.parser_state = state);
        self.checkpoint(key);
    }

    fn driver_state(&self) -> DriverState {
        self.slots
            .iter()
            .map(|slot| (slot.key().clone(), slot.files.clone()))
            .collect()
    }

    fn persist(&self) -> std::io::Result<()> {
        self.store.save(&self.driver_state())
    }

    /// Persist, a failure is reported and processing goes on with the
    /// in-memory state.
    fn checkpoint(&self, key: &str) {
        if let Err(err) = self.persist() {
            self.report(key, None, &Error::Persist(err));
        }
    }

    fn report(&self, key: &str, filename: Option<&str>, err: &Error) {
        error!(message = "Ingestion error", key, file = filename, %err);

        {
            let mut slot = self.slots.entry(key.to_string()).or_default();
            let message = err.to_string();
            match filename {
                Some(name) if slot.files.contains_key(name) => {
                    if let Some(entry) = slot.files.get_mut(name) {
                        entry.last_error = Some(message);
                    }
                }
                _ => slot.last_error = Some(message),
            }
        }

        self.sink.on_exception(err, filename, key);
    }
}

/// Where the dispatcher finds the files and parser of one source.
struct Route<F> {
    directory: PathBuf,
    factory: Arc<F>,
    poller: Shutdown,
}

enum Drain {
    Completed,
    Interrupted,
    Failed(ParseError),
}

/// Consumes the notifications of one source on a blocking thread, one file at
/// a time.
struct Dispatcher<F, S> {
    shared: Arc<Shared<F, S>>,
    key: String,
    route: Route<F>,
    shutdown: Shutdown,
}

impl<F, S> Dispatcher<F, S>
where
    F: ParserFactory,
    S: Sink<F::Record>,
{
    fn run(self, mut rx: UnboundedReceiver<Notification>) {
        debug!(message = "Dispatcher started");

        while let Some(Notification { key, kind }) = rx.blocking_recv() {
            if self.shutdown.is_shutdown() {
                break;
            }

            if key != self.key {
                warn!(message = "Notification for another source", key);
                continue;
            }

            let route = &self.route;
            match kind {
                NotificationKind::New(filename, state) => {
                    self.ingest(&key, route, &filename, state)
                }
                NotificationKind::Modified(filename, state) => {
                    self.modified(&key, &filename, state)
                }
                NotificationKind::Refreshed(filename, state) => {
                    self.refresh(&key, &filename, state)
                }
                NotificationKind::Grown(filename, state) => {
                    self.grown(&key, route, &filename, state)
                }
            }
        }

        debug!(message = "Dispatcher stopped");
    }

    fn open(&self, key: &str, route: &Route<F>, filename: &str) -> Option<File> {
        let path = route.directory.join(filename);

        match File::open(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                self.shared.dequeue(key, filename);
                self.shared.report(key, Some(filename), &Error::Open { path, err });
                self.shared.checkpoint(key);
                None
            }
        }
    }

    fn ingest(&self, key: &str, route: &Route<F>, filename: &str, state: FileState) {
        let parser_state = self.shared.observe(key, filename, state);
        let Some(file) = self.open(key, route, filename) else {
            return;
        };

        debug!(
            message = "Ingesting file",
            key,
            file = filename,
            position = parser_state.position
        );

        let parser = route.factory.build(parser_state, file);
        match self.drain(key, filename, parser) {
            Drain::Completed => {}
            // stays queued until stop clears it, the next start finds it again
            Drain::Interrupted => return,
            Drain::Failed(ParseError::Range(source)) => {
                self.halt(key, route, filename, source);
                return;
            }
            Drain::Failed(source) => {
                // poison file, marking it ingested keeps the source moving
                let err = Error::Parse {
                    filename: filename.to_string(),
                    source,
                };
                self.shared.report(key, Some(filename), &err);
            }
        }

        self.shared.mark_ingested(key, filename);
        self.shared.checkpoint(key);
    }

    fn grown(&self, key: &str, route: &Route<F>, filename: &str, state: FileState) {
        let mut parser_state = match self.shared.observe_growth(key, filename, state) {
            Ok(parser_state) => parser_state,
            Err(source) => {
                self.halt(key, route, filename, source);
                return;
            }
        };
        self.shared.checkpoint(key);

        if parser_state.pending() == 0 {
            return;
        }

        while parser_state.pending() > 0 {
            let Some(file) = self.open(key, route, filename) else {
                return;
            };

            let pending = parser_state.pending();
            debug!(message = "Ingesting growth", key, file = filename, pending);

            let parser = route.factory.build(parser_state, file);
            match self.drain(key, filename, parser) {
                Drain::Completed => break,
                Drain::Interrupted => return,
                Drain::Failed(ParseError::Range(source)) => {
                    self.halt(key, route, filename, source);
                    return;
                }
                Drain::Failed(source) => {
                    let err = Error::Parse {
                        filename: filename.to_string(),
                        source,
                    };
                    self.shared.report(key, Some(filename), &err);

                    // the bad record is consumed, the bytes after it still count
                    parser_state = self.shared.parser_state(key, filename);
                    if parser_state.pending() >= pending {
                        break;
                    }
                }
            }
        }

        self.shared.mark_ingested(key, filename);
        self.shared.checkpoint(key);
    }

    fn modified(&self, key: &str, filename: &str, state: FileState) {
        self.shared.update(key, filename, |entry| {
            entry.record.modified_state = Some(state);
        });

        let err = Error::ModifiedAfterIngestion {
            filename: filename.to_string(),
        };
        self.shared.report(key, Some(filename), &err);
        self.shared.checkpoint(key);
    }

    fn refresh(&self, key: &str, filename: &str, state: FileState) {
        self.shared.update(key, filename, |entry| match &mut entry.record.modified_state {
            Some(modified) => *modified = state,
            None => entry.record.state = state,
        });
        self.shared.checkpoint(key);
    }

    /// Inconsistent ranges are fatal for the source, its poller is stopped.
    fn halt(&self, key: &str, route: &Route<F>, filename: &str, source: RangeError) {
        let err = Error::Range {
            filename: filename.to_string(),
            source,
        };
        self.shared.report(key, Some(filename), &err);
        self.shared.checkpoint(key);

        warn!(message = "Source halted", key);
        route.poller.shutdown();
    }

    fn drain(&self, key: &str, filename: &str, mut parser: F::Parser) -> Drain {
        loop {
            if self.shutdown.is_shutdown() {
                return Drain::Interrupted;
            }

            match parser.next_chunk() {
                Ok(Some(chunk)) => {
                    let records = chunk.records.len();
                    for record in chunk.records {
                        self.shared.sink.on_record(key, filename, record);
                    }

                    self.shared.save_parser_state(key, filename, chunk.state);
                    trace!(message = "Chunk delivered", key, file = filename, records);
                }
                Ok(None) => return Drain::Completed,
                Err(err) => {
                    self.shared
                        .save_parser_state(key, filename, parser.state().clone());
                    return Drain::Failed(err);
                }
            }
        }
    }
}

struct Source<F> {
    config: HarvesterConfig,
    factory: Arc<F>,
}

struct Running {
    pollers: Vec<PollerHandle>,
    dispatchers: Vec<JoinHandle<()>>,
    shutdown: Shutdown,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileStatus {
    pub name: String,
    pub size: u64,
    pub ingested: bool,
    /// Changed after it was ingested.
    pub modified: bool,
    /// Unparsed bytes of a growing file.
    pub pending: u64,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceStatus {
    pub key: String,
    /// Whether its poller is alive.
    pub polling: bool,
    pub queued: usize,
    pub last_error: Option<String>,
    pub files: Vec<FileStatus>,
}

/// Owns the harvesters and parsers of every data source, and the state which
/// makes ingestion resumable.
pub struct Coordinator<F, S> {
    supported: BTreeSet<String>,
    sources: BTreeMap<String, Source<F>>,
    shared: Arc<Shared<F, S>>,
    running: Option<Running>,
}

impl<F, S> Coordinator<F, S>
where
    F: ParserFactory,
    S: Sink<F::Record>,
{
    /// Load the persisted state, sources must be added before sampling.
    pub fn new<I, K>(supported_keys: I, store: impl StateStore, sink: S) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let state = store.load().map_err(Error::Persist)?;

        let slots = DashMap::new();
        for (key, files) in state {
            slots.insert(
                key,
                SourceSlot {
                    files,
                    ..Default::default()
                },
            );
        }

        Ok(Coordinator {
            supported: supported_keys.into_iter().map(Into::into).collect(),
            sources: BTreeMap::new(),
            shared: Arc::new(Shared {
                slots,
                store: Box::new(store),
                sink,
                _factory: PhantomData,
            }),
            running: None,
        })
    }

    pub fn add_source(
        &mut self,
        key: impl Into<String>,
        config: HarvesterConfig,
        factory: F,
    ) -> Result<()> {
        let key = key.into();

        if !self.supported.contains(&key) {
            return Err(Error::Configuration(format!("unsupported data source key {key:?}")));
        }
        if self.sources.contains_key(&key) {
            return Err(Error::Configuration(format!("data source {key:?} is already registered")));
        }
        if self.running.is_some() {
            return Err(Error::Configuration(format!(
                "cannot add data source {key:?} while sampling"
            )));
        }
        if config.frequency.is_zero() {
            return Err(Error::Configuration(format!("frequency of {key:?} must not be zero")));
        }

        match std::fs::metadata(&config.directory) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(Error::Configuration(format!(
                    "{:?} is not a directory",
                    config.directory
                )));
            }
            Err(err) => {
                return Err(Error::Configuration(format!(
                    "directory {:?} is not accessible, {err}",
                    config.directory
                )));
            }
        }

        match config.mode {
            Mode::Directory => {
                DirectoryHarvester::new(&config.directory, &config.pattern, config.file_mod_wait)
                    .map_err(|err| Error::Configuration(err.to_string()))?;
            }
            Mode::Growing => {
                if config.pattern.is_empty() || config.pattern.contains(std::path::is_separator) {
                    return Err(Error::Configuration(format!(
                        "growing file name {:?} must be a plain filename",
                        config.pattern
                    )));
                }
            }
        }

        info!(
            message = "Data source added",
            key,
            directory = ?config.directory,
            pattern = config.pattern,
            mode = ?config.mode
        );

        self.shared.slots.entry(key.clone()).or_default();
        self.sources.insert(
            key,
            Source {
                config,
                factory: Arc::new(factory),
            },
        );

        Ok(())
    }

    #[inline]
    pub fn is_sampling(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn a poller and a dispatcher per source. Calling it again while
    /// sampling does nothing. Must be called within a tokio runtime.
    pub fn start_sampling(&mut self) -> Result<()> {
        if self.running.is_some() {
            debug!(message = "Already sampling");
            return Ok(());
        }

        let shutdown = Shutdown::new();
        let mut pollers: Vec<PollerHandle> = Vec::with_capacity(self.sources.len());
        let mut dispatchers = Vec::with_capacity(self.sources.len());
        for (key, source) in &self.sources {
            let (tx, rx) = mpsc::unbounded_channel();
            // queued ahead of anything the poller observes
            if source.config.mode == Mode::Growing {
                self.resume_growing(key, &source.config, &tx);
            }

            let started = match source.config.mode {
                Mode::Directory => self
                    .directory_poller(key, &source.config, tx)
                    .map(Poller::start),
                Mode::Growing => Ok(self.growing_poller(key, &source.config, tx).start()),
            };
            let poller = match started {
                Ok(poller) => poller,
                Err(err) => {
                    for poller in &pollers {
                        poller.shutdown();
                    }
                    return Err(err);
                }
            };

            let dispatcher = Dispatcher {
                shared: Arc::clone(&self.shared),
                key: key.clone(),
                route: Route {
                    directory: source.config.directory.clone(),
                    factory: Arc::clone(&source.factory),
                    poller: poller.shutdown_handle(),
                },
                shutdown: shutdown.clone(),
            };
            dispatchers.push((dispatcher, rx));
            pollers.push(poller);
        }

        let dispatchers = dispatchers
            .into_iter()
            .map(|(dispatcher, rx)| {
                let span = info_span!("dispatcher", key = %dispatcher.key);
                tokio::task::spawn_blocking(move || {
                    let _enter = span.enter();
                    dispatcher.run(rx)
                })
            })
            .collect();

        info!(message = "Sampling started", sources = pollers.len());

        self.running = Some(Running {
            pollers,
            dispatchers,
            shutdown,
        });

        Ok(())
    }

    /// Stop every poller and dispatcher. Returns once they all ended and the
    /// chunk in flight is persisted; nothing reaches the sink afterwards.
    /// Calling it while not sampling does nothing.
    pub async fn stop_sampling(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        for poller in &running.pollers {
            poller.shutdown();
        }
        running.shutdown.shutdown();

        for poller in running.pollers {
            poller.join().await;
        }
        for dispatcher in running.dispatchers {
            if let Err(err) = dispatcher.await {
                error!(message = "Dispatcher task failed", ?err);
            }
        }

        // dropped notifications, rediscovered by the next start
        for mut slot in self.shared.slots.iter_mut() {
            slot.queued.clear();
            slot.retry.clear();
        }
        if let Err(err) = self.shared.persist() {
            error!(message = "Persist state on stop failed", %err);
        }

        info!(message = "Sampling stopped");
    }

    pub fn status(&self, key: &str) -> Option<SourceStatus> {
        let polling = self
            .running
            .as_ref()
            .and_then(|running| running.pollers.iter().find(|poller| poller.name() == key))
            .is_some_and(|poller| !poller.is_finished());

        let slot = self.shared.slots.get(key)?;
        let files = slot
            .files
            .values()
            .map(|entry| FileStatus {
                name: entry.record.name.clone(),
                size: entry.record.latest().size,
                ingested: entry.record.ingested,
                modified: entry.record.modified_state.is_some(),
                pending: entry.parser_state.pending(),
                last_error: entry.last_error.clone(),
            })
            .collect();

        Some(SourceStatus {
            key: key.to_string(),
            polling,
            queued: slot.queued.len(),
            last_error: slot.last_error.clone(),
            files,
        })
    }

    /// A copy of everything that would be persisted.
    pub fn state(&self) -> DriverState {
        self.shared.driver_state()
    }

    fn directory_poller(
        &self,
        key: &str,
        config: &HarvesterConfig,
        tx: UnboundedSender<Notification>,
    ) -> Result<Poller<Harvest, Error>> {
        let mut harvester =
            DirectoryHarvester::new(&config.directory, &config.pattern, config.file_mod_wait)
                .map_err(|err| Error::Configuration(err.to_string()))?;

        let condition = {
            let shared = Arc::clone(&self.shared);
            let key = key.to_string();

            move || {
                for filename in shared.take_retries(&key) {
                    harvester.forget(&filename);
                }

                let known = shared.snapshot(&key);
                harvester.poll(&known).map_err(|source| Error::Poll {
                    key: key.clone(),
                    source,
                })
            }
        };

        let callback = {
            let shared = Arc::clone(&self.shared);
            let key = key.to_string();

            move |harvest: Harvest| {
                let Harvest {
                    new,
                    modified,
                    refreshed,
                } = harvest;

                let notifications = refreshed
                    .into_iter()
                    .map(|(filename, state)| NotificationKind::Refreshed(filename, state))
                    .chain(
                        modified
                            .into_iter()
                            .map(|(filename, state)| NotificationKind::Modified(filename, state)),
                    );
                for kind in notifications {
                    if !notify(&tx, &key, kind) {
                        return Ok(());
                    }
                }

                for (filename, state) in new {
                    if !shared.enqueue(&key, &filename) {
                        trace!(message = "Already queued", file = filename);
                        continue;
                    }

                    if !notify(&tx, &key, NotificationKind::New(filename, state)) {
                        return Ok(());
                    }
                }

                Ok(())
            }
        };

        Ok(Poller::new(
            key,
            config.frequency,
            condition,
            callback,
            self.exception_handler(key),
        ))
    }

    fn growing_poller(
        &self,
        key: &str,
        config: &HarvesterConfig,
        tx: UnboundedSender<Notification>,
    ) -> Poller<Option<(String, FileState)>, Error> {
        let last = self.shared.latest(key, &config.pattern);
        let mut harvester =
            GrowingFileHarvester::new(&config.directory, &config.pattern, config.file_mod_wait)
                .with_last(last);

        let condition = {
            let key = key.to_string();

            move || {
                harvester.poll().map_err(|source| Error::Poll {
                    key: key.clone(),
                    source,
                })
            }
        };

        let callback = {
            let key = key.to_string();

            move |observed: Option<(String, FileState)>| {
                if let Some((filename, state)) = observed {
                    notify(&tx, &key, NotificationKind::Grown(filename, state));
                }

                Ok(())
            }
        };

        Poller::new(
            key,
            config.frequency,
            condition,
            callback,
            self.exception_handler(key),
        )
    }

    fn exception_handler(&self, key: &str) -> impl FnOnce(Error) + Send + 'static + use<F, S> {
        let shared = Arc::clone(&self.shared);
        let key = key.to_string();

        move |err: Error| shared.report(&key, None, &err)
    }

    /// A growing file with bytes left unparsed by the last run is drained
    /// before anything new is observed.
    fn resume_growing(
        &self,
        key: &str,
        config: &HarvesterConfig,
        tx: &UnboundedSender<Notification>,
    ) {
        let filename = &config.pattern;
        let pending = self.shared.slots.get(key).and_then(|slot| {
            slot.files
                .get(filename)
                .filter(|entry| entry.parser_state.pending() > 0)
                .map(|entry| entry.record.state)
        });

        if let Some(state) = pending {
            debug!(message = "Resuming growing file", key, file = filename);
            notify(tx, key, NotificationKind::Grown(filename.clone(), state));
        }
    }
}

impl<F, S> Drop for Coordinator<F, S> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            for poller in &running.pollers {
                poller.shutdown();
            }
            running.shutdown.shutdown();
        }
    }
}

/// False once the dispatcher is gone, which only happens while stopping.
fn notify(tx: &UnboundedSender<Notification>, key: &str, kind: NotificationKind) -> bool {
    let notification = Notification {
        key: key.to_string(),
        kind,
    };

    if tx.send(notification).is_err() {
        debug!(message = "Dispatcher is gone, notification dropped", key);
        return false;
    }

    true
}
