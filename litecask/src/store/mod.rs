//! Datastore façade: lifecycle, configuration, telemetry, and the shared
//! state the read/write/merge/upkeep paths operate on.

mod merge;
mod read;
mod recovery;
mod upkeep;
mod write;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::cache::ValueCache;
use crate::clock::Clock;
use crate::config::Config;
use crate::datafile::{DATA_FILE_EXT, DataFile, HINT_FILE_EXT, REMOVE_MARKER_EXT, TMP_FILE_EXT};
use crate::error::{Error, Result};
use crate::flock::LockFile;
use crate::index::TagIndex;
use crate::keydir::KeyDir;
use crate::logger::{LogLevel, StoreLogger};
use crate::types::{
    CounterCells, DataFileStats, DatastoreCounters, KeyIndex, NO_FILE_ID, ValueCacheCounters,
};

/// Default byte budget of the value cache.
const DEFAULT_CACHE_BYTES: u64 = 256 * 1024 * 1024;
/// Cap of the KeyDir key-storage arena (grown on demand).
const KEY_STORAGE_MAX_BYTES: u64 = 16 * 1024 * 1024 * 1024;
/// Initial KeyDir slot count.
const INITIAL_KEYDIR_CAPACITY: u32 = 16 * 1024;
/// Default write buffer size; small values already amortise the syscalls.
const DEFAULT_WRITE_BUFFER_BYTES: usize = 100_000;
/// Consecutive write failures before the store degrades to read-only.
const WRITE_FAILURE_DEGRADE_LIMIT: u32 = 3;

/// The write buffer and active-file cursor. Guarded by `write_state`; the
/// append serialisation itself is `active_mutex`.
pub(crate) struct WriteState {
    pub buffer: Vec<u8>,
    pub data_offset: u32,
    pub flushed_offset: u32,
    pub active_file_id: u16,
}

impl WriteState {
    fn new() -> Self {
        Self {
            buffer: vec![0; DEFAULT_WRITE_BUFFER_BYTES],
            data_offset: 0,
            flushed_offset: 0,
            active_file_id: NO_FILE_ID,
        }
    }

    pub fn pending_bytes(&self) -> usize {
        (self.data_offset - self.flushed_offset) as usize
    }
}

/// The open data files, indexed by recyclable 16-bit id.
pub(crate) struct FileTable {
    pub directory: PathBuf,
    pub files: Vec<Option<Arc<DataFile>>>,
    pub free_ids: Vec<u16>,
    /// Highest numeric file name seen or created so far.
    pub max_file_index: u64,
}

impl FileTable {
    fn new() -> Self {
        Self {
            directory: PathBuf::new(),
            files: Vec::new(),
            free_ids: Vec::new(),
            max_file_index: 0,
        }
    }

    pub fn alloc_file_id(&mut self) -> u16 {
        match self.free_ids.pop() {
            Some(id) => id,
            None => {
                self.files.push(None);
                (self.files.len() - 1) as u16
            }
        }
    }

    pub fn get(&self, id: u16) -> Option<Arc<DataFile>> {
        self.files.get(id as usize).and_then(Clone::clone)
    }
}

/// Wake reason of a background worker.
pub(crate) enum Wake {
    Run,
    Exit,
}

#[derive(Default)]
struct SignalState {
    work: bool,
    exit: bool,
}

/// Condvar-parked control of one background thread.
pub(crate) struct WorkerSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl WorkerSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cv: Condvar::new(),
        }
    }

    /// Requests an immediate cycle. No-op when one is already requested.
    pub fn request(&self) -> bool {
        let mut state = self.state.lock();
        if state.work {
            return false;
        }
        state.work = true;
        self.cv.notify_one();
        true
    }

    pub fn request_exit(&self) {
        let mut state = self.state.lock();
        state.exit = true;
        self.cv.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.state.lock().work
    }

    pub fn clear_work(&self) {
        self.state.lock().work = false;
    }

    fn reset(&self) {
        *self.state.lock() = SignalState::default();
    }

    /// Parks until the period elapses, a cycle is requested, or exit.
    pub fn wait_cycle(&self, period: Duration) -> Wake {
        let mut state = self.state.lock();
        if !state.work && !state.exit {
            let deadline = Instant::now() + period;
            while !state.work && !state.exit {
                if self.cv.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }
        if state.exit { Wake::Exit } else { Wake::Run }
    }
}

/// Tracks what the last age-based flush saw, so an idle buffer is flushed
/// once rather than every tick.
pub(crate) struct FlushTracker {
    pub last_flush: Instant,
    pub last_flushed_offset: u32,
    pub last_active_file_id: u16,
}

struct OpenState {
    lock_file: Option<LockFile>,
    threads: Vec<JoinHandle<()>>,
}

/// Shared state of an open datastore, used by the API paths and the
/// background threads.
pub(crate) struct StoreInner {
    pub keydir: KeyDir,
    pub cache: ValueCache,
    pub index: TagIndex,
    pub logger: StoreLogger,
    pub clock: Clock,
    pub counters: CounterCells,
    pub config: Mutex<Config>,
    pub data_file_max_bytes: AtomicU64,
    /// Serialises appends and active-file switches.
    pub active_mutex: Mutex<()>,
    pub write_state: RwLock<WriteState>,
    pub files: RwLock<FileTable>,
    pub flush_tracker: Mutex<FlushTracker>,
    pub is_open: AtomicBool,
    pub degraded: AtomicBool,
    pub write_failure_qty: AtomicU32,
    pub hint_files_missing: AtomicBool,
    pub merge: WorkerSignal,
    pub upkeep: WorkerSignal,
    state: Mutex<OpenState>,
}

/// Embedded, persistent, log-structured key-value store with tag queries,
/// per-entry TTL and background compaction.
///
/// All methods are safe to call from many threads; writes serialise
/// internally. Dropping an open store closes it.
pub struct Datastore {
    inner: Arc<StoreInner>,
}

impl Datastore {
    /// Creates a store with the default value cache budget (256 MB).
    pub fn new() -> Self {
        Self::with_cache_bytes(DEFAULT_CACHE_BYTES)
    }

    /// Creates a store with a custom value cache budget; 0 disables caching.
    pub fn with_cache_bytes(cache_bytes: u64) -> Self {
        Self::with_clock(cache_bytes, Clock::system())
    }

    /// Creates a store with an injected clock, used by TTL tests.
    pub fn with_clock(cache_bytes: u64, clock: Clock) -> Self {
        let inner = StoreInner {
            keydir: KeyDir::new(KEY_STORAGE_MAX_BYTES, INITIAL_KEYDIR_CAPACITY),
            cache: ValueCache::new(cache_bytes),
            index: TagIndex::new(),
            logger: StoreLogger::new(),
            clock,
            counters: CounterCells::default(),
            config: Mutex::new(Config::default()),
            data_file_max_bytes: AtomicU64::new(Config::default().data_file_max_bytes),
            active_mutex: Mutex::new(()),
            write_state: RwLock::new(WriteState::new()),
            files: RwLock::new(FileTable::new()),
            flush_tracker: Mutex::new(FlushTracker {
                last_flush: Instant::now(),
                last_flushed_offset: 0,
                last_active_file_id: NO_FILE_ID,
            }),
            is_open: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            write_failure_qty: AtomicU32::new(0),
            hint_files_missing: AtomicBool::new(false),
            merge: WorkerSignal::new(),
            upkeep: WorkerSignal::new(),
            state: Mutex::new(OpenState {
                lock_file: None,
                threads: Vec::new(),
            }),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Opens the store at `path`, creating the directory when allowed,
    /// reconstructing the in-memory directory from hint or data files, and
    /// starting the background threads.
    pub fn open(&self, path: impl AsRef<Path>, create_if_missing: bool) -> Result<()> {
        let result = self
            .inner
            .open_impl(path.as_ref(), create_if_missing)
            .and_then(|()| {
                if let Err(e) = StoreInner::start_threads(&self.inner) {
                    self.inner.abort_open();
                    return Err(e);
                }
                self.inner.is_open.store(true, Ordering::Relaxed);
                self.inner.logger.info("datastore successfully opened");
                Ok(())
            });
        match &result {
            Ok(()) => {
                self.inner
                    .counters
                    .open_call_qty
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.inner
                    .counters
                    .open_call_failed_qty
                    .fetch_add(1, Ordering::Relaxed);
                self.inner.logger.error(&format!("'open' failed: {e}"));
            }
        }
        result
    }

    /// Stops the background threads, flushes and fsyncs the write buffer,
    /// and releases the directory lock.
    pub fn close(&self) -> Result<()> {
        self.inner.close_impl()
    }

    /// Stores `value` under `key`.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.inner
            .put_entry(key.as_ref(), value.as_ref(), &[], 0, false)
    }

    /// Stores `value` under `key` with searchable tag slices, an optional
    /// TTL (0 = none) and an optional synchronous flush to disk.
    pub fn put_entry(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        indexes: &[KeyIndex],
        ttl_sec: u32,
        forced_sync: bool,
    ) -> Result<()> {
        self.inner
            .put_entry(key.as_ref(), value.as_ref(), indexes, ttl_sec, forced_sync)
    }

    /// Retrieves the value of `key`.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        self.inner.get_impl(key.as_ref())
    }

    /// Removes `key` by writing a tombstone record.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<()> {
        self.inner.remove_impl(key.as_ref(), false)
    }

    /// Returns the keys of live entries declaring every given tag slice
    /// (logical AND). No parts, or any part matching nothing, yields an
    /// empty result.
    pub fn query<T: AsRef<[u8]>>(&self, tag_parts: &[T]) -> Result<Vec<Vec<u8>>> {
        let parts: Vec<&[u8]> = tag_parts.iter().map(AsRef::as_ref).collect();
        self.inner.query_impl(&parts)
    }

    /// Flushes the write buffer and fsyncs the active data file.
    pub fn sync(&self) -> Result<()> {
        self.inner.sync_impl()
    }

    /// Validates and installs a new configuration, persisting it next to
    /// the data files when the store is open.
    pub fn set_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        *self.inner.config.lock() = config;
        self.inner
            .data_file_max_bytes
            .store(config.data_file_max_bytes, Ordering::Relaxed);
        self.inner
            .cache
            .set_target_memory_load_percent(config.value_cache_target_memory_load_percentage);
        if self.inner.is_open.load(Ordering::Relaxed) {
            let dir = self.inner.files.read().directory.clone();
            config.save(&dir)?;
        }
        Ok(())
    }

    pub fn config(&self) -> Config {
        *self.inner.config.lock()
    }

    /// Asks the merge thread to run a cycle now. Returns false when the
    /// store is closed or a merge is already requested.
    pub fn request_merge(&self) -> bool {
        self.inner.is_open.load(Ordering::Relaxed) && self.inner.merge.request()
    }

    /// Asks the upkeep thread to run a cycle now.
    pub fn request_upkeeping(&self) -> bool {
        self.inner.is_open.load(Ordering::Relaxed) && self.inner.upkeep.request()
    }

    pub fn is_merge_ongoing(&self) -> bool {
        self.inner.merge.is_requested()
    }

    pub fn is_upkeeping_ongoing(&self) -> bool {
        self.inner.upkeep.is_requested()
    }

    /// Snapshot of the call and maintenance counters.
    pub fn counters(&self) -> DatastoreCounters {
        self.inner.counters.snapshot()
    }

    /// Aggregated statistics over the data files.
    pub fn file_stats(&self) -> DataFileStats {
        self.inner.file_stats_impl()
    }

    /// Snapshot of the value cache counters.
    pub fn value_cache_counters(&self) -> ValueCacheCounters {
        self.inner.cache.counters()
    }

    pub fn value_cache_allocated_bytes(&self) -> u64 {
        self.inner.cache.allocated_bytes()
    }

    pub fn value_cache_max_allocatable_bytes(&self) -> u64 {
        self.inner.cache.max_allocatable_bytes()
    }

    /// Rough estimate of the memory held by the in-memory structures.
    pub fn estimated_used_memory_bytes(&self, with_cache: bool) -> u64 {
        let mut used = self.inner.keydir.estimated_used_memory_bytes();
        used += self.inner.index.estimated_used_memory_bytes();
        used += self.inner.write_state.read().buffer.len() as u64;
        if with_cache {
            used += self.inner.cache.allocated_bytes();
        }
        used
    }

    /// Minimum severity written to the store's diagnostic log.
    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.logger.set_level(level);
    }

    /// Resizes the write buffer, flushing its current content first.
    pub fn set_write_buffer_bytes(&self, bytes: usize) -> Result<()> {
        let _guard = self.inner.active_mutex.lock();
        let files = self.inner.files.read();
        let mut ws = self.inner.write_state.write();
        if self.inner.is_open.load(Ordering::Relaxed) {
            self.inner.flush_write_buffer_locked(&mut ws, &files)?;
        }
        ws.buffer = vec![0; bytes.max(crate::datafile::DATA_ENTRY_HEADER_SIZE)];
        Ok(())
    }

    /// Deletes every store artifact (data, hint, temporary and marker
    /// files, diagnostic logs) under `path`. Destructive test hook.
    pub fn erase_permanently_all_content(path: impl AsRef<Path>) {
        let Ok(entries) = std::fs::read_dir(path.as_ref()) else {
            return;
        };
        for entry in entries.flatten() {
            let p = entry.path();
            if !p.is_file() {
                continue;
            }
            let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let is_store_file = matches!(
                ext,
                DATA_FILE_EXT | HINT_FILE_EXT | TMP_FILE_EXT | REMOVE_MARKER_EXT
            );
            let is_log = name.starts_with("litecask") && name.ends_with(".log");
            if is_store_file || is_log {
                let _ = std::fs::remove_file(&p);
            }
        }
    }
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        if self.inner.is_open.load(Ordering::Relaxed) {
            let _ = self.inner.close_impl();
        }
    }
}

impl StoreInner {
    pub fn now_sec(&self) -> u32 {
        self.clock.now_sec()
    }

    pub fn update_now(&self) {
        self.keydir.set_now(self.clock.now_sec());
    }

    /// Everything of `open` except the background thread startup, which
    /// needs the `Arc` and lives in [`Datastore::open`].
    fn open_impl(&self, path: &Path, create_if_missing: bool) -> Result<()> {
        if self.is_open.load(Ordering::Relaxed) {
            return Err(Error::StoreAlreadyOpen);
        }

        if !path.exists() && create_if_missing {
            std::fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "datastore directory does not exist",
            )));
        }

        let lock_file = LockFile::acquire(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                Error::StoreAlreadyInUse
            } else {
                Error::Io(e)
            }
        })?;
        self.logger.attach(path);

        if let Some(config) = Config::load(path)? {
            *self.config.lock() = config;
            self.data_file_max_bytes
                .store(config.data_file_max_bytes, Ordering::Relaxed);
            self.cache
                .set_target_memory_load_percent(config.value_cache_target_memory_load_percentage);
        }

        let collected = recovery::sanitize_and_collect(path)?;
        if !create_if_missing && collected.data_paths.is_empty() {
            self.logger.detach();
            drop(lock_file);
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no datastore at the provided path",
            )));
        }

        // Reset the in-memory state from any previous session
        self.keydir.reset();
        self.cache.reset();
        self.index.reset();
        self.degraded.store(false, Ordering::Relaxed);
        self.write_failure_qty.store(0, Ordering::Relaxed);
        self.hint_files_missing.store(false, Ordering::Relaxed);
        self.merge.reset();
        self.upkeep.reset();
        self.update_now();
        {
            let mut files = self.files.write();
            files.directory = path.to_path_buf();
            files.files.clear();
            files.free_ids.clear();
            files.max_file_index = collected.max_index;
            let mut ws = self.write_state.write();
            ws.data_offset = 0;
            ws.flushed_offset = 0;
            ws.active_file_id = NO_FILE_ID;
        }

        self.load_data_files(&collected.data_paths)?;

        {
            let _guard = self.active_mutex.lock();
            self.create_new_active_file_locked()?;
        }

        self.state.lock().lock_file = Some(lock_file);
        Ok(())
    }

    fn start_threads(inner: &Arc<StoreInner>) -> Result<()> {
        let merge_inner = Arc::clone(inner);
        let upkeep_inner = Arc::clone(inner);
        let threads = vec![
            std::thread::Builder::new()
                .name("litecask-merge".into())
                .spawn(move || merge::merge_thread_main(&merge_inner))
                .map_err(Error::Io)?,
            std::thread::Builder::new()
                .name("litecask-upkeep".into())
                .spawn(move || upkeep::upkeep_thread_main(&upkeep_inner))
                .map_err(Error::Io)?,
        ];
        inner.state.lock().threads = threads;
        Ok(())
    }

    /// Rolls an interrupted `open` back: directory lock and log sink.
    fn abort_open(&self) {
        self.state.lock().lock_file = None;
        self.logger.detach();
    }

    fn close_impl(&self) -> Result<()> {
        if !self.is_open.load(Ordering::Relaxed) {
            self.counters
                .close_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::StoreNotOpen);
        }
        self.logger.info("closing datastore");

        self.merge.request_exit();
        self.upkeep.request_exit();
        let threads = std::mem::take(&mut self.state.lock().threads);
        for handle in threads {
            let _ = handle.join();
        }

        let _guard = self.active_mutex.lock();
        let mut files = self.files.write();
        self.is_open.store(false, Ordering::Relaxed);

        {
            let mut ws = self.write_state.write();
            let flush_result = self.flush_write_buffer_locked(&mut ws, &files);
            if let Some(df) = files.get(ws.active_file_id) {
                let _ = df.sync();
            }
            if let Err(e) = flush_result {
                self.logger.error(&format!("close: flush failed: {e}"));
            }
        }
        for slot in files.files.iter() {
            if let Some(df) = slot {
                df.close_handle();
            }
        }
        files.files.clear();
        files.free_ids.clear();
        files.max_file_index = 0;
        drop(files);

        self.logger.detach();
        self.state.lock().lock_file = None;
        self.merge.reset();
        self.upkeep.reset();
        self.counters.close_call_qty.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes the pending buffer range to the active file. Both the write
    /// state and the file table guards are held by the caller.
    pub(crate) fn flush_write_buffer_locked(
        &self,
        ws: &mut WriteState,
        files: &FileTable,
    ) -> Result<()> {
        let pending = ws.pending_bytes();
        if pending == 0 {
            return Ok(());
        }
        let df = files
            .get(ws.active_file_id)
            .ok_or_else(|| Error::Io(std::io::Error::other("active data file is missing")))?;
        match df.append(&ws.buffer[..pending]) {
            Ok(()) => {
                ws.flushed_offset = ws.data_offset;
                self.write_failure_qty.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(self.note_write_failure(e)),
        }
    }

    /// Counts a failed append; repeated failures switch the store to a
    /// read-only degraded mode.
    pub(crate) fn note_write_failure(&self, e: std::io::Error) -> Error {
        let failures = self.write_failure_qty.fetch_add(1, Ordering::Relaxed) + 1;
        self.logger
            .error(&format!("write to the active data file failed: {e}"));
        if failures >= WRITE_FAILURE_DEGRADE_LIMIT && !self.degraded.swap(true, Ordering::Relaxed) {
            self.logger.error(
                "too many consecutive write failures, the datastore is now read-only (degraded)",
            );
        }
        Error::Io(e)
    }

    /// Seals the active file and opens the next one. Returns the numeric
    /// stem of the sealed file, used to name merge outputs. The active
    /// mutex is held by the caller.
    pub(crate) fn create_new_active_file_locked(&self) -> Result<String> {
        let mut files = self.files.write();
        let mut ws = self.write_state.write();

        if let Some(df) = files.get(ws.active_file_id) {
            self.flush_write_buffer_locked(&mut ws, &files)?;
            df.reopen_read_only()?;
        }
        let sealed_basename = files.max_file_index.to_string();

        ws.data_offset = 0;
        ws.flushed_offset = 0;
        let id = files.alloc_file_id();
        files.max_file_index += 1;
        let path = files
            .directory
            .join(format!("{}.{}", files.max_file_index, DATA_FILE_EXT));
        let df = Arc::new(DataFile::create_active(path.clone()).map_err(|e| {
            files.free_ids.push(id);
            Error::Io(e)
        })?);
        files.files[id as usize] = Some(df);
        ws.active_file_id = id;
        drop(ws);
        drop(files);

        self.counters
            .data_file_creation_qty
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .active_data_file_switch_qty
            .fetch_add(1, Ordering::Relaxed);
        self.logger
            .debug(&format!("creating new active data file {}", path.display()));
        Ok(sealed_basename)
    }

    fn sync_impl(&self) -> Result<()> {
        if !self.is_open.load(Ordering::Relaxed) {
            return Err(Error::StoreNotOpen);
        }
        let _guard = self.active_mutex.lock();
        let files = self.files.read();
        let mut ws = self.write_state.write();
        self.flush_write_buffer_locked(&mut ws, &files)?;
        if let Some(df) = files.get(ws.active_file_id) {
            df.sync()?;
        }
        Ok(())
    }

    fn file_stats_impl(&self) -> DataFileStats {
        let files = self.files.read();
        let mut stats = DataFileStats::default();
        for df in files.files.iter().flatten() {
            if !df.is_open() {
                continue;
            }
            stats.file_qty += 1;
            stats.entries += df.entries.load(Ordering::Relaxed);
            stats.entry_bytes += df.bytes.load(Ordering::Relaxed);
            stats.tomb_bytes += df.tomb_bytes.load(Ordering::Relaxed);
            stats.tomb_entries += df.tomb_entries.load(Ordering::Relaxed);
            stats.dead_bytes += df.dead_bytes.load(Ordering::Relaxed);
            stats.dead_entries += df.dead_entries.load(Ordering::Relaxed);
        }
        stats
    }
}
