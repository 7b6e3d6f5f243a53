//! Database handle and write coordinator.
//!
//! One dedicated serving thread owns the write side: it groups queued
//! requests, assigns sequence numbers, appends to the log, applies to the
//! memtable, and replies. Background workers (memtable flush, level
//! compaction, obsolete-file collection) report back to the same thread
//! over a result channel, so every piece of mutable coordination state has
//! a single writer. Readers never pass through the coordinator; they pin
//! the current version and memtables under a brief read lock and proceed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{after, bounded, never, Receiver, Sender};

use crate::batch::WriteBatch;
use crate::compaction::{LevelCompaction, MemTableCompaction};
use crate::comparator::InternalComparator;
use crate::config::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_FILES, L0_STOP_FILES, MAX_GROUP_BYTES,
    SMALL_GROUP_BYTES,
};
use crate::error::{Error, Result};
use crate::filenames::{self, FileKind};
use crate::fs::{File, FileSystem, LockHandle, OpenMode};
use crate::iterator::{DbIter, Iter, MergeIter};
use crate::keys::{LookupKey, Sequence, MAX_SEQUENCE};
use crate::memtable::{MemGet, MemTable};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::table::cache::TableCache;
use crate::version::{Version, VersionEdit, VersionState};
use crate::wal::{LogReader, LogWriter};

struct Request {
    sync: bool,
    /// `None` is the close sentinel.
    batch: Option<WriteBatch>,
    reply: Sender<Result<()>>,
}

struct CompactionResult {
    /// Level of the compaction, or -1 for a memtable flush.
    level: i64,
    err: Option<Error>,
    edit: VersionEdit,
    aborted: bool,
}

struct MemState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
}

struct DbInner {
    dir: PathBuf,
    opts: Arc<Options>,
    icmp: InternalComparator,
    fs: Arc<dyn FileSystem>,
    state: Arc<VersionState>,
    table_cache: Arc<TableCache>,
    snapshots: SnapshotList,

    mem: RwLock<MemState>,

    request_tx: Sender<Request>,
    closing: AtomicBool,
    closed: Mutex<bool>,
    closed_cv: Condvar,
    bg_closing: Mutex<Option<Sender<()>>>,
    serve_handle: Mutex<Option<thread::JoinHandle<()>>>,
    lock: Mutex<Option<Box<dyn LockHandle>>>,
}

/// An open database.
///
/// All methods take `&self`; the handle is `Send + Sync` and is normally
/// shared behind an `Arc`. Dropping the handle closes the database.
pub struct DB {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB").finish_non_exhaustive()
    }
}

impl DB {
    /// Opens (creating or recovering) the database at `dir`.
    pub fn open(dir: impl AsRef<Path>, opts: Options) -> Result<DB> {
        if opts.block_restart_interval == 0 {
            return Err(Error::InvalidArgument(
                "block_restart_interval must be positive".to_string(),
            ));
        }
        if opts.write_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "write_buffer_size must be positive".to_string(),
            ));
        }
        let dir = dir.as_ref().to_path_buf();
        let opts = Arc::new(opts);
        let fs = opts.fs.clone();
        let icmp = InternalComparator(opts.comparator.clone());

        fs.mkdir_all(&dir)?;
        let lock = fs.lock(&filenames::lock_file(&dir))?;

        // Rotate the info log name for external log shippers; the engine
        // itself emits through `tracing`.
        let info = filenames::info_log_file(&dir);
        if fs.exists(&info) {
            let _ = fs.rename(&info, &filenames::old_info_log_file(&dir));
        }

        let current = filenames::current_file(&dir);
        let state = if !fs.exists(&current) {
            if !opts.create_if_missing {
                return Err(Error::DbMissing);
            }
            tracing::info!(dir = %dir.display(), "creating database");
            Arc::new(VersionState::create(&dir, &opts, icmp.clone())?)
        } else {
            if opts.error_if_exists {
                return Err(Error::DbExists);
            }
            tracing::info!(dir = %dir.display(), "recovering database");
            Arc::new(VersionState::recover(&dir, &opts, icmp.clone())?)
        };

        let table_cache = Arc::new(TableCache::new(&dir, opts.clone(), icmp.clone()));

        let (request_tx, request_rx) = bounded(1024);
        let (bg_closing_tx, bg_closing_rx) = bounded::<()>(0);

        let inner = Arc::new(DbInner {
            dir: dir.clone(),
            opts: opts.clone(),
            icmp: icmp.clone(),
            fs: fs.clone(),
            state: state.clone(),
            table_cache,
            snapshots: SnapshotList::new(),
            mem: RwLock::new(MemState {
                mem: Arc::new(MemTable::new(icmp.clone())),
                imm: None,
            }),
            request_tx,
            closing: AtomicBool::new(false),
            closed: Mutex::new(false),
            closed_cv: Condvar::new(),
            bg_closing: Mutex::new(Some(bg_closing_tx)),
            serve_handle: Mutex::new(None),
            lock: Mutex::new(Some(lock)),
        });

        let (log, log_number) = Self::recover_logs(&inner)?;

        let mut coordinator = Coordinator::new(inner.clone(), request_rx, bg_closing_rx);
        coordinator.log = Some(log);
        coordinator.log_number = log_number;
        let handle = thread::Builder::new()
            .name("emberdb-coordinator".to_string())
            .spawn(move || coordinator.serve())
            .map_err(|e| Error::Io(e.to_string()))?;
        *inner.serve_handle.lock().unwrap() = Some(handle);

        Ok(DB { inner })
    }

    /// Replays every log at or past the recovered log number, in file
    /// order. Older logs flush straight to a table; the newest becomes the
    /// active memtable and its file is reused for appending, truncated at
    /// the first torn record.
    fn recover_logs(inner: &Arc<DbInner>) -> Result<(LogWriter, u64)> {
        let state = &inner.state;
        let fs = &inner.fs;
        let mut logs: Vec<u64> = Vec::new();
        let floor = state.log_number();
        for name in fs.list(&inner.dir)? {
            if let FileKind::Log(number) = filenames::parse(&name) {
                if number >= floor {
                    logs.push(number);
                }
            }
        }
        logs.sort_unstable();

        if logs.is_empty() {
            let number = state.new_file_number();
            let file = fs.open(
                &filenames::log_file(&inner.dir, number),
                OpenMode::write_excl(),
            )?;
            return Ok((LogWriter::new(file, 0), number));
        }

        let mut max_sequence = state.last_sequence();

        // All but the newest log replay into a scratch memtable that is
        // flushed immediately.
        let (older, newest) = logs.split_at(logs.len() - 1);
        if !older.is_empty() {
            let scratch = Arc::new(MemTable::new(inner.icmp.clone()));
            for &number in older {
                state.mark_file_number_used(number);
                let file = fs.open(&filenames::log_file(&inner.dir, number), OpenMode::read())?;
                Self::replay_log_file(file, &scratch, &mut max_sequence)?;
            }
            if !scratch.is_empty() {
                let file_number = state.new_file_number();
                let compaction = MemTableCompaction::new(
                    &inner.dir,
                    inner.opts.clone(),
                    inner.icmp.clone(),
                    scratch,
                    state.current(),
                    file_number,
                    false,
                );
                let mut edit = VersionEdit {
                    log_number: Some(newest[0]),
                    next_file_number: Some(state.next_file_number()),
                    last_sequence: Some(max_sequence),
                    ..Default::default()
                };
                compaction.compact(&mut edit)?;
                state.log(&edit)?;
                state.apply(&edit);
            }
        }

        // The newest log becomes the active one.
        let number = newest[0];
        state.mark_file_number_used(number);
        let path = filenames::log_file(&inner.dir, number);
        let file = fs.open(&path, OpenMode::read_write())?;
        let mem = inner.mem.read().unwrap().mem.clone();
        let (mut file, offset) = Self::replay_log_file(file, &mem, &mut max_sequence)?;
        file.truncate(offset)?;
        file.seek(offset)?;
        state.set_last_sequence(max_sequence);
        tracing::info!(log = number, offset, "reusing write-ahead log");
        Ok((LogWriter::new(file, offset), number))
    }

    /// Applies every complete batch record; returns the file along with
    /// the truncation offset after the last complete record.
    fn replay_log_file(
        file: Box<dyn File>,
        mem: &Arc<MemTable>,
        max_sequence: &mut Sequence,
    ) -> Result<(Box<dyn File>, u64)> {
        let mut reader = LogReader::new(file);
        let mut record = Vec::new();
        let offset;
        loop {
            match reader.read_record(&mut record) {
                Ok(true) => {}
                Ok(false) => {
                    offset = reader.offset();
                    break;
                }
                Err(Error::IncompleteRecord) => {
                    // Torn tail: keep everything before it.
                    offset = reader.offset();
                    break;
                }
                Err(err) => return Err(err),
            }
            let batch = WriteBatch::from_bytes(record.clone());
            let items = batch.items().map_err(|_| Error::BatchCorruption)?;
            if items.is_empty() {
                return Err(Error::BatchCorruption);
            }
            batch.for_each(|seq, kind, key, value| {
                mem.insert(seq, kind, key, value);
                if seq > *max_sequence {
                    *max_sequence = seq;
                }
            })?;
        }
        Ok((reader.into_file(), offset))
    }

    pub fn put(&self, key: &[u8], value: &[u8], wopts: WriteOptions) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, wopts)
    }

    pub fn delete(&self, key: &[u8], wopts: WriteOptions) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, wopts)
    }

    /// Applies the batch atomically.
    ///
    /// A compaction that is failing and retrying surfaces its error here
    /// until a retry succeeds; writes during that window fail without
    /// being applied.
    pub fn write(&self, batch: WriteBatch, wopts: WriteOptions) -> Result<()> {
        if self.inner.closing.load(AtomicOrdering::SeqCst) {
            return Err(Error::DbClosed);
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.inner
            .request_tx
            .send(Request { sync: wopts.sync, batch: Some(batch), reply: reply_tx })
            .map_err(|_| Error::DbClosed)?;
        reply_rx.recv().map_err(|_| Error::DbClosed)?
    }

    pub fn get(&self, key: &[u8], ropts: ReadOptions) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        if inner.closing.load(AtomicOrdering::SeqCst) {
            return Err(Error::DbClosed);
        }
        let (mem, imm, version, seq) = {
            let guard = inner.mem.read().unwrap();
            let seq = ropts.snapshot.unwrap_or_else(|| inner.state.last_sequence());
            (guard.mem.clone(), guard.imm.clone(), inner.state.current(), seq)
        };
        let lkey = LookupKey::new(key, seq);
        match mem.get(&lkey) {
            MemGet::Value(v) => return Ok(Some(v)),
            MemGet::Deleted => return Ok(None),
            MemGet::NotFound => {}
        }
        if let Some(imm) = imm {
            match imm.get(&lkey) {
                MemGet::Value(v) => return Ok(Some(v)),
                MemGet::Deleted => return Ok(None),
                MemGet::NotFound => {}
            }
        }
        version.get(&lkey, &inner.table_cache, &ropts)
    }

    /// Iterator over the whole key space.
    pub fn all(&self, ropts: ReadOptions) -> Box<dyn Iter> {
        self.between(None, None, ropts)
    }

    /// Iterator over keys >= `start`.
    pub fn find(&self, start: &[u8], ropts: ReadOptions) -> Box<dyn Iter> {
        self.between(Some(start.to_vec()), None, ropts)
    }

    /// Iterator over `[start, limit)`.
    pub fn range(&self, start: &[u8], limit: &[u8], ropts: ReadOptions) -> Box<dyn Iter> {
        self.between(Some(start.to_vec()), Some(limit.to_vec()), ropts)
    }

    /// Iterator over keys sharing `prefix`.
    pub fn prefix(&self, prefix: &[u8], ropts: ReadOptions) -> Box<dyn Iter> {
        let limit = self.inner.opts.comparator.prefix_successor(prefix);
        self.between(Some(prefix.to_vec()), limit, ropts)
    }

    fn between(
        &self,
        start: Option<Vec<u8>>,
        limit: Option<Vec<u8>>,
        ropts: ReadOptions,
    ) -> Box<dyn Iter> {
        let inner = &self.inner;
        if inner.closing.load(AtomicOrdering::SeqCst) {
            return Box::new(crate::iterator::ErrorIter(Error::DbClosed));
        }
        let (mem, imm, version, seq) = {
            let guard = inner.mem.read().unwrap();
            let seq = ropts.snapshot.unwrap_or_else(|| inner.state.last_sequence());
            (guard.mem.clone(), guard.imm.clone(), inner.state.current(), seq)
        };
        let mut children: Vec<Box<dyn Iter>> = Vec::new();
        children.push(Box::new(mem.iter()));
        if let Some(imm) = imm {
            children.push(Box::new(imm.iter()));
        }
        version.append_iters(&mut children, &inner.table_cache, &ropts);
        let merged = MergeIter::new(inner.icmp.clone(), children);
        let seq = seq.min(MAX_SEQUENCE);
        let db_iter = DbIter::new(inner.icmp.clone(), Box::new(merged), seq);
        let pinned = Box::new(PinnedIter { iter: Box::new(db_iter), _version: version });
        crate::iterator::new_range_iter(start, limit, inner.opts.comparator.clone(), pinned)
    }

    /// Pins the current sequence; reads against the snapshot see exactly
    /// the writes committed before it was taken.
    pub fn snapshot(&self) -> Result<Snapshot> {
        if self.inner.closing.load(AtomicOrdering::SeqCst) {
            return Err(Error::DbClosed);
        }
        Ok(self.inner.snapshots.acquire(self.inner.state.last_sequence()))
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.inner.snapshots.release(snapshot);
    }

    /// Closes the database: drains queued writes with [`Error::DbClosed`],
    /// stops background work, and releases the lock file. Idempotent;
    /// concurrent callers block until the first close finishes.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closing.swap(true, AtomicOrdering::SeqCst) {
            let mut closed = inner.closed.lock().unwrap();
            while !*closed {
                closed = inner.closed_cv.wait(closed).unwrap();
            }
            return Ok(());
        }

        let (reply_tx, reply_rx) = bounded(1);
        if inner
            .request_tx
            .send(Request { sync: false, batch: None, reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.recv();
        }

        // Dropping the sender is the broadcast close signal to workers.
        inner.bg_closing.lock().unwrap().take();

        if let Some(handle) = inner.serve_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        inner.lock.lock().unwrap().take();

        let mut closed = inner.closed.lock().unwrap();
        *closed = true;
        inner.closed_cv.notify_all();
        tracing::info!(dir = %inner.dir.display(), "database closed");
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Keeps the version (and through it, its table files) alive for as long
/// as an iterator is out.
struct PinnedIter {
    iter: Box<dyn Iter>,
    _version: Arc<Version>,
}

impl Iter for PinnedIter {
    fn valid(&self) -> bool {
        self.iter.valid()
    }
    fn first(&mut self) -> bool {
        self.iter.first()
    }
    fn last(&mut self) -> bool {
        self.iter.last()
    }
    fn seek(&mut self, target: &[u8]) -> bool {
        self.iter.seek(target)
    }
    fn next(&mut self) -> bool {
        self.iter.next()
    }
    fn prev(&mut self) -> bool {
        self.iter.prev()
    }
    fn key(&self) -> &[u8] {
        self.iter.key()
    }
    fn value(&self) -> &[u8] {
        self.iter.value()
    }
    fn err(&self) -> Option<Error> {
        self.iter.err()
    }
}

struct Coordinator {
    inner: Arc<DbInner>,
    request_rx: Receiver<Request>,
    bg_closing_rx: Receiver<()>,

    log: Option<LogWriter>,
    log_err: Option<Error>,
    log_number: u64,

    next_log_number: u64,
    next_log_tx: Sender<Option<Box<dyn File>>>,
    next_log_rx: Receiver<Option<Box<dyn File>>>,

    collection_rx: Option<Receiver<()>>,
    compaction_tx: Sender<CompactionResult>,
    compaction_rx: Receiver<CompactionResult>,

    /// Background jobs in flight (flush, level compaction, collection,
    /// next-log open).
    bg_count: usize,
    collection_running: bool,
    compaction_level: Option<usize>,
    compaction_mem: bool,
    compaction_err: Option<Error>,

    shutting_down: bool,
}

impl Coordinator {
    fn new(
        inner: Arc<DbInner>,
        request_rx: Receiver<Request>,
        bg_closing_rx: Receiver<()>,
    ) -> Self {
        let (next_log_tx, next_log_rx) = bounded(1);
        let (compaction_tx, compaction_rx) = bounded(16);
        Coordinator {
            inner,
            request_rx,
            bg_closing_rx,
            log: None,
            log_err: None,
            log_number: 0,
            next_log_number: 0,
            next_log_tx,
            next_log_rx,
            collection_rx: None,
            compaction_tx,
            compaction_rx,
            bg_count: 0,
            collection_running: false,
            compaction_level: None,
            compaction_mem: false,
            compaction_err: None,
            shutting_down: false,
        }
    }

    fn serve(&mut self) {
        self.try_start_background();
        let mut group: Vec<Request> = Vec::new();
        loop {
            if self.shutting_down && self.bg_count == 0 {
                break;
            }
            let (slowdown, pause) = self.throttle();

            let requests = if self.shutting_down || pause {
                never()
            } else {
                self.request_rx.clone()
            };
            let slowdown_ch = match slowdown {
                // A slowdown only matters when something is waiting.
                Some(delay) if !group.is_empty() => after(delay),
                _ => never(),
            };
            let collection = self.collection_rx.clone().unwrap_or_else(never);
            let next_log_rx = self.next_log_rx.clone();
            let compaction_rx = self.compaction_rx.clone();

            // With no throttle active, write out whatever is queued
            // before blocking again.
            if !group.is_empty() && slowdown.is_none() && !pause && !self.shutting_down {
                self.write_group(&mut group);
                continue;
            }

            crossbeam_channel::select! {
                recv(next_log_rx) -> msg => {
                    self.bg_count -= 1;
                    match msg {
                        Ok(Some(file)) => {
                            let number = self.next_log_number;
                            self.next_log_number = 0;
                            self.open_log(file, number);
                        }
                        // Shutdown won the race; the allocated number is
                        // simply skipped.
                        Ok(None) | Err(_) => {
                            self.next_log_number = 0;
                        }
                    }
                }
                recv(collection) -> _ => {
                    self.complete_collection();
                }
                recv(compaction_rx) -> result => {
                    if let Ok(result) = result {
                        self.complete_compaction(result);
                    }
                }
                recv(slowdown_ch) -> _ => {
                    self.write_group(&mut group);
                }
                recv(requests) -> req => {
                    match req {
                        Err(_) => {
                            // Every handle dropped without close.
                            self.shutting_down = true;
                        }
                        Ok(req) => {
                            if req.batch.is_none() {
                                self.shutting_down = true;
                                self.write_group(&mut group);
                                let _ = req.reply.send(Ok(()));
                            } else {
                                group.push(req);
                                if !pause && slowdown.is_none() {
                                    self.drain_queued(&mut group);
                                    self.write_group(&mut group);
                                }
                            }
                        }
                    }
                }
            }
        }
        self.finish(group);
    }

    /// Absorbs already-queued requests into the group, bounded so a small
    /// leading write is not delayed behind a huge group.
    fn drain_queued(&mut self, group: &mut Vec<Request>) {
        let lead = group[0]
            .batch
            .as_ref()
            .map(|b| b.approximate_size())
            .unwrap_or(0);
        let cap = if lead <= SMALL_GROUP_BYTES {
            lead + SMALL_GROUP_BYTES
        } else {
            MAX_GROUP_BYTES
        };
        let mut total = lead;
        while total < cap {
            match self.request_rx.try_recv() {
                Ok(req) => {
                    if req.batch.is_none() {
                        self.shutting_down = true;
                        let _ = req.reply.send(Ok(()));
                        return;
                    }
                    total += req.batch.as_ref().unwrap().approximate_size();
                    group.push(req);
                }
                Err(_) => return,
            }
        }
    }

    fn write_group(&mut self, group: &mut Vec<Request>) {
        if group.is_empty() {
            return;
        }
        let requests = std::mem::take(group);
        if self.log.is_none() {
            let err = self.log_err.clone().unwrap_or(Error::DbClosed);
            for req in requests {
                let _ = req.reply.send(Err(err.clone()));
            }
            return;
        }
        if let Some(err) = self.compaction_err.clone() {
            for req in requests {
                let _ = req.reply.send(Err(err.clone()));
            }
            return;
        }

        let mut batch = requests[0].batch.clone().unwrap();
        for req in &requests[1..] {
            batch.append(req.batch.as_ref().unwrap());
        }
        let sync = requests.iter().any(|r| r.sync);

        let state = &self.inner.state;
        let last = state.last_sequence();
        batch.set_sequence(last + 1);
        state.set_last_sequence(last + batch.count() as Sequence);

        let log = self.log.as_mut().unwrap();
        let result = log.append(batch.bytes()).and_then(|_| {
            if sync {
                log.sync()
            } else {
                Ok(())
            }
        });
        match result {
            Err(err) => {
                tracing::error!(error = %err, "log append failed; failing writes");
                for req in requests {
                    let _ = req.reply.send(Err(err.clone()));
                }
                self.close_log(Some(err));
            }
            Ok(()) => {
                let mem = self.inner.mem.read().unwrap().mem.clone();
                let apply = batch.for_each(|seq, kind, key, value| {
                    mem.insert(seq, kind, key, value);
                });
                debug_assert!(apply.is_ok(), "freshly built batch failed to parse");
                for req in requests {
                    let _ = req.reply.send(Ok(()));
                }
            }
        }
    }

    /// Admission control, evaluated before accepting more writes.
    fn throttle(&mut self) -> (Option<Duration>, bool) {
        if self.log.is_none() || self.compaction_err.is_some() {
            // Writes fail fast; no point delaying them.
            return (None, false);
        }
        let buf_size = self.inner.opts.write_buffer_size;
        let usage = self.inner.mem.read().unwrap().mem.approximate_size();
        let level0 = self.inner.state.current().num_files(0);
        if usage <= buf_size {
            return (None, false);
        }
        if level0 >= L0_STOP_FILES {
            return (None, true);
        }
        self.try_open_next_log();
        if usage >= buf_size + buf_size / 4 {
            return (None, true);
        }
        if level0 >= L0_SLOWDOWN_FILES {
            return (Some(Duration::from_millis(1)), false);
        }
        (None, false)
    }

    fn try_open_next_log(&mut self) {
        let imm_pending = self.inner.mem.read().unwrap().imm.is_some();
        if imm_pending || self.next_log_number != 0 || self.shutting_down {
            return;
        }
        self.next_log_number = self.inner.state.new_file_number();
        self.bg_count += 1;
        let number = self.next_log_number;
        let inner = self.inner.clone();
        let tx = self.next_log_tx.clone();
        let closing = self.bg_closing_rx.clone();
        thread::spawn(move || {
            let path = filenames::log_file(&inner.dir, number);
            let mut timeout = Duration::ZERO;
            loop {
                match inner.fs.open(&path, OpenMode::write()) {
                    Ok(file) => {
                        let _ = tx.send(Some(file));
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(log = number, error = %err, "cannot open next log");
                    }
                }
                timeout = (timeout + timeout / 2 + Duration::from_secs(1))
                    .min(Duration::from_secs(60));
                crossbeam_channel::select! {
                    recv(closing) -> _ => {
                        let _ = tx.send(None);
                        return;
                    }
                    recv(after(timeout)) -> _ => {}
                }
            }
        });
    }

    /// Installs a freshly opened log, freezing the current memtable into
    /// the immutable slot.
    fn open_log(&mut self, file: Box<dyn File>, number: u64) {
        self.log = Some(LogWriter::new(file, 0));
        self.log_err = None;
        self.log_number = number;
        let rotated = {
            let mut guard = self.inner.mem.write().unwrap();
            if !guard.mem.is_empty() {
                debug_assert!(guard.imm.is_none());
                guard.imm = Some(guard.mem.clone());
                guard.mem = Arc::new(MemTable::new(self.inner.icmp.clone()));
                true
            } else {
                false
            }
        };
        tracing::info!(log = number, rotated, "switched write-ahead log");
        if rotated {
            self.try_memory_compaction();
        }
    }

    fn close_log(&mut self, err: Option<Error>) {
        self.log = None;
        self.log_err = err;
        self.log_number = 0;
    }

    fn try_start_background(&mut self) {
        self.try_memory_compaction();
        self.try_level_compaction();
        self.try_remove_obsolete_files();
    }

    fn try_memory_compaction(&mut self) {
        if self.collection_running || self.compaction_mem || self.shutting_down {
            return;
        }
        let imm = match self.inner.mem.read().unwrap().imm.clone() {
            Some(imm) => imm,
            None => return,
        };
        self.compaction_mem = true;
        self.bg_count += 1;

        let state = &self.inner.state;
        let compaction = MemTableCompaction::new(
            &self.inner.dir,
            self.inner.opts.clone(),
            self.inner.icmp.clone(),
            imm,
            state.current(),
            state.new_file_number(),
            self.compaction_level.is_some(),
        );
        let edit = VersionEdit {
            log_number: Some(self.log_number),
            next_file_number: Some(state.next_file_number()),
            last_sequence: Some(state.last_sequence()),
            ..Default::default()
        };
        self.spawn_compaction(-1, edit, CompactionJob::Memory(compaction));
    }

    fn try_level_compaction(&mut self) {
        if self.collection_running || self.compaction_level.is_some() || self.shutting_down {
            return;
        }
        let compaction = match self.inner.state.pick_compaction() {
            Some(c) => c,
            None => return,
        };
        let level = compaction.level;
        self.compaction_level = Some(level);
        self.bg_count += 1;

        let state = &self.inner.state;
        let edit = VersionEdit {
            log_number: Some(self.log_number),
            next_file_number: Some(state.next_file_number()),
            last_sequence: Some(state.last_sequence()),
            ..Default::default()
        };
        let run = LevelCompaction::new(
            &self.inner.dir,
            self.inner.opts.clone(),
            self.inner.icmp.clone(),
            self.inner.table_cache.clone(),
            state.clone(),
            compaction,
            self.smallest_snapshot(),
        );
        self.spawn_compaction(level as i64, edit, CompactionJob::Level(run));
    }

    fn smallest_snapshot(&self) -> Sequence {
        self.inner
            .snapshots
            .oldest()
            .unwrap_or_else(|| self.inner.state.last_sequence())
    }

    /// Runs a compaction to completion on a worker: compact, then log the
    /// edit, retrying with growing backoff and reporting every failed
    /// attempt so the coordinator can surface the error to writers.
    fn spawn_compaction(&self, level: i64, mut edit: VersionEdit, mut job: CompactionJob) {
        let state = self.inner.state.clone();
        let fs = self.inner.fs.clone();
        let dir = self.inner.dir.clone();
        let tx = self.compaction_tx.clone();
        let closing = self.bg_closing_rx.clone();
        thread::spawn(move || {
            let mut compacted = false;
            let mut timeout = Duration::ZERO;
            loop {
                let mut err = None;
                if !compacted {
                    match job.compact(&mut edit) {
                        Ok(()) => {
                            compacted = true;
                            timeout = Duration::ZERO;
                        }
                        Err(e) => {
                            tracing::warn!(level, error = %e, "compaction attempt failed");
                            err = Some(e);
                        }
                    }
                }
                if compacted {
                    match state.log(&edit) {
                        Ok(()) => {
                            let _ = tx.send(CompactionResult {
                                level,
                                err: None,
                                edit,
                                aborted: false,
                            });
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(level, error = %e, "manifest append failed");
                            err = Some(e);
                        }
                    }
                }
                let _ = tx.send(CompactionResult {
                    level,
                    err: err.clone(),
                    edit: VersionEdit::default(),
                    aborted: false,
                });
                timeout = (timeout + timeout / 2 + Duration::from_secs(1))
                    .min(Duration::from_secs(60));
                crossbeam_channel::select! {
                    recv(closing) -> _ => {
                        for number in job.file_numbers() {
                            let _ = fs.remove(&filenames::table_file(&dir, number));
                        }
                        let _ = tx.send(CompactionResult {
                            level,
                            err,
                            edit: VersionEdit::default(),
                            aborted: true,
                        });
                        return;
                    }
                    recv(after(timeout)) -> _ => {}
                }
            }
        });
    }

    fn complete_compaction(&mut self, result: CompactionResult) {
        let finished = result.err.is_none() || result.aborted;
        if finished {
            self.bg_count -= 1;
            if result.level < 0 {
                self.compaction_mem = false;
            } else {
                self.compaction_level = None;
            }
        }
        self.compaction_err = result.err.clone();
        if result.err.is_some() || result.aborted {
            return;
        }

        if result.level < 0 {
            let mut guard = self.inner.mem.write().unwrap();
            guard.imm = None;
        }
        self.inner.state.apply(&result.edit);
        self.try_level_compaction();
        self.try_remove_obsolete_files();
    }

    fn try_remove_obsolete_files(&mut self) {
        if self.collection_running
            || self.compaction_level.is_some()
            || self.compaction_mem
        {
            return;
        }
        self.collection_running = true;
        self.bg_count += 1;
        let (done_tx, done_rx) = bounded(1);
        self.collection_rx = Some(done_rx);

        let inner = self.inner.clone();
        thread::spawn(move || {
            let mut live = HashSet::new();
            inner.state.add_live_files(&mut live);
            let log_number = inner.state.log_number();
            let manifest_number = inner.state.manifest_number();
            let names = inner.fs.list(&inner.dir).unwrap_or_default();
            let mut removed = 0usize;
            for name in names {
                let keep = match filenames::parse(&name) {
                    FileKind::Invalid
                    | FileKind::Lock
                    | FileKind::Current
                    | FileKind::InfoLog
                    | FileKind::OldInfoLog
                    | FileKind::Temp(_) => true,
                    FileKind::Log(number) => number >= log_number,
                    FileKind::Table(number) => live.contains(&number),
                    FileKind::Manifest(number) => number >= manifest_number,
                };
                if keep {
                    continue;
                }
                if let FileKind::Table(number) = filenames::parse(&name) {
                    inner.table_cache.evict(number);
                }
                if inner.fs.remove(&inner.dir.join(&name)).is_ok() {
                    removed += 1;
                }
            }
            if removed > 0 {
                tracing::debug!(removed, "collected obsolete files");
            }
            let _ = done_tx.send(());
        });
    }

    fn complete_collection(&mut self) {
        self.collection_rx = None;
        self.collection_running = false;
        self.bg_count -= 1;
        self.try_memory_compaction();
        self.try_level_compaction();
    }

    /// Shutdown tail: drain queued requests with `DbClosed`, close the
    /// log, and return from the serving thread.
    fn finish(&mut self, group: Vec<Request>) {
        for req in group {
            let _ = req.reply.send(Err(Error::DbClosed));
        }
        while let Ok(req) = self.request_rx.try_recv() {
            let _ = req.reply.send(Err(Error::DbClosed));
        }
        self.close_log(None);
    }
}

/// The two compaction kinds a worker can run.
enum CompactionJob {
    Memory(MemTableCompaction),
    Level(LevelCompaction),
}

impl CompactionJob {
    fn compact(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match self {
            CompactionJob::Memory(c) => c.compact(edit),
            CompactionJob::Level(c) => c.compact(edit),
        }
    }

    fn file_numbers(&self) -> Vec<u64> {
        match self {
            CompactionJob::Memory(c) => c.file_numbers(),
            CompactionJob::Level(c) => c.file_numbers(),
        }
    }
}
