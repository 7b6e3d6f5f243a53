use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;
use crate::fs::{DiskFs, FileSystem};
use crate::keys::Sequence;

/// Number of levels in the tree. Level 0 holds freshly flushed, possibly
/// overlapping tables; levels 1.. hold sorted non-overlapping runs.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that makes level 0 the compaction candidate.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which incoming writes are delayed by 1 ms.
pub const L0_SLOWDOWN_FILES: usize = 8;

/// Level-0 file count at which writes stall until compaction catches up.
pub const L0_STOP_FILES: usize = 12;

/// Target size of a compaction output file.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// A compaction output is cut early once it overlaps this many bytes of
/// level L+2, keeping future compactions of that output small.
pub const MAX_GRANDPARENT_OVERLAP_BYTES: u64 = 10 * MAX_FILE_SIZE;

/// Upper bound on the level-L input set when re-expanding under a fixed
/// L+1 range.
pub const MAX_EXPANDED_COMPACTION_BYTES: u64 = 25 * MAX_FILE_SIZE;

/// Byte budget of level 1; each deeper level gets 10x more.
pub const LEVEL1_MAX_BYTES: f64 = 10.0 * 1024.0 * 1024.0;

/// File handles reserved for the log, manifest, lock, and spare descriptors;
/// the table cache gets `max_open_files` minus this.
pub const NON_TABLE_CACHE_FILES: usize = 10;

/// A write group stops absorbing queued requests past this many bytes.
pub const MAX_GROUP_BYTES: usize = 1 << 20;

/// When the leading request is below this size, the group is capped at the
/// lead size plus this bound instead, so small writes keep low latency.
pub const SMALL_GROUP_BYTES: usize = 128 << 10;

/// Seek budget for a new table file: `max(100, size / 16 KiB)` read misses
/// before the file becomes a compaction candidate.
pub fn allowed_seeks(file_size: u64) -> i32 {
    ((file_size / 16384).max(100)) as i32
}

pub fn max_bytes_for_level(level: usize) -> f64 {
    // Level 0 is scored by file count, not bytes.
    let mut result = LEVEL1_MAX_BYTES;
    for _ in 1..level {
        result *= 10.0;
    }
    result
}

/// Block compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None = 0,
    Snappy = 1,
}

impl Compression {
    pub fn from_u8(b: u8) -> Option<Compression> {
        match b {
            0 => Some(Compression::None),
            1 => Some(Compression::Snappy),
            _ => None,
        }
    }
}

/// Database open options.
#[derive(Clone)]
pub struct Options {
    /// Create the database if no CURRENT file exists (default: true).
    pub create_if_missing: bool,

    /// Fail open when the database already exists (default: false).
    pub error_if_exists: bool,

    /// Treat every detected inconsistency as fatal (default: false).
    pub paranoid_checks: bool,

    /// User-key total order (default: byte-lexicographic).
    pub comparator: Arc<dyn Comparator>,

    /// Memtable size that triggers a flush (default: 4 MiB).
    pub write_buffer_size: usize,

    /// Open file budget shared by the table cache and bookkeeping files
    /// (default: 1000).
    pub max_open_files: usize,

    /// Decompressed data-block cache budget in bytes (default: 8 MiB).
    pub block_cache_size: usize,

    /// Uncompressed size at which a data block is cut (default: 4 KiB).
    pub block_size: usize,

    /// Entries between restart points inside a block (default: 16).
    pub block_restart_interval: usize,

    /// Codec applied to table blocks (default: Snappy).
    pub compression: Compression,

    /// Optional per-table filter (default: none).
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Backing file system (default: local disk).
    pub fs: Arc<dyn FileSystem>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            comparator: Arc::new(BytewiseComparator),
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_cache_size: 8 * 1024 * 1024,
            block_size: 4096,
            block_restart_interval: 16,
            compression: Compression::Snappy,
            filter_policy: None,
            fs: Arc::new(DiskFs),
        }
    }
}

impl Options {
    pub fn create_if_missing(mut self, v: bool) -> Self {
        self.create_if_missing = v;
        self
    }

    pub fn error_if_exists(mut self, v: bool) -> Self {
        self.error_if_exists = v;
        self
    }

    pub fn paranoid_checks(mut self, v: bool) -> Self {
        self.paranoid_checks = v;
        self
    }

    pub fn comparator(mut self, c: Arc<dyn Comparator>) -> Self {
        self.comparator = c;
        self
    }

    pub fn write_buffer_size(mut self, n: usize) -> Self {
        self.write_buffer_size = n;
        self
    }

    pub fn max_open_files(mut self, n: usize) -> Self {
        self.max_open_files = n;
        self
    }

    pub fn block_cache_size(mut self, n: usize) -> Self {
        self.block_cache_size = n;
        self
    }

    pub fn block_size(mut self, n: usize) -> Self {
        self.block_size = n;
        self
    }

    pub fn block_restart_interval(mut self, n: usize) -> Self {
        self.block_restart_interval = n;
        self
    }

    pub fn compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }

    pub fn filter_policy(mut self, p: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(p);
        self
    }

    pub fn fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }
}

/// Per-write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the log before acknowledging the write.
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync(mut self, v: bool) -> Self {
        self.sync = v;
        self
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Verify block checksums on every read, not only on open.
    pub verify_checksums: bool,

    /// Keep blocks read by this operation in the block cache
    /// (default semantics: true unless explicitly disabled).
    pub dont_fill_cache: bool,

    /// Read at this pinned sequence instead of the latest state.
    pub snapshot: Option<Sequence>,
}

impl ReadOptions {
    pub fn verify_checksums(mut self, v: bool) -> Self {
        self.verify_checksums = v;
        self
    }

    pub fn fill_cache(mut self, v: bool) -> Self {
        self.dont_fill_cache = !v;
        self
    }

    pub fn snapshot(mut self, seq: Sequence) -> Self {
        self.snapshot = Some(seq);
        self
    }
}
