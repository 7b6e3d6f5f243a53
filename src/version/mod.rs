//! Versioned file-set state.
//!
//! A [`Version`] is an immutable snapshot of the per-level table file sets.
//! Readers pin the current version (an `Arc` clone) and walk it without
//! locks while compactions publish successors through
//! [`VersionState`](state::VersionState).

pub mod edit;
pub mod state;

pub use edit::{NewFile, VersionEdit};
pub use state::VersionState;

use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::comparator::InternalComparator;
use crate::config::{
    self, ReadOptions, L0_COMPACTION_TRIGGER, MAX_GRANDPARENT_OVERLAP_BYTES, NUM_LEVELS,
};
use crate::error::Error;
use crate::iterator::{IndexIter, Iter};
use crate::keys::{InternalKey, LookupKey};
use crate::table::cache::TableCache;
use crate::table::TableGet;

/// Highest level a flushed memtable may be placed at when its range
/// overlaps nothing below.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Metadata for one table file.
#[derive(Debug)]
pub struct FileMeta {
    pub number: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Read misses left before this file volunteers for compaction.
    pub allowed_seeks: AtomicI32,
}

impl FileMeta {
    pub fn new(number: u64, size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        FileMeta {
            number,
            size,
            smallest,
            largest,
            allowed_seeks: AtomicI32::new(config::allowed_seeks(size)),
        }
    }
}

pub fn total_file_size(files: &[Arc<FileMeta>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// An immutable snapshot of the leveled file sets.
///
/// Level 0 files are ordered newest-first (descending file number) and may
/// overlap; deeper levels are sorted by smallest key and disjoint.
pub struct Version {
    icmp: InternalComparator,
    pub levels: [Vec<Arc<FileMeta>>; NUM_LEVELS],
    /// Score >= 1.0 makes `compaction_level` the size-triggered candidate.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,
    /// A file whose seek budget ran out, recorded by the read path.
    seek_compact: Mutex<Option<(usize, Arc<FileMeta>)>>,
}

impl Version {
    pub fn empty(icmp: InternalComparator) -> Self {
        Version {
            icmp,
            levels: Default::default(),
            compaction_score: 0.0,
            compaction_level: 0,
            seek_compact: Mutex::new(None),
        }
    }

    /// Recomputes the size-based compaction candidate. Level 0 scores by
    /// file count, deeper levels by byte budget.
    pub(crate) fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = -1.0f64;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                self.levels[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(&self.levels[level]) as f64
                    / config::max_bytes_for_level(level)
            };
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        self.compaction_score = best_score;
        self.compaction_level = best_level;
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    /// Point lookup across the leveled files, newest tier first. A table
    /// consulted without yielding the key is charged one seek; a file
    /// whose budget runs out becomes a compaction candidate.
    pub fn get(
        &self,
        lkey: &LookupKey,
        cache: &TableCache,
        ropts: &ReadOptions,
    ) -> crate::error::Result<Option<Vec<u8>>> {
        let ikey = lkey.internal_key();
        let ukey = lkey.user_key();
        let ucmp = self.icmp.user_comparator().clone();

        // Level 0 files overlap; consult every candidate newest-first.
        for file in &self.levels[0] {
            if ucmp.compare(ukey, file.smallest.user_key()).is_lt()
                || ucmp.compare(ukey, file.largest.user_key()).is_gt()
            {
                continue;
            }
            match cache.get(file.number, file.size, ikey, ropts)? {
                TableGet::Value(v) => return Ok(Some(v)),
                TableGet::Deleted => return Ok(None),
                TableGet::NotFound { read_block } => {
                    if read_block {
                        self.charge_seek(0, file);
                    }
                }
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.levels[level];
            if files.is_empty() {
                continue;
            }
            let idx = files.partition_point(|f| {
                self.icmp.compare(f.largest.encoded(), ikey).is_lt()
            });
            if idx >= files.len() {
                continue;
            }
            let file = &files[idx];
            if ucmp.compare(ukey, file.smallest.user_key()).is_lt() {
                continue;
            }
            match cache.get(file.number, file.size, ikey, ropts)? {
                TableGet::Value(v) => return Ok(Some(v)),
                TableGet::Deleted => return Ok(None),
                TableGet::NotFound { read_block } => {
                    if read_block {
                        self.charge_seek(level, file);
                    }
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn charge_seek(&self, level: usize, file: &Arc<FileMeta>) {
        if file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) == 1 {
            let mut pending = self.seek_compact.lock().unwrap();
            if pending.is_none() {
                *pending = Some((level, file.clone()));
            }
        }
    }

    pub(crate) fn seek_compaction(&self) -> Option<(usize, Arc<FileMeta>)> {
        self.seek_compact.lock().unwrap().clone()
    }

    /// Appends one iterator per level-0 file and one concatenating
    /// iterator per deeper non-empty level.
    pub fn append_iters(
        &self,
        iters: &mut Vec<Box<dyn Iter>>,
        cache: &Arc<TableCache>,
        ropts: &ReadOptions,
    ) {
        for file in &self.levels[0] {
            iters.push(cache.iter(file.number, file.size, *ropts));
        }
        for level in 1..NUM_LEVELS {
            if !self.levels[level].is_empty() {
                iters.push(new_level_iter(
                    self.icmp.clone(),
                    self.levels[level].clone(),
                    cache.clone(),
                    *ropts,
                ));
            }
        }
    }

    /// True when any file in `level` overlaps `[smallest, largest]` in
    /// user-key space (either bound absent means unbounded).
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest: Option<&[u8]>,
        largest: Option<&[u8]>,
    ) -> bool {
        !self.overlapping_inputs(level, smallest, largest).is_empty()
    }

    /// Files in `level` overlapping the user-key range. For level 0 the
    /// range grows to cover overlapping files transitively, since its
    /// files overlap one another.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMeta>> {
        let ucmp = self.icmp.user_comparator().clone();
        let mut begin = begin.map(|b| b.to_vec());
        let mut end = end.map(|e| e.to_vec());
        let mut inputs: Vec<Arc<FileMeta>> = Vec::new();
        let mut i = 0;
        while i < self.levels[level].len() {
            let file = &self.levels[level][i];
            i += 1;
            let file_start = file.smallest.user_key();
            let file_limit = file.largest.user_key();
            if begin
                .as_deref()
                .is_some_and(|b| ucmp.compare(file_limit, b).is_lt())
            {
                continue;
            }
            if end
                .as_deref()
                .is_some_and(|e| ucmp.compare(file_start, e).is_gt())
            {
                continue;
            }
            if level == 0 {
                // An overlapping level-0 file may widen the range; restart
                // so earlier files are reconsidered against it.
                let mut expanded = false;
                if begin
                    .as_deref()
                    .is_some_and(|b| ucmp.compare(file_start, b).is_lt())
                {
                    begin = Some(file_start.to_vec());
                    expanded = true;
                }
                if end
                    .as_deref()
                    .is_some_and(|e| ucmp.compare(file_limit, e).is_gt())
                {
                    end = Some(file_limit.to_vec());
                    expanded = true;
                }
                if expanded {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(file.clone());
        }
        inputs
    }

    /// Target level for a freshly flushed memtable: push below level 0
    /// while the range overlaps nothing there and not too much two levels
    /// down.
    pub fn pick_level_for_memtable_output(&self, smallest: &[u8], largest: &[u8]) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest), Some(largest)) {
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(level + 1, Some(smallest), Some(largest)) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let overlaps =
                        self.overlapping_inputs(level + 2, Some(smallest), Some(largest));
                    if total_file_size(&overlaps) > MAX_GRANDPARENT_OVERLAP_BYTES {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// The user-key range spanned by a file set, as encoded internal keys.
    pub fn key_range(icmp: &InternalComparator, files: &[Arc<FileMeta>]) -> (InternalKey, InternalKey) {
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if icmp.compare(file.smallest.encoded(), smallest.encoded()).is_lt() {
                smallest = file.smallest.clone();
            }
            if icmp.compare(file.largest.encoded(), largest.encoded()).is_gt() {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }
}

/// Index over a sorted level's file list: key is each file's largest
/// internal key, value encodes `(number, size)` for the table-cache child.
struct LevelFileIter {
    icmp: InternalComparator,
    files: Vec<Arc<FileMeta>>,
    index: usize,
    opened: bool,
    scratch: [u8; 16],
}

impl LevelFileIter {
    fn new(icmp: InternalComparator, files: Vec<Arc<FileMeta>>) -> Self {
        LevelFileIter { icmp, files, index: 0, opened: false, scratch: [0; 16] }
    }

    fn update_scratch(&mut self) {
        if self.valid() {
            let file = &self.files[self.index];
            LittleEndian::write_u64(&mut self.scratch[..8], file.number);
            LittleEndian::write_u64(&mut self.scratch[8..], file.size);
        }
    }
}

impl Iter for LevelFileIter {
    fn valid(&self) -> bool {
        self.opened && self.index < self.files.len()
    }

    fn first(&mut self) -> bool {
        self.opened = true;
        self.index = 0;
        self.update_scratch();
        self.valid()
    }

    fn last(&mut self) -> bool {
        self.opened = true;
        self.index = self.files.len().saturating_sub(1);
        self.update_scratch();
        self.valid()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        self.opened = true;
        self.index = self
            .files
            .partition_point(|f| self.icmp.compare(f.largest.encoded(), target).is_lt());
        self.update_scratch();
        self.valid()
    }

    fn next(&mut self) -> bool {
        if !self.opened {
            return self.first();
        }
        if self.index < self.files.len() {
            self.index += 1;
        }
        self.update_scratch();
        self.valid()
    }

    fn prev(&mut self) -> bool {
        if !self.opened {
            return self.last();
        }
        if self.index == 0 {
            self.index = self.files.len();
            return false;
        }
        self.index -= 1;
        self.update_scratch();
        self.valid()
    }

    fn key(&self) -> &[u8] {
        self.files[self.index].largest.encoded()
    }

    fn value(&self) -> &[u8] {
        &self.scratch
    }

    fn err(&self) -> Option<Error> {
        None
    }
}

/// Concatenating iterator over a sorted level: file index over lazily
/// opened table iterators.
pub fn new_level_iter(
    icmp: InternalComparator,
    files: Vec<Arc<FileMeta>>,
    cache: Arc<TableCache>,
    ropts: ReadOptions,
) -> Box<dyn Iter> {
    let index = Box::new(LevelFileIter::new(icmp, files));
    Box::new(IndexIter::new(
        index,
        Box::new(move |value: &[u8]| {
            let number = LittleEndian::read_u64(&value[..8]);
            let size = LittleEndian::read_u64(&value[8..]);
            cache.iter(number, size, ropts)
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::keys::Kind;

    fn icmp() -> InternalComparator {
        InternalComparator(Arc::new(BytewiseComparator))
    }

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMeta> {
        Arc::new(FileMeta::new(
            number,
            1000,
            InternalKey::new(smallest, 100, Kind::Value),
            InternalKey::new(largest, 1, Kind::Value),
        ))
    }

    fn version_with_levels() -> Version {
        let mut v = Version::empty(icmp());
        // Level 0: overlapping, newest first.
        v.levels[0] = vec![meta(12, b"c", b"f"), meta(11, b"a", b"d")];
        // Levels 1 and 2: disjoint sorted runs.
        v.levels[1] = vec![meta(5, b"a", b"c"), meta(6, b"e", b"g"), meta(7, b"k", b"p")];
        v.levels[2] = vec![meta(8, b"h", b"i")];
        v
    }

    #[test]
    fn overlapping_inputs_on_sorted_level() {
        let v = version_with_levels();
        let hits = v.overlapping_inputs(1, Some(b"f"), Some(b"l"));
        let numbers: Vec<u64> = hits.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![6, 7]);

        assert!(v.overlapping_inputs(1, Some(b"h"), Some(b"j")).is_empty());
        // Unbounded on both sides takes everything.
        assert_eq!(v.overlapping_inputs(1, None, None).len(), 3);
    }

    #[test]
    fn level0_overlap_expands_transitively() {
        let v = version_with_levels();
        // "e" only touches file 12 directly, but 12 widens the range to
        // ["c","f"], which pulls in file 11.
        let hits = v.overlapping_inputs(0, Some(b"e"), Some(b"e"));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn memtable_output_level_respects_overlap() {
        let v = version_with_levels();
        // Overlaps level 0 -> stays at 0.
        assert_eq!(v.pick_level_for_memtable_output(b"b", b"c"), 0);
        // Overlaps level 1 -> cannot sink below 0.
        assert_eq!(v.pick_level_for_memtable_output(b"g", b"g"), 0);
        // Clear of level 1 but overlapping level 2 stops at 1.
        assert_eq!(v.pick_level_for_memtable_output(b"h", b"j"), 1);
        // Clear of every occupied level -> pushed to the cap.
        assert_eq!(v.pick_level_for_memtable_output(b"q", b"z"), MAX_MEM_COMPACT_LEVEL);
    }

    #[test]
    fn finalize_scores_level0_by_count() {
        let mut v = Version::empty(icmp());
        v.levels[0] = (0..8).map(|i| meta(i + 1, b"a", b"b")).collect();
        v.finalize();
        assert_eq!(v.compaction_level, 0);
        assert!(v.compaction_score >= 2.0);
    }

    #[test]
    fn charge_seek_flags_file_once_budget_is_spent() {
        let v = version_with_levels();
        let file = v.levels[1][0].clone();
        file.allowed_seeks.store(2, AtomicOrdering::Relaxed);
        v.charge_seek(1, &file);
        assert!(v.seek_compaction().is_none());
        v.charge_seek(1, &file);
        let (level, picked) = v.seek_compaction().unwrap();
        assert_eq!(level, 1);
        assert_eq!(picked.number, file.number);
    }

    #[test]
    fn file_iter_seeks_by_largest_key() {
        let files = vec![meta(1, b"a", b"c"), meta(2, b"e", b"g"), meta(3, b"k", b"p")];
        let mut it = LevelFileIter::new(icmp(), files);
        let target = InternalKey::new(b"d", crate::keys::MAX_SEQUENCE, Kind::Value);
        assert!(it.seek(target.encoded()));
        assert_eq!(LittleEndian::read_u64(&it.value()[..8]), 2);
        // Exactly the largest key of a file still lands on that file.
        let target = InternalKey::new(b"g", 1, Kind::Value);
        assert!(it.seek(target.encoded()));
        assert_eq!(LittleEndian::read_u64(&it.value()[..8]), 2);
        assert!(it.prev());
        assert_eq!(LittleEndian::read_u64(&it.value()[..8]), 1);
    }
}
