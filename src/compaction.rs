//! Background compaction work.
//!
//! Two producers of version edits: flushing an immutable memtable into a
//! level-0 (or lower-overlap) table, and merging a level's files into the
//! next level while discarding revisions no snapshot can see.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::comparator::InternalComparator;
use crate::config::{
    Options, ReadOptions, MAX_FILE_SIZE, MAX_GRANDPARENT_OVERLAP_BYTES, NUM_LEVELS,
};
use crate::error::Result;
use crate::filenames;
use crate::fs::OpenMode;
use crate::iterator::{Iter, MergeIter};
use crate::keys::{self, InternalKey, Kind, Sequence};
use crate::memtable::MemTable;
use crate::table::cache::TableCache;
use crate::table::TableBuilder;
use crate::version::state::Compaction;
use crate::version::{new_level_iter, Version, VersionEdit, VersionState};

/// Compaction reads bypass the block cache and verify checksums only under
/// paranoid settings.
fn compaction_read_opts(opts: &Options) -> ReadOptions {
    ReadOptions {
        verify_checksums: opts.paranoid_checks,
        dont_fill_cache: true,
        snapshot: None,
    }
}

/// Writes one immutable memtable out as a table file.
pub struct MemTableCompaction {
    dir: PathBuf,
    opts: Arc<Options>,
    icmp: InternalComparator,
    mem: Arc<MemTable>,
    version: Arc<Version>,
    file_number: u64,
    /// When a level compaction is in flight the output stays at level 0;
    /// pushing lower could overlap tables the compaction is writing.
    level_compaction_running: bool,
}

impl MemTableCompaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: &Path,
        opts: Arc<Options>,
        icmp: InternalComparator,
        mem: Arc<MemTable>,
        version: Arc<Version>,
        file_number: u64,
        level_compaction_running: bool,
    ) -> Self {
        MemTableCompaction {
            dir: dir.to_path_buf(),
            opts,
            icmp,
            mem,
            version,
            file_number,
            level_compaction_running,
        }
    }

    pub fn file_numbers(&self) -> Vec<u64> {
        vec![self.file_number]
    }

    pub fn compact(&self, edit: &mut VersionEdit) -> Result<()> {
        edit.added_files.clear();

        let path = filenames::table_file(&self.dir, self.file_number);
        let result = self.write_table(&path, edit);
        if result.is_err() {
            let _ = self.opts.fs.remove(&path);
        }
        result
    }

    fn write_table(&self, path: &Path, edit: &mut VersionEdit) -> Result<()> {
        let file = self.opts.fs.open(path, OpenMode::write())?;
        let mut builder = TableBuilder::new(file, self.icmp.clone(), &self.opts);

        let mut it = self.mem.iter();
        let mut smallest: Option<InternalKey> = None;
        let mut largest = InternalKey::default();
        let mut ok = it.first();
        while ok {
            let key = it.key();
            if smallest.is_none() {
                smallest = Some(InternalKey::decode(key)?);
            }
            largest = InternalKey::decode(key)?;
            builder.add(key, it.value())?;
            ok = it.next();
        }
        let smallest = match smallest {
            Some(key) => key,
            // An empty memtable produces no file and no edit entry.
            None => return Ok(()),
        };
        let size = builder.finish()?;
        builder.sync()?;

        let level = if self.level_compaction_running {
            0
        } else {
            self.version
                .pick_level_for_memtable_output(smallest.user_key(), largest.user_key())
        };
        tracing::info!(
            file = self.file_number,
            level,
            size,
            entries = builder.num_entries(),
            "memtable flushed"
        );
        edit.add_file(level, self.file_number, size, smallest, largest);
        Ok(())
    }
}

/// Merges the picked input files into new tables at level L+1.
pub struct LevelCompaction {
    dir: PathBuf,
    opts: Arc<Options>,
    icmp: InternalComparator,
    table_cache: Arc<TableCache>,
    state: Arc<VersionState>,
    compaction: Compaction,
    smallest_snapshot: Sequence,
    produced: Vec<u64>,
}

struct Output {
    number: u64,
    size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

impl LevelCompaction {
    pub fn new(
        dir: &Path,
        opts: Arc<Options>,
        icmp: InternalComparator,
        table_cache: Arc<TableCache>,
        state: Arc<VersionState>,
        compaction: Compaction,
        smallest_snapshot: Sequence,
    ) -> Self {
        LevelCompaction {
            dir: dir.to_path_buf(),
            opts,
            icmp,
            table_cache,
            state,
            compaction,
            smallest_snapshot,
            produced: Vec::new(),
        }
    }

    pub fn level(&self) -> usize {
        self.compaction.level
    }

    /// Output files created so far; the coordinator removes them when an
    /// aborted compaction shuts down.
    pub fn file_numbers(&self) -> Vec<u64> {
        self.produced.clone()
    }

    pub fn compact(&mut self, edit: &mut VersionEdit) -> Result<()> {
        // A retry rebuilds the file lists from scratch.
        edit.added_files.clear();
        edit.deleted_files.clear();
        edit.compact_pointers.clear();

        let level = self.compaction.level;
        if self.compaction.is_trivial_move() {
            let file = &self.compaction.inputs[0][0];
            edit.delete_file(level, file.number);
            edit.add_file(
                level + 1,
                file.number,
                file.size,
                file.smallest.clone(),
                file.largest.clone(),
            );
            edit.compact_pointers
                .push((level, self.compaction.largest.clone()));
            tracing::info!(
                file = file.number,
                from = level,
                to = level + 1,
                "trivial move"
            );
            return Ok(());
        }

        let result = self.merge(edit);
        if let Err(err) = &result {
            tracing::warn!(level, error = %err, "compaction failed, removing outputs");
            for number in self.produced.drain(..) {
                let _ = self
                    .opts
                    .fs
                    .remove(&filenames::table_file(&self.dir, number));
                self.table_cache.evict(number);
            }
        }
        result
    }

    fn input_iter(&self) -> MergeIter {
        let ropts = compaction_read_opts(&self.opts);
        let level = self.compaction.level;
        let mut children: Vec<Box<dyn Iter>> = Vec::new();
        if level == 0 {
            for file in &self.compaction.inputs[0] {
                children.push(self.table_cache.iter(file.number, file.size, ropts));
            }
        } else {
            children.push(new_level_iter(
                self.icmp.clone(),
                self.compaction.inputs[0].clone(),
                self.table_cache.clone(),
                ropts,
            ));
        }
        if !self.compaction.inputs[1].is_empty() {
            children.push(new_level_iter(
                self.icmp.clone(),
                self.compaction.inputs[1].clone(),
                self.table_cache.clone(),
                ropts,
            ));
        }
        MergeIter::new(self.icmp.clone(), children)
    }

    fn merge(&mut self, edit: &mut VersionEdit) -> Result<()> {
        let level = self.compaction.level;
        let ucmp = self.icmp.user_comparator().clone();
        tracing::info!(
            level,
            inputs = self.compaction.inputs[0].len(),
            next_level_inputs = self.compaction.inputs[1].len(),
            "compacting"
        );

        let mut iter = self.input_iter();
        let mut builder: Option<TableBuilder> = None;
        let mut current: Option<Output> = None;
        let mut outputs: Vec<Output> = Vec::new();

        // Grandparent-overlap accounting for early output cuts.
        let mut grandparent_index = 0usize;
        let mut overlapped_bytes = 0u64;
        let mut seen_key = false;

        // Per-user-key shadowing state.
        let mut last_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = u64::MAX;

        // Memo for "does any deeper level hold this key": files are
        // consumed in ascending key order, so each level's cursor only
        // moves forward.
        let mut level_ptrs = [0usize; NUM_LEVELS];

        let mut ok = iter.first();
        while ok {
            let key = iter.key().to_vec();

            // Cut the output early if it already overlaps too much of
            // level L+2.
            while grandparent_index < self.compaction.grandparents.len()
                && self
                    .icmp
                    .compare(
                        &key,
                        self.compaction.grandparents[grandparent_index]
                            .largest
                            .encoded(),
                    )
                    .is_gt()
            {
                if seen_key {
                    overlapped_bytes +=
                        self.compaction.grandparents[grandparent_index].size;
                }
                grandparent_index += 1;
            }
            seen_key = true;
            if overlapped_bytes > MAX_GRANDPARENT_OVERLAP_BYTES {
                overlapped_bytes = 0;
                if let (Some(b), Some(out)) = (builder.take(), current.take()) {
                    outputs.push(Self::finish_output(b, out)?);
                }
            }

            let mut drop = false;
            match keys::parse_internal_key(&key) {
                Err(_) => {
                    // Keep unparsable keys; dropping would hide corruption.
                    last_user_key = None;
                    last_sequence_for_key = u64::MAX;
                }
                Ok((ukey, seq, kind)) => {
                    if last_user_key
                        .as_deref()
                        .map_or(true, |last| ucmp.compare(ukey, last).is_ne())
                    {
                        last_user_key = Some(ukey.to_vec());
                        last_sequence_for_key = u64::MAX;
                    }
                    if last_sequence_for_key <= self.smallest_snapshot {
                        // A newer revision at or below the snapshot
                        // already shadows this one everywhere.
                        drop = true;
                    } else if kind == Kind::Deletion
                        && seq <= self.smallest_snapshot
                        && self.is_base_level_for_key(ukey, &mut level_ptrs)
                    {
                        // The tombstone has nothing left to shadow.
                        drop = true;
                    }
                    last_sequence_for_key = seq;
                }
            }

            if !drop {
                if builder.is_none() {
                    let number = self.state.new_file_number();
                    self.produced.push(number);
                    let path = filenames::table_file(&self.dir, number);
                    let file = self.opts.fs.open(&path, OpenMode::write())?;
                    builder = Some(TableBuilder::new(
                        file,
                        self.icmp.clone(),
                        &self.opts,
                    ));
                    current = Some(Output {
                        number,
                        size: 0,
                        smallest: InternalKey::decode(&key)?,
                        largest: InternalKey::default(),
                    });
                }
                let b = builder.as_mut().unwrap();
                b.add(&key, iter.value())?;
                current.as_mut().unwrap().largest = InternalKey::decode(&key)?;
                if b.file_size() >= MAX_FILE_SIZE {
                    let (b, out) = (builder.take().unwrap(), current.take().unwrap());
                    outputs.push(Self::finish_output(b, out)?);
                }
            }
            ok = iter.next();
        }
        if let Some(err) = iter.err() {
            return Err(err);
        }
        if let (Some(b), Some(out)) = (builder.take(), current.take()) {
            outputs.push(Self::finish_output(b, out)?);
        }

        for file in &self.compaction.inputs[0] {
            edit.delete_file(level, file.number);
        }
        for file in &self.compaction.inputs[1] {
            edit.delete_file(level + 1, file.number);
        }
        for out in &outputs {
            edit.add_file(
                level + 1,
                out.number,
                out.size,
                out.smallest.clone(),
                out.largest.clone(),
            );
        }
        edit.compact_pointers
            .push((level, self.compaction.largest.clone()));
        tracing::info!(level, outputs = outputs.len(), "compaction finished");
        Ok(())
    }

    fn finish_output(mut builder: TableBuilder, mut out: Output) -> Result<Output> {
        out.size = builder.finish()?;
        builder.sync()?;
        Ok(out)
    }

    /// True when no level deeper than the compaction output holds the
    /// user key, so a fully-shadowing tombstone can be dropped.
    fn is_base_level_for_key(&self, ukey: &[u8], level_ptrs: &mut [usize; NUM_LEVELS]) -> bool {
        let ucmp = self.icmp.user_comparator().clone();
        for level in self.compaction.level + 2..NUM_LEVELS {
            let files = &self.compaction.version.levels[level];
            while level_ptrs[level] < files.len() {
                let file = &files[level_ptrs[level]];
                if ucmp.compare(ukey, file.largest.user_key()).is_le() {
                    if ucmp.compare(ukey, file.smallest.user_key()).is_ge() {
                        return false;
                    }
                    break;
                }
                level_ptrs[level] += 1;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{BytewiseComparator, InternalComparator};
    use crate::fs::MemFs;
    use crate::keys::LookupKey;
    use crate::memtable::MemTable;
    use crate::table::TableGet;

    fn icmp() -> InternalComparator {
        InternalComparator(Arc::new(BytewiseComparator))
    }

    struct Fixture {
        dir: PathBuf,
        opts: Arc<Options>,
        state: Arc<VersionState>,
        cache: Arc<TableCache>,
    }

    fn fixture() -> Fixture {
        let fs = MemFs::new();
        let dir = PathBuf::from("/db");
        let opts = Arc::new(Options::default().fs(Arc::new(fs)));
        let state =
            Arc::new(VersionState::create(&dir, &opts, icmp()).unwrap());
        let cache = Arc::new(TableCache::new(&dir, opts.clone(), icmp()));
        Fixture { dir, opts, state, cache }
    }

    fn flush(
        f: &Fixture,
        entries: &[(&[u8], u64, Kind, &[u8])],
        level_compaction_running: bool,
    ) -> VersionEdit {
        let mem = Arc::new(MemTable::new(icmp()));
        for (key, seq, kind, value) in entries {
            mem.insert(*seq, *kind, key, value);
        }
        let number = f.state.new_file_number();
        let compaction = MemTableCompaction::new(
            &f.dir,
            f.opts.clone(),
            icmp(),
            mem,
            f.state.current(),
            number,
            level_compaction_running,
        );
        let mut edit = VersionEdit::default();
        compaction.compact(&mut edit).unwrap();
        edit
    }

    #[test]
    fn flush_writes_single_table() {
        let f = fixture();
        let edit = flush(
            &f,
            &[
                (b"a", 1, Kind::Value, b"va"),
                (b"b", 2, Kind::Value, b"vb"),
            ],
            false,
        );
        assert_eq!(edit.added_files.len(), 1);
        let file = &edit.added_files[0];
        assert_eq!(file.smallest.user_key(), b"a");
        assert_eq!(file.largest.user_key(), b"b");

        let lkey = LookupKey::new(b"a", 100);
        match f
            .cache
            .get(file.number, file.size, lkey.internal_key(), &ReadOptions::default())
            .unwrap()
        {
            TableGet::Value(v) => assert_eq!(v, b"va"),
            _ => panic!("missing flushed key"),
        }
    }

    #[test]
    fn flush_while_level_compaction_stays_at_level0() {
        let f = fixture();
        let edit = flush(&f, &[(b"z", 1, Kind::Value, b"v")], true);
        assert_eq!(edit.added_files[0].level, 0);
        // Without a running compaction the same range is pushed down.
        let edit = flush(&f, &[(b"z", 2, Kind::Value, b"v")], false);
        assert_eq!(edit.added_files[0].level, crate::version::MAX_MEM_COMPACT_LEVEL);
    }

    #[test]
    fn single_entry_memtable_single_entry_table() {
        let f = fixture();
        let edit = flush(&f, &[(b"", 1, Kind::Value, b"")], false);
        assert_eq!(edit.added_files.len(), 1);
        let file = &edit.added_files[0];
        let lkey = LookupKey::new(b"", 5);
        match f
            .cache
            .get(file.number, file.size, lkey.internal_key(), &ReadOptions::default())
            .unwrap()
        {
            TableGet::Value(v) => assert_eq!(v, b""),
            _ => panic!("empty key must round-trip"),
        }
    }

    /// Flushes entries and installs the result at a fixed level.
    fn install_at_level(f: &Fixture, level: usize, entries: &[(&[u8], u64, Kind, &[u8])]) {
        let mut edit = flush(f, entries, true);
        edit.added_files[0].level = level;
        f.state.log(&edit).unwrap();
        f.state.apply(&edit);
    }

    #[test]
    fn merge_drops_shadowed_and_tombstones() {
        let f = fixture();
        // Older data below: a value that will stay shadowed, and a key
        // that only exists as a tombstone above.
        install_at_level(
            &f,
            1,
            &[
                (b"k1", 1, Kind::Value, b"old"),
                (b"k2", 2, Kind::Value, b"dead"),
            ],
        );
        install_at_level(
            &f,
            0,
            &[
                (b"k1", 10, Kind::Value, b"new"),
                (b"k2", 11, Kind::Deletion, b""),
            ],
        );

        let current = f.state.current();
        let compaction = Compaction {
            level: 0,
            inputs: [current.levels[0].clone(), current.levels[1].clone()],
            grandparents: Vec::new(),
            largest: current.levels[0][0].largest.clone(),
            version: current,
        };
        let mut run = LevelCompaction::new(
            &f.dir,
            f.opts.clone(),
            icmp(),
            f.cache.clone(),
            f.state.clone(),
            compaction,
            // No snapshots: everything shadowed may go.
            f.state.last_sequence().max(11),
        );
        let mut edit = VersionEdit::default();
        run.compact(&mut edit).unwrap();

        assert_eq!(edit.deleted_files.len(), 2);
        assert_eq!(edit.added_files.len(), 1);
        let out = &edit.added_files[0];
        assert_eq!(out.level, 1);

        // Only k1@10 survives: k1@1 shadowed, k2 fully deleted.
        let lkey = LookupKey::new(b"k1", 100);
        match f
            .cache
            .get(out.number, out.size, lkey.internal_key(), &ReadOptions::default())
            .unwrap()
        {
            TableGet::Value(v) => assert_eq!(v, b"new"),
            _ => panic!("k1 lost"),
        }
        let lkey = LookupKey::new(b"k2", 100);
        assert!(matches!(
            f.cache
                .get(out.number, out.size, lkey.internal_key(), &ReadOptions::default())
                .unwrap(),
            TableGet::NotFound { .. }
        ));
    }

    #[test]
    fn snapshot_preserves_old_revisions() {
        let f = fixture();
        install_at_level(&f, 1, &[(b"x", 1, Kind::Value, b"one")]);
        install_at_level(
            &f,
            0,
            &[(b"x", 10, Kind::Value, b"ten")],
        );

        let current = f.state.current();
        let compaction = Compaction {
            level: 0,
            inputs: [current.levels[0].clone(), current.levels[1].clone()],
            grandparents: Vec::new(),
            largest: current.levels[0][0].largest.clone(),
            version: current,
        };
        let mut run = LevelCompaction::new(
            &f.dir,
            f.opts.clone(),
            icmp(),
            f.cache.clone(),
            f.state.clone(),
            compaction,
            // A snapshot at 5 still needs x@1.
            5,
        );
        let mut edit = VersionEdit::default();
        run.compact(&mut edit).unwrap();

        let out = &edit.added_files[0];
        let lkey = LookupKey::new(b"x", 5);
        match f
            .cache
            .get(out.number, out.size, lkey.internal_key(), &ReadOptions::default())
            .unwrap()
        {
            TableGet::Value(v) => assert_eq!(v, b"one"),
            _ => panic!("snapshot-visible revision dropped"),
        }
        let lkey = LookupKey::new(b"x", 100);
        match f
            .cache
            .get(out.number, out.size, lkey.internal_key(), &ReadOptions::default())
            .unwrap()
        {
            TableGet::Value(v) => assert_eq!(v, b"ten"),
            _ => panic!("latest revision dropped"),
        }
    }

    #[test]
    fn trivial_move_produces_no_files() {
        let f = fixture();
        install_at_level(&f, 1, &[(b"a", 1, Kind::Value, b"v")]);
        let current = f.state.current();
        let compaction = Compaction {
            level: 1,
            inputs: [current.levels[1].clone(), Vec::new()],
            grandparents: Vec::new(),
            largest: current.levels[1][0].largest.clone(),
            version: current,
        };
        assert!(compaction.is_trivial_move());
        let number = compaction.inputs[0][0].number;
        let mut run = LevelCompaction::new(
            &f.dir,
            f.opts.clone(),
            icmp(),
            f.cache.clone(),
            f.state.clone(),
            compaction,
            100,
        );
        let mut edit = VersionEdit::default();
        run.compact(&mut edit).unwrap();
        assert!(run.file_numbers().is_empty());
        assert_eq!(edit.deleted_files, vec![(1, number)]);
        assert_eq!(edit.added_files.len(), 1);
        assert_eq!(edit.added_files[0].number, number);
        assert_eq!(edit.added_files[0].level, 2);
    }
}
