//! In-memory write buffer.
//!
//! A lock-free skip list maps encoded internal keys to values under the
//! internal-key order (user key ascending, sequence descending). Only the
//! coordinator inserts; readers walk concurrent snapshots without blocking
//! writes.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::comparator::InternalComparator;
use crate::error::Error;
use crate::iterator::Iter;
use crate::keys::{self, append_internal_key, Kind, LookupKey, Sequence, TAG_LEN};

/// Skip-list key: an encoded internal key ordered by the shared internal
/// comparator.
struct TableKey {
    ikey: Vec<u8>,
    cmp: InternalComparator,
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp.compare(&self.ikey, &other.ikey) == Ordering::Equal
    }
}

impl Eq for TableKey {}

impl PartialOrd for TableKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TableKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.ikey, &other.ikey)
    }
}

/// Result of a memtable point read.
pub enum MemGet {
    /// Newest visible revision is a value.
    Value(Vec<u8>),
    /// Newest visible revision is a deletion; deeper tiers must not be
    /// consulted.
    Deleted,
    /// This memtable holds no revision at or below the lookup sequence.
    NotFound,
}

pub struct MemTable {
    map: SkipMap<TableKey, Vec<u8>>,
    cmp: InternalComparator,
    approximate_size: AtomicUsize,
}

impl MemTable {
    pub fn new(cmp: InternalComparator) -> Self {
        MemTable {
            map: SkipMap::new(),
            cmp,
            approximate_size: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, seq: Sequence, kind: Kind, user_key: &[u8], value: &[u8]) {
        let mut ikey = Vec::with_capacity(user_key.len() + TAG_LEN);
        append_internal_key(&mut ikey, user_key, seq, kind);
        let added = ikey.len() + value.len();
        self.map.insert(
            TableKey { ikey, cmp: self.cmp.clone() },
            value.to_vec(),
        );
        self.approximate_size.fetch_add(added, AtomicOrdering::Relaxed);
    }

    /// Looks up the newest revision of the key with sequence at or below
    /// the lookup sequence.
    pub fn get(&self, lkey: &LookupKey) -> MemGet {
        let probe = TableKey {
            ikey: lkey.internal_key().to_vec(),
            cmp: self.cmp.clone(),
        };
        let entry = match self.map.lower_bound(std::ops::Bound::Included(&probe)) {
            Some(entry) => entry,
            None => return MemGet::NotFound,
        };
        let found = &entry.key().ikey;
        let user_cmp = self.cmp.user_comparator();
        if user_cmp
            .compare(keys::user_key(found), lkey.user_key())
            .is_ne()
        {
            return MemGet::NotFound;
        }
        match keys::unpack_tag(keys::extract_tag(found)) {
            Ok((_, Kind::Value)) => MemGet::Value(entry.value().clone()),
            Ok((_, Kind::Deletion)) => MemGet::Deleted,
            Err(_) => MemGet::NotFound,
        }
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(self: &Arc<Self>) -> MemIter {
        MemIter { mem: self.clone(), current: None }
    }
}

/// Cursor over a memtable. Holds owned copies of the current entry, so the
/// underlying skip list can keep absorbing newer revisions while the cursor
/// is out.
pub struct MemIter {
    mem: Arc<MemTable>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemIter {
    fn probe(&self, ikey: &[u8]) -> TableKey {
        TableKey { ikey: ikey.to_vec(), cmp: self.mem.cmp.clone() }
    }

    fn capture(
        entry: Option<crossbeam_skiplist::map::Entry<'_, TableKey, Vec<u8>>>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        entry.map(|e| (e.key().ikey.clone(), e.value().clone()))
    }
}

impl Iter for MemIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn first(&mut self) -> bool {
        self.current = Self::capture(self.mem.map.front());
        self.current.is_some()
    }

    fn last(&mut self) -> bool {
        self.current = Self::capture(self.mem.map.back());
        self.current.is_some()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        let probe = self.probe(target);
        self.current =
            Self::capture(self.mem.map.lower_bound(std::ops::Bound::Included(&probe)));
        self.current.is_some()
    }

    fn next(&mut self) -> bool {
        match self.current.take() {
            None => self.first(),
            Some((key, _)) => {
                let probe = self.probe(&key);
                self.current =
                    Self::capture(self.mem.map.lower_bound(std::ops::Bound::Excluded(&probe)));
                self.current.is_some()
            }
        }
    }

    fn prev(&mut self) -> bool {
        match self.current.take() {
            None => self.last(),
            Some((key, _)) => {
                let probe = self.probe(&key);
                self.current =
                    Self::capture(self.mem.map.upper_bound(std::ops::Bound::Excluded(&probe)));
                self.current.is_some()
            }
        }
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("key() on invalid iterator").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("value() on invalid iterator").1
    }

    fn err(&self) -> Option<Error> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn memtable() -> Arc<MemTable> {
        Arc::new(MemTable::new(InternalComparator(Arc::new(
            BytewiseComparator,
        ))))
    }

    #[test]
    fn get_respects_lookup_sequence() {
        let mem = memtable();
        mem.insert(10, Kind::Value, b"k", b"ten");
        mem.insert(20, Kind::Value, b"k", b"twenty");

        assert!(matches!(mem.get(&LookupKey::new(b"k", 25)), MemGet::Value(v) if v == b"twenty"));
        assert!(matches!(mem.get(&LookupKey::new(b"k", 20)), MemGet::Value(v) if v == b"twenty"));
        assert!(matches!(mem.get(&LookupKey::new(b"k", 15)), MemGet::Value(v) if v == b"ten"));
        assert!(matches!(mem.get(&LookupKey::new(b"k", 9)), MemGet::NotFound));
    }

    #[test]
    fn deletion_shadows_value() {
        let mem = memtable();
        mem.insert(5, Kind::Value, b"k", b"v");
        mem.insert(6, Kind::Deletion, b"k", b"");
        assert!(matches!(mem.get(&LookupKey::new(b"k", 7)), MemGet::Deleted));
        assert!(matches!(mem.get(&LookupKey::new(b"k", 5)), MemGet::Value(v) if v == b"v"));
    }

    #[test]
    fn get_does_not_bleed_to_next_user_key() {
        let mem = memtable();
        mem.insert(5, Kind::Value, b"b", b"v");
        assert!(matches!(mem.get(&LookupKey::new(b"a", 10)), MemGet::NotFound));
    }

    #[test]
    fn iterates_internal_order() {
        let mem = memtable();
        mem.insert(1, Kind::Value, b"b", b"old");
        mem.insert(3, Kind::Value, b"b", b"new");
        mem.insert(2, Kind::Value, b"a", b"va");

        let mut it = mem.iter();
        let mut keys_seen = Vec::new();
        let mut ok = it.first();
        while ok {
            let (uk, seq, _) = keys::parse_internal_key(it.key()).unwrap();
            keys_seen.push((uk.to_vec(), seq));
            ok = it.next();
        }
        // User keys ascending; revisions of one key newest-first.
        assert_eq!(
            keys_seen,
            vec![(b"a".to_vec(), 2), (b"b".to_vec(), 3), (b"b".to_vec(), 1)]
        );
    }

    #[test]
    fn iterator_survives_concurrent_inserts() {
        let mem = memtable();
        mem.insert(1, Kind::Value, b"a", b"1");
        mem.insert(2, Kind::Value, b"c", b"3");

        let mut it = mem.iter();
        assert!(it.first());
        mem.insert(3, Kind::Value, b"b", b"2");
        assert!(it.next());
        let (uk, _, _) = keys::parse_internal_key(it.key()).unwrap();
        assert_eq!(uk, b"b");
    }

    #[test]
    fn approximate_size_grows() {
        let mem = memtable();
        assert_eq!(mem.approximate_size(), 0);
        mem.insert(1, Kind::Value, b"key", b"value");
        assert!(mem.approximate_size() >= 3 + 5 + TAG_LEN);
    }
}
