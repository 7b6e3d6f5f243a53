//! Iterator composition.
//!
//! Every cursor in the engine, from a single block to a whole-database
//! range scan, implements [`Iter`]. Compositors wrap children:
//! [`MergeIter`] interleaves N sources, [`IndexIter`] flattens a two-level
//! index, [`DbIter`] projects internal keys to the user view at a fixed
//! sequence, and [`RangeIter`] clips to key bounds. The database read path
//! composes range(db(merge(memtables, tables))).

mod db_iter;
mod index;
mod merge;
mod range;

pub use db_iter::DbIter;
pub use index::IndexIter;
pub use merge::MergeIter;
pub use range::new_range_iter;

use crate::error::Error;

/// A positional cursor over key/value pairs.
///
/// `key`/`value` may only be called while `valid()` holds and the returned
/// slices are invalidated by the next positioning call. Positioning methods
/// return the resulting validity. `next` on a fresh iterator positions at
/// the first entry; `prev` at the last.
pub trait Iter: Send {
    fn valid(&self) -> bool;

    fn first(&mut self) -> bool;

    fn last(&mut self) -> bool;

    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]) -> bool;

    fn next(&mut self) -> bool;

    fn prev(&mut self) -> bool;

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    /// The error that invalidated the iterator, if any.
    fn err(&self) -> Option<Error>;
}

/// Iterator over nothing.
pub struct EmptyIter;

impl Iter for EmptyIter {
    fn valid(&self) -> bool {
        false
    }
    fn first(&mut self) -> bool {
        false
    }
    fn last(&mut self) -> bool {
        false
    }
    fn seek(&mut self, _target: &[u8]) -> bool {
        false
    }
    fn next(&mut self) -> bool {
        false
    }
    fn prev(&mut self) -> bool {
        false
    }
    fn key(&self) -> &[u8] {
        panic!("key() on invalid iterator")
    }
    fn value(&self) -> &[u8] {
        panic!("value() on invalid iterator")
    }
    fn err(&self) -> Option<Error> {
        None
    }
}

/// Iterator that is permanently invalid with an error, used when a source
/// cannot be opened.
pub struct ErrorIter(pub Error);

impl Iter for ErrorIter {
    fn valid(&self) -> bool {
        false
    }
    fn first(&mut self) -> bool {
        false
    }
    fn last(&mut self) -> bool {
        false
    }
    fn seek(&mut self, _target: &[u8]) -> bool {
        false
    }
    fn next(&mut self) -> bool {
        false
    }
    fn prev(&mut self) -> bool {
        false
    }
    fn key(&self) -> &[u8] {
        panic!("key() on invalid iterator")
    }
    fn value(&self) -> &[u8] {
        panic!("value() on invalid iterator")
    }
    fn err(&self) -> Option<Error> {
        Some(self.0.clone())
    }
}

/// Test helper: an iterator over an in-memory sorted list of pairs. Also
/// used by unit tests across the iterator stack. Entries must be pre-sorted
/// under the comparator `seek` will use: raw bytes by default, internal-key
/// order via [`VecIter::with_cmp`].
#[cfg(test)]
pub(crate) struct VecIter {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub pos: Option<usize>,
    pub cmp: Option<crate::comparator::InternalComparator>,
}

#[cfg(test)]
impl VecIter {
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        VecIter { entries, pos: None, cmp: None }
    }

    pub fn with_cmp(
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        cmp: crate::comparator::InternalComparator,
    ) -> Self {
        VecIter { entries, pos: None, cmp: Some(cmp) }
    }
}

#[cfg(test)]
impl Iter for VecIter {
    fn valid(&self) -> bool {
        self.pos.is_some_and(|p| p < self.entries.len())
    }
    fn first(&mut self) -> bool {
        self.pos = Some(0);
        self.valid()
    }
    fn last(&mut self) -> bool {
        self.pos = self.entries.len().checked_sub(1);
        self.valid()
    }
    fn seek(&mut self, target: &[u8]) -> bool {
        let idx = match &self.cmp {
            Some(icmp) => self
                .entries
                .partition_point(|(k, _)| icmp.compare(k, target).is_lt()),
            None => self.entries.partition_point(|(k, _)| k.as_slice() < target),
        };
        self.pos = Some(idx);
        self.valid()
    }
    fn next(&mut self) -> bool {
        match self.pos {
            None => self.first(),
            Some(p) => {
                self.pos = Some(p + 1);
                self.valid()
            }
        }
    }
    fn prev(&mut self) -> bool {
        match self.pos {
            None => self.last(),
            Some(0) => {
                self.pos = Some(self.entries.len());
                false
            }
            Some(p) => {
                self.pos = Some(p - 1);
                self.valid()
            }
        }
    }
    fn key(&self) -> &[u8] {
        &self.entries[self.pos.unwrap()].0
    }
    fn value(&self) -> &[u8] {
        &self.entries[self.pos.unwrap()].1
    }
    fn err(&self) -> Option<Error> {
        None
    }
}
