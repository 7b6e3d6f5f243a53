use std::cmp::Ordering;

use super::Iter;
use crate::comparator::InternalComparator;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Interleaves N children in internal-key order.
///
/// Ties between children (possible only across sources holding distinct
/// revisions) resolve to the earlier child, so callers list newer sources
/// first: memtable, immutable memtable, level 0 newest-to-oldest, then the
/// sorted levels. Reversing direction re-seeks the non-current children
/// around the current key.
pub struct MergeIter {
    icmp: InternalComparator,
    children: Vec<Box<dyn Iter>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergeIter {
    pub fn new(icmp: InternalComparator, children: Vec<Box<dyn Iter>>) -> Self {
        MergeIter { icmp, children, current: None, direction: Direction::Forward }
    }

    fn find_smallest(&mut self) -> bool {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            smallest = match smallest {
                None => Some(i),
                Some(s) => {
                    if self.icmp.compare(child.key(), self.children[s].key())
                        == Ordering::Less
                    {
                        Some(i)
                    } else {
                        Some(s)
                    }
                }
            };
        }
        self.current = smallest;
        self.current.is_some()
    }

    fn find_largest(&mut self) -> bool {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if !child.valid() {
                continue;
            }
            largest = match largest {
                None => Some(i),
                Some(l) => {
                    if self.icmp.compare(child.key(), self.children[l].key())
                        == Ordering::Greater
                    {
                        Some(i)
                    } else {
                        Some(l)
                    }
                }
            };
        }
        self.current = largest;
        self.current.is_some()
    }
}

impl Iter for MergeIter {
    fn valid(&self) -> bool {
        self.current.is_some_and(|i| self.children[i].valid())
    }

    fn first(&mut self) -> bool {
        for child in &mut self.children {
            child.first();
        }
        self.direction = Direction::Forward;
        self.find_smallest()
    }

    fn last(&mut self) -> bool {
        for child in &mut self.children {
            child.last();
        }
        self.direction = Direction::Backward;
        self.find_largest()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest()
    }

    fn next(&mut self) -> bool {
        let current = match self.current {
            Some(i) => i,
            None => return self.first(),
        };
        if self.direction != Direction::Forward {
            // The other children sit before the current key; bring each to
            // its first entry after it.
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                if child.seek(&key) && self.icmp.compare(child.key(), &key) == Ordering::Equal
                {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }
        self.children[current].next();
        self.find_smallest()
    }

    fn prev(&mut self) -> bool {
        let current = match self.current {
            Some(i) => i,
            None => return self.last(),
        };
        if self.direction != Direction::Backward {
            // Position every other child at its last entry before the
            // current key.
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                if child.seek(&key) {
                    child.prev();
                } else {
                    child.last();
                }
            }
            self.direction = Direction::Backward;
        }
        self.children[current].prev();
        self.find_largest()
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("key() on invalid iterator")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("value() on invalid iterator")].value()
    }

    fn err(&self) -> Option<Error> {
        self.children.iter().find_map(|c| c.err())
    }
}
