use std::sync::Arc;

use super::{EmptyIter, Iter};
use crate::comparator::Comparator;
use crate::error::Error;

/// Clips an iterator over user keys to `[start, limit)`. Either bound may
/// be absent; degenerate bounds produce an empty iterator. Positioning
/// never escapes the bounds.
pub fn new_range_iter(
    start: Option<Vec<u8>>,
    limit: Option<Vec<u8>>,
    cmp: Arc<dyn Comparator>,
    iter: Box<dyn Iter>,
) -> Box<dyn Iter> {
    match (start, limit) {
        (None, None) => iter,
        (Some(start), None) => Box::new(StartIter {
            cmp,
            iter,
            start,
            valid: false,
            seeked: false,
        }),
        (None, Some(limit)) => Box::new(LimitIter {
            cmp,
            iter,
            limit,
            valid: false,
            seeked: false,
        }),
        (Some(start), Some(limit)) => {
            if cmp.compare(&start, &limit).is_ge() {
                return Box::new(EmptyIter);
            }
            Box::new(RangeIter {
                cmp,
                iter,
                start,
                limit,
                valid: false,
                seeked: false,
            })
        }
    }
}

/// Lower bound only.
struct StartIter {
    cmp: Arc<dyn Comparator>,
    iter: Box<dyn Iter>,
    start: Vec<u8>,
    valid: bool,
    seeked: bool,
}

impl StartIter {
    fn check_start(&mut self, valid: bool) -> bool {
        self.valid = valid && self.cmp.compare(self.iter.key(), &self.start).is_ge();
        self.valid
    }
}

impl Iter for StartIter {
    fn valid(&self) -> bool {
        self.valid
    }

    fn first(&mut self) -> bool {
        self.seeked = true;
        self.valid = self.iter.seek(&self.start);
        self.valid
    }

    fn last(&mut self) -> bool {
        self.seeked = true;
        let valid = self.iter.last();
        self.check_start(valid)
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        self.seeked = true;
        let target = if self.cmp.compare(target, &self.start).is_lt() {
            &self.start
        } else {
            target
        };
        let target = target.to_vec();
        self.valid = self.iter.seek(&target);
        self.valid
    }

    fn next(&mut self) -> bool {
        if !self.seeked {
            return self.first();
        }
        if !self.valid {
            return false;
        }
        self.valid = self.iter.next();
        self.valid
    }

    fn prev(&mut self) -> bool {
        if !self.seeked {
            return self.last();
        }
        if !self.valid {
            return false;
        }
        let valid = self.iter.prev();
        self.check_start(valid)
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.iter.value()
    }

    fn err(&self) -> Option<Error> {
        self.iter.err()
    }
}

/// Upper bound only.
struct LimitIter {
    cmp: Arc<dyn Comparator>,
    iter: Box<dyn Iter>,
    limit: Vec<u8>,
    valid: bool,
    seeked: bool,
}

impl LimitIter {
    fn check_limit(&mut self, valid: bool) -> bool {
        self.valid = valid && self.cmp.compare(self.iter.key(), &self.limit).is_lt();
        self.valid
    }

    fn last_below_limit(&mut self) -> bool {
        if self.iter.seek(&self.limit) {
            while self.iter.prev() {
                if self.cmp.compare(self.iter.key(), &self.limit).is_lt() {
                    self.valid = true;
                    return true;
                }
            }
            self.valid = false;
            return false;
        }
        // Nothing at or past the limit; the absolute last entry may still
        // qualify.
        if self.iter.last() {
            while self.cmp.compare(self.iter.key(), &self.limit).is_ge() {
                if !self.iter.prev() {
                    self.valid = false;
                    return false;
                }
            }
            self.valid = true;
            return true;
        }
        self.valid = false;
        false
    }
}

impl Iter for LimitIter {
    fn valid(&self) -> bool {
        self.valid
    }

    fn first(&mut self) -> bool {
        self.seeked = true;
        let valid = self.iter.first();
        self.check_limit(valid)
    }

    fn last(&mut self) -> bool {
        self.seeked = true;
        self.last_below_limit()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        self.seeked = true;
        if self.cmp.compare(target, &self.limit).is_ge() {
            self.valid = false;
            return false;
        }
        let valid = self.iter.seek(target);
        self.check_limit(valid)
    }

    fn next(&mut self) -> bool {
        if !self.seeked {
            return self.first();
        }
        if !self.valid {
            return false;
        }
        let valid = self.iter.next();
        self.check_limit(valid)
    }

    fn prev(&mut self) -> bool {
        if !self.seeked {
            return self.last();
        }
        if !self.valid {
            return false;
        }
        self.valid = self.iter.prev();
        self.valid
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.iter.value()
    }

    fn err(&self) -> Option<Error> {
        self.iter.err()
    }
}

/// Both bounds.
struct RangeIter {
    cmp: Arc<dyn Comparator>,
    iter: Box<dyn Iter>,
    start: Vec<u8>,
    limit: Vec<u8>,
    valid: bool,
    seeked: bool,
}

impl RangeIter {
    fn check_start(&mut self, valid: bool) -> bool {
        self.valid = valid && self.cmp.compare(self.iter.key(), &self.start).is_ge();
        self.valid
    }

    fn check_limit(&mut self, valid: bool) -> bool {
        self.valid = valid && self.cmp.compare(self.iter.key(), &self.limit).is_lt();
        self.valid
    }
}

impl Iter for RangeIter {
    fn valid(&self) -> bool {
        self.valid
    }

    fn first(&mut self) -> bool {
        self.seeked = true;
        let valid = self.iter.seek(&self.start);
        self.check_limit(valid)
    }

    fn last(&mut self) -> bool {
        self.seeked = true;
        if self.iter.seek(&self.limit) {
            while self.iter.prev() {
                if self.cmp.compare(self.iter.key(), &self.limit).is_lt() {
                    return self.check_start(true);
                }
            }
            self.valid = false;
            return false;
        }
        if self.iter.last() {
            while self.cmp.compare(self.iter.key(), &self.limit).is_ge() {
                if !self.iter.prev() {
                    self.valid = false;
                    return false;
                }
            }
            return self.check_start(true);
        }
        self.valid = false;
        false
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        self.seeked = true;
        if self.cmp.compare(target, &self.limit).is_ge() {
            self.valid = false;
            return false;
        }
        let target = if self.cmp.compare(target, &self.start).is_lt() {
            self.start.clone()
        } else {
            target.to_vec()
        };
        let valid = self.iter.seek(&target);
        self.check_limit(valid)
    }

    fn next(&mut self) -> bool {
        if !self.seeked {
            return self.first();
        }
        if !self.valid {
            return false;
        }
        let valid = self.iter.next();
        self.check_limit(valid)
    }

    fn prev(&mut self) -> bool {
        if !self.seeked {
            return self.last();
        }
        if !self.valid {
            return false;
        }
        let valid = self.iter.prev();
        self.check_start(valid)
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        self.iter.value()
    }

    fn err(&self) -> Option<Error> {
        self.iter.err()
    }
}
