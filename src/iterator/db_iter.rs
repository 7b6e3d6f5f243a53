use super::Iter;
use crate::comparator::InternalComparator;
use crate::error::Error;
use crate::keys::{self, Kind, LookupKey, Sequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Projects a merged internal-key stream onto the user-visible view at a
/// fixed sequence: entries newer than the snapshot are invisible, each user
/// key contributes its newest visible revision, and a deletion hides the
/// key entirely.
///
/// Keys exposed by this iterator are user keys; `seek` takes a user key.
pub struct DbIter {
    icmp: InternalComparator,
    inner: Box<dyn Iter>,
    sequence: Sequence,
    direction: Direction,
    valid: bool,
    /// Current user key when moving backward; skip target when forward.
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
}

impl DbIter {
    pub fn new(icmp: InternalComparator, inner: Box<dyn Iter>, sequence: Sequence) -> Self {
        DbIter {
            icmp,
            inner,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
        }
    }

    /// Moves forward to the newest visible revision of the next
    /// not-yet-hidden user key. When `skipping`, entries with user key <=
    /// `saved_key` are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) -> bool {
        debug_assert!(self.direction == Direction::Forward);
        while self.inner.valid() {
            if let Ok((ukey, seq, kind)) = keys::parse_internal_key(self.inner.key()) {
                if seq <= self.sequence {
                    match kind {
                        Kind::Deletion => {
                            // Every older revision of this key is shadowed.
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(ukey);
                            skipping = true;
                        }
                        Kind::Value => {
                            let hidden = skipping
                                && self
                                    .icmp
                                    .user_comparator()
                                    .compare(ukey, &self.saved_key)
                                    .is_le();
                            if !hidden {
                                self.saved_key.clear();
                                self.valid = true;
                                return true;
                            }
                        }
                    }
                }
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
        false
    }

    /// Moves backward to the newest visible revision of the previous
    /// visible user key, leaving the inner cursor just before its group.
    fn find_prev_user_entry(&mut self) -> bool {
        debug_assert!(self.direction == Direction::Backward);
        let mut value_kind = Kind::Deletion;
        if self.inner.valid() {
            loop {
                if let Ok((ukey, seq, kind)) = keys::parse_internal_key(self.inner.key()) {
                    if seq <= self.sequence {
                        if value_kind != Kind::Deletion
                            && self
                                .icmp
                                .user_comparator()
                                .compare(ukey, &self.saved_key)
                                .is_lt()
                        {
                            // Crossed into the previous user key with a
                            // value already in hand.
                            break;
                        }
                        value_kind = kind;
                        match kind {
                            Kind::Deletion => {
                                self.saved_key.clear();
                                self.saved_value.clear();
                            }
                            Kind::Value => {
                                self.saved_key.clear();
                                self.saved_key.extend_from_slice(ukey);
                                self.saved_value.clear();
                                self.saved_value.extend_from_slice(self.inner.value());
                            }
                        }
                    }
                }
                if !self.inner.prev() {
                    break;
                }
            }
        }
        if value_kind == Kind::Deletion {
            self.valid = false;
            self.direction = Direction::Forward;
            self.saved_key.clear();
            self.saved_value.clear();
        } else {
            self.valid = true;
        }
        self.valid
    }
}

impl Iter for DbIter {
    fn valid(&self) -> bool {
        self.valid
    }

    fn first(&mut self) -> bool {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        if self.inner.first() {
            self.find_next_user_entry(false)
        } else {
            self.valid = false;
            false
        }
    }

    fn last(&mut self) -> bool {
        self.direction = Direction::Backward;
        self.saved_value.clear();
        self.saved_key.clear();
        self.inner.last();
        self.find_prev_user_entry()
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        let lkey = LookupKey::new(target, self.sequence);
        if self.inner.seek(lkey.internal_key()) {
            self.find_next_user_entry(false)
        } else {
            self.valid = false;
            false
        }
    }

    fn next(&mut self) -> bool {
        if !self.valid {
            return self.first();
        }
        if self.direction == Direction::Backward {
            // The inner cursor sits before the current group; step back
            // onto or past it.
            self.direction = Direction::Forward;
            if !self.inner.valid() {
                self.inner.first();
            } else {
                self.inner.next();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return false;
            }
            // saved_key still holds the current user key and must be
            // skipped together with anything older.
            return self.find_next_user_entry(true);
        }
        // Remember the current user key, then skip all its revisions.
        let current = keys::user_key(self.inner.key()).to_vec();
        self.saved_key = current;
        self.inner.next();
        self.find_next_user_entry(true)
    }

    fn prev(&mut self) -> bool {
        if !self.valid {
            return self.last();
        }
        if self.direction == Direction::Forward {
            // Walk the inner cursor to just before the current user key.
            let current = keys::user_key(self.inner.key()).to_vec();
            loop {
                if !self.inner.prev() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return false;
                }
                if self
                    .icmp
                    .user_comparator()
                    .compare(keys::user_key(self.inner.key()), &current)
                    .is_lt()
                {
                    break;
                }
            }
            self.direction = Direction::Backward;
            self.saved_key = current;
            self.saved_value.clear();
        }
        self.find_prev_user_entry()
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => keys::user_key(self.inner.key()),
            Direction::Backward => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Backward => &self.saved_value,
        }
    }

    fn err(&self) -> Option<Error> {
        self.inner.err()
    }
}
