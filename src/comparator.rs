use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::keys::{self, pack_tag, MAX_SEQUENCE, SEEK_KIND, TAG_LEN};

/// Total order over user keys.
///
/// The separator/successor hooks let the table builder emit index keys that
/// are as short as possible while still seeking correctly.
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn name(&self) -> &'static str;

    /// Returns a key `k` with `start <= k < limit`, preferably shorter than
    /// `start`. Falling back to `start` itself is always correct.
    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8>;

    /// Returns a key `k >= key`, preferably shorter than `key`.
    fn find_short_successor(&self, key: &[u8]) -> Vec<u8>;

    /// Smallest key strictly greater than every key having `prefix` as a
    /// prefix, or `None` when no such key exists (all-0xff prefixes).
    /// The default suits byte-lexicographic orders.
    fn prefix_successor(&self, prefix: &[u8]) -> Option<Vec<u8>> {
        let mut limit = prefix.to_vec();
        while let Some(&last) = limit.last() {
            if last != 0xff {
                *limit.last_mut().unwrap() = last + 1;
                return Some(limit);
            }
            limit.pop();
        }
        None
    }
}

/// Default byte-lexicographic user-key order.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "emberdb.BytewiseComparator"
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let common = start
            .iter()
            .zip(limit.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if common < start.len() && common < limit.len() {
            let byte = start[common];
            if byte < 0xff && byte + 1 < limit[common] {
                let mut sep = start[..=common].to_vec();
                sep[common] = byte + 1;
                return sep;
            }
        }
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        for (i, &b) in key.iter().enumerate() {
            if b != 0xff {
                let mut succ = key[..=i].to_vec();
                succ[i] = b + 1;
                return succ;
            }
        }
        key.to_vec()
    }
}

/// Orders encoded internal keys: user key ascending per the wrapped user
/// comparator, then packed `(sequence, kind)` descending, so newer revisions
/// of a key sort first.
#[derive(Clone)]
pub struct InternalComparator(pub Arc<dyn Comparator>);

impl InternalComparator {
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.0
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.0.compare(keys::user_key(a), keys::user_key(b)) {
            Ordering::Equal => keys::extract_tag(b).cmp(&keys::extract_tag(a)),
            ord => ord,
        }
    }

    /// Index-key separator: a key `>=` every entry of the block ending at
    /// `start` and `<` every entry of the block starting at `limit`. With an
    /// empty `limit` (last block), shortens toward the user-key successor.
    pub fn append_successor(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = keys::user_key(start);
        let short = if limit.is_empty() {
            self.0.find_short_successor(user_start)
        } else {
            self.0.find_shortest_separator(user_start, keys::user_key(limit))
        };
        if short.len() < user_start.len() && self.0.compare(user_start, &short).is_lt() {
            // Shorter user key: attach the maximal tag so the separator
            // still sorts before every entry with that user key.
            let mut sep = short;
            let mut tag = [0u8; TAG_LEN];
            LittleEndian::write_u64(&mut tag, pack_tag(MAX_SEQUENCE, SEEK_KIND));
            sep.extend_from_slice(&tag);
            return sep;
        }
        start.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{InternalKey, Kind};

    #[test]
    fn bytewise_separator_shortens() {
        let c = BytewiseComparator;
        assert_eq!(c.find_shortest_separator(b"abcdef", b"abzz"), b"abd".to_vec());
        // Adjacent bytes leave no room to shorten.
        assert_eq!(c.find_shortest_separator(b"abc", b"abd"), b"abc".to_vec());
        // Prefix relationship leaves no room either.
        assert_eq!(c.find_shortest_separator(b"ab", b"abc"), b"ab".to_vec());
    }

    #[test]
    fn bytewise_successor() {
        let c = BytewiseComparator;
        assert_eq!(c.find_short_successor(b"abc"), b"b".to_vec());
        assert_eq!(c.find_short_successor(b"\xff\xffq"), b"\xff\xffr".to_vec());
        assert_eq!(c.find_short_successor(b"\xff\xff"), b"\xff\xff".to_vec());
    }

    #[test]
    fn prefix_successor_carries() {
        let c = BytewiseComparator;
        assert_eq!(c.prefix_successor(b"ab\xff"), Some(b"ac".to_vec()));
        assert_eq!(c.prefix_successor(b"\xff\xff"), None);
    }

    #[test]
    fn internal_order_newer_first() {
        let icmp = InternalComparator(Arc::new(BytewiseComparator));
        let newer = InternalKey::new(b"k", 9, Kind::Value);
        let older = InternalKey::new(b"k", 3, Kind::Value);
        let other = InternalKey::new(b"l", 1, Kind::Value);
        assert!(icmp.compare(newer.encoded(), older.encoded()).is_lt());
        assert!(icmp.compare(older.encoded(), other.encoded()).is_lt());
    }

    #[test]
    fn deletion_sorts_after_value_at_same_sequence() {
        let icmp = InternalComparator(Arc::new(BytewiseComparator));
        let put = InternalKey::new(b"k", 5, Kind::Value);
        let del = InternalKey::new(b"k", 5, Kind::Deletion);
        assert!(icmp.compare(put.encoded(), del.encoded()).is_lt());
    }

    #[test]
    fn append_successor_attaches_max_tag() {
        let icmp = InternalComparator(Arc::new(BytewiseComparator));
        let last = InternalKey::new(b"abcdef", 4, Kind::Value);
        let next = InternalKey::new(b"abzz", 8, Kind::Value);
        let sep = icmp.append_successor(last.encoded(), next.encoded());
        assert!(icmp.compare(last.encoded(), &sep).is_le());
        assert!(icmp.compare(&sep, next.encoded()).is_lt());
        assert_eq!(keys::user_key(&sep), b"abd");
    }
}
