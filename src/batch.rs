//! Atomic write batches.
//!
//! A batch is the unit written to the log and applied to the memtable:
//!
//! ```text
//! +--------------+-----------+------------------------------------+
//! | sequence: u64| count: u32| count x [kind, key, value?]        |
//! +--------------+-----------+------------------------------------+
//! ```
//!
//! Keys and values are varint-length-prefixed; deletions carry no value.
//! The `count` items consume `count` consecutive sequence numbers starting
//! at `sequence`, assigned by the coordinator just before the log append.

use byteorder::{ByteOrder, LittleEndian};

use crate::encoding::{get_length_prefixed, put_length_prefixed};
use crate::error::{Error, Result};
use crate::keys::{Kind, Sequence};

pub const BATCH_HEADER_LEN: usize = 12;

/// One decoded batch item, borrowing from the batch representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem<'a> {
    pub kind: Kind,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch { rep: vec![0; BATCH_HEADER_LEN] }
    }

    /// Wraps raw batch bytes recovered from a log record.
    pub(crate) fn from_bytes(rep: Vec<u8>) -> Self {
        WriteBatch { rep }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(Kind::Value as u8);
        put_length_prefixed(&mut self.rep, key);
        put_length_prefixed(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(Kind::Deletion as u8);
        put_length_prefixed(&mut self.rep, key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_LEN, 0);
    }

    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.rep[8..12])
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn sequence(&self) -> Sequence {
        LittleEndian::read_u64(&self.rep[0..8])
    }

    pub(crate) fn set_sequence(&mut self, seq: Sequence) {
        LittleEndian::write_u64(&mut self.rep[0..8], seq);
    }

    fn set_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.rep[8..12], count);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.rep
    }

    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Absorbs another batch's items; the coordinator groups queued
    /// requests this way before a single log append.
    pub(crate) fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_LEN..]);
    }

    /// Decodes the items, validating the count against the payload.
    pub fn items(&self) -> Result<Vec<BatchItem<'_>>> {
        if self.rep.len() < BATCH_HEADER_LEN {
            return Err(Error::BatchCorruption);
        }
        let expected = self.count() as usize;
        let mut items = Vec::with_capacity(expected);
        let mut data = &self.rep[BATCH_HEADER_LEN..];
        while !data.is_empty() {
            let kind = Kind::from_u8(data[0]).map_err(|_| Error::BatchCorruption)?;
            data = &data[1..];
            let (key, n) = get_length_prefixed(data).map_err(|_| Error::BatchCorruption)?;
            data = &data[n..];
            let value = match kind {
                Kind::Value => {
                    let (value, n) =
                        get_length_prefixed(data).map_err(|_| Error::BatchCorruption)?;
                    data = &data[n..];
                    value
                }
                Kind::Deletion => &[][..],
            };
            items.push(BatchItem { kind, key, value });
        }
        if items.len() != expected {
            return Err(Error::BatchCorruption);
        }
        Ok(items)
    }

    /// Applies every item through `apply`, assigning each the next
    /// consecutive sequence number starting at the batch sequence.
    pub(crate) fn for_each<F>(&self, mut apply: F) -> Result<()>
    where
        F: FnMut(Sequence, Kind, &[u8], &[u8]),
    {
        let base = self.sequence();
        for (i, item) in self.items()?.into_iter().enumerate() {
            apply(base + i as Sequence, item.kind, item.key, item.value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch() {
        let batch = WriteBatch::new();
        assert_eq!(batch.count(), 0);
        assert!(batch.is_empty());
        assert!(batch.items().unwrap().is_empty());
        assert_eq!(batch.bytes().len(), BATCH_HEADER_LEN);
    }

    #[test]
    fn encode_parse_roundtrip() {
        let mut batch = WriteBatch::new();
        batch.put(b"alpha", b"1");
        batch.delete(b"beta");
        batch.put(b"", b"");
        batch.set_sequence(99);

        let reparsed = WriteBatch::from_bytes(batch.bytes().to_vec());
        assert_eq!(reparsed.sequence(), 99);
        let items = reparsed.items().unwrap();
        assert_eq!(
            items,
            vec![
                BatchItem { kind: Kind::Value, key: b"alpha", value: b"1" },
                BatchItem { kind: Kind::Deletion, key: b"beta", value: b"" },
                BatchItem { kind: Kind::Value, key: b"", value: b"" },
            ]
        );
    }

    #[test]
    fn for_each_assigns_consecutive_sequences() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"a");
        batch.put(b"b", b"2");
        batch.set_sequence(10);

        let mut seen = Vec::new();
        batch
            .for_each(|seq, kind, key, _| seen.push((seq, kind, key.to_vec())))
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (10, Kind::Value, b"a".to_vec()),
                (11, Kind::Deletion, b"a".to_vec()),
                (12, Kind::Value, b"b".to_vec()),
            ]
        );
    }

    #[test]
    fn append_merges_counts_and_items() {
        let mut lead = WriteBatch::new();
        lead.put(b"x", b"1");
        let mut tail = WriteBatch::new();
        tail.delete(b"y");
        tail.put(b"z", b"3");
        lead.append(&tail);
        assert_eq!(lead.count(), 3);
        let items = lead.items().unwrap();
        assert_eq!(items[2].key, b"z");
    }

    #[test]
    fn truncated_payload_is_batch_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let mut bytes = batch.bytes().to_vec();
        bytes.truncate(bytes.len() - 2);
        assert_eq!(
            WriteBatch::from_bytes(bytes).items(),
            Err(Error::BatchCorruption)
        );
    }

    #[test]
    fn count_mismatch_is_batch_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let mut bytes = batch.bytes().to_vec();
        LittleEndian::write_u32(&mut bytes[8..12], 2);
        assert_eq!(
            WriteBatch::from_bytes(bytes).items(),
            Err(Error::BatchCorruption)
        );
    }
}
