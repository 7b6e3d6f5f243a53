//! Manifest records.
//!
//! A version edit is the delta between two versions: files added and
//! removed per level, plus scalar bookkeeping (active log number, last
//! sequence, file-number watermark). The manifest is a log of encoded
//! edits whose cumulative application reproduces the current version.

use crate::encoding::{
    get_length_prefixed, get_varint64, put_length_prefixed, put_varint64,
};
use crate::error::Result;
use crate::keys::{InternalKey, Sequence};

const TAG_LOG_NUMBER: u64 = 1;
const TAG_PREV_LOG_NUMBER: u64 = 2;
const TAG_NEXT_FILE_NUMBER: u64 = 3;
const TAG_LAST_SEQUENCE: u64 = 4;
const TAG_COMPACT_POINTER: u64 = 5;
const TAG_DELETED_FILE: u64 = 6;
const TAG_ADDED_FILE: u64 = 7;

/// A file added to a level by this edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub level: usize,
    pub number: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<Sequence>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub added_files: Vec<NewFile>,
}

impl VersionEdit {
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.added_files.push(NewFile { level, number, size, smallest, largest });
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(n) = self.log_number {
            put_varint64(&mut buf, TAG_LOG_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint64(&mut buf, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint64(&mut buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint64(&mut buf, TAG_LAST_SEQUENCE);
            put_varint64(&mut buf, n);
        }
        for (level, key) in &self.compact_pointers {
            put_varint64(&mut buf, TAG_COMPACT_POINTER);
            put_varint64(&mut buf, *level as u64);
            put_length_prefixed(&mut buf, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint64(&mut buf, TAG_DELETED_FILE);
            put_varint64(&mut buf, *level as u64);
            put_varint64(&mut buf, *number);
        }
        for file in &self.added_files {
            put_varint64(&mut buf, TAG_ADDED_FILE);
            put_varint64(&mut buf, file.level as u64);
            put_varint64(&mut buf, file.number);
            put_varint64(&mut buf, file.size);
            put_length_prefixed(&mut buf, file.smallest.encoded());
            put_length_prefixed(&mut buf, file.largest.encoded());
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<VersionEdit> {
        let mut edit = VersionEdit::default();
        while !data.is_empty() {
            let (tag, n) = get_varint64(data)?;
            data = &data[n..];
            match tag {
                TAG_LOG_NUMBER => {
                    let (v, n) = get_varint64(data)?;
                    data = &data[n..];
                    edit.log_number = Some(v);
                }
                TAG_PREV_LOG_NUMBER => {
                    let (v, n) = get_varint64(data)?;
                    data = &data[n..];
                    edit.prev_log_number = Some(v);
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (v, n) = get_varint64(data)?;
                    data = &data[n..];
                    edit.next_file_number = Some(v);
                }
                TAG_LAST_SEQUENCE => {
                    let (v, n) = get_varint64(data)?;
                    data = &data[n..];
                    edit.last_sequence = Some(v);
                }
                TAG_COMPACT_POINTER => {
                    let (level, n) = get_varint64(data)?;
                    data = &data[n..];
                    let (key, n) = get_length_prefixed(data)?;
                    data = &data[n..];
                    edit.compact_pointers
                        .push((level as usize, InternalKey::decode(key)?));
                }
                TAG_DELETED_FILE => {
                    let (level, n) = get_varint64(data)?;
                    data = &data[n..];
                    let (number, n) = get_varint64(data)?;
                    data = &data[n..];
                    edit.deleted_files.push((level as usize, number));
                }
                TAG_ADDED_FILE => {
                    let (level, n) = get_varint64(data)?;
                    data = &data[n..];
                    let (number, n) = get_varint64(data)?;
                    data = &data[n..];
                    let (size, n) = get_varint64(data)?;
                    data = &data[n..];
                    let (smallest, n) = get_length_prefixed(data)?;
                    data = &data[n..];
                    let smallest = InternalKey::decode(smallest)?;
                    let (largest, n) = get_length_prefixed(data)?;
                    data = &data[n..];
                    let largest = InternalKey::decode(largest)?;
                    edit.added_files.push(NewFile {
                        level: level as usize,
                        number,
                        size,
                        smallest,
                        largest,
                    });
                }
                _ => return Err(crate::corrupt!("unknown edit tag {tag}")),
            }
        }
        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::keys::Kind;

    #[test]
    fn empty_edit_roundtrip() {
        let edit = VersionEdit::default();
        assert_eq!(VersionEdit::decode(&edit.encode()).unwrap(), edit);
    }

    #[test]
    fn full_edit_roundtrip() {
        let mut edit = VersionEdit {
            log_number: Some(12),
            prev_log_number: Some(0),
            next_file_number: Some(42),
            last_sequence: Some(100_000),
            ..Default::default()
        };
        edit.compact_pointers
            .push((3, InternalKey::new(b"pointer", 55, Kind::Value)));
        edit.delete_file(1, 7);
        edit.delete_file(2, 8);
        edit.add_file(
            2,
            40,
            2 << 20,
            InternalKey::new(b"aaa", 3, Kind::Value),
            InternalKey::new(b"zzz", 9, Kind::Deletion),
        );
        assert_eq!(VersionEdit::decode(&edit.encode()).unwrap(), edit);
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut buf = Vec::new();
        crate::encoding::put_varint64(&mut buf, 99);
        assert!(matches!(
            VersionEdit::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn truncated_edit_is_corruption() {
        let mut edit = VersionEdit::default();
        edit.add_file(
            0,
            9,
            100,
            InternalKey::new(b"a", 1, Kind::Value),
            InternalKey::new(b"b", 2, Kind::Value),
        );
        let bytes = edit.encode();
        assert!(VersionEdit::decode(&bytes[..bytes.len() - 3]).is_err());
    }
}
