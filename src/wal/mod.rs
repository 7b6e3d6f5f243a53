//! Write-ahead log framing.
//!
//! Records are framed into 32 KiB physical blocks so a corrupt region can
//! be skipped without losing the rest of the file:
//!
//! ```text
//! +---------+----------+---------+----------------+
//! | crc: u32| len: u16 | type: u8| payload        |
//! +---------+----------+---------+----------------+
//! ```
//!
//! A record larger than the space left in a block is split across blocks
//! with types `First`/`Middle`/`Last`; one that fits is `Full`. When fewer
//! than seven bytes remain in a block the writer zero-fills them and starts
//! the next block.
//!
//! The checksum is CRC-32C (Castagnoli) over `type || payload`, masked by
//! rotation so that a CRC stored in the payload cannot masquerade as a
//! frame checksum.
//!
//! Reading stops cleanly at end of file. A record cut short by a crash
//! surfaces as [`Error::IncompleteRecord`]; recovery truncates there and
//! continues. A checksum mismatch is corruption and is not resumable.

mod reader;
mod writer;

pub use reader::LogReader;
pub use writer::LogWriter;

use crc::{Crc, CRC_32_ISCSI};

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 7;

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282ead8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    pub fn from_u8(b: u8) -> Option<RecordType> {
        match b {
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

/// Masks a CRC so that storing a CRC inside a checksummed payload does not
/// produce the same bit pattern.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

pub(crate) fn record_crc(ty: u8, payload: &[u8]) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(&[ty]);
    digest.update(payload);
    mask_crc(digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fs::{FileSystem, MemFs, OpenMode};
    use std::path::Path;

    fn roundtrip(records: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let fs = MemFs::new();
        let path = Path::new("/wal");
        let mut writer =
            LogWriter::new(fs.open(path, OpenMode::write()).unwrap(), 0);
        for rec in records {
            writer.append(rec).unwrap();
        }
        let mut reader = LogReader::new(fs.open(path, OpenMode::read()).unwrap());
        let mut out = Vec::new();
        let mut scratch = Vec::new();
        while reader.read_record(&mut scratch).unwrap() {
            out.push(scratch.clone());
        }
        out
    }

    #[test]
    fn mask_roundtrip() {
        for crc in [0u32, 1, 0xdeadbeef, u32::MAX] {
            assert_eq!(unmask_crc(mask_crc(crc)), crc);
        }
        // Masking must change the value, otherwise it serves no purpose.
        assert_ne!(mask_crc(0x12345678), 0x12345678);
    }

    #[test]
    fn small_records_roundtrip() {
        let records = vec![b"one".to_vec(), b"two".to_vec(), Vec::new(), b"four".to_vec()];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn spanning_record_roundtrip() {
        // Spans three physical blocks.
        let big = vec![0xabu8; BLOCK_SIZE * 2 + 1234];
        let records = vec![b"head".to_vec(), big, b"tail".to_vec()];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn record_at_block_boundary() {
        // Leaves fewer than HEADER_SIZE bytes in the first block so the
        // writer must pad and restart.
        let first = vec![7u8; BLOCK_SIZE - HEADER_SIZE - 3];
        let records = vec![first, b"next".to_vec()];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn torn_tail_is_incomplete_record() {
        let fs = MemFs::new();
        let path = Path::new("/wal");
        {
            let mut writer = LogWriter::new(fs.open(path, OpenMode::write()).unwrap(), 0);
            writer.append(b"complete").unwrap();
            writer.append(&vec![1u8; 512]).unwrap();
        }
        // Cut into the second record's payload.
        let full_len = fs.open(path, OpenMode::read()).unwrap().len().unwrap();
        fs.open(path, OpenMode::read_write())
            .unwrap()
            .truncate(full_len - 100)
            .unwrap();

        let mut reader = LogReader::new(fs.open(path, OpenMode::read()).unwrap());
        let mut scratch = Vec::new();
        assert!(reader.read_record(&mut scratch).unwrap());
        assert_eq!(scratch, b"complete");
        let end_of_first = reader.offset();
        assert_eq!(reader.read_record(&mut scratch), Err(Error::IncompleteRecord));
        // Truncation point excludes the torn record entirely.
        assert_eq!(reader.offset(), end_of_first);
    }

    #[test]
    fn corrupt_payload_is_corruption() {
        let fs = MemFs::new();
        let path = Path::new("/wal");
        {
            let mut writer = LogWriter::new(fs.open(path, OpenMode::write()).unwrap(), 0);
            writer.append(b"record-one").unwrap();
        }
        // Flip a payload byte.
        let mut f = fs.open(path, OpenMode::read_write()).unwrap();
        let mut byte = [0u8; 1];
        f.read_at(&mut byte, HEADER_SIZE as u64 + 2).unwrap();
        f.seek(HEADER_SIZE as u64 + 2).unwrap();
        f.write_all(&[byte[0] ^ 0xff]).unwrap();

        let mut reader = LogReader::new(fs.open(path, OpenMode::read()).unwrap());
        let mut scratch = Vec::new();
        assert!(matches!(
            reader.read_record(&mut scratch),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn writer_resumes_mid_block() {
        let fs = MemFs::new();
        let path = Path::new("/wal");
        let mut writer = LogWriter::new(fs.open(path, OpenMode::write()).unwrap(), 0);
        writer.append(b"first").unwrap();
        let offset = writer.offset();
        drop(writer);

        let mut file = fs.open(path, OpenMode::read_write()).unwrap();
        file.seek(offset).unwrap();
        let mut writer = LogWriter::new(file, offset);
        writer.append(b"second").unwrap();

        let mut reader = LogReader::new(fs.open(path, OpenMode::read()).unwrap());
        let mut scratch = Vec::new();
        assert!(reader.read_record(&mut scratch).unwrap());
        assert_eq!(scratch, b"first");
        assert!(reader.read_record(&mut scratch).unwrap());
        assert_eq!(scratch, b"second");
        assert!(!reader.read_record(&mut scratch).unwrap());
    }
}
