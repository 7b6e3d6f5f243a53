//! Immutable sorted tables.
//!
//! ```text
//! +---------------------+
//! | data blocks ...     |
//! | filter block        |  (optional)
//! | meta-index block    |  "filter.<name>" -> handle
//! | data-index block    |
//! | footer (48 bytes)   |
//! +---------------------+
//! ```
//!
//! Each block is stored as `[data][type: u8][crc32c: u32]`; the checksum
//! covers `data || type` and uses the same masked Castagnoli CRC as the
//! log. `type` selects the compression codec.

mod block;
mod builder;
mod filter_block;
mod reader;

pub mod cache;

pub use block::{Block, BlockBuilder, BlockCmp, BlockIter};
pub use builder::TableBuilder;
pub use cache::TableCache;
pub use filter_block::{FilterBlockBuilder, FilterBlockReader};
pub use reader::{Table, TableGet};

use byteorder::{ByteOrder, LittleEndian};

use crate::config::Compression;
use crate::encoding::{get_varint64, put_varint64, MAX_VARINT64_LEN};
use crate::error::{Error, Result};
use crate::fs::File;
use crate::wal::{mask_crc, unmask_crc, CRC32C};

pub const TABLE_MAGIC: u64 = 0xdb4775248b80fb57;

pub const FOOTER_LEN: usize = 48;

/// Compression type byte plus checksum.
pub const BLOCK_TRAILER_LEN: usize = 5;

/// Location of a block inside a table file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.length);
    }

    pub fn decode_from(data: &[u8]) -> Result<(BlockHandle, usize)> {
        let (offset, n) = get_varint64(data)?;
        let (length, m) = get_varint64(&data[n..])?;
        Ok((BlockHandle { offset, length }, n + m))
    }
}

/// Table footer: the two index handles, zero-padded, then the magic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    pub meta_index: BlockHandle,
    pub data_index: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut handles = Vec::with_capacity(4 * MAX_VARINT64_LEN);
        self.meta_index.encode_to(&mut handles);
        self.data_index.encode_to(&mut handles);

        let mut buf = [0u8; FOOTER_LEN];
        buf[..handles.len()].copy_from_slice(&handles);
        LittleEndian::write_u64(&mut buf[FOOTER_LEN - 8..], TABLE_MAGIC);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Footer> {
        if data.len() < FOOTER_LEN {
            return Err(Error::Corruption("footer too short".to_string()));
        }
        let magic = LittleEndian::read_u64(&data[FOOTER_LEN - 8..FOOTER_LEN]);
        if magic != TABLE_MAGIC {
            return Err(crate::corrupt!("bad table magic {magic:#018x}"));
        }
        let (meta_index, n) = BlockHandle::decode_from(data)?;
        let (data_index, _) = BlockHandle::decode_from(&data[n..])?;
        Ok(Footer { meta_index, data_index })
    }
}

/// Appends `data` with its trailer to an open table file, returning the
/// bytes written. Used by the table builder for every block kind.
pub(crate) fn write_raw_block(
    file: &mut dyn File,
    data: &[u8],
    compression: Compression,
) -> Result<usize> {
    let mut trailer = [0u8; BLOCK_TRAILER_LEN];
    trailer[0] = compression as u8;
    let mut digest = CRC32C.digest();
    digest.update(data);
    digest.update(&trailer[..1]);
    LittleEndian::write_u32(&mut trailer[1..], mask_crc(digest.finalize()));
    file.write_all(data)?;
    file.write_all(&trailer)?;
    Ok(data.len() + BLOCK_TRAILER_LEN)
}

/// Reads and decodes the block at `handle`, verifying the checksum when
/// asked and undoing compression.
pub(crate) fn read_raw_block(
    file: &dyn File,
    handle: BlockHandle,
    verify_checksums: bool,
) -> Result<Vec<u8>> {
    let total = handle.length as usize + BLOCK_TRAILER_LEN;
    let mut buf = vec![0u8; total];
    let n = file.read_at(&mut buf, handle.offset)?;
    if n != total {
        return Err(Error::Corruption("truncated block read".to_string()));
    }
    let data_len = handle.length as usize;
    let ty = buf[data_len];
    if verify_checksums {
        let stored = unmask_crc(LittleEndian::read_u32(&buf[data_len + 1..]));
        let actual = CRC32C.checksum(&buf[..data_len + 1]);
        if stored != actual {
            return Err(Error::Corruption("block checksum mismatch".to_string()));
        }
    }
    let compression = Compression::from_u8(ty)
        .ok_or_else(|| Error::Corruption(format!("bad block type {ty}")))?;
    buf.truncate(data_len);
    match compression {
        Compression::None => Ok(buf),
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(&buf)
            .map_err(|e| Error::Corruption(format!("snappy: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_roundtrip() {
        let handle = BlockHandle { offset: 123456789, length: 4096 };
        let mut buf = Vec::new();
        handle.encode_to(&mut buf);
        let (decoded, n) = BlockHandle::decode_from(&buf).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn footer_roundtrip() {
        let footer = Footer {
            meta_index: BlockHandle { offset: 1000, length: 64 },
            data_index: BlockHandle { offset: 1069, length: 512 },
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_LEN);
        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded.meta_index, footer.meta_index);
        assert_eq!(decoded.data_index, footer.data_index);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let mut encoded = Footer::default().encode();
        encoded[FOOTER_LEN - 1] ^= 0xff;
        assert!(matches!(Footer::decode(&encoded), Err(Error::Corruption(_))));
    }

    #[test]
    fn raw_block_roundtrip_with_checksum() {
        use crate::fs::{FileSystem, MemFs, OpenMode};
        use std::path::Path;

        let fs = MemFs::new();
        let path = Path::new("/t");
        let payload = b"some block payload".to_vec();
        {
            let mut f = fs.open(path, OpenMode::write()).unwrap();
            write_raw_block(f.as_mut(), &payload, Compression::None).unwrap();
        }
        let f = fs.open(path, OpenMode::read()).unwrap();
        let handle = BlockHandle { offset: 0, length: payload.len() as u64 };
        assert_eq!(read_raw_block(f.as_ref(), handle, true).unwrap(), payload);

        // Corrupt one byte; checksum verification must notice.
        let mut f = fs.open(path, OpenMode::read_write()).unwrap();
        f.seek(3).unwrap();
        f.write_all(&[0xff]).unwrap();
        let f = fs.open(path, OpenMode::read()).unwrap();
        assert!(read_raw_block(f.as_ref(), handle, true).is_err());
    }

    #[test]
    fn snappy_block_roundtrip() {
        use crate::fs::{FileSystem, MemFs, OpenMode};
        use std::path::Path;

        let fs = MemFs::new();
        let path = Path::new("/t");
        let payload = vec![7u8; 10_000];
        let compressed = snap::raw::Encoder::new().compress_vec(&payload).unwrap();
        {
            let mut f = fs.open(path, OpenMode::write()).unwrap();
            write_raw_block(f.as_mut(), &compressed, Compression::Snappy).unwrap();
        }
        let f = fs.open(path, OpenMode::read()).unwrap();
        let handle = BlockHandle { offset: 0, length: compressed.len() as u64 };
        assert_eq!(read_raw_block(f.as_ref(), handle, true).unwrap(), payload);
    }
}
