use byteorder::{ByteOrder, LittleEndian};

use super::{record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::error::Result;
use crate::fs::File;

const ZEROES: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Appends framed records to a log file.
pub struct LogWriter {
    file: Box<dyn File>,
    offset: u64,
    block_offset: usize,
}

impl LogWriter {
    /// `offset` is the file position writes continue from; recovery passes
    /// the truncation point of a reused log, fresh logs pass zero.
    pub fn new(file: Box<dyn File>, offset: u64) -> Self {
        LogWriter {
            file,
            offset,
            block_offset: (offset % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Appends one record, fragmenting across physical blocks as needed.
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    self.file.write_all(&ZEROES[..leftover])?;
                    self.offset += leftover as u64;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let frag_len = left.len().min(avail);
            let end = frag_len == left.len();
            let ty = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };
            self.emit(ty, &left[..frag_len])?;
            left = &left[frag_len..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    fn emit(&mut self, ty: RecordType, payload: &[u8]) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], record_crc(ty as u8, payload));
        LittleEndian::write_u16(&mut header[4..6], payload.len() as u16);
        header[6] = ty as u8;
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        let written = HEADER_SIZE + payload.len();
        self.offset += written as u64;
        self.block_offset += written;
        Ok(())
    }

    /// File position after the last appended record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }
}
