use byteorder::{ByteOrder, LittleEndian};

use super::{record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::fs::File;

/// Reads framed records back from a log file.
///
/// `read_record` returns `Ok(false)` at a clean end of file and
/// [`Error::IncompleteRecord`] at a torn tail; [`offset`](Self::offset) then
/// points just past the last complete record, which is where recovery
/// truncates before reusing the file.
pub struct LogReader {
    file: Box<dyn File>,
    buf: Vec<u8>,
    pos: usize,
    file_read: u64,
    eof: bool,
    record_end: u64,
}

impl LogReader {
    pub fn new(file: Box<dyn File>) -> Self {
        LogReader {
            file,
            buf: Vec::new(),
            pos: 0,
            file_read: 0,
            eof: false,
            record_end: 0,
        }
    }

    /// Reads the next record into `scratch` (replacing its contents).
    pub fn read_record(&mut self, scratch: &mut Vec<u8>) -> Result<bool> {
        scratch.clear();
        let mut in_fragment = false;
        loop {
            if self.buf.len() - self.pos < HEADER_SIZE {
                // The rest of the block is trailer padding.
                if self.eof {
                    return self.end_of_input(in_fragment);
                }
                self.load_block()?;
                if self.buf.is_empty() && self.eof {
                    return self.end_of_input(in_fragment);
                }
                continue;
            }

            let header = &self.buf[self.pos..self.pos + HEADER_SIZE];
            let stored_crc = LittleEndian::read_u32(&header[0..4]);
            let len = LittleEndian::read_u16(&header[4..6]) as usize;
            let ty = header[6];

            if ty == 0 && len == 0 && stored_crc == 0 {
                // Zero-filled space is only legitimate at a torn tail.
                if self.eof {
                    return self.end_of_input(in_fragment);
                }
                return Err(Error::Corruption("zeroed log record".to_string()));
            }

            if self.pos + HEADER_SIZE + len > self.buf.len() {
                if self.eof {
                    // Payload cut short by a crash.
                    return Err(Error::IncompleteRecord);
                }
                return Err(Error::Corruption(
                    "record length past block end".to_string(),
                ));
            }

            let ty = RecordType::from_u8(ty)
                .ok_or_else(|| Error::Corruption(format!("unknown record type {ty}")))?;
            let payload_start = self.pos + HEADER_SIZE;
            let payload = &self.buf[payload_start..payload_start + len];
            if stored_crc != record_crc(ty as u8, payload) {
                return Err(Error::Corruption("log record checksum mismatch".to_string()));
            }

            self.pos += HEADER_SIZE + len;
            match ty {
                RecordType::Full => {
                    if in_fragment {
                        return Err(Error::Corruption(
                            "full record inside fragmented record".to_string(),
                        ));
                    }
                    scratch.extend_from_slice(payload);
                    self.record_end = self.consumed_offset();
                    return Ok(true);
                }
                RecordType::First => {
                    if in_fragment {
                        return Err(Error::Corruption(
                            "first record inside fragmented record".to_string(),
                        ));
                    }
                    scratch.extend_from_slice(payload);
                    in_fragment = true;
                }
                RecordType::Middle => {
                    if !in_fragment {
                        return Err(Error::Corruption(
                            "middle record without first".to_string(),
                        ));
                    }
                    scratch.extend_from_slice(payload);
                }
                RecordType::Last => {
                    if !in_fragment {
                        return Err(Error::Corruption("last record without first".to_string()));
                    }
                    scratch.extend_from_slice(payload);
                    self.record_end = self.consumed_offset();
                    return Ok(true);
                }
            }
        }
    }

    /// File offset just past the last complete record returned.
    pub fn offset(&self) -> u64 {
        self.record_end
    }

    /// Hands the file back, e.g. so recovery can truncate and append.
    pub fn into_file(self) -> Box<dyn File> {
        self.file
    }

    fn end_of_input(&self, in_fragment: bool) -> Result<bool> {
        if in_fragment {
            // First/Middle fragments without a Last: torn tail.
            return Err(Error::IncompleteRecord);
        }
        Ok(false)
    }

    fn consumed_offset(&self) -> u64 {
        self.file_read - (self.buf.len() - self.pos) as u64
    }

    fn load_block(&mut self) -> Result<()> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < BLOCK_SIZE {
            self.eof = true;
        }
        block.truncate(filled);
        self.buf = block;
        self.pos = 0;
        self.file_read += filled as u64;
        Ok(())
    }
}
