//! Prefix-compressed key-ordered blocks.
//!
//! ```text
//! entry:   [shared: varint][unshared: varint][value_len: varint]
//!          [key tail][value]
//! trailer: [restart offsets: u32 x R][R: u32]
//! ```
//!
//! `shared` counts leading bytes reused from the previous key. Every
//! `restart_interval` entries compression resets (`shared = 0`), giving
//! binary search an anchor.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::comparator::InternalComparator;
use crate::encoding::{get_varint32, put_varint32};
use crate::error::{Error, Result};
use crate::iterator::Iter;

const SIZE_U32: usize = 4;

/// Key order used inside a block: internal keys for data and index blocks,
/// raw bytes for the meta-index.
#[derive(Clone)]
pub enum BlockCmp {
    Internal(InternalComparator),
    Raw,
}

impl BlockCmp {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            BlockCmp::Internal(icmp) => icmp.compare(a, b),
            BlockCmp::Raw => a.cmp(b),
        }
    }
}

pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval > 0, "restart interval must be positive");
        BlockBuilder {
            buf: Vec::new(),
            restarts: vec![0],
            restart_interval,
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Keys must arrive in strictly ascending block order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished, "add after finish");

        let mut shared = 0;
        if self.counter < self.restart_interval {
            let max = self.last_key.len().min(key.len());
            while shared < max && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
        }

        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, (key.len() - shared) as u32);
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    pub fn finish(&mut self) -> &[u8] {
        assert!(!self.finished);
        let mut scratch = [0u8; SIZE_U32];
        for &offset in &self.restarts {
            LittleEndian::write_u32(&mut scratch, offset);
            self.buf.extend_from_slice(&scratch);
        }
        LittleEndian::write_u32(&mut scratch, self.restarts.len() as u32);
        self.buf.extend_from_slice(&scratch);
        self.finished = true;
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * SIZE_U32 + SIZE_U32
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

/// A decoded block; shared between the cache and live iterators.
pub struct Block {
    data: Vec<u8>,
    restarts_offset: usize,
    num_restarts: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < SIZE_U32 {
            return Err(Error::Corruption("block too short".to_string()));
        }
        let num_restarts = LittleEndian::read_u32(&data[data.len() - SIZE_U32..]) as usize;
        if num_restarts == 0 {
            return Err(Error::Corruption("block has no restart points".to_string()));
        }
        let trailer = (num_restarts + 1) * SIZE_U32;
        if data.len() < trailer {
            return Err(Error::Corruption("block restart array truncated".to_string()));
        }
        let restarts_offset = data.len() - trailer;
        Ok(Block { data, restarts_offset, num_restarts })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, index: usize) -> usize {
        let off = self.restarts_offset + index * SIZE_U32;
        LittleEndian::read_u32(&self.data[off..off + SIZE_U32]) as usize
    }

    pub fn iter(self: &Arc<Self>, cmp: BlockCmp) -> BlockIter {
        BlockIter {
            block: self.clone(),
            cmp,
            current: 0,
            next_offset: 0,
            restart_index: 0,
            key: Vec::new(),
            value: (0, 0),
            valid: false,
            opened: false,
            err: None,
        }
    }
}

/// Cursor over one block. The value is a borrowed view into the block
/// buffer; the key is reassembled from shared prefixes into an owned
/// buffer.
pub struct BlockIter {
    block: Arc<Block>,
    cmp: BlockCmp,
    /// Offset of the current entry.
    current: usize,
    /// Offset where the next entry starts.
    next_offset: usize,
    restart_index: usize,
    key: Vec<u8>,
    value: (usize, usize),
    valid: bool,
    opened: bool,
    err: Option<Error>,
}

impl BlockIter {
    fn corrupt(&mut self, msg: &str) -> bool {
        self.valid = false;
        self.err = Some(Error::Corruption(msg.to_string()));
        false
    }

    fn seek_to_restart(&mut self, index: usize) {
        self.restart_index = index;
        self.next_offset = self.block.restart_point(index);
        self.key.clear();
        self.valid = false;
    }

    /// Decodes the entry at `next_offset` and makes it current.
    fn parse_next(&mut self) -> bool {
        self.opened = true;
        if self.next_offset >= self.block.restarts_offset {
            self.valid = false;
            return false;
        }
        let data = &self.block.data[..self.block.restarts_offset];
        let entry_start = self.next_offset;
        let mut pos = entry_start;

        let (shared, n) = match get_varint32(&data[pos..]) {
            Ok(v) => v,
            Err(_) => return self.corrupt("bad entry varint"),
        };
        pos += n;
        let (non_shared, n) = match get_varint32(&data[pos..]) {
            Ok(v) => v,
            Err(_) => return self.corrupt("bad entry varint"),
        };
        pos += n;
        let (value_len, n) = match get_varint32(&data[pos..]) {
            Ok(v) => v,
            Err(_) => return self.corrupt("bad entry varint"),
        };
        pos += n;

        let (shared, non_shared, value_len) =
            (shared as usize, non_shared as usize, value_len as usize);
        if shared > self.key.len() || pos + non_shared + value_len > data.len() {
            return self.corrupt("entry out of bounds");
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&data[pos..pos + non_shared]);
        pos += non_shared;
        self.value = (pos, pos + value_len);

        self.current = entry_start;
        self.next_offset = pos + value_len;
        while self.restart_index + 1 < self.block.num_restarts
            && self.block.restart_point(self.restart_index + 1) <= self.current
        {
            self.restart_index += 1;
        }
        self.valid = true;
        true
    }
}

impl Iter for BlockIter {
    fn valid(&self) -> bool {
        self.valid
    }

    fn first(&mut self) -> bool {
        self.seek_to_restart(0);
        self.parse_next()
    }

    fn last(&mut self) -> bool {
        self.seek_to_restart(self.block.num_restarts - 1);
        while self.parse_next() {
            if self.next_offset >= self.block.restarts_offset {
                break;
            }
        }
        self.valid
    }

    fn seek(&mut self, target: &[u8]) -> bool {
        // Binary search for the last restart whose key is < target, then
        // scan forward within its group.
        let mut left = 0;
        let mut right = self.block.num_restarts;
        while left < right {
            let mid = left + (right - left) / 2;
            self.seek_to_restart(mid);
            if !self.parse_next() {
                return false;
            }
            if self.cmp.compare(&self.key, target) == Ordering::Less {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        self.seek_to_restart(left.saturating_sub(1));
        while self.parse_next() {
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return true;
            }
        }
        self.valid = false;
        self.valid
    }

    fn next(&mut self) -> bool {
        if !self.opened {
            return self.first();
        }
        if !self.valid {
            return false;
        }
        self.parse_next()
    }

    fn prev(&mut self) -> bool {
        if !self.opened {
            return self.last();
        }
        if !self.valid {
            return false;
        }
        // Rescan from the restart point preceding the current entry.
        let original = self.current;
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.valid = false;
                return false;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart(self.restart_index);
        loop {
            if !self.parse_next() {
                return false;
            }
            if self.next_offset >= original {
                return true;
            }
        }
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value.0..self.value.1]
    }

    fn err(&self) -> Option<Error> {
        self.err.clone()
    }
}
