//! Per-table filter block.
//!
//! One filter is generated for every 2 KiB window of data-block starting
//! offsets, so probing needs only the block offset, not a filter per block:
//!
//! ```text
//! [filter 0][filter 1]...[offset of filter i: u32 x N][array start: u32][lg(base): u8]
//! ```

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::filter::FilterPolicy;

/// lg(2048): window of data-block offsets covered by one filter.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Called with the file offset each data block starts at, before its
    /// keys are added.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = (block_offset / FILTER_BASE) as usize;
        debug_assert!(filter_index >= self.filter_offsets.len());
        while self.filter_offsets.len() < filter_index {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        let mut scratch = [0u8; 4];
        for &offset in &self.filter_offsets {
            LittleEndian::write_u32(&mut scratch, offset);
            self.result.extend_from_slice(&scratch);
        }
        LittleEndian::write_u32(&mut scratch, array_offset);
        self.result.extend_from_slice(&scratch);
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            return;
        }
        let filter = self.policy.create_filter(&self.keys);
        self.result.extend_from_slice(&filter);
        self.keys.clear();
    }
}

pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    array_offset: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Returns `None` when the block is structurally unusable; the caller
    /// then reads without filtering.
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> Option<Self> {
        if data.len() < 5 {
            return None;
        }
        let base_lg = data[data.len() - 1];
        let array_offset = LittleEndian::read_u32(&data[data.len() - 5..data.len() - 1]) as usize;
        if array_offset > data.len() - 5 {
            return None;
        }
        let num_filters = (data.len() - 5 - array_offset) / 4;
        Some(FilterBlockReader { policy, data, array_offset, num_filters, base_lg })
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Offsets past the covered range err toward reading.
            return true;
        }
        let pos = self.array_offset + index * 4;
        let start = LittleEndian::read_u32(&self.data[pos..pos + 4]) as usize;
        let limit = if index + 1 < self.num_filters {
            LittleEndian::read_u32(&self.data[pos + 4..pos + 8]) as usize
        } else {
            self.array_offset
        };
        if start > limit || limit > self.array_offset {
            return true;
        }
        if start == limit {
            // Empty filter covers no keys.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..limit])
    }
}
