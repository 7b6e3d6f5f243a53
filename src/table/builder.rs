use std::borrow::Cow;

use super::{write_raw_block, BlockBuilder, BlockHandle, Footer};
use crate::comparator::InternalComparator;
use crate::config::{Compression, Options};
use crate::error::{Error, Result};
use crate::fs::File;
use crate::keys;
use crate::table::filter_block::FilterBlockBuilder;

/// Builds an immutable sorted table from internal keys added in ascending
/// order.
///
/// The index entry for a finished data block is held back until the next
/// key arrives, so the separator can sit between the block's last key and
/// the next block's first key.
pub struct TableBuilder {
    file: Box<dyn File>,
    icmp: InternalComparator,
    compression: Compression,
    block_size: usize,

    offset: u64,
    num_entries: u64,
    last_key: Vec<u8>,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    pending_index: Option<BlockHandle>,
    filter_block: Option<FilterBlockBuilder>,

    finished: bool,
}

impl TableBuilder {
    pub fn new(file: Box<dyn File>, icmp: InternalComparator, opts: &Options) -> Self {
        let mut filter_block = opts
            .filter_policy
            .clone()
            .map(FilterBlockBuilder::new);
        if let Some(fb) = &mut filter_block {
            fb.start_block(0);
        }
        TableBuilder {
            file,
            icmp,
            compression: opts.compression,
            block_size: opts.block_size,
            offset: 0,
            num_entries: 0,
            last_key: Vec::new(),
            data_block: BlockBuilder::new(opts.block_restart_interval),
            // Every index entry is a restart point, enabling binary search
            // over whole blocks.
            index_block: BlockBuilder::new(1),
            pending_index: None,
            filter_block,
            finished: false,
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.finished);
        debug_assert!(
            self.num_entries == 0 || self.icmp.compare(key, &self.last_key).is_gt(),
            "keys must be added in ascending internal order"
        );

        if let Some(handle) = self.pending_index.take() {
            let separator = self.icmp.append_successor(&self.last_key, key);
            let mut encoded = Vec::new();
            handle.encode_to(&mut encoded);
            self.index_block.add(&separator, &encoded);
        }
        if let Some(fb) = &mut self.filter_block {
            fb.add_key(keys::user_key(key));
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(self.pending_index.is_none());
        let handle = write_block(
            self.file.as_mut(),
            self.data_block.finish(),
            self.compression,
            &mut self.offset,
        )?;
        self.data_block.reset();
        self.pending_index = Some(handle);
        if let Some(fb) = &mut self.filter_block {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes the filter, meta-index, data-index, and footer. Returns the
    /// final file size.
    pub fn finish(&mut self) -> Result<u64> {
        debug_assert!(!self.finished);
        self.flush_data_block()?;
        self.finished = true;

        // Filter block, uncompressed, then its meta-index entry.
        let mut meta_index = BlockBuilder::new(16);
        if let Some(fb) = &mut self.filter_block {
            let name = fb.policy_name();
            let data = fb.finish();
            let handle = BlockHandle { offset: self.offset, length: data.len() as u64 };
            let written = write_raw_block(self.file.as_mut(), data, Compression::None)?;
            self.offset += written as u64;

            let mut encoded = Vec::new();
            handle.encode_to(&mut encoded);
            meta_index.add(format!("filter.{name}").as_bytes(), &encoded);
        }
        let meta_handle = write_block(
            self.file.as_mut(),
            meta_index.finish(),
            self.compression,
            &mut self.offset,
        )?;

        // The held-back index entry for the final block gets a successor
        // of the last key, with nothing to bound it above.
        if let Some(handle) = self.pending_index.take() {
            let separator = self.icmp.append_successor(&self.last_key, &[]);
            let mut encoded = Vec::new();
            handle.encode_to(&mut encoded);
            self.index_block.add(&separator, &encoded);
        }
        let index_handle = write_block(
            self.file.as_mut(),
            self.index_block.finish(),
            self.compression,
            &mut self.offset,
        )?;

        let footer = Footer { meta_index: meta_handle, data_index: index_handle };
        self.file.write_all(&footer.encode())?;
        self.offset += super::FOOTER_LEN as u64;
        Ok(self.offset)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn file_size(&self) -> u64 {
        self.offset + self.data_block.current_size_estimate() as u64
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

fn write_block(
    file: &mut dyn File,
    raw: &[u8],
    compression: Compression,
    offset: &mut u64,
) -> Result<BlockHandle> {
    let (data, ty): (Cow<'_, [u8]>, Compression) = match compression {
        Compression::None => (Cow::Borrowed(raw), Compression::None),
        Compression::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(raw)
                .map_err(|e| Error::Io(format!("snappy: {e}")))?;
            if compressed.len() < raw.len() {
                (Cow::Owned(compressed), Compression::Snappy)
            } else {
                // Incompressible block: store raw rather than grow it.
                (Cow::Borrowed(raw), Compression::None)
            }
        }
    };
    let handle = BlockHandle { offset: *offset, length: data.len() as u64 };
    let written = write_raw_block(file, &data, ty)?;
    *offset += written as u64;
    Ok(handle)
}
