use std::sync::Arc;

use super::{read_raw_block, Block, BlockCmp, BlockHandle, Footer, FOOTER_LEN};
use crate::cache::Cache;
use crate::comparator::InternalComparator;
use crate::config::{Options, ReadOptions};
use crate::error::{Error, Result};
use crate::fs::File;
use crate::iterator::{ErrorIter, IndexIter, Iter};
use crate::keys::{self, Kind};
use crate::table::filter_block::FilterBlockReader;

/// Result of a point lookup inside one table.
pub enum TableGet {
    /// Newest revision at or below the lookup sequence is a value.
    Value(Vec<u8>),
    /// Newest such revision is a deletion marker.
    Deleted,
    /// The table holds no revision of the key. `read_block` reports
    /// whether answering required a data-block read; such misses charge
    /// the file's seek budget.
    NotFound { read_block: bool },
}

/// Shared key for decoded data blocks: `(file_number, block_offset)`.
pub type BlockCache = Cache<(u64, u64), Arc<Block>>;

/// An open sorted-table file: parsed footer and index, lazily read data
/// blocks.
pub struct Table {
    file: Arc<dyn File>,
    file_number: u64,
    icmp: InternalComparator,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
    block_cache: Arc<BlockCache>,
}

impl Table {
    pub fn open(
        file: Arc<dyn File>,
        file_number: u64,
        file_size: u64,
        icmp: InternalComparator,
        opts: &Options,
        block_cache: Arc<BlockCache>,
    ) -> Result<Table> {
        if file_size < FOOTER_LEN as u64 {
            return Err(Error::Corruption("table shorter than footer".to_string()));
        }
        let mut footer_buf = [0u8; FOOTER_LEN];
        let n = file.read_at(&mut footer_buf, file_size - FOOTER_LEN as u64)?;
        if n != FOOTER_LEN {
            return Err(Error::Corruption("truncated footer read".to_string()));
        }
        let footer = Footer::decode(&footer_buf)?;

        let index_data = read_raw_block(file.as_ref(), footer.data_index, true)?;
        let index_block = Arc::new(Block::new(index_data)?);

        let filter = match &opts.filter_policy {
            Some(policy) => {
                Self::load_filter(file.as_ref(), footer.meta_index, policy.clone())?
            }
            None => None,
        };

        Ok(Table {
            file,
            file_number,
            icmp,
            index_block,
            filter,
            block_cache,
        })
    }

    fn load_filter(
        file: &dyn File,
        meta_handle: BlockHandle,
        policy: Arc<dyn crate::filter::FilterPolicy>,
    ) -> Result<Option<FilterBlockReader>> {
        if meta_handle.length == 0 {
            return Ok(None);
        }
        let meta_data = read_raw_block(file, meta_handle, true)?;
        let meta_block = Arc::new(Block::new(meta_data)?);
        let mut it = meta_block.iter(BlockCmp::Raw);
        let name = format!("filter.{}", policy.name());
        if !it.seek(name.as_bytes()) || it.key() != name.as_bytes() {
            // Built without this policy (or none at all): read unfiltered.
            return Ok(None);
        }
        let (handle, _) = BlockHandle::decode_from(it.value())?;
        let filter_data = read_raw_block(file, handle, true)?;
        Ok(FilterBlockReader::new(policy, filter_data))
    }

    fn read_block(&self, handle: BlockHandle, ropts: &ReadOptions) -> Result<Arc<Block>> {
        let key = (self.file_number, handle.offset);
        if let Some(block) = self.block_cache.get(&key) {
            return Ok(block);
        }
        let data = read_raw_block(self.file.as_ref(), handle, ropts.verify_checksums)?;
        let block = Arc::new(Block::new(data)?);
        if !ropts.dont_fill_cache {
            self.block_cache.insert(key, block.clone(), block.size());
        }
        Ok(block)
    }

    /// Finds the newest revision of the lookup key's user key with
    /// sequence at or below the lookup sequence.
    pub fn get(&self, ikey: &[u8], ropts: &ReadOptions) -> Result<TableGet> {
        let mut index_it = self.index_block.iter(BlockCmp::Internal(self.icmp.clone()));
        if !index_it.seek(ikey) {
            if let Some(err) = index_it.err() {
                return Err(err);
            }
            return Ok(TableGet::NotFound { read_block: false });
        }
        let (handle, _) = BlockHandle::decode_from(index_it.value())?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, keys::user_key(ikey)) {
                return Ok(TableGet::NotFound { read_block: false });
            }
        }

        let block = self.read_block(handle, ropts)?;
        let mut it = block.iter(BlockCmp::Internal(self.icmp.clone()));
        if it.seek(ikey) {
            let found = it.key();
            let ucmp = self.icmp.user_comparator();
            if ucmp
                .compare(keys::user_key(found), keys::user_key(ikey))
                .is_eq()
            {
                let (_, _, kind) = keys::parse_internal_key(found)?;
                return Ok(match kind {
                    Kind::Value => TableGet::Value(it.value().to_vec()),
                    Kind::Deletion => TableGet::Deleted,
                });
            }
        }
        if let Some(err) = it.err() {
            return Err(err);
        }
        Ok(TableGet::NotFound { read_block: true })
    }

    /// Two-level cursor: index block over lazily loaded data blocks.
    pub fn iter(self: &Arc<Self>, ropts: ReadOptions) -> Box<dyn Iter> {
        let table = self.clone();
        let index = Box::new(
            self.index_block
                .iter(BlockCmp::Internal(self.icmp.clone())),
        );
        Box::new(IndexIter::new(
            index,
            Box::new(move |handle_bytes: &[u8]| -> Box<dyn Iter> {
                let handle = match BlockHandle::decode_from(handle_bytes) {
                    Ok((handle, _)) => handle,
                    Err(err) => return Box::new(ErrorIter(err)),
                };
                match table.read_block(handle, &ropts) {
                    Ok(block) => {
                        Box::new(block.iter(BlockCmp::Internal(table.icmp.clone())))
                    }
                    Err(err) => Box::new(ErrorIter(err)),
                }
            }),
        ))
    }
}
