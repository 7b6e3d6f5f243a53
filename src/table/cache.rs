use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::reader::{BlockCache, Table, TableGet};
use crate::cache::Cache;
use crate::comparator::InternalComparator;
use crate::config::{Options, ReadOptions, NON_TABLE_CACHE_FILES};
use crate::error::Result;
use crate::filenames;
use crate::fs::OpenMode;
use crate::iterator::{ErrorIter, Iter};

/// Bounded cache of open table readers keyed by file number, sharing one
/// block cache across all tables. Eviction drops the cache's reference;
/// the file handle closes when the last iterator or reader releases it.
pub struct TableCache {
    dir: PathBuf,
    opts: Arc<Options>,
    icmp: InternalComparator,
    tables: Cache<u64, Arc<Table>>,
    blocks: Arc<BlockCache>,
}

impl TableCache {
    pub fn new(dir: &Path, opts: Arc<Options>, icmp: InternalComparator) -> Self {
        let capacity = opts
            .max_open_files
            .saturating_sub(NON_TABLE_CACHE_FILES)
            .max(1);
        let blocks = Arc::new(Cache::new(opts.block_cache_size));
        TableCache {
            dir: dir.to_path_buf(),
            opts,
            icmp,
            tables: Cache::new(capacity),
            blocks,
        }
    }

    fn find(&self, number: u64, size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.get(&number) {
            return Ok(table);
        }
        let path = filenames::table_file(&self.dir, number);
        let file = match self.opts.fs.open(&path, OpenMode::read()) {
            Ok(file) => file,
            Err(_) => {
                // Databases written by older builds used the .sst suffix.
                let alt = filenames::sst_table_file(&self.dir, number);
                self.opts.fs.open(&alt, OpenMode::read())?
            }
        };
        let table = Arc::new(Table::open(
            Arc::from(file),
            number,
            size,
            self.icmp.clone(),
            &self.opts,
            self.blocks.clone(),
        )?);
        self.tables.insert(number, table.clone(), 1);
        Ok(table)
    }

    pub fn get(
        &self,
        number: u64,
        size: u64,
        ikey: &[u8],
        ropts: &ReadOptions,
    ) -> Result<TableGet> {
        self.find(number, size)?.get(ikey, ropts)
    }

    pub fn iter(&self, number: u64, size: u64, ropts: ReadOptions) -> Box<dyn Iter> {
        match self.find(number, size) {
            Ok(table) => table.iter(ropts),
            Err(err) => Box::new(ErrorIter(err)),
        }
    }

    /// Drops cached handles for a deleted table file.
    pub fn evict(&self, number: u64) {
        self.tables.remove(&number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::fs::{FileSystem, MemFs};
    use crate::keys::{append_internal_key, Kind, LookupKey};
    use crate::table::TableBuilder;

    fn icmp() -> InternalComparator {
        InternalComparator(Arc::new(BytewiseComparator))
    }

    fn write_table(fs: &MemFs, opts: &Options, dir: &Path, number: u64) -> u64 {
        let path = filenames::table_file(dir, number);
        let mut builder = TableBuilder::new(
            fs.open(&path, OpenMode::write()).unwrap(),
            icmp(),
            opts,
        );
        let mut ikey = Vec::new();
        append_internal_key(&mut ikey, b"k", number, Kind::Value);
        builder.add(&ikey, format!("v{number}").as_bytes()).unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn caches_open_tables() {
        let fs = MemFs::new();
        let dir = Path::new("/db");
        let opts = Arc::new(Options::default().fs(Arc::new(fs.clone())));
        let size = write_table(&fs, &opts, dir, 3);

        let cache = TableCache::new(dir, opts, icmp());
        let lkey = LookupKey::new(b"k", 100);
        for _ in 0..3 {
            match cache.get(3, size, lkey.internal_key(), &ReadOptions::default()) {
                Ok(TableGet::Value(v)) => assert_eq!(v, b"v3"),
                _ => panic!("expected value"),
            }
        }
    }

    #[test]
    fn missing_table_is_an_error_iter() {
        let fs = MemFs::new();
        let dir = Path::new("/db");
        let opts = Arc::new(Options::default().fs(Arc::new(fs.clone())));
        let cache = TableCache::new(dir, opts, icmp());
        let mut it = cache.iter(99, 1000, ReadOptions::default());
        assert!(!it.first());
        assert!(it.err().is_some());
    }

    #[test]
    fn evict_then_reopen() {
        let fs = MemFs::new();
        let dir = Path::new("/db");
        let opts = Arc::new(Options::default().fs(Arc::new(fs.clone())));
        let size = write_table(&fs, &opts, dir, 4);
        let cache = TableCache::new(dir, opts, icmp());
        let lkey = LookupKey::new(b"k", 100);
        assert!(cache
            .get(4, size, lkey.internal_key(), &ReadOptions::default())
            .is_ok());
        cache.evict(4);
        assert!(cache
            .get(4, size, lkey.internal_key(), &ReadOptions::default())
            .is_ok());
    }
}
