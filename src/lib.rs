//! emberdb is an embedded, ordered key-value storage engine organized as
//! a log-structured merge tree: writes land in a write-ahead log and an
//! in-memory table, immutable sorted table files hold older data across
//! seven levels, and background compactions keep reads and space bounded.
//!
//! ```no_run
//! use emberdb::{Options, ReadOptions, WriteOptions, DB};
//!
//! # fn main() -> emberdb::Result<()> {
//! let db = DB::open("/tmp/demo-db", Options::default())?;
//! db.put(b"key", b"value", WriteOptions::default())?;
//! assert_eq!(db.get(b"key", ReadOptions::default())?, Some(b"value".to_vec()));
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod compaction;
pub mod comparator;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod filenames;
pub mod filter;
pub mod flock;
pub mod fs;
pub mod iterator;
pub mod keys;
pub mod memtable;
pub mod snapshot;
pub mod table;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use comparator::{BytewiseComparator, Comparator};
pub use config::{Compression, Options, ReadOptions, WriteOptions};
pub use db::DB;
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use iterator::Iter;
pub use snapshot::Snapshot;
