//! Crash and recovery behavior: torn log tails, multi-log replay, and
//! directory hygiene after restarts.

use std::path::Path;
use std::sync::Arc;

use emberdb::filenames::{self, FileKind};
use emberdb::fs::{FileSystem, MemFs, OpenMode};
use emberdb::{Iter, Options, ReadOptions, WriteOptions, DB};

fn mem_options(fs: &MemFs) -> Options {
    Options::default().fs(Arc::new(fs.clone()))
}

fn count_entries(db: &DB) -> usize {
    let mut it = db.all(ReadOptions::default());
    let mut n = 0;
    let mut ok = it.first();
    while ok {
        n += 1;
        ok = it.next();
    }
    n
}

fn log_files(fs: &MemFs, dir: &Path) -> Vec<String> {
    let mut logs: Vec<String> = fs
        .list(dir)
        .unwrap()
        .into_iter()
        .filter(|name| matches!(filenames::parse(name), FileKind::Log(_)))
        .collect();
    logs.sort();
    logs
}

#[test]
fn torn_log_tail_is_truncated() {
    let fs = MemFs::new();
    let db = DB::open("/db", mem_options(&fs)).unwrap();
    for i in 0..100u32 {
        let key = format!("k{i:03}");
        db.put(key.as_bytes(), b"v", WriteOptions::default().sync(true))
            .unwrap();
    }
    let crashed = fs.fork();
    db.close().unwrap();

    // Tear the last record by chopping bytes off the newest log.
    let dir = Path::new("/db");
    let logs = log_files(&crashed, dir);
    let newest = dir.join(logs.last().unwrap());
    let len = crashed.open(&newest, OpenMode::read()).unwrap().len().unwrap();
    crashed
        .open(&newest, OpenMode::read_write())
        .unwrap()
        .truncate(len - 3)
        .unwrap();

    let db = DB::open("/db", mem_options(&crashed)).unwrap();
    // Exactly the torn write is gone.
    assert_eq!(count_entries(&db), 99);
    assert_eq!(
        db.get(b"k098", ReadOptions::default()).unwrap(),
        Some(b"v".to_vec())
    );
    assert_eq!(db.get(b"k099", ReadOptions::default()).unwrap(), None);

    // The database keeps working and survives another reopen.
    db.put(b"k099", b"again", WriteOptions::default()).unwrap();
    db.close().unwrap();
    let db = DB::open("/db", mem_options(&fs.fork())).unwrap();
    drop(db);
}

#[test]
fn multiple_logs_replay_in_order() {
    let fs = MemFs::new();
    let opts = mem_options(&fs).write_buffer_size(4 << 10);
    let db = DB::open("/db", opts).unwrap();
    // Enough volume to rotate logs several times; later writes overwrite
    // earlier ones so replay order matters.
    for round in 0..3u32 {
        for i in 0..500u32 {
            let key = format!("k{i:04}");
            let value = format!("round{round}");
            db.put(key.as_bytes(), value.as_bytes(), WriteOptions::default())
                .unwrap();
        }
    }
    let crashed = fs.fork();
    db.close().unwrap();

    let db = DB::open("/db", mem_options(&crashed)).unwrap();
    for i in 0..500u32 {
        let key = format!("k{i:04}");
        assert_eq!(
            db.get(key.as_bytes(), ReadOptions::default()).unwrap(),
            Some(b"round2".to_vec()),
            "{key}"
        );
    }
    db.close().unwrap();
}

#[test]
fn directory_contains_only_recognized_files() {
    let fs = MemFs::new();
    let opts = mem_options(&fs).write_buffer_size(4 << 10);
    let db = DB::open("/db", opts).unwrap();
    for i in 0..2_000u32 {
        let key = format!("k{i:05}");
        db.put(key.as_bytes(), &[7u8; 64], WriteOptions::default())
            .unwrap();
    }
    db.close().unwrap();

    let names = fs.list(Path::new("/db")).unwrap();
    assert!(names.iter().any(|n| n == "CURRENT"));
    assert!(names.iter().any(|n| n == "LOCK"));
    for name in &names {
        assert!(
            !matches!(filenames::parse(name), FileKind::Invalid),
            "unexpected file {name}"
        );
    }

    // Reopening after a quiet period still finds a consistent directory.
    let db = DB::open("/db", mem_options(&fs)).unwrap();
    assert_eq!(count_entries(&db), 2_000);
    db.close().unwrap();
}

#[test]
fn reopen_many_times_is_stable() {
    let fs = MemFs::new();
    for round in 0..5u32 {
        let db = DB::open("/db", mem_options(&fs)).unwrap();
        let key = format!("round{round}");
        db.put(key.as_bytes(), b"done", WriteOptions::default()).unwrap();
        assert_eq!(count_entries(&db), round as usize + 1);
        db.close().unwrap();
    }
}
