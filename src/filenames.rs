//! Database file naming.
//!
//! Everything lives directly under the database directory:
//! `CURRENT`, `LOCK`, `LOG`/`LOG.old`, `NNNNNN.log`, `NNNNNN.ldb`
//! (`.sst` recognized for compatibility), `MANIFEST-NNNNNN`, and
//! `NNNNNN.dbtmp` scratch files used for atomic CURRENT updates.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Current,
    Lock,
    InfoLog,
    OldInfoLog,
    Log(u64),
    Table(u64),
    Manifest(u64),
    Temp(u64),
    Invalid,
}

pub fn current_file(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub fn info_log_file(dir: &Path) -> PathBuf {
    dir.join("LOG")
}

pub fn old_info_log_file(dir: &Path) -> PathBuf {
    dir.join("LOG.old")
}

pub fn log_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub fn table_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.ldb"))
}

pub fn sst_table_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.sst"))
}

pub fn manifest_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn temp_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

/// Classifies a bare file name from the database directory.
pub fn parse(name: &str) -> FileKind {
    match name {
        "CURRENT" => return FileKind::Current,
        "LOCK" => return FileKind::Lock,
        "LOG" => return FileKind::InfoLog,
        "LOG.old" => return FileKind::OldInfoLog,
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return match parse_number(rest) {
            Some(n) => FileKind::Manifest(n),
            None => FileKind::Invalid,
        };
    }
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if let Some(n) = parse_number(stem) {
            return match ext {
                "log" => FileKind::Log(n),
                "ldb" | "sst" => FileKind::Table(n),
                "dbtmp" => FileKind::Temp(n),
                _ => FileKind::Invalid,
            };
        }
    }
    FileKind::Invalid
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_parse_back() {
        let dir = Path::new("/db");
        let cases = [
            (log_file(dir, 7), FileKind::Log(7)),
            (table_file(dir, 123456), FileKind::Table(123456)),
            (sst_table_file(dir, 9), FileKind::Table(9)),
            (manifest_file(dir, 42), FileKind::Manifest(42)),
            (temp_file(dir, 3), FileKind::Temp(3)),
            (current_file(dir), FileKind::Current),
            (lock_file(dir), FileKind::Lock),
            (info_log_file(dir), FileKind::InfoLog),
            (old_info_log_file(dir), FileKind::OldInfoLog),
        ];
        for (path, kind) in cases {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(parse(name), kind, "{name}");
        }
    }

    #[test]
    fn garbage_is_invalid() {
        for name in ["", "foo", "123.", ".log", "12x.log", "MANIFEST-", "MANIFEST-x", "1.tmp"] {
            assert_eq!(parse(name), FileKind::Invalid, "{name}");
        }
    }

    #[test]
    fn numbers_beyond_padding_still_parse() {
        assert_eq!(parse("12345678901.log"), FileKind::Log(12345678901));
    }
}
