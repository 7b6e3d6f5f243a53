//! File-system abstraction.
//!
//! The engine performs every directory and file operation through
//! [`FileSystem`], so tests can run against an in-memory tree ([`MemFs`])
//! and recovery paths can be exercised without touching disk. [`DiskFs`] is
//! the production implementation.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::flock::FileLock;

/// How to open a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenMode {
    /// Read-only.
    pub fn read() -> Self {
        OpenMode { read: true, ..Default::default() }
    }

    /// Write, creating or truncating.
    pub fn write() -> Self {
        OpenMode { write: true, create: true, truncate: true, ..Default::default() }
    }

    /// Write, failing if the file already exists.
    pub fn write_excl() -> Self {
        OpenMode { write: true, create: true, exclusive: true, ..Default::default() }
    }

    /// Read and write without truncation. Recovery reuses the newest log
    /// this way, appending past the last valid record.
    pub fn read_write() -> Self {
        OpenMode { read: true, write: true, create: true, ..Default::default() }
    }
}

/// An open file. Sequential reads and writes advance an internal position;
/// `read_at` is positionless so table readers can share a handle.
pub trait File: Send + Sync {
    /// Reads as much of `buf` as possible at `offset`, returning the number
    /// of bytes read (short only at end of file).
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    fn sync(&self) -> Result<()>;

    fn truncate(&self, n: u64) -> Result<()>;

    fn seek(&mut self, pos: u64) -> Result<()>;

    fn len(&self) -> Result<u64>;
}

/// Held lock on the database directory; released on drop.
pub trait LockHandle: Send {}

pub trait FileSystem: Send + Sync {
    fn mkdir_all(&self, dir: &Path) -> Result<()>;

    fn lock(&self, path: &Path) -> Result<Box<dyn LockHandle>>;

    fn exists(&self, path: &Path) -> bool;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn File>>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn remove(&self, path: &Path) -> Result<()>;

    /// Bare file names in `dir`, unordered.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------- DiskFs

/// Local-disk file system.
pub struct DiskFs;

struct DiskFile(std::fs::File);

struct DiskLock(#[allow(dead_code)] FileLock);

impl LockHandle for DiskLock {}

impl FileSystem for DiskFs {
    fn mkdir_all(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn LockHandle>> {
        let lock = FileLock::lock(path)?;
        Ok(Box::new(DiskLock(lock)))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn File>> {
        let file = std::fs::OpenOptions::new()
            .read(mode.read)
            .write(mode.write)
            .create(mode.create && !mode.exclusive)
            .create_new(mode.exclusive)
            .truncate(mode.truncate)
            .open(path)?;
        Ok(Box::new(DiskFile(file)))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

impl File for DiskFile {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            match self.0.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(Read::read(&mut self.0, buf)?)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        Write::write_all(&mut self.0, data)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.0.sync_data()?;
        Ok(())
    }

    fn truncate(&self, n: u64) -> Result<()> {
        self.0.set_len(n)?;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        Seek::seek(&mut self.0, SeekFrom::Start(pos))?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

// ----------------------------------------------------------------- MemFs

/// In-memory file system for tests. Files persist across open/close within
/// one `MemFs`, so crash recovery can be simulated by reopening a database
/// on the same instance.
#[derive(Clone, Default)]
pub struct MemFs {
    inner: Arc<Mutex<MemFsInner>>,
}

#[derive(Default)]
struct MemFsInner {
    files: HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
    locked: HashMap<PathBuf, ()>,
}

struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
    readable: bool,
    writable: bool,
}

struct MemLock {
    fs: MemFs,
    path: PathBuf,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep-copies the current file contents into an independent instance
    /// with no locks held. Crash-recovery tests use this to capture the
    /// on-disk state "at the moment of the kill" while the original
    /// database keeps running.
    pub fn fork(&self) -> MemFs {
        let inner = self.inner.lock().unwrap();
        let files = inner
            .files
            .iter()
            .map(|(path, data)| {
                let copied = data.lock().unwrap().clone();
                (path.clone(), Arc::new(Mutex::new(copied)))
            })
            .collect();
        MemFs {
            inner: Arc::new(Mutex::new(MemFsInner { files, locked: HashMap::new() })),
        }
    }
}

impl LockHandle for MemLock {}

impl Drop for MemLock {
    fn drop(&mut self) {
        self.fs.inner.lock().unwrap().locked.remove(&self.path);
    }
}

impl FileSystem for MemFs {
    fn mkdir_all(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn LockHandle>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locked.insert(path.to_path_buf(), ()).is_some() {
            return Err(Error::Io(format!("{}: already locked", path.display())));
        }
        inner
            .files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        Ok(Box::new(MemLock { fs: self.clone(), path: path.to_path_buf() }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().files.contains_key(path)
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn File>> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner.files.get(path).cloned();
        let data = match existing {
            Some(_) if mode.exclusive => {
                return Err(Error::Io(format!("{}: file exists", path.display())));
            }
            Some(data) => {
                if mode.truncate {
                    data.lock().unwrap().clear();
                }
                data
            }
            None => {
                if !mode.create && !mode.exclusive {
                    return Err(Error::Io(format!("{}: no such file", path.display())));
                }
                let data = Arc::new(Mutex::new(Vec::new()));
                inner.files.insert(path.to_path_buf(), data.clone());
                data
            }
        };
        Ok(Box::new(MemFile {
            data,
            pos: 0,
            readable: mode.read,
            writable: mode.write,
        }))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.files.remove(from) {
            Some(data) => {
                inner.files.insert(to.to_path_buf(), data);
                Ok(())
            }
            None => Err(Error::Io(format!("{}: no such file", from.display()))),
        }
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.files.remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::Io(format!("{}: no such file", path.display()))),
        }
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut names = Vec::new();
        for path in inner.files.keys() {
            if path.parent() == Some(dir) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if !self.readable {
            return Err(Error::Io("file not open for reading".to_string()));
        }
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at_pos(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::Io("file not open for writing".to_string()));
        }
        let mut contents = self.data.lock().unwrap();
        let pos = self.pos as usize;
        if contents.len() < pos {
            contents.resize(pos, 0);
        }
        let overlap = (contents.len() - pos).min(data.len());
        contents[pos..pos + overlap].copy_from_slice(&data[..overlap]);
        contents.extend_from_slice(&data[overlap..]);
        self.pos += data.len() as u64;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, n: u64) -> Result<()> {
        self.data.lock().unwrap().truncate(n as usize);
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }
}

impl MemFile {
    fn read_at_pos(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(Error::Io("file not open for reading".to_string()));
        }
        let data = self.data.lock().unwrap();
        let pos = self.pos as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        Ok(n)
    }
}
