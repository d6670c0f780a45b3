//! File-backed store

use super::{short_read, Accessor};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A store backed directly by a file on disk.
///
/// Reads and writes are positional, so they share the file without a
/// lock; only `close` takes it exclusively. The file length is tracked in
/// memory and refreshed by `size`.
pub struct FileStore {
    name: String,
    file: RwLock<Option<File>>,
    len: AtomicU64,
}

impl FileStore {
    /// Create (or truncate) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        debug!(path = ?path, "Created file store");
        Self::from_file(path.display().to_string(), file)
    }

    /// Open an existing file at `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!(path = ?path, "Opened file store");
        Self::from_file(path.display().to_string(), file)
    }

    /// Wrap an already opened file.
    pub fn from_file(name: impl Into<String>, file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            name: name.into(),
            file: RwLock::new(Some(file)),
            len: AtomicU64::new(len),
        })
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        let guard = self.file.read();
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{}: store is closed", self.name),
            )),
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

impl Accessor for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.with_file(|file| {
            let (want, len) = (buf.len(), self.len.load(Ordering::Acquire));
            if offset + want as u64 > len {
                return Err(short_read(offset, want, len));
            }

            read_exact_at(file, buf, offset).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => short_read(offset, want, len),
                _ => e,
            })
        })
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.with_file(|file| {
            write_all_at(file, buf, offset)?;
            self.len
                .fetch_max(offset + buf.len() as u64, Ordering::AcqRel);
            Ok(())
        })
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.with_file(|file| {
            file.set_len(size)?;
            self.len.store(size, Ordering::Release);
            Ok(())
        })
    }

    fn size(&self) -> io::Result<u64> {
        self.with_file(|file| {
            let len = file.metadata()?.len();
            self.len.store(len, Ordering::Release);
            Ok(len)
        })
    }

    fn sync(&self) -> io::Result<()> {
        self.with_file(|file| file.sync_all())
    }

    fn close(&self) -> io::Result<()> {
        match self.file.write().take() {
            Some(file) => {
                file.sync_all()?;
                debug!(name = %self.name, "Closed file store");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
