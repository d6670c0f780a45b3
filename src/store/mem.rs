//! In-memory store
//!
//! The whole image lives in memory. When backed by a file, the image is
//! loaded on open and written back only by `sync` and `close`, so content
//! written since the last sync is lost on a crash. Meant for small stores
//! and for tests.

use super::{short_read, Accessor};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub struct MemStore {
    name: String,
    image: RwLock<Vec<u8>>,
    backing: Mutex<Option<File>>,
    closed: AtomicBool,
}

impl MemStore {
    /// A volatile store that is never written anywhere.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: RwLock::new(Vec::new()),
            backing: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// An empty store that is flushed to the file at `path` on sync/close.
    /// Any existing file content is discarded.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            name: path.display().to_string(),
            image: RwLock::new(Vec::new()),
            backing: Mutex::new(Some(file)),
            closed: AtomicBool::new(false),
        })
    }

    /// Load the file at `path` into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        debug!(path = ?path, bytes = image.len(), "Loaded memory store image");

        Ok(Self {
            name: path.display().to_string(),
            image: RwLock::new(image),
            backing: Mutex::new(Some(file)),
            closed: AtomicBool::new(false),
        })
    }

    /// Copy of the current image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.image.read().clone()
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{}: store is closed", self.name),
            ));
        }
        Ok(())
    }
}

impl Accessor for MemStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.check_open()?;
        let image = self.image.read();
        let size = image.len() as u64;
        let end = offset + buf.len() as u64;
        if end > size {
            return Err(short_read(offset, buf.len(), size));
        }

        buf.copy_from_slice(&image[offset as usize..end as usize]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.check_open()?;
        let mut image = self.image.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > image.len() {
            image.resize(end, 0);
        }

        image[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.check_open()?;
        self.image.write().resize(size as usize, 0);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        self.check_open()?;
        Ok(self.image.read().len() as u64)
    }

    fn sync(&self) -> io::Result<()> {
        self.check_open()?;
        let mut backing = self.backing.lock();
        let file = match backing.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };

        let image = self.image.read();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&image)?;
        file.set_len(image.len() as u64)?;
        file.sync_all()
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        self.sync()?;
        self.backing.lock().take();
        self.closed.store(true, Ordering::Release);
        debug!(name = %self.name, "Closed memory store");
        Ok(())
    }
}
