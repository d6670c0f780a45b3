//! Store configuration
//!
//! ```toml
//! backend = "file"      # or "memory"
//! cache_pages = 256     # 4 KiB pages in the read cache, 0 disables it
//! probe = false         # log I/O statistics on close
//! sync_on_close = true
//! ```

use crate::alloc::AtomAllocator;
use crate::error::{Error, Result};
use crate::store::{Accessor, CachedStore, FileStore, MemStore, ProbeStore};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::debug;

/// Where the store image lives while it is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Positional reads and writes on the file.
    #[default]
    File,
    /// The whole image in memory, written back on sync and close.
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Backend::File),
            "memory" | "mem" => Ok(Backend::Memory),
            other => Err(Error::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Options for building the accessor stack of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Pages held by the LRU read cache.
    pub cache_pages: usize,
    /// Wrap the store in an I/O statistics probe.
    pub probe: bool,
    pub sync_on_close: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::File,
            cache_pages: 0,
            probe: false,
            sync_on_close: true,
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Create (or truncate) the store at `path` and build its stack.
    pub fn create<P: AsRef<Path>>(&self, path: P) -> Result<Box<dyn Accessor>> {
        self.build(path.as_ref(), true)
    }

    /// Open the existing store at `path` and build its stack.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Box<dyn Accessor>> {
        self.build(path.as_ref(), false)
    }

    /// Close `allocator`, syncing it first when configured to.
    pub fn close<S: Accessor>(&self, allocator: AtomAllocator<S>) -> Result<()> {
        if self.sync_on_close {
            allocator.sync()?;
        }
        allocator.close()
    }

    fn build(&self, path: &Path, create: bool) -> Result<Box<dyn Accessor>> {
        let op = if create { "create" } else { "open" };
        let wrap = |source: io::Error| Error::Io {
            name: path.display().to_string(),
            op,
            source,
        };

        let mut store: Box<dyn Accessor> = match (self.backend, create) {
            (Backend::File, true) => Box::new(FileStore::create(path).map_err(wrap)?),
            (Backend::File, false) => Box::new(FileStore::open(path).map_err(wrap)?),
            (Backend::Memory, true) => Box::new(MemStore::create(path).map_err(wrap)?),
            (Backend::Memory, false) => Box::new(MemStore::open(path).map_err(wrap)?),
        };

        if self.cache_pages > 0 {
            store = Box::new(CachedStore::new(store, self.cache_pages).map_err(wrap)?);
        }
        if self.probe {
            store = Box::new(ProbeStore::new(store));
        }

        debug!(
            path = %path.display(),
            op,
            backend = ?self.backend,
            cache_pages = self.cache_pages,
            probe = self.probe,
            "Built store stack"
        );
        Ok(store)
    }
}
