//! LRU page cache layered over another store
//!
//! Reads are served from fixed size pages kept in an LRU. Writes go straight
//! to the inner store (write-through) and drop the pages they touch, so the
//! cache never holds data the inner store does not.

use super::{short_read, Accessor};
use lru::LruCache;
use parking_lot::Mutex;
use std::io;
use std::num::NonZeroUsize;
use tracing::debug;

/// Bytes per cached page.
pub const PAGE_SIZE: u64 = 4096;

pub struct CachedStore<S> {
    inner: S,
    state: Mutex<CacheState>,
}

struct CacheState {
    pages: LruCache<u64, Vec<u8>>,
    /// Size of the inner store, tracked so page loads never read past it.
    size: u64,
    hits: u64,
    misses: u64,
}

impl<S: Accessor> CachedStore<S> {
    /// Wrap `inner` with a cache of `capacity` pages. A zero capacity is
    /// rejected; leave the store unwrapped to disable caching.
    pub fn new(inner: S, capacity: usize) -> io::Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: page cache needs at least one page", inner.name()),
            )
        })?;
        let size = inner.size()?;
        Ok(Self {
            inner,
            state: Mutex::new(CacheState {
                pages: LruCache::new(capacity),
                size,
                hits: 0,
                misses: 0,
            }),
        })
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Drop every cached page.
    pub fn clear(&self) {
        self.state.lock().pages.clear();
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let total = state.hits + state.misses;
        let hit_rate = if total > 0 {
            state.hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            size: state.pages.len(),
            capacity: state.pages.cap().get(),
        }
    }
}

impl<S: Accessor> Accessor for CachedStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        let end = offset + buf.len() as u64;
        if end > state.size {
            return Err(short_read(offset, buf.len(), state.size));
        }

        let mut pos = offset;
        while pos < end {
            let index = pos / PAGE_SIZE;
            let page_start = index * PAGE_SIZE;

            if state.pages.contains(&index) {
                state.hits += 1;
            } else {
                state.misses += 1;
                let len = PAGE_SIZE.min(state.size - page_start) as usize;
                let mut page = vec![0u8; len];
                self.inner.read_at(&mut page, page_start)?;
                state.pages.put(index, page);
            }

            let page = state.pages.get(&index).ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, format!("page {} not cached", index))
            })?;
            let from = (pos - page_start) as usize;
            let take = ((end - pos) as usize).min(page.len() - from);
            let at = (pos - offset) as usize;
            buf[at..at + take].copy_from_slice(&page[from..from + take]);
            pos += take as u64;
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        self.inner.write_at(buf, offset)?;

        let end = offset + buf.len() as u64;
        if !buf.is_empty() {
            for index in offset / PAGE_SIZE..=(end - 1) / PAGE_SIZE {
                state.pages.pop(&index);
            }
        }
        if end > state.size {
            // The page that held the old end is short; reload it next time.
            let old_last = state.size / PAGE_SIZE;
            state.pages.pop(&old_last);
            state.size = end;
        }
        Ok(())
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        self.inner.truncate(size)?;
        state.pages.clear();
        state.size = size;
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.state.lock().size)
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    fn close(&self) -> io::Result<()> {
        let stats = self.stats();
        debug!(
            name = %self.inner.name(),
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = stats.hit_rate,
            "Page cache statistics"
        );
        self.state.lock().pages.clear();
        self.inner.close()
    }

    fn begin_update(&self) -> io::Result<()> {
        self.inner.begin_update()
    }

    fn end_update(&self) -> io::Result<()> {
        self.inner.end_update()
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}
