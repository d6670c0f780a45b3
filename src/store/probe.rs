//! I/O statistics probe
//!
//! Counts operations, bytes and 512-byte sectors touched by the reads and
//! writes passing through it. Stack one below and one above a
//! [`CachedStore`](super::CachedStore) to see how much I/O the cache saves.

use super::Accessor;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

const SECTOR: u64 = 512;

pub struct ProbeStore<S> {
    inner: S,
    ops_rd: AtomicU64,
    ops_wr: AtomicU64,
    bytes_rd: AtomicU64,
    bytes_wr: AtomicU64,
    sectors_rd: AtomicU64,
    sectors_wr: AtomicU64,
}

/// Snapshot of a probe's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStats {
    pub ops_rd: u64,
    pub ops_wr: u64,
    pub bytes_rd: u64,
    pub bytes_wr: u64,
    pub sectors_rd: u64,
    pub sectors_wr: u64,
}

impl ProbeStats {
    /// Average bytes per read operation.
    pub fn avg_read(&self) -> f64 {
        if self.ops_rd == 0 {
            0.0
        } else {
            self.bytes_rd as f64 / self.ops_rd as f64
        }
    }

    /// Average bytes per write operation.
    pub fn avg_write(&self) -> f64 {
        if self.ops_wr == 0 {
            0.0
        } else {
            self.bytes_wr as f64 / self.ops_wr as f64
        }
    }
}

/// Number of sectors overlapped by `len` bytes at `offset`.
fn sectors(offset: u64, len: usize) -> u64 {
    if len == 0 {
        return 0;
    }

    let first = offset / SECTOR;
    let last = (offset + len as u64 - 1) / SECTOR;
    last - first + 1
}

impl<S: Accessor> ProbeStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            ops_rd: AtomicU64::new(0),
            ops_wr: AtomicU64::new(0),
            bytes_rd: AtomicU64::new(0),
            bytes_wr: AtomicU64::new(0),
            sectors_rd: AtomicU64::new(0),
            sectors_wr: AtomicU64::new(0),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn stats(&self) -> ProbeStats {
        ProbeStats {
            ops_rd: self.ops_rd.load(Ordering::Relaxed),
            ops_wr: self.ops_wr.load(Ordering::Relaxed),
            bytes_rd: self.bytes_rd.load(Ordering::Relaxed),
            bytes_wr: self.bytes_wr.load(Ordering::Relaxed),
            sectors_rd: self.sectors_rd.load(Ordering::Relaxed),
            sectors_wr: self.sectors_wr.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        for counter in [
            &self.ops_rd,
            &self.ops_wr,
            &self.bytes_rd,
            &self.bytes_wr,
            &self.sectors_rd,
            &self.sectors_wr,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl<S: Accessor> Accessor for ProbeStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.inner.read_at(buf, offset)?;
        self.ops_rd.fetch_add(1, Ordering::Relaxed);
        self.bytes_rd.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.sectors_rd
            .fetch_add(sectors(offset, buf.len()), Ordering::Relaxed);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.inner.write_at(buf, offset)?;
        self.ops_wr.fetch_add(1, Ordering::Relaxed);
        self.bytes_wr.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.sectors_wr
            .fetch_add(sectors(offset, buf.len()), Ordering::Relaxed);
        Ok(())
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.inner.truncate(size)
    }

    fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.sync()
    }

    fn close(&self) -> io::Result<()> {
        let stats = self.stats();
        info!(
            name = %self.inner.name(),
            ops_rd = stats.ops_rd,
            ops_wr = stats.ops_wr,
            bytes_rd = stats.bytes_rd,
            bytes_wr = stats.bytes_wr,
            sectors_rd = stats.sectors_rd,
            sectors_wr = stats.sectors_wr,
            "Store I/O statistics"
        );
        self.inner.close()
    }

    fn begin_update(&self) -> io::Result<()> {
        self.inner.begin_update()
    }

    fn end_update(&self) -> io::Result<()> {
        self.inner.end_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn test_sector_count() {
        assert_eq!(sectors(0, 0), 0);
        assert_eq!(sectors(0, 1), 1);
        assert_eq!(sectors(0, 512), 1);
        assert_eq!(sectors(511, 2), 2);
        assert_eq!(sectors(1024, 1025), 3);
    }

    #[test]
    fn test_probe_counts() -> io::Result<()> {
        let probe = ProbeStore::new(MemStore::new("probe"));
        probe.write_at(&[0u8; 16], 0)?;
        probe.write_at(&[0u8; 16], 504)?;

        let mut buf = [0u8; 8];
        probe.read_at(&mut buf, 0)?;

        let stats = probe.stats();
        assert_eq!(stats.ops_wr, 2);
        assert_eq!(stats.bytes_wr, 32);
        assert_eq!(stats.sectors_wr, 3);
        assert_eq!(stats.ops_rd, 1);
        assert_eq!(stats.bytes_rd, 8);
        assert_eq!(stats.avg_read(), 8.0);

        probe.reset();
        assert_eq!(probe.stats(), ProbeStats::default());
        Ok(())
    }

    #[test]
    fn test_probe_failed_read_not_counted() {
        let probe = ProbeStore::new(MemStore::new("probe"));
        let mut buf = [0u8; 1];
        assert!(probe.read_at(&mut buf, 0).is_err());
        assert_eq!(probe.stats().ops_rd, 0);
    }
}
