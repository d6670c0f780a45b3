//! Store boundary
//!
//! The allocator never touches a file directly. It talks to an [`Accessor`]:
//! a named, byte addressable container with positional reads and writes.
//!
//! # Architecture
//!
//! ```text
//! AtomAllocator
//!   └─→ ProbeStore   (optional, I/O statistics)
//!        └─→ CachedStore  (optional, LRU page cache, write-through)
//!             └─→ FileStore | MemStore
//! ```
//!
//! Wrappers are transparent: every layer implements [`Accessor`] and forwards
//! to the layer below it.

pub mod cache;
pub mod file;
pub mod mem;
pub mod probe;

pub use cache::{CacheStats, CachedStore};
pub use file::FileStore;
pub use mem::MemStore;
pub use probe::{ProbeStats, ProbeStore};

use std::io;

/// Positional I/O over a store.
///
/// All methods take `&self` so that concurrent readers can share a store;
/// implementations serialize their own reads and writes.
pub trait Accessor: Send + Sync {
    /// Name of the store as presented on creation.
    fn name(&self) -> &str;

    /// Fill all of `buf` from the store starting at `offset`.
    ///
    /// Reading past the end of the store is an error.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` at `offset`, growing the store if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Change the size of the store.
    fn truncate(&self, size: u64) -> io::Result<()>;

    /// Current size of the store in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Commit the current contents to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Release the store. No I/O may follow.
    fn close(&self) -> io::Result<()>;

    /// Start of a structural update. Calls may nest; the outermost
    /// `end_update` is an implicit commit for stores that journal.
    fn begin_update(&self) -> io::Result<()> {
        Ok(())
    }

    /// End of a structural update started by `begin_update`.
    fn end_update(&self) -> io::Result<()> {
        Ok(())
    }
}

impl<A: Accessor + ?Sized> Accessor for Box<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        (**self).write_at(buf, offset)
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        (**self).truncate(size)
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }

    fn sync(&self) -> io::Result<()> {
        (**self).sync()
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }

    fn begin_update(&self) -> io::Result<()> {
        (**self).begin_update()
    }

    fn end_update(&self) -> io::Result<()> {
        (**self).end_update()
    }
}

/// Error for a read that runs past the end of a store.
pub(crate) fn short_read(offset: u64, len: usize, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "read of {} bytes @{:#x} past end of store ({:#x} bytes)",
            len, offset, size
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boxed_accessor_forwards() -> io::Result<()> {
        let store: Box<dyn Accessor> = Box::new(MemStore::new("boxed"));
        store.write_at(b"abcdef", 2)?;
        assert_eq!(store.size()?, 8);

        let mut buf = [0u8; 4];
        store.read_at(&mut buf, 2)?;
        assert_eq!(&buf, b"abcd");
        assert_eq!(store.name(), "boxed");

        store.begin_update()?;
        store.end_update()?;
        Ok(())
    }

    #[test]
    fn test_short_read_kind() {
        let err = short_read(16, 4, 18);
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
