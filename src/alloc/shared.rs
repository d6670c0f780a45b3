//! Thread-safe wrapper around [`AtomAllocator`]

use super::allocator::AtomAllocator;
use super::audit::AuditReport;
use super::handle::Handle;
use crate::error::Result;
use crate::store::Accessor;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An allocator behind a reader/writer lock.
///
/// Structural operations take the write lock; reads and audits share the
/// read lock. Use [`write_lock`](Self::write_lock) to run several
/// operations as one unit.
pub struct SharedAllocator<S: Accessor> {
    inner: RwLock<AtomAllocator<S>>,
}

impl<S: Accessor> SharedAllocator<S> {
    pub fn new(allocator: AtomAllocator<S>) -> Self {
        Self {
            inner: RwLock::new(allocator),
        }
    }

    pub fn alloc(&self, content: &[u8]) -> Result<Handle> {
        self.inner.write().alloc(content)
    }

    pub fn free(&self, handle: Handle) -> Result<()> {
        self.inner.write().free(handle)
    }

    pub fn realloc(&self, handle: Handle, content: &[u8], keep_handle: bool) -> Result<Handle> {
        self.inner.write().realloc(handle, content, keep_handle)
    }

    pub fn read(&self, handle: Handle) -> Result<Vec<u8>> {
        self.inner.read().read(handle)
    }

    pub fn audit(&self) -> Result<AuditReport> {
        self.inner.read().audit()
    }

    pub fn read_lock(&self) -> RwLockReadGuard<'_, AtomAllocator<S>> {
        self.inner.read()
    }

    pub fn write_lock(&self) -> RwLockWriteGuard<'_, AtomAllocator<S>> {
        self.inner.write()
    }

    pub fn into_inner(self) -> AtomAllocator<S> {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_writers() -> Result<()> {
        let shared = Arc::new(SharedAllocator::new(AtomAllocator::create(MemStore::new("shared"))?));

        let workers: Vec<_> = (0..4u8)
            .map(|t| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || -> Result<Vec<(Handle, Vec<u8>)>> {
                    let mut kept = Vec::new();
                    for i in 0..50u8 {
                        let content = vec![t ^ i; (i as usize * 7) % 90];
                        let h = shared.alloc(&content)?;
                        if i % 3 == 0 {
                            shared.free(h)?;
                        } else {
                            kept.push((h, content));
                        }
                    }
                    Ok(kept)
                })
            })
            .collect();

        for worker in workers {
            for (h, content) in worker.join().unwrap()? {
                assert_eq!(shared.read(h)?, content);
            }
        }
        shared.audit()?;
        Ok(())
    }

    #[test]
    fn test_write_lock_groups_operations() -> Result<()> {
        let shared = SharedAllocator::new(AtomAllocator::create(MemStore::new("shared"))?);
        let h = {
            let mut a = shared.write_lock();
            let h = a.alloc(b"one")?;
            a.realloc(h, b"two", true)?
        };
        assert_eq!(shared.read_lock().read(h)?, b"two");
        assert_eq!(shared.into_inner().read(h)?, b"two");
        Ok(())
    }
}
