//! Allocator core: alloc, free, realloc and read

use super::codec::{
    atoms_for, encode_relocation, encode_used, unescape, BlockKind, Boundary, ATOM_SIZE,
    MAX_ATOMS, MAX_CONTENT, SIZE_OFFSET,
};
use super::freelist::{FreeLists, CLASSES, TABLE_LEN};
use super::handle::Handle;
use super::io::StoreIo;
use crate::error::{Error, Result};
use crate::store::Accessor;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, info, warn};

/// First atom of every store. It is itself a valid 15 byte used block
/// (tag 0x0f); the last two bytes record the free table handle.
pub const SIGNATURE: [u8; 16] = [
    0x0f, 0xf1, 0xc1, 0xa1, 0xfe, 0xa5, 0x1b, 0x1e, 0, 0, 0, 0, 0, 0, 2, 0,
];

/// Space allocator over an [`Accessor`].
///
/// Mutating operations take `&mut self`; wrap the allocator in a
/// [`SharedAllocator`](super::SharedAllocator) to share it between threads.
pub struct AtomAllocator<S: Accessor> {
    pub(super) io: StoreIo<S>,
    /// Current extent in atoms.
    pub(super) atoms: u64,
    /// Blocks below this atom are the bootstrap records and never freed.
    pub(super) canfree: u64,
    pub(super) free: FreeLists,
}

/// A non-empty free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeEntry {
    pub class: usize,
    pub head: Handle,
}

impl<S: Accessor> AtomAllocator<S> {
    /// Initialize a new allocator in `store`. Existing content is discarded.
    pub fn create(store: S) -> Result<Self> {
        let io = StoreIo::new(store);
        io.truncate_atoms(0)?;

        let mut allocator = Self {
            io,
            atoms: 0,
            canfree: 0,
            free: FreeLists::new(),
        };

        allocator.update(|a| {
            a.extend(&SIGNATURE[1..])?;
            a.extend(&[])?;
            a.extend(&FreeLists::initial_table())
        })?;
        allocator.canfree = allocator.atoms;

        info!(
            name = %allocator.io.name(),
            atoms = allocator.atoms,
            "Created allocator store"
        );
        Ok(allocator)
    }

    /// Open an allocator previously created in `store`.
    pub fn open(store: S) -> Result<Self> {
        let io = StoreIo::new(store);
        let size = io.size()?;
        if size % ATOM_SIZE != 0 {
            warn!(name = %io.name(), size, "Store size is not a multiple of the atom size");
            return Err(Error::Size {
                name: io.name().to_string(),
                size,
            });
        }

        let mut header = [0u8; 16];
        io.read(&mut header, 0)?;
        if header != SIGNATURE {
            warn!(name = %io.name(), "Store signature mismatch");
            return Err(Error::Header {
                name: io.name().to_string(),
                got: header.to_vec(),
                expected: SIGNATURE.to_vec(),
            });
        }

        let mut allocator = Self {
            io,
            atoms: size / ATOM_SIZE,
            canfree: 0,
            free: FreeLists::new(),
        };

        let table_atom = Handle::FREE_TABLE.atom();
        let kind = allocator.block_kind(table_atom)?;
        if kind.content_span().map(|(_, len)| len) != Some(TABLE_LEN) {
            return Err(allocator.io.corrupted(table_atom * ATOM_SIZE));
        }
        let table = allocator.read_content(table_atom, kind)?;
        allocator.canfree = table_atom + atoms_for(TABLE_LEN);
        allocator.free = FreeLists::from_table(
            allocator.io.name(),
            &table,
            allocator.canfree,
            allocator.atoms,
        )?;

        info!(
            name = %allocator.io.name(),
            atoms = allocator.atoms,
            free_lists = allocator.free.non_empty().count(),
            "Opened allocator store"
        );
        Ok(allocator)
    }

    /// Handle of the permanent root record.
    pub fn root(&self) -> Handle {
        Handle::ROOT
    }

    /// Current extent of the store in atoms.
    pub fn atoms(&self) -> u64 {
        self.atoms
    }

    /// Lowest handle that can be freed.
    pub fn canfree(&self) -> u64 {
        self.canfree
    }

    pub fn name(&self) -> &str {
        self.io.name()
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        self.io.store()
    }

    /// Heads of the non-empty free lists, smallest class first.
    pub fn free_report(&self) -> Vec<FreeEntry> {
        self.free
            .non_empty()
            .map(|(class, head)| FreeEntry {
                class,
                head: Handle::new(head),
            })
            .collect()
    }

    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    /// Close the underlying store.
    pub fn close(self) -> Result<()> {
        self.io.close()?;
        info!(name = %self.io.name(), atoms = self.atoms, "Closed allocator store");
        Ok(())
    }

    /// Give the store back without closing it.
    pub fn into_store(self) -> S {
        self.io.into_store()
    }

    /// Store `content` in a new block and return its handle.
    pub fn alloc(&mut self, content: &[u8]) -> Result<Handle> {
        self.update(|a| a.alloc_block(content))
    }

    /// Content of the block at `handle`, following a relocation stub.
    pub fn read(&self, handle: Handle) -> Result<Vec<u8>> {
        self.check_handle(handle)?;
        let atom = handle.atom();
        let kind = self.block_kind(atom)?;
        if kind.is_free() {
            return Err(self.io.invalid_handle(atom));
        }

        let (atom, kind) = if kind == BlockKind::Relocated {
            let target = self.relocation_target(atom)?;
            (target, self.block_kind(target)?)
        } else {
            (atom, kind)
        };
        self.read_content(atom, kind)
    }

    /// Release the block at `handle`. Freeing a relocation stub releases
    /// its target as well.
    pub fn free(&mut self, handle: Handle) -> Result<()> {
        let atom = handle.atom();
        if handle.is_null() {
            return Err(Error::NullHandle {
                name: self.io.name().to_string(),
            });
        }
        if atom < self.canfree || atom >= self.atoms {
            return Err(self.io.invalid_handle(atom));
        }

        let (kind, atoms) = self.block_info(atom)?;
        if kind.is_free() {
            return Err(self.io.invalid_handle(atom));
        }

        self.update(|a| {
            if kind == BlockKind::Relocated {
                let target = a.relocation_target(atom)?;
                let (_, target_atoms) = a.block_info(target)?;
                a.release(target, target_atoms)?;
            }
            a.release(atom, atoms)
        })?;
        debug!(handle = %handle, atoms, "Freed block");
        Ok(())
    }

    /// Replace the content of `handle`, returning the handle now holding
    /// it. With `keep_handle` the returned handle is always `handle`; the
    /// root record is always kept.
    pub fn realloc(&mut self, handle: Handle, content: &[u8], keep_handle: bool) -> Result<Handle> {
        let atom = handle.atom();
        if handle.is_null() {
            return Err(Error::NullHandle {
                name: self.io.name().to_string(),
            });
        }

        let keep_handle = keep_handle || handle == Handle::ROOT;
        if handle != Handle::ROOT && (atom < self.canfree || atom >= self.atoms) {
            return Err(self.io.invalid_handle(atom));
        }

        let new_atoms = self.request_atoms(content.len())?;
        let (kind, old_atoms) = self.block_info(atom)?;
        if kind.is_free() {
            return Err(self.io.invalid_handle(atom));
        }

        self.update(|a| {
            if kind == BlockKind::Relocated {
                a.realloc_relocated(atom, content, new_atoms)
            } else {
                a.realloc_block(atom, old_atoms, content, new_atoms, keep_handle)
            }
        })
    }

    /// Run a structural update between the store's begin/end hooks.
    fn update<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.io.begin_update()?;
        let result = op(self);
        let end = self.io.end_update();
        let value = result?;
        end?;
        Ok(value)
    }

    fn request_atoms(&self, len: usize) -> Result<u64> {
        if len > MAX_CONTENT {
            return Err(Error::BadRequest {
                name: self.io.name().to_string(),
                size: len,
            });
        }
        Ok(atoms_for(len))
    }

    /// Valid targets for read: the root and anything from `canfree` up to
    /// the extent.
    fn check_handle(&self, handle: Handle) -> Result<()> {
        if handle.is_null() {
            return Err(Error::NullHandle {
                name: self.io.name().to_string(),
            });
        }

        let atom = handle.atom();
        if handle != Handle::ROOT && (atom < self.canfree || atom >= self.atoms) {
            return Err(self.io.invalid_handle(atom));
        }
        Ok(())
    }

    fn alloc_block(&mut self, content: &[u8]) -> Result<Handle> {
        let rq = self.request_atoms(content.len())?;

        if let Some((class, head)) = self.free.first_fit(rq) {
            let size = if class == CLASSES {
                let size = self.io.read_u56(head * ATOM_SIZE + SIZE_OFFSET)?;
                if size < MAX_ATOMS {
                    return Err(Error::FreeList {
                        name: self.io.name().to_string(),
                        size,
                        block: head,
                    });
                }
                size
            } else {
                class as u64
            };

            self.free.remove(&self.io, head, size)?;
            if rq < size {
                self.free.insert(&self.io, head + rq, size - rq)?;
            }
            self.write_used(content, head)?;
            debug!(handle = head, atoms = rq, from = size, "Allocated from free list");
            return Ok(Handle::new(head));
        }

        let handle = self.extend(content)?;
        debug!(handle = %handle, atoms = rq, "Allocated at end of store");
        Ok(handle)
    }

    fn realloc_block(
        &mut self,
        atom: u64,
        old_atoms: u64,
        content: &[u8],
        new_atoms: u64,
        keep_handle: bool,
    ) -> Result<Handle> {
        let handle = Handle::new(atom);
        match new_atoms.cmp(&old_atoms) {
            Ordering::Equal => {
                self.write_used(content, atom)?;
                debug!(handle = %handle, atoms = new_atoms, "Reallocated in place");
            }
            Ordering::Less => {
                self.write_used(content, atom)?;
                self.release(atom + new_atoms, old_atoms - new_atoms)?;
                debug!(handle = %handle, from = old_atoms, to = new_atoms, "Shrunk block");
            }
            Ordering::Greater => {
                let right = self.peek_right(atom, old_atoms)?;
                if right > 0 && new_atoms <= old_atoms + right {
                    self.grow_into_right(atom, old_atoms, right, content, new_atoms)?;
                    debug!(handle = %handle, from = old_atoms, to = new_atoms, "Grew block into free neighbour");
                    return Ok(handle);
                }

                if !keep_handle {
                    self.release(atom, old_atoms)?;
                    let moved = self.alloc_block(content)?;
                    debug!(from = %handle, to = %moved, atoms = new_atoms, "Moved block");
                    return Ok(moved);
                }

                let target = self.alloc_block(content)?;
                self.io
                    .write(&encode_relocation(target.atom()), atom * ATOM_SIZE)?;
                if old_atoms > 1 {
                    self.release(atom + 1, old_atoms - 1)?;
                }
                debug!(handle = %handle, target = %target, atoms = new_atoms, "Relocated block");
            }
        }
        Ok(handle)
    }

    fn realloc_relocated(&mut self, atom: u64, content: &[u8], new_atoms: u64) -> Result<Handle> {
        let handle = Handle::new(atom);
        let target = self.relocation_target(atom)?;

        if new_atoms == 1 {
            self.write_used(content, atom)?;
            let (_, target_atoms) = self.block_info(target)?;
            self.release(target, target_atoms)?;
            debug!(handle = %handle, "Collapsed relocation stub");
            return Ok(handle);
        }

        let right = self.peek_right(atom, 1)?;
        if right > 0 && new_atoms <= 1 + right {
            self.grow_into_right(atom, 1, right, content, new_atoms)?;
            let (_, target_atoms) = self.block_info(target)?;
            self.release(target, target_atoms)?;
            debug!(handle = %handle, atoms = new_atoms, "Replaced relocation stub in place");
            return Ok(handle);
        }

        let (_, target_atoms) = self.block_info(target)?;
        let moved = self.realloc_block(target, target_atoms, content, new_atoms, false)?;
        if moved.atom() != target {
            self.io.write_u56(atom * ATOM_SIZE + 1, moved.atom())?;
            debug!(handle = %handle, target = %moved, "Retargeted relocation stub");
        }
        Ok(handle)
    }

    /// Take `right` free atoms following `old_atoms@atom` and store
    /// `content` over the union, listing whatever is left over.
    fn grow_into_right(
        &mut self,
        atom: u64,
        old_atoms: u64,
        right: u64,
        content: &[u8],
        new_atoms: u64,
    ) -> Result<()> {
        let total = old_atoms + right;
        self.free.remove(&self.io, atom + old_atoms, right)?;
        if new_atoms < total {
            self.free.insert(&self.io, atom + new_atoms, total - new_atoms)?;
        }
        self.write_used(content, atom)
    }

    /// Turn `atoms@atom` into free space: merge with free neighbours, then
    /// either list the union or, when it ends the store, cut it off.
    fn release(&mut self, atom: u64, atoms: u64) -> Result<()> {
        let left = self.peek_left(atom)?;
        let right = self.peek_right(atom, atoms)?;
        if left > 0 {
            self.free.remove(&self.io, atom - left, left)?;
        }
        if right > 0 {
            self.free.remove(&self.io, atom + atoms, right)?;
        }

        let start = atom - left;
        let end = atom + atoms + right;
        if end == self.atoms {
            self.io.truncate_atoms(start)?;
            debug!(from = self.atoms, to = start, "Truncated free tail");
            self.atoms = start;
            return Ok(());
        }

        self.free.insert(&self.io, start, end - start)
    }

    /// Size of the free block ending right before `atom`, 0 if that block
    /// is used. Reads only the trailing bytes of the left neighbour.
    fn peek_left(&self, atom: u64) -> Result<u64> {
        if atom <= self.canfree {
            return Ok(0);
        }

        let end = atom * ATOM_SIZE;
        match Boundary::from_trailer(self.io.read_byte(end - 1)?) {
            Boundary::Used => Ok(0),
            Boundary::FreeAtom => Ok(1),
            Boundary::Free => {
                let size = self.io.read_u56(end - 8)?;
                if size < 2 || size > atom - self.canfree {
                    return Err(self.io.corrupted(end - 8));
                }
                Ok(size)
            }
        }
    }

    /// Size of the free block right after `atoms@atom`, 0 if it is used or
    /// `atoms@atom` ends the store.
    fn peek_right(&self, atom: u64, atoms: u64) -> Result<u64> {
        let next = atom + atoms;
        if next >= self.atoms {
            return Ok(0);
        }

        let (kind, size) = self.block_info(next)?;
        Ok(if kind.is_free() { size } else { 0 })
    }

    pub(super) fn block_kind(&self, atom: u64) -> Result<BlockKind> {
        let offset = atom * ATOM_SIZE;
        let mut prefix = [0u8; 3];
        self.io.read(&mut prefix, offset)?;
        BlockKind::decode(prefix).ok_or_else(|| self.io.corrupted(offset + 1))
    }

    /// Kind and size in atoms of the block at `atom`.
    pub(super) fn block_info(&self, atom: u64) -> Result<(BlockKind, u64)> {
        let kind = self.block_kind(atom)?;
        let atoms = match kind.atoms() {
            Some(atoms) => atoms,
            None => {
                let offset = atom * ATOM_SIZE + SIZE_OFFSET;
                let atoms = self.io.read_u56(offset)?;
                if atoms < 2 || atom + atoms > self.atoms {
                    return Err(self.io.corrupted(offset));
                }
                atoms
            }
        };
        Ok((kind, atoms))
    }

    /// Target of the relocation stub at `atom`. A stub may only point at a
    /// used, non relocated block.
    pub(super) fn relocation_target(&self, atom: u64) -> Result<u64> {
        let offset = atom * ATOM_SIZE + 1;
        let target = self.io.read_u56(offset)?;
        if target < self.canfree || target >= self.atoms {
            return Err(self.io.corrupted(offset));
        }

        let kind = self.block_kind(target)?;
        if kind == BlockKind::Relocated || kind.is_free() {
            return Err(self.io.corrupted(target * ATOM_SIZE));
        }
        Ok(target)
    }

    fn read_content(&self, atom: u64, kind: BlockKind) -> Result<Vec<u8>> {
        let offset = atom * ATOM_SIZE;
        let (start, len) = kind
            .content_span()
            .ok_or_else(|| self.io.corrupted(offset))?;

        let mut content = vec![0u8; len];
        self.io.read(&mut content, offset + start)?;
        if kind.is_escaped() {
            unescape(&mut content);
        }
        Ok(content)
    }

    fn write_used(&self, content: &[u8], atom: u64) -> Result<()> {
        self.io.write(&encode_used(content), atom * ATOM_SIZE)
    }

    /// Append a used block at the end of the store.
    fn extend(&mut self, content: &[u8]) -> Result<Handle> {
        let atom = self.atoms;
        self.write_used(content, atom)?;
        self.atoms += atoms_for(content.len());
        Ok(Handle::new(atom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use std::io;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    const BASE: u64 = 3377;

    fn allocator() -> AtomAllocator<MemStore> {
        AtomAllocator::create(MemStore::new("alloc")).unwrap()
    }

    fn entry(class: usize, head: u64) -> FreeEntry {
        FreeEntry {
            class,
            head: Handle::new(head),
        }
    }

    #[test]
    fn test_create_layout() -> Result<()> {
        let a = allocator();
        assert_eq!(a.atoms(), BASE);
        assert_eq!(a.canfree(), BASE);
        assert_eq!(a.store().size().unwrap(), BASE * ATOM_SIZE);

        let mut header = [0u8; 16];
        a.store().read_at(&mut header, 0).unwrap();
        assert_eq!(header, SIGNATURE);
        assert_eq!(a.read(a.root())?, Vec::<u8>::new());
        assert!(a.free_report().is_empty());
        Ok(())
    }

    #[test]
    fn test_alloc_and_read_sizes() -> Result<()> {
        let mut a = allocator();
        let mut blocks = Vec::new();
        for &n in &[0usize, 1, 15, 16, 237, 238, 1000, MAX_CONTENT] {
            let mut content: Vec<u8> = (0..n).map(|i| i as u8).collect();
            if let Some(last) = content.last_mut() {
                *last = 0xff;
            }
            let h = a.alloc(&content)?;
            blocks.push((h, content));
        }

        for (h, content) in &blocks {
            assert_eq!(&a.read(*h)?, content);
        }
        assert_eq!(a.audit()?.used_blocks, 3 + blocks.len() as u64);
        Ok(())
    }

    #[test]
    fn test_alloc_too_large() {
        let mut a = allocator();
        let err = a.alloc(&vec![0u8; MAX_CONTENT + 1]).unwrap_err();
        assert!(matches!(err, Error::BadRequest { size, .. } if size == MAX_CONTENT + 1));
        assert_eq!(a.atoms(), BASE);
    }

    #[test]
    fn test_free_middle_of_three() -> Result<()> {
        let mut a = allocator();
        let _h1 = a.alloc(&[])?;
        let h2 = a.alloc(&[])?;
        let _h3 = a.alloc(&[])?;

        a.free(h2)?;
        assert_eq!(a.free_report(), vec![entry(1, h2.atom())]);
        assert_eq!(a.audit()?.free_blocks, 1);

        // Exact fit is reused
        assert_eq!(a.alloc(b"x")?, h2);
        assert!(a.free_report().is_empty());
        Ok(())
    }

    #[test]
    fn test_free_tail_truncates() -> Result<()> {
        let mut a = allocator();
        let h1 = a.alloc(&[1; 100])?;
        let h2 = a.alloc(&[2; 100])?;

        a.free(h2)?;
        assert_eq!(a.atoms(), h2.atom());
        a.free(h1)?;
        assert_eq!(a.atoms(), BASE);
        assert_eq!(a.store().size().unwrap(), BASE * ATOM_SIZE);
        assert!(a.free_report().is_empty());
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_coalesce_left_then_right() -> Result<()> {
        let mut a = allocator();
        let x = a.alloc(&[])?;
        let y = a.alloc(&[])?;
        let z = a.alloc(&[])?;
        a.alloc(&[])?;

        a.free(x)?;
        a.free(z)?;
        assert_eq!(a.free_report(), vec![entry(1, z.atom())]);
        a.free(y)?;
        assert_eq!(a.free_report(), vec![entry(3, x.atom())]);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_coalesce_right_then_left() -> Result<()> {
        let mut a = allocator();
        let x = a.alloc(&[])?;
        let y = a.alloc(&[])?;
        let z = a.alloc(&[])?;
        a.alloc(&[])?;

        a.free(y)?;
        a.free(x)?;
        assert_eq!(a.free_report(), vec![entry(2, x.atom())]);
        a.free(z)?;
        assert_eq!(a.free_report(), vec![entry(3, x.atom())]);
        assert_eq!(a.audit()?.free_atoms, 3);
        Ok(())
    }

    #[test]
    fn test_split_on_reuse() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(&[0; 100])?;
        a.alloc(&[])?;
        a.free(h)?;
        assert_eq!(a.free_report(), vec![entry(7, h.atom())]);

        assert_eq!(a.alloc(&[1; 20])?, h);
        assert_eq!(a.free_report(), vec![entry(5, h.atom() + 2)]);
        assert_eq!(a.read(h)?, vec![1; 20]);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_invalid_handles() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(&[])?;
        a.alloc(&[])?;

        assert!(matches!(a.read(Handle::NULL), Err(Error::NullHandle { .. })));
        assert!(matches!(a.free(Handle::NULL), Err(Error::NullHandle { .. })));
        assert!(matches!(a.realloc(Handle::NULL, b"", true), Err(Error::NullHandle { .. })));

        for bad in [Handle::FREE_TABLE, Handle::new(3), Handle::new(a.atoms())] {
            assert!(matches!(a.read(bad), Err(Error::InvalidHandle { .. })), "{}", bad);
            assert!(matches!(a.realloc(bad, b"", false), Err(Error::InvalidHandle { .. })), "{}", bad);
        }
        assert!(matches!(a.free(Handle::ROOT), Err(Error::InvalidHandle { .. })));

        a.free(h)?;
        assert!(matches!(a.read(h), Err(Error::InvalidHandle { .. })));
        assert!(matches!(a.free(h), Err(Error::InvalidHandle { .. })));
        assert!(matches!(a.realloc(h, b"", true), Err(Error::InvalidHandle { .. })));
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_realloc_in_place_and_shrink() -> Result<()> {
        let mut a = allocator();
        let small = a.alloc(b"abc")?;
        assert_eq!(a.realloc(small, b"xyz", false)?, small);
        assert_eq!(a.read(small)?, b"xyz");

        let h = a.alloc(&[1; 100])?;
        a.alloc(&[])?;
        assert_eq!(a.realloc(h, &[2; 10], false)?, h);
        assert_eq!(a.read(h)?, vec![2; 10]);
        assert_eq!(a.free_report(), vec![entry(6, h.atom() + 1)]);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_realloc_shrink_at_tail_truncates() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(&[1; 100])?;
        a.realloc(h, b"x", true)?;
        assert_eq!(a.atoms(), h.atom() + 1);
        assert!(a.free_report().is_empty());
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_realloc_grows_into_free_neighbour() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(b"a")?;
        let n = a.alloc(&[0; 60])?;
        a.alloc(&[])?;
        a.free(n)?;

        assert_eq!(a.realloc(h, &[3; 40], false)?, h);
        assert_eq!(a.read(h)?, vec![3; 40]);
        assert_eq!(a.free_report(), vec![entry(2, h.atom() + 3)]);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_realloc_moves_without_keep() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(b"a")?;
        a.alloc(b"g")?;

        let moved = a.realloc(h, &[4; 100], false)?;
        assert_ne!(moved, h);
        assert_eq!(a.read(moved)?, vec![4; 100]);
        assert_eq!(a.free_report(), vec![entry(1, h.atom())]);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_realloc_keep_writes_stub_then_collapses() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(b"a")?;
        let g = a.alloc(b"g")?;

        assert_eq!(a.realloc(h, &[5; 100], true)?, h);
        assert_eq!(a.io.read_byte(h.atom() * ATOM_SIZE)?, 0xfd);
        assert_eq!(a.read(h)?, vec![5; 100]);
        a.audit()?;

        assert_eq!(a.realloc(h, b"small", true)?, h);
        assert_eq!(a.read(h)?, b"small");
        assert_eq!(a.atoms(), g.atom() + 1);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_realloc_stub_moves_target() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(b"a")?;
        a.alloc(b"g")?;
        a.realloc(h, &[5; 100], true)?;
        a.alloc(&[])?;

        assert_eq!(a.realloc(h, &[6; 500], true)?, h);
        assert_eq!(a.read(h)?, vec![6; 500]);
        assert_eq!(a.free_report(), vec![entry(7, h.atom() + 2)]);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_realloc_stub_grows_in_place() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(b"a")?;
        let n = a.alloc(&[0; 60])?;
        let g = a.alloc(&[])?;
        a.realloc(h, &[1; 100], true)?;
        a.free(n)?;

        assert_eq!(a.realloc(h, &[2; 50], true)?, h);
        assert_eq!(a.io.read_byte(h.atom() * ATOM_SIZE)?, 50);
        assert_eq!(a.read(h)?, vec![2; 50]);
        assert_eq!(a.free_report(), vec![entry(1, h.atom() + 4)]);
        assert_eq!(a.atoms(), g.atom() + 1);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_free_stub_releases_target() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(b"a")?;
        let g = a.alloc(b"g")?;
        a.realloc(h, &[5; 100], true)?;

        a.free(h)?;
        assert_eq!(a.atoms(), g.atom() + 1);
        assert_eq!(a.free_report(), vec![entry(1, h.atom())]);
        a.audit()?;
        Ok(())
    }

    #[test]
    fn test_catch_all_class_reads_true_size() -> Result<()> {
        let mut a = allocator();
        let first = a.alloc(&vec![1; MAX_CONTENT])?;
        let second = a.alloc(&vec![2; MAX_CONTENT])?;
        assert_eq!(second.atom(), first.atom() + MAX_ATOMS);
        a.alloc(&[])?;

        a.free(first)?;
        a.free(second)?;
        assert_eq!(a.free_report(), vec![entry(CLASSES, first.atom())]);
        let report = a.audit()?;
        assert_eq!(report.free_blocks, 1);
        assert_eq!(report.free_atoms, 2 * MAX_ATOMS);

        // Split off one atom, the rest stays in the catch-all class
        assert_eq!(a.alloc(b"x")?, first);
        assert_eq!(a.free_report(), vec![entry(CLASSES, first.atom() + 1)]);
        assert_eq!(a.audit()?.free_atoms, 2 * MAX_ATOMS - 1);
        assert_eq!(a.read(first)?, b"x");

        // A catch-all head claiming fewer than 3856 atoms is refused
        let head = first.atom() + 1;
        a.io.write_u56(head * ATOM_SIZE + SIZE_OFFSET, 100)?;
        assert!(matches!(
            a.alloc(b"y"),
            Err(Error::FreeList { size: 100, block, .. }) if block == head
        ));
        Ok(())
    }

    #[test]
    fn test_chained_relocation_is_corrupt() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(b"a")?;
        a.alloc(b"g")?;
        a.realloc(h, &[5; 100], true)?;
        let h2 = a.alloc(b"b")?;
        a.realloc(h2, &[6; 100], true)?;
        assert_eq!(a.io.read_byte(h2.atom() * ATOM_SIZE)?, 0xfd);

        // Point the first stub at the second one
        a.io.write(&encode_relocation(h2.atom()), h.atom() * ATOM_SIZE)?;

        let corrupt_at = h2.atom() * ATOM_SIZE;
        assert!(matches!(a.read(h), Err(Error::Corrupted { offset, .. }) if offset == corrupt_at));
        assert!(matches!(a.realloc(h, b"xx", true), Err(Error::Corrupted { .. })));
        assert!(matches!(a.free(h), Err(Error::Corrupted { .. })));
        assert!(matches!(a.audit(), Err(Error::Audit { .. })));

        // The second stub still resolves
        assert_eq!(a.read(h2)?, vec![6; 100]);
        Ok(())
    }

    #[test]
    fn test_root_always_keeps_handle() -> Result<()> {
        let mut a = allocator();
        assert_eq!(a.realloc(Handle::ROOT, &[7; 300], false)?, Handle::ROOT);
        assert_eq!(a.read(Handle::ROOT)?, vec![7; 300]);
        a.audit()?;

        assert_eq!(a.realloc(Handle::ROOT, b"", false)?, Handle::ROOT);
        assert_eq!(a.read(Handle::ROOT)?, Vec::<u8>::new());
        assert_eq!(a.atoms(), BASE);
        a.audit()?;
        Ok(())
    }

    /// Counts the update hooks.
    struct Hooked {
        inner: MemStore,
        begins: AtomicU64,
        ends: AtomicU64,
    }

    impl Accessor for Hooked {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
            self.inner.read_at(buf, offset)
        }
        fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
            self.inner.write_at(buf, offset)
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
            self.inner.close()
        }
        fn begin_update(&self) -> io::Result<()> {
            self.begins.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
        fn end_update(&self) -> io::Result<()> {
            self.ends.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_updates_are_bracketed() -> Result<()> {
        let mut a = AtomAllocator::create(Hooked {
            inner: MemStore::new("hooked"),
            begins: AtomicU64::new(0),
            ends: AtomicU64::new(0),
        })?;
        let h = a.alloc(b"one")?;
        a.realloc(h, &[1; 64], true)?;
        a.free(h)?;
        // Rejected requests still close their bracket
        assert!(a.alloc(&vec![0; MAX_CONTENT + 1]).is_err());

        let store = a.into_store();
        let begins = store.begins.load(AtomicOrdering::SeqCst);
        assert_eq!(begins, store.ends.load(AtomicOrdering::SeqCst));
        assert!(begins >= 4);
        Ok(())
    }
}
