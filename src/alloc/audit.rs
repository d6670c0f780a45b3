//! Consistency check of a whole store
//!
//! The audit walks every block from atom 0 to the extent, then walks every
//! free list and cross-checks the two views:
//!
//! ```text
//! blocks:  [hdr][root][table ...][used][free][used][stub] ... end
//!                                        ^              |
//! lists:   class n head ---------------- +              +--> target
//! ```

use super::allocator::AtomAllocator;
use super::codec::{decode_links, BlockKind, ATOM_SIZE, PREV_OFFSET};
use super::freelist::{class_for, head_offset, CLASSES};
use crate::error::{Error, Result};
use crate::store::Accessor;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Block and atom counts of a store that passed an audit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub total_atoms: u64,
    pub used_atoms: u64,
    pub free_atoms: u64,
}

impl<S: Accessor> AtomAllocator<S> {
    /// Verify the structure of the whole store.
    ///
    /// Fails on the first inconsistency with [`Error::Audit`] (or the
    /// underlying read error) naming the offending offset.
    pub fn audit(&self) -> Result<AuditReport> {
        let size = self.io.size()?;
        if size != self.atoms * ATOM_SIZE {
            return Err(self.audit_error(size, format!("store size differs from extent of {} atoms", self.atoms)));
        }

        let mut report = AuditReport::default();
        let mut starts = BTreeSet::new();
        let mut targets = Vec::new();
        let mut free = BTreeMap::new();
        let mut prev_free = false;

        let mut atom = 0;
        while atom < self.atoms {
            let offset = atom * ATOM_SIZE;
            let (kind, atoms) = self.block_info(atom)?;
            let end = atom + atoms;
            if end > self.atoms {
                return Err(self.audit_error(offset, "block extends past the end of the store"));
            }

            let last = self.io.read_byte(end * ATOM_SIZE - 1)?;
            if !kind.accepts_trailer(last) {
                return Err(self.audit_error(
                    end * ATOM_SIZE - 1,
                    format!("trailing byte {:#04x} does not match {:?}", last, kind),
                ));
            }

            if kind.is_free() {
                self.check_free_block(atom, kind, atoms, prev_free)?;
                free.insert(atom, atoms);
                report.free_blocks += 1;
                report.free_atoms += atoms;
            } else {
                if kind == BlockKind::Relocated {
                    let target = self
                        .relocation_target(atom)
                        .map_err(|_| self.audit_error(offset + 1, "relocation target is not a used block"))?;
                    targets.push((atom, target));
                }
                starts.insert(atom);
                report.used_blocks += 1;
                report.used_atoms += atoms;
            }

            prev_free = kind.is_free();
            report.total_blocks += 1;
            atom = end;
        }
        report.total_atoms = atom;

        if prev_free {
            return Err(self.audit_error(self.atoms * ATOM_SIZE, "store ends with a free block"));
        }

        let mut pointed = BTreeSet::new();
        for (stub, target) in targets {
            if !starts.contains(&target) {
                return Err(self.audit_error(stub * ATOM_SIZE + 1, "relocation target is not a block start"));
            }
            if !pointed.insert(target) {
                return Err(self.audit_error(stub * ATOM_SIZE + 1, "relocation target shared by two stubs"));
            }
        }

        self.check_free_lists(&mut free)?;
        if let Some((&atom, _)) = free.iter().next() {
            return Err(self.audit_error(atom * ATOM_SIZE, "free block missing from its free list"));
        }

        debug!(name = %self.io.name(), ?report, "Audit passed");
        Ok(report)
    }

    fn check_free_block(&self, atom: u64, kind: BlockKind, atoms: u64, prev_free: bool) -> Result<()> {
        let offset = atom * ATOM_SIZE;
        if atom < self.canfree {
            return Err(self.audit_error(offset, "free block below the first freeable atom"));
        }
        if prev_free {
            return Err(self.audit_error(offset, "adjacent free blocks were not merged"));
        }

        if kind == BlockKind::Free {
            let tail = self.io.read_u56((atom + atoms) * ATOM_SIZE - 8)?;
            if tail != atoms {
                return Err(self.audit_error(
                    (atom + atoms) * ATOM_SIZE - 8,
                    format!("trailing size {} differs from leading size {}", tail, atoms),
                ));
            }
        }

        let (prev, next) = self.links(atom)?;
        for link in [prev, next] {
            if link != 0 && (link < self.canfree || link >= self.atoms) {
                return Err(self.audit_error(offset + PREV_OFFSET, format!("free list link {:#x} out of range", link)));
            }
        }
        Ok(())
    }

    /// Walk every list, consuming the blocks found by the block walk.
    fn check_free_lists(&self, free: &mut BTreeMap<u64, u64>) -> Result<()> {
        for class in 1..=CLASSES {
            let head = self.free.head(class);
            let persisted = self.io.read_u56(head_offset(class))?;
            if persisted != head {
                return Err(self.audit_error(
                    head_offset(class),
                    format!("persisted head {:#x} of class {} differs from {:#x}", persisted, class, head),
                ));
            }

            let mut prev = 0;
            let mut cur = head;
            while cur != 0 {
                let atoms = free.remove(&cur).ok_or_else(|| {
                    self.audit_error(cur * ATOM_SIZE, format!("class {} lists a block that is not free or listed twice", class))
                })?;
                if class_for(atoms) != class {
                    return Err(self.audit_error(
                        cur * ATOM_SIZE,
                        format!("free block of {} atoms listed in class {}", atoms, class),
                    ));
                }

                let (back, next) = self.links(cur)?;
                if back != prev {
                    return Err(self.audit_error(cur * ATOM_SIZE + PREV_OFFSET, "prev link does not match list order"));
                }
                prev = cur;
                cur = next;
            }
        }
        Ok(())
    }

    fn links(&self, atom: u64) -> Result<(u64, u64)> {
        let mut links = [0u8; 14];
        self.io.read(&mut links, atom * ATOM_SIZE + PREV_OFFSET)?;
        Ok(decode_links(&links))
    }

    fn audit_error(&self, offset: u64, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        warn!(name = %self.io.name(), offset, %reason, "Audit failed");
        Error::Audit {
            name: self.io.name().to_string(),
            offset,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::codec::encode_relocation;
    use crate::alloc::Handle;
    use crate::store::MemStore;

    fn allocator() -> AtomAllocator<MemStore> {
        AtomAllocator::create(MemStore::new("audit")).unwrap()
    }

    #[test]
    fn test_fresh_store() -> Result<()> {
        let a = allocator();
        let report = a.audit()?;
        assert_eq!(report.total_blocks, 3);
        assert_eq!(report.used_blocks, 3);
        assert_eq!(report.free_blocks, 0);
        assert_eq!(report.total_atoms, a.atoms());
        assert_eq!(report.used_atoms, a.atoms());
        Ok(())
    }

    #[test]
    fn test_counts_blocks_and_atoms() -> Result<()> {
        let mut a = allocator();
        let h1 = a.alloc(&[1; 40])?;
        a.alloc(&[])?;
        let _h3 = a.alloc(&[3; 100])?;
        a.free(h1)?;

        let report = a.audit()?;
        assert_eq!(report.total_blocks, 6);
        assert_eq!(report.free_blocks, 1);
        assert_eq!(report.free_atoms, 3);
        assert_eq!(report.used_atoms + report.free_atoms, report.total_atoms);
        Ok(())
    }

    #[test]
    fn test_detects_bad_trailer() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(&[7; 20])?;
        a.alloc(&[])?;
        a.io.write(&[0xfe], (h.atom() + 2) * ATOM_SIZE - 1)?;
        assert!(matches!(a.audit(), Err(Error::Audit { .. })));
        Ok(())
    }

    #[test]
    fn test_detects_unlisted_free_block() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(&[])?;
        a.alloc(&[])?;
        a.free(h)?;
        // Forget the list head: the block is now orphaned
        a.io.write_u56(head_offset(1), 0)?;
        a.free = crate::alloc::freelist::FreeLists::new();
        let err = a.audit().unwrap_err();
        assert!(err.to_string().contains("missing from its free list"), "{}", err);
        Ok(())
    }

    #[test]
    fn test_detects_dangling_relocation() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(&[])?;
        let target = a.alloc(&[9; 40])?;
        a.alloc(&[])?;
        // Point into the middle of the target block
        a.io.write(&encode_relocation(target.atom() + 1), h.atom() * ATOM_SIZE)?;
        assert!(matches!(a.audit(), Err(Error::Audit { .. })));
        Ok(())
    }

    #[test]
    fn test_detects_head_mismatch() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(&[])?;
        a.alloc(&[])?;
        a.free(h)?;
        a.io.write_u56(head_offset(1), Handle::ROOT.atom())?;
        let err = a.audit().unwrap_err();
        assert!(err.to_string().contains("persisted head"), "{}", err);
        Ok(())
    }

    #[test]
    fn test_detects_small_block_in_catch_all_class() -> Result<()> {
        let mut a = allocator();
        let h = a.alloc(&vec![7; 47_990])?;
        a.alloc(&[])?;
        a.free(h)?;
        let class = a.free_report()[0].class;
        assert!(class < CLASSES);

        // Move the list to the catch-all slot and reload the table
        a.io.write_u56(head_offset(class), 0)?;
        a.io.write_u56(head_offset(CLASSES), h.atom())?;
        let a = AtomAllocator::open(a.into_store())?;
        assert_eq!(a.free_report()[0].class, CLASSES);

        let err = a.audit().unwrap_err();
        assert!(matches!(err, Error::Audit { offset, .. } if offset == h.atom() * ATOM_SIZE));
        assert!(err.to_string().contains("listed in class 3856"), "{}", err);
        Ok(())
    }
}
