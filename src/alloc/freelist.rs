//! Segregated free lists
//!
//! One doubly linked list per block size: class `n` holds free blocks of
//! exactly `n` atoms for `n < 3856`, class 3856 holds every free block of
//! 3856 atoms or more, unsorted. The links live inside the free blocks
//! themselves; only the list heads are kept in memory.
//!
//! The heads are persisted in the free table record (handle 2) as 3856
//! fixed 14-byte records `[class:7][head:7]`, so updating one head rewrites
//! 7 bytes and never moves the table.

use super::codec::{
    decode_links, encode_free_atom, encode_free_head, encode_free_tail, ATOM_SIZE, MAX_ATOMS,
    NEXT_OFFSET, PREV_OFFSET,
};
use super::handle::{get_u56, put_u56, Handle, HANDLE_BYTES};
use super::io::StoreIo;
use crate::error::{Error, Result};
use crate::store::Accessor;

/// Number of size classes.
pub const CLASSES: usize = MAX_ATOMS as usize;

const RECORD_SIZE: usize = 2 * HANDLE_BYTES;
/// Content length of the free table record.
pub(crate) const TABLE_LEN: usize = CLASSES * RECORD_SIZE;

/// Size class of a free block of `atoms` atoms.
pub fn class_for(atoms: u64) -> usize {
    atoms.min(MAX_ATOMS) as usize
}

/// Store offset of the persisted head of `class`.
///
/// The table is a long block: 3 prefix bytes precede the records.
pub(crate) fn head_offset(class: usize) -> u64 {
    debug_assert!((1..=CLASSES).contains(&class));
    Handle::FREE_TABLE.atom() * ATOM_SIZE + 3 + HANDLE_BYTES as u64 + ((class - 1) * RECORD_SIZE) as u64
}

pub(crate) struct FreeLists {
    /// heads[0] is unused, heads[n] is the first block of class n.
    heads: Vec<u64>,
}

impl FreeLists {
    /// All lists empty.
    pub fn new() -> Self {
        Self {
            heads: vec![0; CLASSES + 1],
        }
    }

    /// Content of a fresh free table: every class tagged, every head null.
    pub fn initial_table() -> Vec<u8> {
        let mut table = vec![0u8; TABLE_LEN];
        for class in 1..=CLASSES {
            put_u56(&mut table[(class - 1) * RECORD_SIZE..], class as u64);
        }
        table
    }

    /// Load the heads from the content of the free table record, rejecting
    /// records that do not describe a free list inside `[canfree, atoms)`.
    pub fn from_table(name: &str, table: &[u8], canfree: u64, atoms: u64) -> Result<Self> {
        let mut lists = Self::new();
        for (i, record) in table.chunks(RECORD_SIZE).enumerate() {
            if record.len() != RECORD_SIZE {
                return Err(Error::Corrupted {
                    name: name.to_string(),
                    offset: head_offset(1) - HANDLE_BYTES as u64 + (i * RECORD_SIZE) as u64,
                });
            }

            let size = get_u56(record);
            let head = get_u56(&record[HANDLE_BYTES..]);
            let bad = size != (i + 1) as u64
                || (head != 0 && (head < canfree || head >= atoms));
            if bad {
                return Err(Error::FreeList {
                    name: name.to_string(),
                    size,
                    block: head,
                });
            }

            lists.heads[i + 1] = head;
        }
        Ok(lists)
    }

    pub fn head(&self, class: usize) -> u64 {
        self.heads[class]
    }

    /// First non-empty class able to hold `atoms` atoms, with its head.
    /// Smaller classes come first, so an exact fit beats the catch-all class.
    pub fn first_fit(&self, atoms: u64) -> Option<(usize, u64)> {
        (class_for(atoms)..=CLASSES)
            .map(|class| (class, self.heads[class]))
            .find(|&(_, head)| head != 0)
    }

    /// Non-empty classes and their heads, smallest class first.
    pub fn non_empty(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.heads
            .iter()
            .enumerate()
            .skip(1)
            .filter(|&(_, &head)| head != 0)
            .map(|(class, &head)| (class, head))
    }

    /// Mark `atoms@atom` free and push it on the front of its class list.
    pub fn insert<S: Accessor>(&mut self, io: &StoreIo<S>, atom: u64, atoms: u64) -> Result<()> {
        let class = class_for(atoms);
        let head = self.heads[class];
        if head != 0 {
            io.write_u56(head * ATOM_SIZE + PREV_OFFSET, atom)?;
        }
        write_free_block(io, 0, atom, atoms, head)?;
        self.set_head(io, class, atom)
    }

    /// Unlink the free block `atoms@atom` from its class list.
    pub fn remove<S: Accessor>(&mut self, io: &StoreIo<S>, atom: u64, atoms: u64) -> Result<()> {
        let class = class_for(atoms);
        let mut links = [0u8; 2 * HANDLE_BYTES];
        io.read(&mut links, atom * ATOM_SIZE + PREV_OFFSET)?;
        let (prev, next) = decode_links(&links);
        debug_assert!(prev != 0 || self.heads[class] == atom);

        if prev == 0 {
            self.set_head(io, class, next)?;
        } else {
            io.write_u56(prev * ATOM_SIZE + NEXT_OFFSET, next)?;
        }

        if next != 0 {
            io.write_u56(next * ATOM_SIZE + PREV_OFFSET, prev)?;
        }
        Ok(())
    }

    fn set_head<S: Accessor>(&mut self, io: &StoreIo<S>, class: usize, head: u64) -> Result<()> {
        io.write_u56(head_offset(class), head)?;
        self.heads[class] = head;
        Ok(())
    }
}

/// Write the free block encoding of `atoms@atom` with the given links.
pub(crate) fn write_free_block<S: Accessor>(
    io: &StoreIo<S>,
    prev: u64,
    atom: u64,
    atoms: u64,
    next: u64,
) -> Result<()> {
    let offset = atom * ATOM_SIZE;
    if atoms == 1 {
        return io.write(&encode_free_atom(prev, next), offset);
    }

    io.write(&encode_free_head(prev, next, atoms), offset)?;
    let tail = encode_free_tail(atoms);
    io.write(&tail, offset + atoms * ATOM_SIZE - tail.len() as u64)
}
