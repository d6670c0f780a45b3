//! Block codec
//!
//! Every block is a run of 16-byte atoms. Its first byte (the tag) says what
//! kind of block it is:
//!
//! ```text
//! 0x00         empty used block (1 atom)
//! 0x01..=0xed  short used block, tag = content length
//! 0xee..=0xfb  short used block, escaped, length = 15 + 16 * (tag - 0xee)
//! 0xfc         long used block, next 2 bytes = big-endian length field
//!                0x00ee..=0xf0f0  length = field
//!                0xf0f1..=0xffff  escaped, length = 13 + 16 * (field - 0xf0f1)
//! 0xfd         relocation stub, next 7 bytes = target handle
//! 0xfe         free block of >= 2 atoms
//! 0xff         free block of exactly 1 atom
//! ```
//!
//! The last byte of every block is a boundary tag read by the right
//! neighbour: 0xfe or 0xff for free blocks, anything else for used blocks.
//! When a used block's content ends exactly at the block end and its last
//! byte is 0xfe or 0xff, the escaped tag is used and the byte is stored
//! minus 0xfe.
//!
//! Free blocks carry `prev`/`next` links (7 bytes each) after the tag. Free
//! blocks of two or more atoms also store their size right after the links
//! and again in the 7 bytes before the trailing tag:
//!
//! ```text
//! 1 atom:   [ff][prev:7][next:7][ff]
//! N atoms:  [fe][prev:7][next:7][size:7] ... [size:7][fe]
//! ```

use super::handle::{get_u56, put_u56, HANDLE_BYTES};

/// Bytes per atom.
pub const ATOM_SIZE: u64 = 16;
/// Largest block, in atoms.
pub const MAX_ATOMS: u64 = 3856;
/// Largest content of a short block.
pub const MAX_SHORT: usize = 237;
/// Largest content of any block.
pub const MAX_CONTENT: usize = 61680;

pub(crate) const TAG_EMPTY: u8 = 0x00;
const TAG_SHORT_ESC: u8 = 0xee;
const TAG_SHORT_ESC_LAST: u8 = 0xfb;
pub(crate) const TAG_LONG: u8 = 0xfc;
pub(crate) const TAG_RELOC: u8 = 0xfd;
pub(crate) const TAG_FREE: u8 = 0xfe;
pub(crate) const TAG_FREE_ATOM: u8 = 0xff;

const LONG_ESC_BASE: usize = 0xf0f1;

/// Offset of the `prev` link inside a free block.
pub(crate) const PREV_OFFSET: u64 = 1;
/// Offset of the `next` link inside a free block.
pub(crate) const NEXT_OFFSET: u64 = 8;
/// Offset of the leading size field inside a free block of >= 2 atoms.
pub(crate) const SIZE_OFFSET: u64 = 15;

/// Atoms needed to hold `len` content bytes plus the encoding overhead.
pub fn atoms_for(len: usize) -> u64 {
    let overhead = if len > MAX_SHORT { 3 } else { 1 };
    ((len + overhead + ATOM_SIZE as usize - 1) / ATOM_SIZE as usize) as u64
}

/// Kind of a block as told by its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Empty,
    Short { len: usize, escaped: bool },
    Long { len: usize, escaped: bool },
    Relocated,
    FreeAtom,
    /// Free block of two or more atoms. The size lives inside the block.
    Free,
}

impl BlockKind {
    /// Decode the first three bytes of a block. Returns `None` for a long
    /// block whose length field is outside both valid ranges.
    pub fn decode(prefix: [u8; 3]) -> Option<Self> {
        let kind = match prefix[0] {
            TAG_EMPTY => BlockKind::Empty,
            tag @ 0x01..=0xed => BlockKind::Short {
                len: tag as usize,
                escaped: false,
            },
            tag @ TAG_SHORT_ESC..=TAG_SHORT_ESC_LAST => BlockKind::Short {
                len: 15 + 16 * (tag - TAG_SHORT_ESC) as usize,
                escaped: true,
            },
            TAG_LONG => {
                let n = u16::from_be_bytes([prefix[1], prefix[2]]) as usize;
                match n {
                    0..=MAX_SHORT => return None,
                    n if n <= MAX_CONTENT => BlockKind::Long {
                        len: n,
                        escaped: false,
                    },
                    n => BlockKind::Long {
                        len: 13 + 16 * (n - LONG_ESC_BASE),
                        escaped: true,
                    },
                }
            }
            TAG_RELOC => BlockKind::Relocated,
            TAG_FREE => BlockKind::Free,
            TAG_FREE_ATOM => BlockKind::FreeAtom,
        };
        Some(kind)
    }

    pub fn is_free(&self) -> bool {
        matches!(self, BlockKind::Free | BlockKind::FreeAtom)
    }

    /// Block size in atoms, or `None` when it has to be read from the block.
    pub fn atoms(&self) -> Option<u64> {
        match *self {
            BlockKind::Empty | BlockKind::Relocated | BlockKind::FreeAtom => Some(1),
            BlockKind::Short { len, .. } | BlockKind::Long { len, .. } => Some(atoms_for(len)),
            BlockKind::Free => None,
        }
    }

    /// Offset and length of the content of a used, non relocated block.
    pub fn content_span(&self) -> Option<(u64, usize)> {
        match *self {
            BlockKind::Empty => Some((1, 0)),
            BlockKind::Short { len, .. } => Some((1, len)),
            BlockKind::Long { len, .. } => Some((3, len)),
            _ => None,
        }
    }

    pub fn is_escaped(&self) -> bool {
        matches!(
            self,
            BlockKind::Short { escaped: true, .. } | BlockKind::Long { escaped: true, .. }
        )
    }

    /// Whether `last`, the final byte of a block of this kind, is legal.
    pub fn accepts_trailer(&self, last: u8) -> bool {
        match self {
            BlockKind::Empty | BlockKind::Relocated => last == 0,
            k if k.is_escaped() => last <= 1,
            BlockKind::Short { .. } | BlockKind::Long { .. } => last < TAG_FREE,
            BlockKind::Free => last == TAG_FREE,
            BlockKind::FreeAtom => last == TAG_FREE_ATOM,
        }
    }
}

/// Status of the block ending right before some position, as told by its
/// trailing byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Used,
    FreeAtom,
    /// Free block of two or more atoms; its size sits in the 7 bytes
    /// before the trailing byte.
    Free,
}

impl Boundary {
    pub fn from_trailer(last: u8) -> Self {
        match last {
            TAG_FREE => Boundary::Free,
            TAG_FREE_ATOM => Boundary::FreeAtom,
            _ => Boundary::Used,
        }
    }
}

/// Encode `content` as a complete used block, padded to whole atoms.
///
/// The caller guarantees `content.len() <= MAX_CONTENT`.
pub fn encode_used(content: &[u8]) -> Vec<u8> {
    debug_assert!(content.len() <= MAX_CONTENT);
    let n = content.len();
    let atoms = atoms_for(n);
    let mut block = vec![0u8; (atoms * ATOM_SIZE) as usize];
    if n == 0 {
        return block;
    }

    let header = if n <= MAX_SHORT { 1 } else { 3 };
    let last = content[n - 1];
    let flush = (n + header) % ATOM_SIZE as usize == 0;
    if flush && last >= TAG_FREE {
        if n <= MAX_SHORT {
            block[0] = TAG_SHORT_ESC + ((n - 15) / 16) as u8;
        } else {
            let field = (LONG_ESC_BASE + (n - 13) / 16) as u16;
            block[0] = TAG_LONG;
            block[1..3].copy_from_slice(&field.to_be_bytes());
        }
        block[header..header + n - 1].copy_from_slice(&content[..n - 1]);
        let end = block.len() - 1;
        block[end] = last - TAG_FREE;
        return block;
    }

    if n <= MAX_SHORT {
        block[0] = n as u8;
    } else {
        block[0] = TAG_LONG;
        block[1..3].copy_from_slice(&(n as u16).to_be_bytes());
    }
    block[header..header + n].copy_from_slice(content);
    block
}

/// Undo the escaping of the last content byte.
pub fn unescape(content: &mut [u8]) {
    if let Some(last) = content.last_mut() {
        *last += TAG_FREE;
    }
}

/// A one atom relocation stub pointing at `target`.
pub fn encode_relocation(target: u64) -> [u8; ATOM_SIZE as usize] {
    let mut atom = [0u8; ATOM_SIZE as usize];
    atom[0] = TAG_RELOC;
    put_u56(&mut atom[1..], target);
    atom
}

/// A complete one atom free block.
pub fn encode_free_atom(prev: u64, next: u64) -> [u8; ATOM_SIZE as usize] {
    let mut atom = [0u8; ATOM_SIZE as usize];
    atom[0] = TAG_FREE_ATOM;
    put_u56(&mut atom[PREV_OFFSET as usize..], prev);
    put_u56(&mut atom[NEXT_OFFSET as usize..], next);
    atom[15] = TAG_FREE_ATOM;
    atom
}

/// Leading part of a free block of `atoms >= 2` atoms.
pub fn encode_free_head(prev: u64, next: u64, atoms: u64) -> [u8; 22] {
    debug_assert!(atoms >= 2);
    let mut head = [0u8; 22];
    head[0] = TAG_FREE;
    put_u56(&mut head[PREV_OFFSET as usize..], prev);
    put_u56(&mut head[NEXT_OFFSET as usize..], next);
    put_u56(&mut head[SIZE_OFFSET as usize..], atoms);
    head
}

/// Trailing 8 bytes of a free block of `atoms >= 2` atoms.
pub fn encode_free_tail(atoms: u64) -> [u8; HANDLE_BYTES + 1] {
    let mut tail = [0u8; HANDLE_BYTES + 1];
    put_u56(&mut tail, atoms);
    tail[HANDLE_BYTES] = TAG_FREE;
    tail
}

/// Decode the `prev` and `next` links from the 14 bytes following a free
/// block's tag.
pub fn decode_links(links: &[u8; 14]) -> (u64, u64) {
    (get_u56(&links[..7]), get_u56(&links[7..]))
}
