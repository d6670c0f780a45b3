//! Block handles

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes used to persist a handle (the low 56 bits, big-endian).
pub const HANDLE_BYTES: usize = 7;

/// Stable identifier of a block: the index of the atom it starts at.
///
/// Only the low 56 bits are meaningful; the most significant byte is always
/// zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(u64);

impl Handle {
    /// The null handle. Any access through it is an error.
    pub const NULL: Handle = Handle(0);
    /// The permanent root record.
    pub const ROOT: Handle = Handle(1);
    /// The permanent free-list table record.
    pub const FREE_TABLE: Handle = Handle(2);
    /// Largest representable handle.
    pub const MAX: Handle = Handle((1 << 56) - 1);

    /// Create a handle from an atom index.
    pub fn new(atom: u64) -> Self {
        debug_assert!(atom <= Self::MAX.0, "handle {:#x} exceeds 56 bits", atom);
        Self(atom & Self::MAX.0)
    }

    /// The atom index this handle refers to.
    pub fn atom(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Handle {
    fn from(atom: u64) -> Self {
        Handle::new(atom)
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

/// Store the low 56 bits of `value` big-endian into `buf[..7]`.
pub(crate) fn put_u56(buf: &mut [u8], value: u64) {
    debug_assert!(value < 1 << 56);
    buf[..HANDLE_BYTES].copy_from_slice(&value.to_be_bytes()[1..]);
}

/// Load a 56 bit big-endian value from `buf[..7]`.
pub(crate) fn get_u56(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[1..].copy_from_slice(&buf[..HANDLE_BYTES]);
    u64::from_be_bytes(bytes)
}
