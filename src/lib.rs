// atomalloc - persistent, file-backed space allocator
// Allocate/free/resize opaque blobs inside a flat byte store, addressed by
// stable integer handles that survive process restarts.

#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod config;
pub mod store;

// Re-exports for convenience
pub use alloc::{AtomAllocator, AuditReport, FreeEntry, Handle, SharedAllocator};
pub use config::{Backend, StoreConfig};
pub use store::{Accessor, CachedStore, FileStore, MemStore, ProbeStore};

/// Allocator error types
pub mod error {
    use std::io;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// Content larger than the largest representable block.
        #[error("{name}: bad request, size {size} exceeds the maximum block content")]
        BadRequest { name: String, size: usize },

        /// A tag byte or length field outside any known encoding.
        #[error("{name}: corrupted data @{offset:#x}")]
        Corrupted { name: String, offset: u64 },

        #[error("{name}: access via null handle")]
        NullHandle { name: String },

        /// Reserved, out of range, free or otherwise unusable handle.
        #[error("{name}: invalid handle {handle:#x}")]
        InvalidHandle { name: String, handle: u64 },

        #[error("{name}: invalid free list item, size {size:#x}, block {block:#x}")]
        FreeList { name: String, size: u64, block: u64 },

        #[error("{name}: invalid size {size:#x}({size}), size % 16 != 0")]
        Size { name: String, size: u64 },

        #[error("{name}: invalid header, got {got:02x?}, expected {expected:02x?}")]
        Header {
            name: String,
            got: Vec<u8>,
            expected: Vec<u8>,
        },

        #[error("{name}: read @{offset:#x}: {source}")]
        Read {
            name: String,
            offset: u64,
            #[source]
            source: io::Error,
        },

        #[error("{name}: write @{offset:#x}: {source}")]
        Write {
            name: String,
            offset: u64,
            #[source]
            source: io::Error,
        },

        /// Truncate, stat, sync, close, create or open failure.
        #[error("{name}: {op}: {source}")]
        Io {
            name: String,
            op: &'static str,
            #[source]
            source: io::Error,
        },

        #[error("{name}: audit failed @{offset:#x}: {reason}")]
        Audit {
            name: String,
            offset: u64,
            reason: String,
        },

        #[error("configuration error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = error::Error::Corrupted {
            name: "db".to_string(),
            offset: 0x20,
        };
        assert_eq!(err.to_string(), "db: corrupted data @0x20");

        let err = error::Error::Size {
            name: "db".to_string(),
            size: 17,
        };
        assert_eq!(err.to_string(), "db: invalid size 0x11(17), size % 16 != 0");
    }

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }
}
