//! Persistent atom allocator
//!
//! Space in a store is handed out in blocks of 16-byte atoms. A block is
//! addressed by the index of its first atom (its [`Handle`]); handles stay
//! valid across reopen and, with `keep_handle`, across reallocation.
//!
//! ```text
//! atom 0        1       2                3377
//! +-----------+-------+----------------+------+------+-----
//! | signature | root  | free table ... | used | free | ...
//! +-----------+-------+----------------+------+------+-----
//!                                      ^ canfree
//! ```
//!
//! Free space is tracked in 3856 segregated, doubly linked free lists whose
//! heads are persisted in the free table. Adjacent free blocks are always
//! merged, and free space at the end of the store is cut off instead of
//! listed.

mod allocator;
mod audit;
pub mod codec;
pub mod freelist;
pub mod handle;
mod io;
mod shared;

pub use allocator::{AtomAllocator, FreeEntry, SIGNATURE};
pub use audit::AuditReport;
pub use handle::Handle;
pub use shared::SharedAllocator;
