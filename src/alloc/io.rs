//! Store access with allocator error context

use super::codec::ATOM_SIZE;
use super::handle::{get_u56, put_u56, HANDLE_BYTES};
use crate::error::{Error, Result};
use crate::store::Accessor;

/// Wraps an [`Accessor`] so every failure carries the store name and
/// offset.
pub(crate) struct StoreIo<S> {
    store: S,
    name: String,
}

impl<S: Accessor> StoreIo<S> {
    pub fn new(store: S) -> Self {
        let name = store.name().to_string();
        Self { store, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.store
            .read_at(buf, offset)
            .map_err(|source| Error::Read {
                name: self.name.clone(),
                offset,
                source,
            })
    }

    pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.store
            .write_at(buf, offset)
            .map_err(|source| Error::Write {
                name: self.name.clone(),
                offset,
                source,
            })
    }

    pub fn read_byte(&self, offset: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(&mut b, offset)?;
        Ok(b[0])
    }

    /// Read a 7 byte handle (or size) field.
    pub fn read_u56(&self, offset: u64) -> Result<u64> {
        let mut b = [0u8; HANDLE_BYTES];
        self.read(&mut b, offset)?;
        Ok(get_u56(&b))
    }

    /// Write a 7 byte handle (or size) field.
    pub fn write_u56(&self, offset: u64, value: u64) -> Result<()> {
        let mut b = [0u8; HANDLE_BYTES];
        put_u56(&mut b, value);
        self.write(&b, offset)
    }

    /// Shrink or grow the store to exactly `atoms` atoms.
    pub fn truncate_atoms(&self, atoms: u64) -> Result<()> {
        self.store
            .truncate(atoms * ATOM_SIZE)
            .map_err(|source| self.io_error("truncate", source))
    }

    pub fn size(&self) -> Result<u64> {
        self.store
            .size()
            .map_err(|source| self.io_error("stat", source))
    }

    pub fn sync(&self) -> Result<()> {
        self.store
            .sync()
            .map_err(|source| self.io_error("sync", source))
    }

    pub fn close(&self) -> Result<()> {
        self.store
            .close()
            .map_err(|source| self.io_error("close", source))
    }

    pub fn begin_update(&self) -> Result<()> {
        self.store
            .begin_update()
            .map_err(|source| self.io_error("begin update", source))
    }

    pub fn end_update(&self) -> Result<()> {
        self.store
            .end_update()
            .map_err(|source| self.io_error("end update", source))
    }

    pub fn corrupted(&self, offset: u64) -> Error {
        Error::Corrupted {
            name: self.name.clone(),
            offset,
        }
    }

    pub fn invalid_handle(&self, handle: u64) -> Error {
        Error::InvalidHandle {
            name: self.name.clone(),
            handle,
        }
    }

    fn io_error(&self, op: &'static str, source: std::io::Error) -> Error {
        Error::Io {
            name: self.name.clone(),
            op,
            source,
        }
    }
}
