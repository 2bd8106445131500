//! Storage backend abstraction.
//!
//! Every stage reads and writes through a [`StorageBackend`] rooted at its folder, so the
//! pipeline core never depends on a particular vendor client. The local filesystem backend
//! is always available.

mod local;

pub use local::LocalStorage;

use std::io::{Read, Write};

use bytes::Bytes;

use crate::error::Result;

/// An object being written. Nothing is visible under the key until [`commit`](Self::commit).
///
/// Dropping an uncommitted writer discards the data, so a failed task leaves no partial output.
pub trait ObjectWriter: Write + Send {
    /// Atomically publish the written bytes under the target key.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Trait for storage backends.
pub trait StorageBackend: Send + Sync {
    /// Open an object for streaming reads.
    fn open(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// Start writing an object.
    fn create(&self, key: &str) -> Result<Box<dyn ObjectWriter>>;

    /// Delete an object.
    fn delete(&self, key: &str) -> Result<()>;

    /// Check if key exists.
    fn exists(&self, key: &str) -> Result<bool>;

    /// List keys under a prefix, recursively, in lexicographic order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Human-readable location, used in logs and configuration fingerprints.
    fn describe(&self) -> String;

    /// Read a whole object.
    fn get(&self, key: &str) -> Result<Bytes> {
        let mut data = Vec::new();
        self.open(key)?.read_to_end(&mut data)?;
        Ok(Bytes::from(data))
    }

    /// Write a whole object.
    fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let mut writer = self.create(key)?;
        writer.write_all(&data)?;
        writer.commit()
    }
}
