//! # sluice-core
//!
//! Shared infrastructure for the sluice corpus-processing pipeline.
//!
//! Provides:
//! - The [`Document`] data model
//! - Storage backends behind the [`StorageBackend`] capability
//! - Streaming compression (zstd, lz4)
//! - Hashing (xxhash, sha1, blake3) and the [`HashConfig`] used by fingerprinting stages

pub mod compression;
pub mod document;
pub mod error;
pub mod hashing;
pub mod storage;

pub use compression::Compression;
pub use document::{Document, MetaValue, Metadata};
pub use error::{Result, SluiceError};
pub use hashing::{HashAlgorithm, HashConfig, HashFunction, Precision};
pub use storage::{LocalStorage, ObjectWriter, StorageBackend};
