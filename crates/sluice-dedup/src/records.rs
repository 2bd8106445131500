//! On-disk layouts of the intermediate dedup files.
//!
//! Every file starts with a bincode-encoded [`FileHeader`] (magic and format version),
//! followed by a stream of bincode-encoded items that is read back until end of file.
//!
//! | File | After the header | Items |
//! |------|------------------|-------|
//! | `*.minhash.sig` | [`SignatureHeader`] | [`SignatureRecord`], sorted by `(band, doc_id)` |
//! | `*.dups` | | [`Edge`] |
//! | `removal.ids` | | doc id, sorted |

use std::collections::HashSet;
use std::fmt::Display;
use std::io::{BufRead, BufReader, Read, Write};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sluice_core::Precision;

use crate::error::{DedupError, Result};

const FORMAT_VERSION: u8 = 1;
const SIGNATURE_MAGIC: [u8; 4] = *b"SLMS";
const EDGES_MAGIC: [u8; 4] = *b"SLDP";
const REMOVAL_MAGIC: [u8; 4] = *b"SLRM";

/// Leading bytes of every intermediate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// File kind.
    pub magic: [u8; 4],
    /// Layout version.
    pub version: u8,
}

fn corrupt(kind: &'static str, file: &str, reason: impl Display) -> DedupError {
    DedupError::Corrupt {
        kind,
        file: file.to_string(),
        reason: reason.to_string(),
    }
}

fn write_header<W: Write>(writer: &mut W, magic: [u8; 4]) -> Result<()> {
    let header = FileHeader {
        magic,
        version: FORMAT_VERSION,
    };
    bincode::serialize_into(writer, &header)?;
    Ok(())
}

fn read_header<R: Read>(
    reader: &mut R,
    magic: [u8; 4],
    kind: &'static str,
    file: &str,
) -> Result<()> {
    let header: FileHeader = bincode::deserialize_from(reader)
        .map_err(|e| corrupt(kind, file, format!("missing header: {e}")))?;
    if header.magic != magic {
        return Err(corrupt(kind, file, "bad magic"));
    }
    if header.version != FORMAT_VERSION {
        return Err(corrupt(
            kind,
            file,
            format!("unsupported version {}", header.version),
        ));
    }
    Ok(())
}

/// Streams bincode items out of a file until its end.
///
/// End of file between two items ends the stream; anywhere else it is a corrupt file.
struct RecordReader<R, T> {
    reader: BufReader<R>,
    kind: &'static str,
    file: String,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<R: Read, T: DeserializeOwned> RecordReader<R, T> {
    fn new(reader: BufReader<R>, kind: &'static str, file: &str) -> Self {
        Self {
            reader,
            kind,
            file: file.to_string(),
            done: false,
            _item: PhantomData,
        }
    }

    fn next_item(&mut self) -> Result<Option<T>> {
        let at_end = self
            .reader
            .fill_buf()
            .map_err(|e| corrupt(self.kind, &self.file, e))?
            .is_empty();
        if at_end {
            return Ok(None);
        }
        bincode::deserialize_from(&mut self.reader)
            .map(Some)
            .map_err(|e| corrupt(self.kind, &self.file, e))
    }
}

impl<R: Read, T: DeserializeOwned> Iterator for RecordReader<R, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_item() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Shape of every record in a signature file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureHeader {
    /// Width of each stored hash value.
    pub precision: Precision,
    /// Values per band.
    pub hashes_per_bucket: usize,
}

/// One band of one document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Hash values of the band.
    pub band: Vec<u64>,
    /// Document id.
    pub doc_id: String,
}

/// Write a complete signature file. `records` must already be sorted.
pub fn write_signatures<W: Write>(
    writer: &mut W,
    header: SignatureHeader,
    records: &[SignatureRecord],
) -> Result<()> {
    write_header(writer, SIGNATURE_MAGIC)?;
    bincode::serialize_into(&mut *writer, &header)?;
    for record in records {
        bincode::serialize_into(&mut *writer, record)?;
    }
    Ok(())
}

/// Streams records out of a signature file.
pub struct SignatureReader<R: Read> {
    records: RecordReader<R, SignatureRecord>,
    hashes_per_bucket: usize,
}

impl<R: Read> SignatureReader<R> {
    /// Read the header; fails if it does not match `expected`.
    pub fn open(reader: R, file: &str, expected: SignatureHeader) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        read_header(&mut reader, SIGNATURE_MAGIC, "signature", file)?;
        let header: SignatureHeader = bincode::deserialize_from(&mut reader)
            .map_err(|e| corrupt("signature", file, format!("missing shape: {e}")))?;
        if header != expected {
            return Err(DedupError::IncompatibleSignatures {
                file: file.to_string(),
                reason: format!(
                    "written with {}-bit values and {} hashes per bucket, expected {}-bit and {}",
                    header.precision.bits(),
                    header.hashes_per_bucket,
                    expected.precision.bits(),
                    expected.hashes_per_bucket
                ),
            });
        }

        Ok(Self {
            records: RecordReader::new(reader, "signature", file),
            hashes_per_bucket: header.hashes_per_bucket,
        })
    }
}

impl<R: Read> Iterator for SignatureReader<R> {
    type Item = Result<SignatureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(record.and_then(|record| {
            if record.band.len() == self.hashes_per_bucket {
                Ok(record)
            } else {
                Err(corrupt(
                    "signature",
                    &self.records.file,
                    format!("band of {} values for {}", record.band.len(), record.doc_id),
                ))
            }
        }))
    }
}

/// A candidate-duplicate edge between two documents.
pub type Edge = (String, String);

/// Write a complete edge file.
pub fn write_edges<W: Write>(writer: &mut W, edges: &[Edge]) -> Result<()> {
    write_header(writer, EDGES_MAGIC)?;
    for edge in edges {
        bincode::serialize_into(&mut *writer, edge)?;
    }
    Ok(())
}

/// Read every edge of an edge file.
pub fn read_edges<R: Read>(reader: R, file: &str) -> Result<Vec<Edge>> {
    let mut reader = BufReader::new(reader);
    read_header(&mut reader, EDGES_MAGIC, "edge", file)?;
    RecordReader::new(reader, "edge", file).collect()
}

/// Write a removal set. `ids` should be sorted for reproducible output.
pub fn write_removal_set<'a, W, I>(writer: &mut W, ids: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a str>,
{
    write_header(writer, REMOVAL_MAGIC)?;
    for id in ids {
        bincode::serialize_into(&mut *writer, id)?;
    }
    Ok(())
}

/// Load a removal set whole.
pub fn read_removal_set<R: Read>(reader: R, file: &str) -> Result<HashSet<String>> {
    let mut reader = BufReader::new(reader);
    read_header(&mut reader, REMOVAL_MAGIC, "removal set", file)?;
    RecordReader::new(reader, "removal set", file).collect()
}
