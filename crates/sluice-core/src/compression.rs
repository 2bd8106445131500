//! Streaming compression for document shards (zstd, lz4, gzip).
//!
//! Readers pick the codec from the file extension; writers append it.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};

/// Compression codec applied to a whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    #[default]
    None,
    /// Zstandard frame, level 3.
    Zstd,
    /// LZ4 frame format for maximum speed.
    Lz4,
    /// Gzip member, default level.
    Gzip,
}

impl Compression {
    /// File extension appended by writers (including the dot), empty for `None`.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Zstd => ".zst",
            Self::Lz4 => ".lz4",
            Self::Gzip => ".gz",
        }
    }

    /// Detect the codec from a path's final extension.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("zst" | "zstd") => Self::Zstd,
            Some("lz4") => Self::Lz4,
            Some("gz" | "gzip") => Self::Gzip,
            _ => Self::None,
        }
    }

    /// Wrap a raw reader with the matching decoder.
    pub fn decoder<'a, R: Read + Send + 'a>(
        self,
        reader: R,
    ) -> Result<Box<dyn BufRead + Send + 'a>> {
        Ok(match self {
            Self::None => Box::new(BufReader::new(reader)),
            Self::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(reader)
                    .map_err(|e| SluiceError::Compression(e.to_string()))?;
                Box::new(BufReader::new(decoder))
            }
            Self::Lz4 => Box::new(BufReader::new(lz4_flex::frame::FrameDecoder::new(reader))),
            Self::Gzip => Box::new(BufReader::new(flate2::read::MultiGzDecoder::new(reader))),
        })
    }

    /// Wrap a raw writer with the matching encoder.
    pub fn encoder<W: Write>(self, writer: W) -> Result<CompressedWriter<W>> {
        Ok(match self {
            Self::None => CompressedWriter::Plain(writer),
            Self::Zstd => CompressedWriter::Zstd(
                zstd::stream::write::Encoder::new(writer, 3)
                    .map_err(|e| SluiceError::Compression(e.to_string()))?,
            ),
            Self::Lz4 => CompressedWriter::Lz4(lz4_flex::frame::FrameEncoder::new(writer)),
            Self::Gzip => CompressedWriter::Gzip(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::default(),
            )),
        })
    }
}

impl std::str::FromStr for Compression {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "zstd" | "zst" => Ok(Self::Zstd),
            "lz4" => Ok(Self::Lz4),
            "gzip" | "gz" => Ok(Self::Gzip),
            other => Err(SluiceError::Config(format!("unknown compression '{other}'"))),
        }
    }
}

/// Writer that must be explicitly finished to flush the trailing frame.
pub enum CompressedWriter<W: Write> {
    /// Pass-through.
    Plain(W),
    /// Zstandard encoder.
    Zstd(zstd::stream::write::Encoder<'static, W>),
    /// LZ4 frame encoder.
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    /// Gzip encoder.
    Gzip(flate2::write::GzEncoder<W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Flush the codec trailer and return the inner writer.
    pub fn finish(self) -> Result<W> {
        match self {
            Self::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Self::Zstd(encoder) => Ok(encoder.finish()?),
            Self::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| SluiceError::Compression(e.to_string())),
            Self::Gzip(encoder) => Ok(encoder.finish()?),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
            Self::Lz4(w) => w.write(buf),
            Self::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
            Self::Lz4(w) => w.flush(),
            Self::Gzip(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: Compression) {
        let original = b"{\"text\":\"hello world\"}\n".repeat(100);

        let mut encoder = codec.encoder(Vec::new()).unwrap();
        encoder.write_all(&original).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut decoded = Vec::new();
        codec
            .decoder(compressed.as_slice())
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();

        assert_eq!(decoded, original);
        if codec != Compression::None {
            assert!(compressed.len() < original.len());
        }
    }

    #[test]
    fn test_zstd_roundtrip() {
        roundtrip(Compression::Zstd);
    }

    #[test]
    fn test_lz4_roundtrip() {
        roundtrip(Compression::Lz4);
    }

    #[test]
    fn test_gzip_roundtrip() {
        roundtrip(Compression::Gzip);
    }

    #[test]
    fn test_plain_roundtrip() {
        roundtrip(Compression::None);
    }

    #[test]
    fn test_detection_from_path() {
        assert_eq!(Compression::from_path("a/00001.jsonl.zst"), Compression::Zstd);
        assert_eq!(Compression::from_path("a/00001.jsonl.lz4"), Compression::Lz4);
        assert_eq!(Compression::from_path("a/00001.jsonl.gz"), Compression::Gzip);
        assert_eq!(Compression::from_path("a/00001.jsonl"), Compression::None);
        assert_eq!("GZIP".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!(
            Compression::from_path(format!("x.jsonl{}", Compression::Zstd.extension())),
            Compression::Zstd
        );
    }
}
