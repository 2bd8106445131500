//! Hashing functions and the hash configuration shared by fingerprinting stages.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Result, SluiceError};

/// Trait for hash functions that map bytes to an integer.
pub trait HashFunction: Send + Sync {
    /// Hash data and return u64.
    fn hash_u64(&self, data: &[u8]) -> u64;
}

/// XXHash3 hasher - extremely fast, good for checksums.
pub struct XxHash3;

impl XxHash3 {
    /// Create a new XXHash3 hasher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for XxHash3 {
    fn default() -> Self {
        Self::new()
    }
}

impl HashFunction for XxHash3 {
    fn hash_u64(&self, data: &[u8]) -> u64 {
        xxhash_rust::xxh3::xxh3_64(data)
    }
}

/// SHA-1 hasher. Slower than xxh3 but with fewer collisions on short shingles.
pub struct Sha1Hasher;

impl Sha1Hasher {
    /// Create a new SHA-1 hasher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for Sha1Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl HashFunction for Sha1Hasher {
    fn hash_u64(&self, data: &[u8]) -> u64 {
        let digest = Sha1::digest(data);
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(first)
    }
}

/// Hash algorithm used to turn shingles into integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-1, truncated to the configured precision.
    Sha1,
    /// XXH3 64-bit.
    #[default]
    Xxhash,
}

impl std::str::FromStr for HashAlgorithm {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "xxhash" | "xxh3" => Ok(Self::Xxhash),
            other => Err(SluiceError::Config(format!("unknown hash algorithm '{other}'"))),
        }
    }
}

/// Bit width of every hash value produced under a [`HashConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Precision {
    /// 32-bit hash values.
    Bits32,
    /// 64-bit hash values.
    #[default]
    Bits64,
}

impl Precision {
    /// Number of bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits32 => 32,
            Self::Bits64 => 64,
        }
    }

    /// Number of bytes used to store one value on disk.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }

    /// Largest representable value.
    #[must_use]
    pub const fn max_value(self) -> u64 {
        match self {
            Self::Bits32 => u32::MAX as u64,
            Self::Bits64 => u64::MAX,
        }
    }
}

impl TryFrom<u32> for Precision {
    type Error = String;

    fn try_from(bits: u32) -> std::result::Result<Self, Self::Error> {
        match bits {
            32 => Ok(Self::Bits32),
            64 => Ok(Self::Bits64),
            other => Err(format!("precision must be 32 or 64 bits, got {other}")),
        }
    }
}

impl From<Precision> for u32 {
    fn from(precision: Precision) -> Self {
        precision.bits()
    }
}

/// Hash function and bit precision used for fingerprinting.
///
/// Signatures computed under different configs are not comparable, so this value
/// is part of every stage's configuration fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HashConfig {
    /// Hash algorithm.
    pub algorithm: HashAlgorithm,
    /// Output precision.
    pub precision: Precision,
}

impl HashConfig {
    /// Create a new hash config.
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, precision: Precision) -> Self {
        Self {
            algorithm,
            precision,
        }
    }

    /// Hash `data` to an integer that fits in the configured precision.
    #[must_use]
    pub fn hash(&self, data: &[u8]) -> u64 {
        let full = match self.algorithm {
            HashAlgorithm::Sha1 => Sha1Hasher.hash_u64(data),
            HashAlgorithm::Xxhash => XxHash3.hash_u64(data),
        };
        full & self.precision.max_value()
    }

    /// Largest value a hash can take.
    #[must_use]
    pub fn max_value(&self) -> u64 {
        self.precision.max_value()
    }
}

/// Hex BLAKE3 digest over an ordered list of parts.
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
#[must_use]
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xxhash3_deterministic() {
        let hasher = XxHash3::new();
        let data = b"hello world";

        assert_eq!(hasher.hash_u64(data), hasher.hash_u64(data));
        assert_ne!(hasher.hash_u64(data), hasher.hash_u64(b"hello world!"));
    }

    #[test]
    fn test_sha1_known_prefix() {
        // sha1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        let hasher = Sha1Hasher::new();
        assert_eq!(
            hasher.hash_u64(b"abc"),
            u64::from_le_bytes([0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a])
        );
    }

    #[test]
    fn test_hash_config_precision_mask() {
        let config = HashConfig::new(HashAlgorithm::Sha1, Precision::Bits32);
        for word in ["alpha", "beta", "gamma", "delta"] {
            assert!(config.hash(word.as_bytes()) <= u64::from(u32::MAX));
        }

        let wide = HashConfig::new(HashAlgorithm::Sha1, Precision::Bits64);
        assert_eq!(
            wide.hash(b"alpha") & u64::from(u32::MAX),
            config.hash(b"alpha")
        );
    }

    #[test]
    fn test_hash_config_serde() {
        let config = HashConfig::new(HashAlgorithm::Sha1, Precision::Bits32);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"algorithm":"sha1","precision":32}"#);

        let back: HashConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let bad = serde_json::from_str::<HashConfig>(r#"{"algorithm":"sha1","precision":16}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("SHA1".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha1);
        assert_eq!("xxhash".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Xxhash);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_fingerprint_is_length_prefixed() {
        assert_ne!(fingerprint(["ab", "c"]), fingerprint(["a", "bc"]));
        assert_eq!(fingerprint(["x", "y"]), fingerprint(["x", "y"]));
    }
}
