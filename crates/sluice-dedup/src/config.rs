//! MinHash parameters shared by all four stages of one dedup run.

use serde::{Deserialize, Serialize};
use sluice_core::HashConfig;

use crate::error::{DedupError, Result};
use crate::minhash::MERSENNE_PRIME;

/// Default number of buckets (bands).
pub const DEFAULT_NUM_BUCKETS: usize = 14;

/// Default hashes per bucket.
pub const DEFAULT_HASHES_PER_BUCKET: usize = 8;

/// Default shingle size in words.
pub const DEFAULT_NGRAM_SIZE: usize = 5;

/// Default permutation seed.
pub const DEFAULT_SEED: u64 = 1;

/// MinHash configuration.
///
/// Two documents become candidate duplicates when all `hashes_per_bucket` values of at
/// least one of the `num_buckets` bands agree. Signatures computed under different
/// configurations are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinhashConfig {
    /// Number of bands.
    pub num_buckets: usize,
    /// Hash values per band.
    pub hashes_per_bucket: usize,
    /// Shingle size in words.
    pub n_grams: usize,
    /// Seed of the permutation parameters.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Shingle hash function and precision.
    #[serde(default)]
    pub hash_config: HashConfig,
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl Default for MinhashConfig {
    fn default() -> Self {
        Self {
            num_buckets: DEFAULT_NUM_BUCKETS,
            hashes_per_bucket: DEFAULT_HASHES_PER_BUCKET,
            n_grams: DEFAULT_NGRAM_SIZE,
            seed: DEFAULT_SEED,
            hash_config: HashConfig::default(),
        }
    }
}

impl MinhashConfig {
    /// Total permutations: `num_buckets * hashes_per_bucket`.
    #[must_use]
    pub fn num_hashes(&self) -> usize {
        self.num_buckets * self.hashes_per_bucket
    }

    /// Reject zero-sized parameters.
    pub fn validate(&self) -> Result<()> {
        if self.num_buckets == 0 || self.hashes_per_bucket == 0 || self.n_grams == 0 {
            return Err(DedupError::InvalidConfig(format!(
                "num_buckets ({}), hashes_per_bucket ({}) and n_grams ({}) must all be > 0",
                self.num_buckets, self.hashes_per_bucket, self.n_grams
            )));
        }
        Ok(())
    }

    /// Largest value a MinHash can take: the precision mask, capped below the
    /// permutation modulus.
    #[must_use]
    pub fn max_hash_value(&self) -> u64 {
        self.hash_config.max_value().min(MERSENNE_PRIME - 1)
    }

    /// Canonical rendering, part of every dedup step's fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "minhash:b{}:r{}:n{}:s{}:{:?}:{}",
            self.num_buckets,
            self.hashes_per_bucket,
            self.n_grams,
            self.seed,
            self.hash_config.algorithm,
            self.hash_config.precision.bits()
        )
    }
}
