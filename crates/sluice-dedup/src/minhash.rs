//! MinHash signature generation for document similarity.
//!
//! MinHash is a locality-sensitive hashing technique that approximates
//! the Jaccard similarity between sets. Here the sets are word n-gram
//! shingles of normalized text, and each permutation is a universal hash
//! `(a * h + b) mod (2^61 - 1)` of the shingle hash `h`.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::MinhashConfig;

/// Mersenne prime 2^61 - 1, the modulus of every permutation.
pub(crate) const MERSENNE_PRIME: u64 = (1 << 61) - 1;

/// MinHash signature: one minimum per permutation, grouped into bands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinHashSignature {
    /// The minimum hash values for each permutation.
    pub values: Vec<u64>,
    hashes_per_bucket: usize,
}

impl MinHashSignature {
    /// Number of permutations in this signature.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the signature is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The hash band of bucket `bucket`.
    #[must_use]
    pub fn band(&self, bucket: usize) -> &[u64] {
        let start = bucket * self.hashes_per_bucket;
        &self.values[start..start + self.hashes_per_bucket]
    }

    /// Iterate over all bands in bucket order.
    pub fn bands(&self) -> impl Iterator<Item = &[u64]> {
        self.values.chunks(self.hashes_per_bucket)
    }
}

/// MinHash signature generator.
///
/// Permutation parameters are drawn once from a `StdRng` seeded with
/// [`MinhashConfig::seed`], so every task of a run (and every rerun) hashes identically.
#[derive(Debug, Clone)]
pub struct MinHasher {
    config: MinhashConfig,
    /// `(a, b)` per permutation, `a` in `[1, p)` and `b` in `[0, p)`.
    permutations: Vec<(u64, u64)>,
}

impl MinHasher {
    /// Create a hasher for `config`.
    #[must_use]
    pub fn new(config: MinhashConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let permutations = (0..config.num_hashes())
            .map(|_| {
                (
                    rng.gen_range(1..MERSENNE_PRIME),
                    rng.gen_range(0..MERSENNE_PRIME),
                )
            })
            .collect();
        Self {
            config,
            permutations,
        }
    }

    /// The configuration this hasher was built from.
    #[must_use]
    pub fn config(&self) -> &MinhashConfig {
        &self.config
    }

    /// Generate a MinHash signature from a set of shingle hashes.
    ///
    /// Returns `None` for an empty set; an empty document has no meaningful signature.
    #[must_use]
    pub fn signature(&self, shingles: &HashSet<u64>) -> Option<MinHashSignature> {
        if shingles.is_empty() {
            return None;
        }

        let mask = self.config.hash_config.max_value();
        let mut min_hashes = vec![u64::MAX; self.permutations.len()];

        for &shingle in shingles {
            let h = u128::from(shingle % MERSENNE_PRIME);
            for (slot, &(a, b)) in min_hashes.iter_mut().zip(&self.permutations) {
                let permuted =
                    ((u128::from(a) * h + u128::from(b)) % u128::from(MERSENNE_PRIME)) as u64;
                *slot = (*slot).min(permuted & mask);
            }
        }

        Some(MinHashSignature {
            values: min_hashes,
            hashes_per_bucket: self.config.hashes_per_bucket,
        })
    }

    /// Generate a MinHash signature directly from text.
    #[must_use]
    pub fn signature_from_text(&self, text: &str) -> Option<MinHashSignature> {
        self.signature(&self.tokenize(text))
    }

    /// Tokenize text into n-gram shingle hashes.
    ///
    /// Text is lowercased and punctuation becomes whitespace before splitting into words.
    /// A text with fewer words than the n-gram size is a single shingle, so short exact
    /// duplicates still collide.
    #[must_use]
    pub fn tokenize(&self, text: &str) -> HashSet<u64> {
        let normalized = normalize(text);
        let words: Vec<&str> = normalized.split_whitespace().collect();
        let n = self.config.n_grams;
        let hash = |shingle: &str| self.config.hash_config.hash(shingle.as_bytes());

        if words.len() < n {
            if words.is_empty() {
                return HashSet::new();
            }
            return HashSet::from([hash(&words.join(" "))]);
        }

        words.windows(n).map(|gram| hash(&gram.join(" "))).collect()
    }

    /// Estimate Jaccard similarity from two MinHash signatures.
    ///
    /// The similarity is approximated by the fraction of hash values
    /// that match between the two signatures.
    #[must_use]
    pub fn similarity(sig1: &MinHashSignature, sig2: &MinHashSignature) -> f64 {
        if sig1.values.is_empty() || sig1.values.len() != sig2.values.len() {
            return 0.0;
        }

        let matches = sig1
            .values
            .iter()
            .zip(&sig2.values)
            .filter(|(a, b)| a == b)
            .count();

        matches as f64 / sig1.values.len() as f64
    }
}

/// Lowercase, and replace every non-alphanumeric, non-whitespace character with a space.
fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{HashAlgorithm, HashConfig, Precision};

    fn hasher() -> MinHasher {
        MinHasher::new(MinhashConfig::default())
    }

    #[test]
    fn test_minhash_identical_documents() {
        let hasher = hasher();
        let text = "The quick brown fox jumps over the lazy dog";

        let sig1 = hasher.signature_from_text(text).unwrap();
        let sig2 = hasher.signature_from_text(text).unwrap();

        assert_eq!(sig1, sig2);
        assert!((MinHasher::similarity(&sig1, &sig2) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_normalization_ignores_case_and_punctuation() {
        let hasher = hasher();
        assert_eq!(
            hasher.signature_from_text("The quick, brown fox!"),
            hasher.signature_from_text("the quick brown   FOX")
        );
    }

    #[test]
    fn test_minhash_different_documents() {
        let hasher = hasher();
        let sig1 = hasher
            .signature_from_text("The quick brown fox jumps over the lazy dog")
            .unwrap();
        let sig2 = hasher
            .signature_from_text("Completely different text about machine learning algorithms")
            .unwrap();

        let similarity = MinHasher::similarity(&sig1, &sig2);
        assert!(
            similarity < 0.3,
            "Different documents should have low similarity, got {similarity}"
        );
    }

    #[test]
    fn test_empty_document_has_no_signature() {
        let hasher = hasher();
        assert!(hasher.signature_from_text("").is_none());
        assert!(hasher.signature_from_text(" ... !!").is_none());
    }

    #[test]
    fn test_signature_shape() {
        let config = MinhashConfig {
            num_buckets: 4,
            hashes_per_bucket: 3,
            ..Default::default()
        };
        let sig = MinHasher::new(config)
            .signature_from_text("Some test document")
            .unwrap();

        assert_eq!(sig.len(), 12);
        assert_eq!(sig.bands().count(), 4);
        assert_eq!(sig.band(2), &sig.values[6..9]);
    }

    #[test]
    fn test_seed_controls_permutations() {
        let text = "Reproducibility test document with enough words";
        let a = MinHasher::new(MinhashConfig::default()).signature_from_text(text);
        let b = MinHasher::new(MinhashConfig::default()).signature_from_text(text);
        let c = MinHasher::new(MinhashConfig {
            seed: 7,
            ..Default::default()
        })
        .signature_from_text(text);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_precision_bounds_values() {
        let config = MinhashConfig {
            hash_config: HashConfig::new(HashAlgorithm::Sha1, Precision::Bits32),
            ..Default::default()
        };
        let sig = MinHasher::new(config)
            .signature_from_text("one two three four five six seven")
            .unwrap();
        assert!(sig.values.iter().all(|&v| v <= u64::from(u32::MAX)));
    }

    #[test]
    fn test_tokenize_basic() {
        let hasher = MinHasher::new(MinhashConfig {
            n_grams: 3,
            ..Default::default()
        });
        // "one two three", "two three four", "three four five"
        assert_eq!(hasher.tokenize("one two three four five").len(), 3);
    }

    #[test]
    fn test_tokenize_short_text() {
        let hasher = hasher();
        assert_eq!(hasher.tokenize("one two three").len(), 1);
    }

    #[test]
    fn test_jaccard_approximation() {
        let hasher = MinHasher::new(MinhashConfig {
            num_buckets: 32,
            hashes_per_bucket: 8,
            ..Default::default()
        });

        let text1 = "word1 word2 word3 word4 word5 word6 word7 word8 word9 word10";
        let text2 = "word1 word2 word3 word4 word5 wordA wordB wordC wordD wordE";

        let tokens1 = hasher.tokenize(text1);
        let tokens2 = hasher.tokenize(text2);
        let intersection = tokens1.intersection(&tokens2).count();
        let union = tokens1.union(&tokens2).count();
        let exact_jaccard = intersection as f64 / union as f64;

        let sig1 = hasher.signature(&tokens1).unwrap();
        let sig2 = hasher.signature(&tokens2).unwrap();
        let diff = (exact_jaccard - MinHasher::similarity(&sig1, &sig2)).abs();
        assert!(diff < 0.2, "exact {exact_jaccard}, diff {diff}");
    }
}
