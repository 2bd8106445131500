//! Stage 2: merge the signatures of one bucket and emit candidate-duplicate edges.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Read;
use std::path::Path;

use sluice_core::{LocalStorage, StorageBackend};
use sluice_pipeline::{DocumentStream, PipelineStep, StepContext};
use tracing::{debug, info};

use crate::config::MinhashConfig;
use crate::error::{DedupError, Result};
use crate::records::{write_edges, Edge, SignatureHeader, SignatureReader, SignatureRecord};
use crate::signature::{bucket_prefix, SIGNATURE_SUFFIX};

/// Suffix of every edge file.
pub const EDGES_SUFFIX: &str = ".dups";

/// Storage key of the edges found by one slice of one bucket.
#[must_use]
pub fn edges_key(bucket: usize, slice: usize) -> String {
    format!("{bucket:05}_{slice:02}{EDGES_SUFFIX}")
}

/// Range of first-hash values owned by one bucket task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HashSlice {
    start: u64,
    end: u64,
    /// The last slice also owns `end` itself.
    inclusive: bool,
}

impl HashSlice {
    fn new(max_value: u64, slice: usize, slices: usize) -> Self {
        let bound = |i: usize| (u128::from(max_value) * i as u128 / slices as u128) as u64;
        Self {
            start: bound(slice),
            end: bound(slice + 1),
            inclusive: slice + 1 == slices,
        }
    }

    fn contains(&self, value: u64) -> bool {
        value >= self.start && (value < self.end || (self.inclusive && value == self.end))
    }
}

type SignatureFile = SignatureReader<Box<dyn Read + Send>>;

/// Next record of `reader` whose first hash falls in `slice`, or `None` once past it.
fn next_in_slice(reader: &mut SignatureFile, slice: HashSlice) -> Result<Option<SignatureRecord>> {
    for record in reader.by_ref() {
        let record = record?;
        let first = record.band.first().copied().unwrap_or_default();
        if first < slice.start {
            continue;
        }
        if !slice.contains(first) {
            return Ok(None);
        }
        return Ok(Some(record));
    }
    Ok(None)
}

/// Groups documents with identical bands, one bucket (or bucket slice) per task.
///
/// Runs with `num_buckets * workers_per_bucket` tasks. Task `r` owns bucket
/// `r / workers_per_bucket` and the `r % workers_per_bucket`-th slice of the first-hash
/// value range of that bucket. The signature files of the bucket are merged in
/// `(band, doc_id)` order, and every member of a run of equal bands is linked to the
/// run's first (smallest) doc id.
pub struct MinhashDedupBuckets {
    input: LocalStorage,
    output: LocalStorage,
    config: MinhashConfig,
    workers_per_bucket: usize,
}

impl MinhashDedupBuckets {
    /// Read signatures from `signatures_dir`, write edges to `output_dir`.
    pub fn new(
        signatures_dir: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        config: MinhashConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            input: LocalStorage::new(signatures_dir)?,
            output: LocalStorage::new(output_dir)?,
            config,
            workers_per_bucket: 1,
        })
    }

    /// Split each bucket across `n` tasks.
    pub fn with_workers_per_bucket(mut self, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(DedupError::InvalidConfig(
                "workers_per_bucket must be > 0".into(),
            ));
        }
        self.workers_per_bucket = n;
        Ok(self)
    }

    /// Number of tasks the bucket executor must be started with.
    #[must_use]
    pub fn tasks(&self) -> usize {
        self.config.num_buckets * self.workers_per_bucket
    }

    fn open_bucket(&self, bucket: usize) -> Result<Vec<SignatureFile>> {
        let header = SignatureHeader {
            precision: self.config.hash_config.precision,
            hashes_per_bucket: self.config.hashes_per_bucket,
        };
        self.input
            .list(&bucket_prefix(bucket))?
            .into_iter()
            .filter(|key| key.ends_with(SIGNATURE_SUFFIX))
            .map(|key| SignatureReader::open(self.input.open(&key)?, &key, header))
            .collect()
    }

    /// K-way merge of the bucket's files, restricted to `slice`.
    fn find_edges(&self, bucket: usize, slice: HashSlice) -> Result<Vec<Edge>> {
        let mut files = self.open_bucket(bucket)?;
        debug!(bucket, files = files.len(), "Merging signature files");

        let mut heap = BinaryHeap::with_capacity(files.len());
        for (idx, file) in files.iter_mut().enumerate() {
            if let Some(record) = next_in_slice(file, slice)? {
                heap.push(Reverse((record, idx)));
            }
        }

        let mut edges = Vec::new();
        let mut run: Option<SignatureRecord> = None;
        while let Some(Reverse((record, idx))) = heap.pop() {
            if let Some(next) = next_in_slice(&mut files[idx], slice)? {
                heap.push(Reverse((next, idx)));
            }
            match &run {
                Some(head) if head.band == record.band => {
                    if head.doc_id != record.doc_id {
                        edges.push((head.doc_id.clone(), record.doc_id));
                    }
                }
                _ => run = Some(record),
            }
        }
        Ok(edges)
    }
}

impl PipelineStep for MinhashDedupBuckets {
    fn name(&self) -> &str {
        "minhash_buckets"
    }

    fn fingerprint(&self) -> Option<String> {
        Some(format!(
            "{}:wpb{}",
            self.config.fingerprint(),
            self.workers_per_bucket
        ))
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> sluice_pipeline::Result<DocumentStream<'a>> {
        if ctx.world_size() != self.tasks() {
            return Err(DedupError::TaskCount {
                stage: "buckets",
                expected: self.tasks(),
                actual: ctx.world_size(),
            }
            .into());
        }

        let bucket = ctx.rank() / self.workers_per_bucket;
        let slice_index = ctx.rank() % self.workers_per_bucket;
        let slice = HashSlice::new(
            self.config.max_hash_value(),
            slice_index,
            self.workers_per_bucket,
        );

        let edges = self.find_edges(bucket, slice)?;
        let key = edges_key(bucket, slice_index);
        let mut writer = self.output.create(&key)?;
        write_edges(&mut writer, &edges)?;
        writer.commit()?;

        ctx.incr("edges", edges.len() as u64);
        info!(bucket, slice = slice_index, edges = edges.len(), "Bucket done");
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minhash::MinHasher;
    use crate::records::{read_edges, write_signatures};
    use crate::signature::MinhashDedupSignature;
    use sluice_core::{Document, Precision};
    use sluice_pipeline::run_step;
    use tempfile::TempDir;

    fn config() -> MinhashConfig {
        MinhashConfig {
            num_buckets: 1,
            hashes_per_bucket: 2,
            ..Default::default()
        }
    }

    fn write_file(dir: &Path, rank: usize, records: &[([u64; 2], &str)]) {
        let storage = LocalStorage::new(dir).unwrap();
        let mut records: Vec<_> = records
            .iter()
            .map(|(band, id)| SignatureRecord {
                band: band.to_vec(),
                doc_id: (*id).to_string(),
            })
            .collect();
        records.sort();
        let header = SignatureHeader {
            precision: Precision::Bits64,
            hashes_per_bucket: 2,
        };
        let mut writer = storage
            .create(&crate::signature::signature_key(0, rank))
            .unwrap();
        write_signatures(&mut writer, header, &records).unwrap();
        writer.commit().unwrap();
    }

    fn edges(dir: &Path, key: &str) -> Vec<Edge> {
        let storage = LocalStorage::new(dir).unwrap();
        read_edges(storage.open(key).unwrap(), key).unwrap()
    }

    #[test]
    fn test_hash_slices_partition_the_range() {
        let slices: Vec<_> = (0..3).map(|s| HashSlice::new(u64::MAX, s, 3)).collect();
        assert_eq!(slices[0].start, 0);
        assert_eq!(slices[0].end, slices[1].start);
        assert_eq!(slices[1].end, slices[2].start);
        assert!(slices[2].contains(u64::MAX));
        assert!(!slices[1].contains(slices[1].end));
    }

    #[test]
    fn test_equal_bands_across_files_become_star_edges() {
        let tmp = TempDir::new().unwrap();
        let sigs = tmp.path().join("sigs");
        write_file(&sigs, 0, &[([1, 1], "c"), ([5, 5], "x")]);
        write_file(&sigs, 1, &[([1, 1], "a"), ([1, 1], "b"), ([2, 2], "y")]);

        let step = MinhashDedupBuckets::new(&sigs, tmp.path().join("out"), config()).unwrap();
        let (_, stats) = run_step(&step, vec![], 0, 1).unwrap();

        assert_eq!(stats.counter("edges"), 2);
        assert_eq!(
            edges(&tmp.path().join("out"), "00000_00.dups"),
            vec![
                ("a".to_string(), "b".to_string()),
                ("a".to_string(), "c".to_string())
            ]
        );
    }

    #[test]
    fn test_slices_split_the_work() {
        let tmp = TempDir::new().unwrap();
        let sigs = tmp.path().join("sigs");
        let high = config().max_hash_value() - 1;
        write_file(&sigs, 0, &[([1, 1], "a"), ([high, 0], "p")]);
        write_file(&sigs, 1, &[([1, 1], "b"), ([high, 0], "q")]);

        let out = tmp.path().join("out");
        let step = MinhashDedupBuckets::new(&sigs, &out, config())
            .unwrap()
            .with_workers_per_bucket(2)
            .unwrap();
        run_step(&step, vec![], 0, 2).unwrap();
        run_step(&step, vec![], 1, 2).unwrap();

        assert_eq!(
            edges(&out, "00000_00.dups"),
            vec![("a".to_string(), "b".to_string())]
        );
        assert_eq!(
            edges(&out, "00000_01.dups"),
            vec![("p".to_string(), "q".to_string())]
        );
    }

    #[test]
    fn test_real_signatures_spread_over_every_slice() {
        let config = MinhashConfig::default();
        let hasher = MinHasher::new(config);
        let slices: Vec<_> = (0..8)
            .map(|s| HashSlice::new(config.max_hash_value(), s, 8))
            .collect();

        // short texts are a single shingle, so their first hash is uniform over the range
        let mut counts = [0usize; 8];
        for i in 0..2000 {
            let text = format!("document {i} topic{}", i % 7);
            let signature = hasher.signature_from_text(&text).unwrap();
            let first = signature.band(0)[0];
            let owner = slices.iter().position(|s| s.contains(first)).unwrap();
            counts[owner] += 1;
        }
        assert!(counts.iter().all(|&n| n > 100), "{counts:?}");
    }

    #[test]
    fn test_every_slice_finds_its_share_of_duplicates() {
        let tmp = TempDir::new().unwrap();
        let sigs = tmp.path().join("sigs");
        let out = tmp.path().join("out");
        let config = MinhashConfig {
            num_buckets: 1,
            ..Default::default()
        };

        let signatures = MinhashDedupSignature::new(&sigs, config).unwrap();
        let docs: Vec<_> = (0..60)
            .flat_map(|i| {
                let text = format!("pair {i} item{i}");
                [
                    Document::new(format!("a{i:02}"), text.clone()),
                    Document::new(format!("b{i:02}"), text),
                ]
            })
            .collect();
        run_step(&signatures, docs, 0, 1).unwrap();

        let step = MinhashDedupBuckets::new(&sigs, &out, config)
            .unwrap()
            .with_workers_per_bucket(3)
            .unwrap();
        let mut total = 0;
        for rank in 0..3 {
            let (_, stats) = run_step(&step, vec![], rank, 3).unwrap();
            assert!(stats.counter("edges") > 0, "slice {rank} found no edges");
            total += stats.counter("edges");
        }
        assert_eq!(total, 60);
    }

    #[test]
    fn test_wrong_task_count_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let step = MinhashDedupBuckets::new(tmp.path(), tmp.path(), config()).unwrap();
        let err = run_step(&step, vec![], 0, 3).unwrap_err();
        assert!(err.to_string().contains("expects 1 tasks, got 3"));
    }

    #[test]
    fn test_incompatible_signatures_fail() {
        let tmp = TempDir::new().unwrap();
        let sigs = tmp.path().join("sigs");
        write_file(&sigs, 0, &[([1, 1], "a")]);

        let narrow = MinhashConfig {
            hash_config: sluice_core::HashConfig::new(
                sluice_core::HashAlgorithm::Xxhash,
                Precision::Bits32,
            ),
            ..config()
        };
        let step = MinhashDedupBuckets::new(&sigs, tmp.path().join("out"), narrow).unwrap();
        let err = run_step(&step, vec![], 0, 1).unwrap_err();
        assert!(err.to_string().contains("incompatible"));
    }
}
