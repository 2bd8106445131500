//! Stage 1: per-document MinHash signatures, split into one file per bucket.

use std::path::Path;

use sluice_core::{Document, LocalStorage, StorageBackend};
use sluice_pipeline::writers::{DocumentSink, SinkStream};
use sluice_pipeline::{DocumentStream, PipelineStep, StepContext};
use tracing::debug;

use crate::config::MinhashConfig;
use crate::error::Result;
use crate::minhash::MinHasher;
use crate::records::{write_signatures, SignatureHeader, SignatureRecord};

/// Suffix of every signature file.
pub const SIGNATURE_SUFFIX: &str = ".minhash.sig";

/// Storage key of the signatures of bucket `bucket` written by task `rank`.
#[must_use]
pub fn signature_key(bucket: usize, rank: usize) -> String {
    format!("bucket_{bucket:03}/{rank:05}{SIGNATURE_SUFFIX}")
}

/// Directory prefix holding every signature file of `bucket`.
#[must_use]
pub fn bucket_prefix(bucket: usize) -> String {
    format!("bucket_{bucket:03}/")
}

/// Computes a signature for every input document and writes its bands.
///
/// A sink: yields nothing. Each task writes exactly one file per bucket, possibly empty,
/// so the bucket stage sees the same layout regardless of the data. Documents without
/// words have no signature and are counted under `empty_documents`.
pub struct MinhashDedupSignature {
    storage: LocalStorage,
    hasher: MinHasher,
}

impl MinhashDedupSignature {
    /// Write signatures under `output_dir`.
    pub fn new(output_dir: impl AsRef<Path>, config: MinhashConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            storage: LocalStorage::new(output_dir)?,
            hasher: MinHasher::new(config),
        })
    }

    fn header(&self) -> SignatureHeader {
        let config = self.hasher.config();
        SignatureHeader {
            precision: config.hash_config.precision,
            hashes_per_bucket: config.hashes_per_bucket,
        }
    }
}

impl PipelineStep for MinhashDedupSignature {
    fn name(&self) -> &str {
        "minhash_signature"
    }

    fn fingerprint(&self) -> Option<String> {
        Some(self.hasher.config().fingerprint())
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> sluice_pipeline::Result<DocumentStream<'a>> {
        let sink = SignatureSink {
            step: self,
            ctx,
            buckets: vec![Vec::new(); self.hasher.config().num_buckets],
        };
        Ok(Box::new(SinkStream::new(input, Box::new(sink))))
    }
}

struct SignatureSink<'a> {
    step: &'a MinhashDedupSignature,
    ctx: StepContext<'a>,
    buckets: Vec<Vec<SignatureRecord>>,
}

impl DocumentSink for SignatureSink<'_> {
    fn write(&mut self, doc: &Document) -> sluice_pipeline::Result<()> {
        let Some(signature) = self.step.hasher.signature_from_text(&doc.text) else {
            self.ctx.incr("empty_documents", 1);
            return Ok(());
        };
        for (records, band) in self.buckets.iter_mut().zip(signature.bands()) {
            records.push(SignatureRecord {
                band: band.to_vec(),
                doc_id: doc.id.clone(),
            });
        }
        self.ctx.incr("signatures", 1);
        Ok(())
    }

    fn close(self: Box<Self>) -> sluice_pipeline::Result<()> {
        let header = self.step.header();
        let rank = self.ctx.rank();
        for (bucket, mut records) in self.buckets.into_iter().enumerate() {
            records.sort_unstable();
            let key = signature_key(bucket, rank);
            let mut writer = self.step.storage.create(&key)?;
            write_signatures(&mut writer, header, &records)?;
            writer.commit()?;
            debug!(key = %key, records = records.len(), "Wrote signature file");
        }
        Ok(())
    }
}
