//! # sluice-dedup
//!
//! Near-duplicate removal with MinHash and locality-sensitive hashing, as four dependent
//! pipeline stages:
//!
//! 1. [`MinhashDedupSignature`]: one signature per document, written per task and per bucket.
//! 2. [`MinhashDedupBuckets`]: documents with identical bands become candidate-duplicate edges.
//! 3. [`MinhashDedupCluster`]: a single task joins edges transitively into the removal set.
//! 4. [`MinhashDedupFilter`]: the corpus is re-read and every removed id is dropped.
//!
//! [`MinhashDedup`] wires the four executors together.
//!
//! ```no_run
//! use sluice_dedup::{MinhashConfig, MinhashDedup};
//! use sluice_pipeline::readers::JsonlReader;
//! use sluice_pipeline::PipelineStep;
//!
//! # fn main() -> sluice_dedup::Result<()> {
//! let dedup = MinhashDedup::new(
//!     MinhashConfig::default(),
//!     || Ok(Box::new(JsonlReader::new("data/")?) as Box<dyn PipelineStep>),
//!     "work/",
//!     "deduped/",
//! )
//! .with_tasks(16)
//! .with_workers(Some(8));
//!
//! let report = dedup.run()?;
//! println!("kept {}, removed {}", report.kept(), report.removed());
//! # Ok(())
//! # }
//! ```

pub mod buckets;
pub mod cluster;
pub mod config;
pub mod error;
pub mod filter;
pub mod minhash;
pub mod pipeline;
pub mod records;
pub mod signature;

pub use buckets::MinhashDedupBuckets;
pub use cluster::{ClusterAssignment, DocClusters, MinhashDedupCluster, UnionFind};
pub use config::MinhashConfig;
pub use error::{DedupError, Result};
pub use filter::MinhashDedupFilter;
pub use minhash::{MinHashSignature, MinHasher};
pub use pipeline::{DedupReport, MinhashDedup, ReaderFactory};
pub use signature::MinhashDedupSignature;
