//! The four dedup executors wired under one work folder.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sluice_pipeline::writers::JsonlWriter;
use sluice_pipeline::{
    CancelHandle, ExecutionReport, ExecutorConfig, PipelineExecutor, PipelineStep,
    TokensCounter, Workers,
};
use tracing::info;

use crate::buckets::MinhashDedupBuckets;
use crate::cluster::MinhashDedupCluster;
use crate::config::MinhashConfig;
use crate::error::{DedupError, Result};
use crate::filter::MinhashDedupFilter;
use crate::signature::MinhashDedupSignature;

/// Stage computing signatures.
pub const SIGNATURES_STAGE: &str = "signatures";
/// Stage merging buckets into edges.
pub const BUCKETS_STAGE: &str = "buckets";
/// Stage resolving clusters.
pub const CLUSTERS_STAGE: &str = "clusters";
/// Stage writing the deduplicated corpus.
pub const FILTER_STAGE: &str = "filter";

/// Builds a fresh reader step for the signature and filter stages.
///
/// Both stages must read the corpus with the same partitioning, so both get their reader
/// from the same factory.
pub type ReaderFactory =
    Box<dyn Fn() -> sluice_pipeline::Result<Box<dyn PipelineStep>> + Send + Sync>;

/// Reports of every stage of one dedup run, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    /// One report per stage.
    pub stages: Vec<ExecutionReport>,
}

impl DedupReport {
    /// Report of a stage, looked up by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&ExecutionReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    fn filter_counter(&self, step: &str, key: &str) -> u64 {
        self.stage(FILTER_STAGE)
            .and_then(|s| s.stats.step(step))
            .map_or(0, |step| step.counter(key))
    }

    /// Tokens read by the filter stage before dedup, in this invocation.
    #[must_use]
    pub fn tokens(&self) -> u64 {
        self.filter_counter("tokens_counter", "tokens")
    }

    /// Documents dropped by the filter stage in this invocation.
    #[must_use]
    pub fn removed(&self) -> u64 {
        self.filter_counter("minhash_filter", "removed")
    }

    /// Documents written by the filter stage in this invocation.
    #[must_use]
    pub fn kept(&self) -> u64 {
        self.filter_counter("minhash_filter", "kept")
    }

    /// True when every stage was already complete and nothing ran.
    #[must_use]
    pub fn fully_resumed(&self) -> bool {
        self.stages.iter().all(|s| s.executed.is_empty())
    }
}

/// Full MinHash deduplication of one corpus.
///
/// Layout under `work_dir`: `signatures/`, `buckets/`, `remove_ids/`. Each stage logs
/// to its own folder under the logging root (`work_dir/logs` unless overridden), so
/// completion markers of different stages never collide.
pub struct MinhashDedup {
    config: MinhashConfig,
    reader: ReaderFactory,
    work_dir: PathBuf,
    logging_dir: PathBuf,
    output_dir: PathBuf,
    tasks: usize,
    workers: Workers,
    workers_per_bucket: usize,
    save_cluster_ids: bool,
    exclusion_dir: Option<PathBuf>,
    start_jitter_secs: u64,
    cancel: CancelHandle,
}

impl MinhashDedup {
    /// Deduplicate what `reader` yields into `output_dir`.
    pub fn new<F>(
        config: MinhashConfig,
        reader: F,
        work_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self
    where
        F: Fn() -> sluice_pipeline::Result<Box<dyn PipelineStep>> + Send + Sync + 'static,
    {
        let work_dir = work_dir.into();
        Self {
            config,
            reader: Box::new(reader),
            logging_dir: work_dir.join("logs"),
            work_dir,
            output_dir: output_dir.into(),
            tasks: 1,
            workers: Workers::Unbounded,
            workers_per_bucket: 1,
            save_cluster_ids: false,
            exclusion_dir: None,
            start_jitter_secs: 0,
            cancel: CancelHandle::new(),
        }
    }

    /// Number of tasks of the signature and filter stages.
    #[must_use]
    pub fn with_tasks(mut self, tasks: usize) -> Self {
        self.tasks = tasks;
        self
    }

    /// Worker limit of every stage.
    #[must_use]
    pub fn with_workers(mut self, workers: impl Into<Workers>) -> Self {
        self.workers = workers.into();
        self
    }

    /// Split each bucket across `n` bucket-stage tasks.
    #[must_use]
    pub fn with_workers_per_bucket(mut self, n: usize) -> Self {
        self.workers_per_bucket = n;
        self
    }

    /// Write `clusters.jsonl` and annotate survivors with their cluster.
    #[must_use]
    pub fn with_cluster_ids(mut self, save: bool) -> Self {
        self.save_cluster_ids = save;
        self
    }

    /// Write removed documents to JSONL files under `dir`.
    #[must_use]
    pub fn with_exclusion_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exclusion_dir = Some(dir.into());
        self
    }

    /// Log to `dir` instead of `work_dir/logs`.
    #[must_use]
    pub fn with_logging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logging_dir = dir.into();
        self
    }

    /// Random startup delay of signature and filter tasks.
    #[must_use]
    pub fn with_start_jitter(mut self, secs: u64) -> Self {
        self.start_jitter_secs = secs;
        self
    }

    /// Share a cancellation flag with the caller.
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Folder holding intermediate files.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn stage_config(&self, name: &str, tasks: usize) -> ExecutorConfig {
        ExecutorConfig::new(name, tasks, self.logging_dir.join(name)).with_workers(self.workers)
    }

    /// Build the four executors, each depending on the previous one.
    pub fn executors(&self) -> Result<Vec<PipelineExecutor>> {
        self.config.validate()?;
        let signatures_dir = self.work_dir.join("signatures");
        let buckets_dir = self.work_dir.join("buckets");
        let remove_dir = self.work_dir.join("remove_ids");

        let signatures = PipelineExecutor::new(
            vec![
                (self.reader)()?,
                Box::new(MinhashDedupSignature::new(&signatures_dir, self.config)?),
            ],
            self.stage_config(SIGNATURES_STAGE, self.tasks)
                .with_start_jitter(self.start_jitter_secs),
        )
        .with_cancel_handle(self.cancel.clone());

        let bucket_step = MinhashDedupBuckets::new(&signatures_dir, &buckets_dir, self.config)?
            .with_workers_per_bucket(self.workers_per_bucket)?;
        let bucket_tasks = bucket_step.tasks();
        let buckets = PipelineExecutor::new(
            vec![Box::new(bucket_step)],
            self.stage_config(BUCKETS_STAGE, bucket_tasks),
        )
        .depends_on(signatures.readiness())
        .with_cancel_handle(self.cancel.clone());

        let clusters = PipelineExecutor::new(
            vec![Box::new(
                MinhashDedupCluster::new(&buckets_dir, &remove_dir)?
                    .with_cluster_ids(self.save_cluster_ids),
            )],
            self.stage_config(CLUSTERS_STAGE, 1),
        )
        .depends_on(buckets.readiness())
        .with_cancel_handle(self.cancel.clone());

        let mut dedup_filter =
            MinhashDedupFilter::new(&remove_dir)?.with_cluster_ids(self.save_cluster_ids);
        if let Some(dir) = &self.exclusion_dir {
            dedup_filter = dedup_filter.with_exclusion_writer(JsonlWriter::new(dir)?);
        }
        let filter = PipelineExecutor::new(
            vec![
                (self.reader)()?,
                Box::new(TokensCounter::new()),
                Box::new(dedup_filter),
                Box::new(JsonlWriter::new(&self.output_dir)?),
            ],
            self.stage_config(FILTER_STAGE, self.tasks)
                .with_start_jitter(self.start_jitter_secs),
        )
        .depends_on(clusters.readiness())
        .with_cancel_handle(self.cancel.clone());

        Ok(vec![signatures, buckets, clusters, filter])
    }

    /// Run all four stages in order.
    pub fn run(&self) -> Result<DedupReport> {
        self.run_with(|_| {})
    }

    /// Run all four stages, calling `before_stage` ahead of each one.
    pub fn run_with<F>(&self, mut before_stage: F) -> Result<DedupReport>
    where
        F: FnMut(&PipelineExecutor),
    {
        let mut stages = Vec::with_capacity(4);
        for executor in self.executors()? {
            if self.cancel.is_cancelled() {
                return Err(DedupError::Pipeline(sluice_pipeline::PipelineError::Cancelled));
            }
            before_stage(&executor);
            stages.push(executor.run()?);
        }

        let report = DedupReport { stages };
        info!(
            kept = report.kept(),
            removed = report.removed(),
            tokens = report.tokens(),
            resumed = report.fully_resumed(),
            "MinHash dedup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_pipeline::readers::JsonlReader;
    use tempfile::TempDir;

    fn dedup(tmp: &TempDir) -> MinhashDedup {
        let input = tmp.path().join("in");
        std::fs::create_dir_all(&input).unwrap();
        MinhashDedup::new(
            MinhashConfig::default(),
            move || Ok(Box::new(JsonlReader::new(&input)?) as Box<dyn PipelineStep>),
            tmp.path().join("work"),
            tmp.path().join("out"),
        )
    }

    #[test]
    fn test_executors_are_chained_with_expected_task_counts() {
        let tmp = TempDir::new().unwrap();
        let executors = dedup(&tmp)
            .with_tasks(3)
            .with_workers_per_bucket(2)
            .executors()
            .unwrap();

        let shape: Vec<_> = executors
            .iter()
            .map(|e| (e.config().name.as_str(), e.config().tasks))
            .collect();
        assert_eq!(
            shape,
            vec![("signatures", 3), ("buckets", 28), ("clusters", 1), ("filter", 3)]
        );
        assert_eq!(
            executors[3].step_names(),
            vec!["jsonl_reader", "tokens_counter", "minhash_filter", "jsonl_writer"]
        );
    }

    #[test]
    fn test_invalid_config_fails_before_running() {
        let tmp = TempDir::new().unwrap();
        let mut dedup = dedup(&tmp);
        dedup.config.n_grams = 0;
        assert!(matches!(dedup.run(), Err(DedupError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_workers_per_bucket_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let result = dedup(&tmp).with_workers_per_bucket(0).executors();
        assert!(matches!(result, Err(DedupError::InvalidConfig(_))));
    }
}
