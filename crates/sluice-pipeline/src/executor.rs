//! Local pipeline executor.
//!
//! Runs one pipeline over `tasks` shards on a bounded worker pool. Completed tasks leave a
//! durable marker in the logging directory; a rerun skips them and only re-executes what
//! failed or never ran.

use std::cell::RefCell;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sluice_core::hashing::fingerprint;
use tracing::{debug, info, info_span, warn};

use crate::checkpoint::{
    unix_now, CheckpointStore, CompletionMarker, CompletionTracker, ExecutorInfo, FailureRecord,
};
use crate::error::{PipelineError, Result, TaskFailure};
use crate::stats::{PipelineStats, StepStats, TaskStats};
use crate::step::{empty_stream, DocumentStream, PipelineStep, StepContext};

fn default_true() -> bool {
    true
}

fn default_poll_millis() -> u64 {
    1000
}

/// Concurrency limit of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workers {
    /// At most this many tasks at once.
    Bounded(usize),
    /// One worker per pending task.
    #[default]
    Unbounded,
}

impl Workers {
    /// The bound, if any.
    #[must_use]
    pub fn limit(self) -> Option<usize> {
        match self {
            Self::Bounded(n) => Some(n),
            Self::Unbounded => None,
        }
    }
}

impl From<Option<usize>> for Workers {
    fn from(value: Option<usize>) -> Self {
        value.map_or(Self::Unbounded, Self::Bounded)
    }
}

/// A contiguous range of ranks run by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTasks {
    /// First rank.
    pub offset: usize,
    /// Number of ranks.
    pub count: usize,
}

/// Configuration of one executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Stage name; identifies markers and log records.
    pub name: String,
    /// Number of shards.
    pub tasks: usize,
    /// Worker pool size.
    #[serde(default)]
    pub workers: Workers,
    /// Root of this executor's markers, failure records and stats.
    pub logging_dir: PathBuf,
    /// Upper bound of a random delay before each task starts.
    #[serde(default)]
    pub start_jitter_secs: u64,
    /// Skip tasks that already have a completion marker.
    #[serde(default = "default_true")]
    pub skip_completed: bool,
    /// Run only this sub-range of ranks.
    #[serde(default)]
    pub local_tasks: Option<LocalTasks>,
    /// How long to wait for a pending dependency; 0 checks once, `None` waits until it
    /// completes or fails.
    #[serde(default)]
    pub dependency_timeout_secs: Option<u64>,
    /// Dependency polling interval.
    #[serde(default = "default_poll_millis")]
    pub dependency_poll_millis: u64,
}

impl ExecutorConfig {
    /// A config with unbounded workers and default options.
    pub fn new(name: impl Into<String>, tasks: usize, logging_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            tasks,
            workers: Workers::Unbounded,
            logging_dir: logging_dir.into(),
            start_jitter_secs: 0,
            skip_completed: true,
            local_tasks: None,
            dependency_timeout_secs: None,
            dependency_poll_millis: default_poll_millis(),
        }
    }

    /// Limit concurrent tasks.
    #[must_use]
    pub fn with_workers(mut self, workers: impl Into<Workers>) -> Self {
        self.workers = workers.into();
        self
    }

    /// Random start delay in `[0, secs)`.
    #[must_use]
    pub fn with_start_jitter(mut self, secs: u64) -> Self {
        self.start_jitter_secs = secs;
        self
    }

    /// Sample a start delay below `start_jitter_secs`, if jitter is enabled.
    pub fn start_delay(&self) -> Option<Duration> {
        if self.start_jitter_secs == 0 {
            return None;
        }
        let bound = Duration::from_secs(self.start_jitter_secs);
        Some(rand::thread_rng().gen_range(Duration::ZERO..bound))
    }

    #[must_use]
    pub fn with_skip_completed(mut self, skip: bool) -> Self {
        self.skip_completed = skip;
        self
    }

    /// Run only ranks `offset..offset + count` here.
    #[must_use]
    pub fn with_local_tasks(mut self, offset: usize, count: usize) -> Self {
        self.local_tasks = Some(LocalTasks { offset, count });
        self
    }

    /// Wait up to `secs` for a pending dependency.
    #[must_use]
    pub fn with_dependency_timeout(mut self, secs: u64) -> Self {
        self.dependency_timeout_secs = Some(secs);
        self
    }

    /// Check counts and the local range.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PipelineError::Configuration("stage name must not be empty".into()));
        }
        if self.tasks == 0 {
            return Err(PipelineError::Configuration(format!(
                "stage '{}': tasks must be > 0",
                self.name
            )));
        }
        if self.workers == Workers::Bounded(0) {
            return Err(PipelineError::Configuration(format!(
                "stage '{}': workers must be > 0 or unbounded",
                self.name
            )));
        }
        if let Some(local) = self.local_tasks {
            if local.count == 0 || local.offset + local.count > self.tasks {
                return Err(PipelineError::Configuration(format!(
                    "stage '{}': local tasks {}..{} outside 0..{}",
                    self.name,
                    local.offset,
                    local.offset + local.count,
                    self.tasks
                )));
            }
        }
        Ok(())
    }

    /// Ranks this process is responsible for.
    #[must_use]
    pub fn local_ranks(&self) -> Range<usize> {
        match self.local_tasks {
            Some(local) => local.offset..local.offset + local.count,
            None => 0..self.tasks,
        }
    }
}

/// Cooperative cancellation flag, checked before each task and between documents.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// A fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a successful [`PipelineExecutor::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Stage name.
    pub stage: String,
    /// Total tasks of the stage.
    pub tasks: usize,
    /// Ranks executed by this invocation.
    pub executed: Vec<usize>,
    /// Ranks skipped because they already had a marker.
    pub skipped: Vec<usize>,
    /// Stats merged over the executed tasks.
    pub stats: PipelineStats,
    /// Wall time of the invocation.
    pub elapsed_secs: f64,
}

/// Runs an ordered list of steps over `tasks` shards.
pub struct PipelineExecutor {
    pipeline: Vec<Box<dyn PipelineStep>>,
    config: ExecutorConfig,
    depends_on: Option<CompletionTracker>,
    cancel: CancelHandle,
}

impl PipelineExecutor {
    /// Create an executor.
    pub fn new(pipeline: Vec<Box<dyn PipelineStep>>, config: ExecutorConfig) -> Self {
        Self {
            pipeline,
            config,
            depends_on: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Require `upstream` to be complete before any task starts.
    #[must_use]
    pub fn depends_on(mut self, upstream: CompletionTracker) -> Self {
        self.depends_on = Some(upstream);
        self
    }

    /// Share a cancellation flag with other executors.
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels this executor.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Readiness signal for dependent executors.
    #[must_use]
    pub fn readiness(&self) -> CompletionTracker {
        CompletionTracker::new(
            self.config.name.clone(),
            self.config.tasks,
            self.config.logging_dir.clone(),
        )
    }

    /// Executor configuration.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Step names in pipeline order.
    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        self.pipeline.iter().map(|s| s.name().to_string()).collect()
    }

    /// Digest of the stage name and every step's name and fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let parts = std::iter::once(self.config.name.clone()).chain(
            self.pipeline
                .iter()
                .flat_map(|s| [s.name().to_string(), s.fingerprint().unwrap_or_default()]),
        );
        fingerprint(parts)
    }

    /// Run every pending local task.
    ///
    /// Fails before any task starts on invalid configuration, an unsatisfied dependency, or
    /// markers written under a different configuration. Otherwise every task runs, and the
    /// result is [`PipelineError::TasksFailed`] if any of them failed.
    pub fn run(&self) -> Result<ExecutionReport> {
        let started = Instant::now();
        self.config.validate()?;
        if self.pipeline.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "stage '{}' has no steps",
                self.config.name
            )));
        }

        if let Some(upstream) = &self.depends_on {
            info!(stage = %self.config.name, dependency = %upstream.stage(), "Checking dependency");
            upstream.wait_unless(
                self.config.dependency_timeout_secs.map(Duration::from_secs),
                Duration::from_millis(self.config.dependency_poll_millis.max(1)),
                || self.cancel.is_cancelled(),
            )?;
        }

        let store = CheckpointStore::open(&self.config.logging_dir)?;
        let fingerprint = self.fingerprint();
        self.check_markers(&store, &fingerprint)?;
        store.write_executor_info(&ExecutorInfo {
            stage: self.config.name.clone(),
            tasks: self.config.tasks,
            workers: self.config.workers.limit(),
            steps: self.step_names(),
            fingerprint: fingerprint.clone(),
            started_at: unix_now(),
        })?;

        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for rank in self.config.local_ranks() {
            if self.config.skip_completed && store.marker(rank)?.is_some() {
                skipped.push(rank);
            } else {
                pending.push(rank);
            }
        }
        if !skipped.is_empty() {
            info!(
                stage = %self.config.name,
                skipped = skipped.len(),
                "Skipping tasks that already completed"
            );
        }

        let mut stats = PipelineStats::new(&self.config.name, &self.step_names());
        let mut failures = Vec::new();
        let mut executed = Vec::new();
        if !pending.is_empty() {
            let outcomes = self.run_pool(&pending, &store, &fingerprint)?;
            for (rank, outcome) in outcomes {
                match outcome {
                    Ok(task_stats) => {
                        stats.merge(&task_stats);
                        executed.push(rank);
                    }
                    Err(PipelineError::Cancelled) => {}
                    Err(e) => failures.push(TaskFailure {
                        rank,
                        error: e.to_string(),
                    }),
                }
            }
            store.write_merged_stats(&stats)?;
        }

        let elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            stage = %self.config.name,
            completed = executed.len(),
            skipped = skipped.len(),
            failed = failures.len(),
            elapsed_secs,
            "Stage finished"
        );
        for step in &stats.steps {
            debug!(
                stage = %self.config.name,
                step = %step.name,
                docs_in = step.docs_in,
                docs_out = step.docs_out,
                "Step totals"
            );
        }

        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !failures.is_empty() {
            return Err(PipelineError::TasksFailed {
                stage: self.config.name.clone(),
                failures,
            });
        }
        Ok(ExecutionReport {
            stage: self.config.name.clone(),
            tasks: self.config.tasks,
            executed,
            skipped,
            stats,
            elapsed_secs,
        })
    }

    fn check_markers(&self, store: &CheckpointStore, fingerprint: &str) -> Result<()> {
        for marker in store.markers()? {
            if marker.stage != self.config.name
                || marker.tasks != self.config.tasks
                || marker.fingerprint != fingerprint
            {
                return Err(PipelineError::Configuration(format!(
                    "{} holds a completion marker for task {} of stage '{}' ({} tasks) written with \
                     a different configuration; remove it or use another logging directory",
                    store.root().display(),
                    marker.rank,
                    marker.stage,
                    marker.tasks
                )));
            }
        }
        Ok(())
    }

    fn run_pool(
        &self,
        ranks: &[usize],
        store: &CheckpointStore,
        fingerprint: &str,
    ) -> Result<Vec<(usize, Result<TaskStats>)>> {
        let threads = self
            .config
            .workers
            .limit()
            .map_or(ranks.len(), |n| n.min(ranks.len()))
            .max(1);
        let stage = self.config.name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{stage}-{i}"))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("cannot start worker pool: {e}")))?;

        info!(
            stage = %self.config.name,
            tasks = ranks.len(),
            workers = threads,
            "Launching tasks"
        );
        Ok(pool.install(|| {
            ranks
                .par_iter()
                .map(|&rank| (rank, self.run_task(rank, store, fingerprint)))
                .collect()
        }))
    }

    fn run_task(
        &self,
        rank: usize,
        store: &CheckpointStore,
        fingerprint: &str,
    ) -> Result<TaskStats> {
        let span = info_span!("task", stage = %self.config.name, rank);
        let _enter = span.enter();

        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(delay) = self.config.start_delay() {
            debug!(delay_ms = delay.as_millis() as u64, "Delaying task start");
            std::thread::sleep(delay);
        }
        store.clear_failure(rank)?;

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(rank)))
            .unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(PipelineError::Step(format!("task panicked: {message}").into()))
            });

        match outcome {
            Ok(steps) => {
                let task_stats = TaskStats {
                    stage: self.config.name.clone(),
                    rank,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                    steps,
                };
                store.write_task_stats(&task_stats)?;
                store.write_marker(&CompletionMarker {
                    stage: self.config.name.clone(),
                    rank,
                    tasks: self.config.tasks,
                    fingerprint: fingerprint.to_string(),
                    success: true,
                    completed_at: unix_now(),
                })?;
                info!(elapsed_secs = task_stats.elapsed_secs, "Task completed");
                Ok(task_stats)
            }
            Err(PipelineError::Cancelled) => {
                warn!("Task cancelled");
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                warn!(error = %e, "Task failed");
                let record = FailureRecord {
                    stage: self.config.name.clone(),
                    rank,
                    error: e.to_string(),
                    failed_at: unix_now(),
                };
                if let Err(write_err) = store.write_failure(&record) {
                    warn!(error = %write_err, "Could not persist failure record");
                }
                Err(e)
            }
        }
    }

    /// Wire every step of one task and drain the final stream.
    fn execute(&self, rank: usize) -> Result<Vec<StepStats>> {
        let cells: Vec<RefCell<StepStats>> = self
            .pipeline
            .iter()
            .map(|step| RefCell::new(StepStats::new(step.name())))
            .collect();

        {
            let cancel = &self.cancel;
            let mut stream: DocumentStream<'_> = empty_stream();
            for (step, cell) in self.pipeline.iter().zip(&cells) {
                let ctx = StepContext::new(&self.config.name, rank, self.config.tasks, cell);
                let input: DocumentStream<'_> = Box::new(stream.map(move |doc| {
                    if cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    if doc.is_ok() {
                        ctx.record_in();
                    }
                    doc
                }));
                let output = step.run(input, ctx)?;
                stream = Box::new(output.inspect(move |doc| {
                    if doc.is_ok() {
                        ctx.record_out();
                    }
                }));
            }

            for doc in stream {
                doc?;
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
            }
        }

        Ok(cells.into_iter().map(RefCell::into_inner).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::Document;
    use tempfile::TempDir;

    struct Emit(usize);

    impl PipelineStep for Emit {
        fn name(&self) -> &str {
            "emit"
        }

        fn fingerprint(&self) -> Option<String> {
            Some(format!("emit:{}", self.0))
        }

        fn run<'a>(
            &'a self,
            input: DocumentStream<'a>,
            ctx: StepContext<'a>,
        ) -> Result<DocumentStream<'a>> {
            let rank = ctx.rank();
            Ok(Box::new(input.chain(
                (0..self.0).map(move |i| Ok(Document::new(format!("{rank}/{i}"), "x"))),
            )))
        }
    }

    fn executor(tmp: &TempDir, docs: usize, tasks: usize) -> PipelineExecutor {
        PipelineExecutor::new(
            vec![Box::new(Emit(docs))],
            ExecutorConfig::new("emit", tasks, tmp.path().join("logs")).with_workers(Some(2)),
        )
    }

    #[test]
    fn test_validate_rejects_bad_counts() {
        assert!(ExecutorConfig::new("s", 0, "/tmp/x").validate().is_err());
        assert!(ExecutorConfig::new("s", 2, "/tmp/x")
            .with_workers(Some(0))
            .validate()
            .is_err());
        assert!(ExecutorConfig::new("s", 2, "/tmp/x")
            .with_local_tasks(1, 2)
            .validate()
            .is_err());
        assert!(ExecutorConfig::new("s", 2, "/tmp/x")
            .with_local_tasks(1, 1)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_run_writes_markers_and_stats() {
        let tmp = TempDir::new().unwrap();
        let report = executor(&tmp, 3, 4).run().unwrap();

        assert_eq!(report.executed.len(), 4);
        assert_eq!(report.stats.step("emit").unwrap().docs_out, 12);

        let logs = tmp.path().join("logs");
        for rank in 0..4 {
            assert!(logs.join(format!("completions/{rank:05}.json")).is_file());
            assert!(logs.join(format!("stats/{rank:05}.json")).is_file());
        }
        assert!(logs.join("stats.json").is_file());
        assert!(logs.join("executor.json").is_file());
    }

    #[test]
    fn test_fingerprint_changes_with_step_config() {
        let tmp = TempDir::new().unwrap();
        assert_ne!(executor(&tmp, 1, 1).fingerprint(), executor(&tmp, 2, 1).fingerprint());
        assert_eq!(executor(&tmp, 1, 1).fingerprint(), executor(&tmp, 1, 1).fingerprint());
    }

    #[test]
    fn test_workers_serde_shape() {
        let json = serde_json::to_string(&Workers::Bounded(4)).unwrap();
        assert_eq!(json, r#"{"bounded":4}"#);
        let back: Workers = serde_json::from_str(r#""unbounded""#).unwrap();
        assert_eq!(back, Workers::Unbounded);
    }

    #[test]
    fn test_start_delay_stays_below_jitter() {
        let config = ExecutorConfig::new("s", 1, "logs");
        assert_eq!(config.start_delay(), None);

        let config = config.with_start_jitter(2);
        for _ in 0..50 {
            assert!(config.start_delay().unwrap() < Duration::from_secs(2));
        }

        let huge = ExecutorConfig::new("s", 1, "logs").with_start_jitter(u64::MAX);
        assert!(huge.start_delay().unwrap() < Duration::from_secs(u64::MAX));
    }
}
