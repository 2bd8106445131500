//! Durable task bookkeeping inside an executor's logging directory.
//!
//! ```text
//! <logging_dir>/
//!   executor.json            configuration snapshot of the latest invocation
//!   completions/00000.json   one marker per completed task
//!   failures/00003.json      one record per task whose latest attempt failed
//!   stats/00000.json         per-task stats
//!   stats.json               stats merged over the latest invocation
//! ```
//!
//! Markers are written atomically and only ever by the task that owns the rank, so
//! concurrent tasks never contend on a file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sluice_core::{LocalStorage, SluiceError, StorageBackend};

use crate::error::{PipelineError, Result};
use crate::stats::{PipelineStats, TaskStats};

const COMPLETIONS_DIR: &str = "completions";
const FAILURES_DIR: &str = "failures";
const STATS_DIR: &str = "stats";
const EXECUTOR_FILE: &str = "executor.json";
const MERGED_STATS_FILE: &str = "stats.json";

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn rank_key(dir: &str, rank: usize) -> String {
    format!("{dir}/{rank:05}.json")
}

/// Proof that a task completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    /// Stage that wrote the marker.
    pub stage: String,
    /// Task index.
    pub rank: usize,
    /// Number of tasks the stage was partitioned into.
    pub tasks: usize,
    /// Digest of the step configuration that produced the output.
    pub fingerprint: String,
    /// Always true; a marker is only written on success.
    pub success: bool,
    /// Completion time, seconds since the epoch.
    pub completed_at: u64,
}

/// Why the latest attempt of a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage name.
    pub stage: String,
    /// Task index.
    pub rank: usize,
    /// Rendered error.
    pub error: String,
    /// Failure time, seconds since the epoch.
    pub failed_at: u64,
}

/// Snapshot of an executor invocation, persisted as `executor.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    /// Stage name.
    pub stage: String,
    /// Number of tasks.
    pub tasks: usize,
    /// Worker limit, `None` when unbounded.
    pub workers: Option<usize>,
    /// Step names in pipeline order.
    pub steps: Vec<String>,
    /// Configuration fingerprint.
    pub fingerprint: String,
    /// Invocation time, seconds since the epoch.
    pub started_at: u64,
}

/// Reads and writes the bookkeeping files of one logging directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    storage: LocalStorage,
}

impl CheckpointStore {
    /// Open (creating if needed) a logging directory.
    pub fn open(logging_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            storage: LocalStorage::new(logging_dir)?,
        })
    }

    /// Root of the logging directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.get(key) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(SluiceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.storage.put(key, Bytes::from(data))?;
        Ok(())
    }

    fn read_all<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for key in self.storage.list(&format!("{dir}/"))? {
            if let Some(record) = self.read_json(&key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Marker for one rank, if the task completed.
    pub fn marker(&self, rank: usize) -> Result<Option<CompletionMarker>> {
        self.read_json(&rank_key(COMPLETIONS_DIR, rank))
    }

    /// Every marker in the directory.
    pub fn markers(&self) -> Result<Vec<CompletionMarker>> {
        self.read_all(COMPLETIONS_DIR)
    }

    /// Persist a completion marker.
    pub fn write_marker(&self, marker: &CompletionMarker) -> Result<()> {
        self.write_json(&rank_key(COMPLETIONS_DIR, marker.rank), marker)
    }

    /// Every failure record in the directory.
    pub fn failures(&self) -> Result<Vec<FailureRecord>> {
        self.read_all(FAILURES_DIR)
    }

    /// Persist a failure record.
    pub fn write_failure(&self, record: &FailureRecord) -> Result<()> {
        self.write_json(&rank_key(FAILURES_DIR, record.rank), record)
    }

    /// Remove the failure record of a rank, if any.
    pub fn clear_failure(&self, rank: usize) -> Result<()> {
        match self.storage.delete(&rank_key(FAILURES_DIR, rank)) {
            Ok(()) | Err(SluiceError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist stats of one task.
    pub fn write_task_stats(&self, stats: &TaskStats) -> Result<()> {
        self.write_json(&rank_key(STATS_DIR, stats.rank), stats)
    }

    /// Stats of one task, if it ever completed.
    pub fn task_stats(&self, rank: usize) -> Result<Option<TaskStats>> {
        self.read_json(&rank_key(STATS_DIR, rank))
    }

    /// Persist merged stats.
    pub fn write_merged_stats(&self, stats: &PipelineStats) -> Result<()> {
        self.write_json(MERGED_STATS_FILE, stats)
    }

    /// Merged stats of the latest invocation.
    pub fn merged_stats(&self) -> Result<Option<PipelineStats>> {
        self.read_json(MERGED_STATS_FILE)
    }

    /// Persist the executor snapshot.
    pub fn write_executor_info(&self, info: &ExecutorInfo) -> Result<()> {
        self.write_json(EXECUTOR_FILE, info)
    }

    /// Executor snapshot of the latest invocation.
    pub fn executor_info(&self) -> Result<Option<ExecutorInfo>> {
        self.read_json(EXECUTOR_FILE)
    }
}

/// Completion state of a stage, derived from durable files only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// Every task has a marker.
    Complete,
    /// These ranks failed on their latest attempt and have no marker.
    Failed(Vec<usize>),
    /// Some tasks have neither a marker nor a failure record yet.
    Pending {
        /// Tasks with a marker.
        completed: usize,
        /// Total tasks.
        total: usize,
    },
}

/// Readiness signal of an executor that other executors can depend on.
///
/// Cheap to clone; it only remembers where the executor keeps its markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionTracker {
    stage: String,
    tasks: usize,
    logging_dir: PathBuf,
}

impl CompletionTracker {
    /// Tracker for a stage with `tasks` tasks logging into `logging_dir`.
    #[must_use]
    pub fn new(stage: impl Into<String>, tasks: usize, logging_dir: impl Into<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            tasks,
            logging_dir: logging_dir.into(),
        }
    }

    /// Name of the tracked stage.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Current status of the tracked stage.
    pub fn status(&self) -> Result<StageStatus> {
        if !self.logging_dir.exists() {
            return Ok(StageStatus::Pending {
                completed: 0,
                total: self.tasks,
            });
        }
        let store = CheckpointStore::open(&self.logging_dir)?;

        let completed: BTreeSet<usize> = store
            .markers()?
            .into_iter()
            .filter(|m| m.success && m.stage == self.stage && m.rank < self.tasks)
            .map(|m| m.rank)
            .collect();
        if completed.len() == self.tasks {
            return Ok(StageStatus::Complete);
        }

        let failed: Vec<usize> = store
            .failures()?
            .into_iter()
            .filter(|f| f.stage == self.stage && !completed.contains(&f.rank))
            .map(|f| f.rank)
            .collect();
        if !failed.is_empty() {
            return Ok(StageStatus::Failed(failed));
        }

        Ok(StageStatus::Pending {
            completed: completed.len(),
            total: self.tasks,
        })
    }

    /// True when every task has a marker.
    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.status()? == StageStatus::Complete)
    }

    /// Block until the stage completes, polling every `poll`.
    ///
    /// Fails with [`PipelineError::DependencyFailure`] as soon as a task is seen failed, or
    /// once `timeout` elapses with the stage still pending. A zero timeout checks once;
    /// no timeout waits for as long as the stage is pending.
    pub fn wait(&self, timeout: Option<Duration>, poll: Duration) -> Result<()> {
        self.wait_unless(timeout, poll, || false)
    }

    /// Like [`wait`](Self::wait), but gives up with [`PipelineError::Cancelled`] once
    /// `cancelled` returns true while the stage is still pending.
    pub fn wait_unless(
        &self,
        timeout: Option<Duration>,
        poll: Duration,
        cancelled: impl Fn() -> bool,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.status()? {
                StageStatus::Complete => return Ok(()),
                StageStatus::Failed(ranks) => {
                    return Err(PipelineError::DependencyFailure {
                        stage: self.stage.clone(),
                        reason: format!("tasks {ranks:?} failed"),
                    })
                }
                StageStatus::Pending { completed, total } => {
                    let now = Instant::now();
                    let pause = match deadline {
                        Some(deadline) if now >= deadline => {
                            return Err(PipelineError::DependencyFailure {
                                stage: self.stage.clone(),
                                reason: format!("only {completed} of {total} tasks completed"),
                            });
                        }
                        Some(deadline) => poll.min(deadline - now),
                        None => poll,
                    };
                    if cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    tracing::debug!(
                        stage = %self.stage,
                        completed,
                        total,
                        "Waiting for dependency"
                    );
                    std::thread::sleep(pause);
                }
            }
        }
    }
}
