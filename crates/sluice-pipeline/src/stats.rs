//! Per-step and per-task statistics written to the logging directory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Counters for one step of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStats {
    /// Step name.
    pub name: String,
    /// Documents pulled into the step.
    pub docs_in: u64,
    /// Documents the step yielded downstream.
    pub docs_out: u64,
    /// Step-specific counters (e.g. `dropped`, `signatures_written`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
}

impl StepStats {
    /// Empty stats for a named step.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add `n` to a named counter.
    pub fn add(&mut self, key: &str, n: u64) {
        *self.counters.entry(key.to_string()).or_default() += n;
    }

    /// Read a named counter (0 when never touched).
    #[must_use]
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    fn merge(&mut self, other: &StepStats) {
        self.docs_in += other.docs_in;
        self.docs_out += other.docs_out;
        for (key, value) in &other.counters {
            *self.counters.entry(key.clone()).or_default() += value;
        }
    }
}

/// Stats of a single task, persisted as `stats/{rank:05}.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Stage name.
    pub stage: String,
    /// Task index.
    pub rank: usize,
    /// Wall time of the task in seconds.
    pub elapsed_secs: f64,
    /// One entry per pipeline step, in pipeline order.
    pub steps: Vec<StepStats>,
}

/// Stats merged over every task of one executor invocation, persisted as `stats.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Stage name.
    pub stage: String,
    /// Number of tasks merged in.
    pub tasks: usize,
    /// Sum of task wall times in seconds.
    pub total_task_secs: f64,
    /// Per-step totals, in pipeline order.
    pub steps: Vec<StepStats>,
}

impl PipelineStats {
    /// Empty totals for the given stage and step names.
    #[must_use]
    pub fn new(stage: impl Into<String>, step_names: &[String]) -> Self {
        Self {
            stage: stage.into(),
            tasks: 0,
            total_task_secs: 0.0,
            steps: step_names.iter().map(StepStats::new).collect(),
        }
    }

    /// Fold one task's stats into the totals.
    pub fn merge(&mut self, task: &TaskStats) {
        self.tasks += 1;
        self.total_task_secs += task.elapsed_secs;
        for (total, step) in self.steps.iter_mut().zip(&task.steps) {
            total.merge(step);
        }
    }

    /// Totals for a step, looked up by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepStats> {
        self.steps.iter().find(|s| s.name == name)
    }
}
