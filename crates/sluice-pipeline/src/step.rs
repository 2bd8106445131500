//! The `PipelineStep` capability and the per-step task context.

use std::cell::RefCell;

use sluice_core::Document;

use crate::error::Result;
use crate::stats::StepStats;

/// Lazy sequence of documents flowing between steps.
///
/// Items are pulled one at a time; no step is required to buffer its shard.
pub type DocumentStream<'a> = Box<dyn Iterator<Item = Result<Document>> + 'a>;

/// A stream that yields nothing.
#[must_use]
pub fn empty_stream<'a>() -> DocumentStream<'a> {
    Box::new(std::iter::empty())
}

/// What a step knows about the task it is running in.
///
/// Each step of a task receives its own context; counters recorded through it end up
/// in that step's entry of the task stats.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    stage: &'a str,
    rank: usize,
    world_size: usize,
    stats: &'a RefCell<StepStats>,
}

impl<'a> StepContext<'a> {
    /// Build a context. The executor does this for every step of every task.
    #[must_use]
    pub fn new(
        stage: &'a str,
        rank: usize,
        world_size: usize,
        stats: &'a RefCell<StepStats>,
    ) -> Self {
        Self {
            stage,
            rank,
            world_size,
            stats,
        }
    }

    /// Stage (executor) name.
    #[must_use]
    pub fn stage(&self) -> &'a str {
        self.stage
    }

    /// Index of the running task, in `0..world_size`.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of tasks of the stage.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Add `n` to a step counter.
    pub fn incr(&self, key: &str, n: u64) {
        self.stats.borrow_mut().add(key, n);
    }

    pub(crate) fn record_in(&self) {
        self.stats.borrow_mut().docs_in += 1;
    }

    pub(crate) fn record_out(&self) {
        self.stats.borrow_mut().docs_out += 1;
    }
}

/// One stage of a pipeline.
///
/// A step receives the stream produced by the previous step (empty for the first step) and
/// returns its own stream. It may filter, transform, or act as a sink that persists documents
/// and yields nothing. Implementations are shared by every task of an executor, so per-task
/// state belongs in the returned stream, never in `self`.
///
/// Output must depend only on the input and on `(rank, world_size)`, and any writes must be
/// idempotent per task so a rerun replaces rather than duplicates them.
pub trait PipelineStep: Send + Sync {
    /// Name used in stats and logs.
    fn name(&self) -> &str;

    /// Canonical rendering of the configuration that affects this step's output.
    ///
    /// Completion markers record a digest of every step's fingerprint; rerunning an executor
    /// whose fingerprint changed against existing markers is a configuration error.
    fn fingerprint(&self) -> Option<String> {
        None
    }

    /// Wire this step onto `input`.
    fn run<'a>(&'a self, input: DocumentStream<'a>, ctx: StepContext<'a>)
        -> Result<DocumentStream<'a>>;
}

impl<T: PipelineStep + ?Sized> PipelineStep for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fingerprint(&self) -> Option<String> {
        (**self).fingerprint()
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> Result<DocumentStream<'a>> {
        (**self).run(input, ctx)
    }
}

/// Run one step outside an executor, collecting its output and stats.
///
/// Handy for exercising a step against an in-memory shard.
pub fn run_step<S: PipelineStep + ?Sized>(
    step: &S,
    input: Vec<Document>,
    rank: usize,
    world_size: usize,
) -> Result<(Vec<Document>, StepStats)> {
    let stats = RefCell::new(StepStats::new(step.name()));
    let output = {
        let ctx = StepContext::new("standalone", rank, world_size, &stats);
        let input: DocumentStream<'_> = Box::new(input.into_iter().map(Ok));
        step.run(input, ctx)?.collect::<Result<Vec<_>>>()?
    };
    Ok((output, stats.into_inner()))
}
