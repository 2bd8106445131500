//! # sluice-pipeline
//!
//! A staged, resumable document pipeline.
//!
//! A pipeline is an ordered list of [`PipelineStep`]s. A [`PipelineExecutor`] runs it over
//! `tasks` disjoint shards on a bounded worker pool, records a completion marker per task in
//! its logging directory, and on rerun executes only the tasks without a marker. Executors
//! chain through [`CompletionTracker`]s: a dependent executor starts only once every task
//! upstream has completed.
//!
//! ```no_run
//! use sluice_pipeline::filters::{FilterStep, TextContainsFilter};
//! use sluice_pipeline::readers::JsonlReader;
//! use sluice_pipeline::writers::JsonlWriter;
//! use sluice_pipeline::{ExecutorConfig, PipelineExecutor};
//!
//! # fn main() -> sluice_pipeline::Result<()> {
//! let executor = PipelineExecutor::new(
//!     vec![
//!         Box::new(JsonlReader::new("data/")?),
//!         Box::new(FilterStep::new(TextContainsFilter::new("hugging"))),
//!         Box::new(JsonlWriter::new("out/")?),
//!     ],
//!     ExecutorConfig::new("filter", 8, "logs/filter").with_workers(Some(4)),
//! );
//! let report = executor.run()?;
//! println!("{} tasks executed", report.executed.len());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod filters;
pub mod readers;
pub mod stats;
pub mod step;
pub mod tokens;
pub mod writers;

pub use checkpoint::{CompletionTracker, StageStatus};
pub use error::{PipelineError, Result, TaskFailure};
pub use executor::{
    CancelHandle, ExecutionReport, ExecutorConfig, LocalTasks, PipelineExecutor, Workers,
};
pub use stats::{PipelineStats, StepStats, TaskStats};
pub use step::{empty_stream, run_step, DocumentStream, PipelineStep, StepContext};
pub use tokens::{Tokenizer, TokensCounter, WhitespaceTokenizer};
