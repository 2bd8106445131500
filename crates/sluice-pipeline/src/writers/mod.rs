//! Output sinks.
//!
//! A [`Writer`] is the shareable configuration; [`Writer::open`] yields a per-task
//! [`DocumentSink`] that buffers output until [`DocumentSink::close`] commits it. A sink
//! dropped without `close` discards its output, so a failed task never publishes a partial file.

mod jsonl;

pub use jsonl::JsonlWriter;

use sluice_core::Document;

use crate::error::Result;
use crate::step::DocumentStream;

/// Shareable writer configuration.
pub trait Writer: Send + Sync {
    /// Name used in stats and logs.
    fn name(&self) -> &str;

    /// Canonical rendering of the configuration that affects output.
    fn fingerprint(&self) -> Option<String> {
        None
    }

    /// Open the sink of one task.
    fn open(&self, rank: usize) -> Result<Box<dyn DocumentSink>>;
}

/// Per-task output handle.
pub trait DocumentSink {
    /// Append one document.
    fn write(&mut self, doc: &Document) -> Result<()>;

    /// Flush and atomically publish everything written.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Drains a stream into a sink, yielding nothing unless something fails.
///
/// The sink is closed once the input is exhausted. On the first error the sink is dropped
/// uncommitted and the error is yielded.
pub struct SinkStream<'a> {
    input: DocumentStream<'a>,
    sink: Option<Box<dyn DocumentSink + 'a>>,
}

impl<'a> SinkStream<'a> {
    /// Wrap `input` so that pulling the result writes every document to `sink`.
    #[must_use]
    pub fn new(input: DocumentStream<'a>, sink: Box<dyn DocumentSink + 'a>) -> Self {
        Self {
            input,
            sink: Some(sink),
        }
    }
}

impl Iterator for SinkStream<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        let sink = self.sink.as_mut()?;
        for doc in self.input.by_ref() {
            let written = doc.and_then(|doc| sink.write(&doc));
            if let Err(e) = written {
                self.sink = None;
                return Some(Err(e));
            }
        }
        self.sink.take()?.close().err().map(Err)
    }
}
