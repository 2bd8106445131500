//! Document filters.
//!
//! A [`Filter`] only decides; [`FilterStep`] turns it into a pipeline step that counts
//! decisions and optionally routes dropped documents to an exclusion [`Writer`].

mod text;

pub use text::{MinWordsFilter, TextContainsFilter};

use sluice_core::Document;

use crate::error::Result;
use crate::step::{DocumentStream, PipelineStep, StepContext};
use crate::writers::{DocumentSink, Writer};

/// Metadata key set on dropped documents before they reach the exclusion writer.
pub const FILTER_REASON_KEY: &str = "filter_reason";

/// Outcome of a filter for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Pass the document downstream.
    Keep,
    /// Remove the document, with a short reason.
    Drop(String),
}

/// A keep/drop predicate over documents.
pub trait Filter: Send + Sync {
    /// Name used in stats and logs.
    fn name(&self) -> &str;

    /// Canonical rendering of the configuration that affects decisions.
    fn fingerprint(&self) -> Option<String> {
        None
    }

    /// Decide on one document.
    fn filter(&self, doc: &Document) -> Result<FilterDecision>;
}

/// Runs a [`Filter`] over a stream.
///
/// Counters: `kept`, `dropped`, and `dropped_{reason}` per reason.
pub struct FilterStep<F> {
    filter: F,
    exclusion: Option<Box<dyn Writer>>,
}

impl<F: Filter> FilterStep<F> {
    /// Wrap a filter without an exclusion writer.
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            exclusion: None,
        }
    }

    /// Send dropped documents to `writer`.
    #[must_use]
    pub fn with_exclusion_writer(mut self, writer: impl Writer + 'static) -> Self {
        self.exclusion = Some(Box::new(writer));
        self
    }

    /// The wrapped filter.
    pub fn filter(&self) -> &F {
        &self.filter
    }
}

impl<F: Filter> PipelineStep for FilterStep<F> {
    fn name(&self) -> &str {
        self.filter.name()
    }

    fn fingerprint(&self) -> Option<String> {
        let exclusion = self.exclusion.as_ref().and_then(|w| w.fingerprint());
        match (self.filter.fingerprint(), exclusion) {
            (None, None) => None,
            (filter, exclusion) => Some(format!(
                "{}|{}",
                filter.unwrap_or_default(),
                exclusion.unwrap_or_default()
            )),
        }
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> Result<DocumentStream<'a>> {
        let exclusion = match &self.exclusion {
            Some(writer) => Some(writer.open(ctx.rank())?),
            None => None,
        };
        Ok(Box::new(FilterStream {
            filter: &self.filter,
            input,
            exclusion,
            ctx,
            done: false,
        }))
    }
}

struct FilterStream<'a, F> {
    filter: &'a F,
    input: DocumentStream<'a>,
    exclusion: Option<Box<dyn DocumentSink>>,
    ctx: StepContext<'a>,
    done: bool,
}

impl<F: Filter> FilterStream<'_, F> {
    fn decide(&mut self, doc: Document) -> Result<Option<Document>> {
        match self.filter.filter(&doc)? {
            FilterDecision::Keep => {
                self.ctx.incr("kept", 1);
                Ok(Some(doc))
            }
            FilterDecision::Drop(reason) => {
                self.ctx.incr("dropped", 1);
                self.ctx.incr(&format!("dropped_{reason}"), 1);
                if let Some(sink) = self.exclusion.as_mut() {
                    sink.write(&doc.with_metadata(FILTER_REASON_KEY, reason))?;
                }
                Ok(None)
            }
        }
    }
}

impl<F: Filter> Iterator for FilterStream<'_, F> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(doc) = self.input.next() {
            match doc.and_then(|doc| self.decide(doc)) {
                Ok(Some(kept)) => return Some(Ok(kept)),
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    self.exclusion = None;
                    return Some(Err(e));
                }
            }
        }
        self.done = true;
        let sink = self.exclusion.take()?;
        sink.close().err().map(Err)
    }
}
