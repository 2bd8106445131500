//! Token counting.
//!
//! [`TokensCounter`] passes every document through unchanged and records how many tokens
//! went by, so a stage placed before and after a filter reports what the filter removed.

use sluice_core::Document;

use crate::error::Result;
use crate::step::{DocumentStream, PipelineStep, StepContext};

/// Metadata key holding a document's token count.
pub const TOKEN_COUNT_KEY: &str = "token_count";

/// Splits text into tokens for counting.
pub trait Tokenizer: Send + Sync {
    /// Name recorded in the step fingerprint.
    fn name(&self) -> &str;

    /// Number of tokens in `text`.
    fn count(&self, text: &str) -> usize;
}

/// Whitespace-separated words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn name(&self) -> &str {
        "whitespace"
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Counts tokens of every document passing through.
///
/// Counters: `tokens` (sum over the shard). With [`TokensCounter::with_metadata`], each
/// document also gets a `token_count` metadata entry.
pub struct TokensCounter {
    tokenizer: Box<dyn Tokenizer>,
    set_metadata: bool,
}

impl TokensCounter {
    /// Count whitespace-separated words.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tokenizer(WhitespaceTokenizer)
    }

    /// Count with a custom tokenizer.
    pub fn with_tokenizer(tokenizer: impl Tokenizer + 'static) -> Self {
        Self {
            tokenizer: Box::new(tokenizer),
            set_metadata: false,
        }
    }

    /// Also store the count on each document.
    #[must_use]
    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.set_metadata = enabled;
        self
    }
}

impl Default for TokensCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStep for TokensCounter {
    fn name(&self) -> &str {
        "tokens_counter"
    }

    fn fingerprint(&self) -> Option<String> {
        // Metadata changes the output; the counter alone does not.
        self.set_metadata
            .then(|| format!("tokens_counter:{}", self.tokenizer.name()))
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> Result<DocumentStream<'a>> {
        Ok(Box::new(input.map(move |doc| {
            let doc: Document = doc?;
            let count = self.tokenizer.count(&doc.text);
            ctx.incr("tokens", count as u64);
            Ok(if self.set_metadata {
                doc.with_metadata(TOKEN_COUNT_KEY, count)
            } else {
                doc
            })
        })))
    }
}
