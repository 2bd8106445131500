//! Simple text predicates.

use sluice_core::Document;

use super::{Filter, FilterDecision};
use crate::error::Result;

/// Keeps documents whose text contains a substring.
#[derive(Debug, Clone)]
pub struct TextContainsFilter {
    needle: String,
    case_sensitive: bool,
}

impl TextContainsFilter {
    /// Case-sensitive match on `needle`.
    #[must_use]
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            case_sensitive: true,
        }
    }

    /// Match ignoring case.
    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self.needle = self.needle.to_lowercase();
        self
    }
}

impl Filter for TextContainsFilter {
    fn name(&self) -> &str {
        "text_contains"
    }

    fn fingerprint(&self) -> Option<String> {
        Some(format!(
            "text_contains:{:?}:{}",
            self.needle, self.case_sensitive
        ))
    }

    fn filter(&self, doc: &Document) -> Result<FilterDecision> {
        let found = if self.case_sensitive {
            doc.text.contains(&self.needle)
        } else {
            doc.text.to_lowercase().contains(&self.needle)
        };
        Ok(if found {
            FilterDecision::Keep
        } else {
            FilterDecision::Drop("no_match".into())
        })
    }
}

/// Drops documents with fewer than `min_words` whitespace-separated words.
#[derive(Debug, Clone, Copy)]
pub struct MinWordsFilter {
    min_words: usize,
}

impl MinWordsFilter {
    #[must_use]
    pub fn new(min_words: usize) -> Self {
        Self { min_words }
    }
}

impl Filter for MinWordsFilter {
    fn name(&self) -> &str {
        "min_words"
    }

    fn fingerprint(&self) -> Option<String> {
        Some(format!("min_words:{}", self.min_words))
    }

    fn filter(&self, doc: &Document) -> Result<FilterDecision> {
        Ok(if doc.text.split_whitespace().nth(self.min_words.saturating_sub(1)).is_some()
            || self.min_words == 0
        {
            FilterDecision::Keep
        } else {
            FilterDecision::Drop("too_short".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_contains() {
        let filter = TextContainsFilter::new("query_with_pdf");
        assert_eq!(
            filter.filter(&Document::new("a", "def query_with_pdf(x)")).unwrap(),
            FilterDecision::Keep
        );
        assert_eq!(
            filter.filter(&Document::new("b", "def Query_With_PDF(x)")).unwrap(),
            FilterDecision::Drop("no_match".into())
        );

        let loose = TextContainsFilter::new("Hugging").case_insensitive();
        assert_eq!(
            loose.filter(&Document::new("c", "HUGGING face")).unwrap(),
            FilterDecision::Keep
        );
    }

    #[test]
    fn test_min_words() {
        let filter = MinWordsFilter::new(3);
        assert_eq!(
            filter.filter(&Document::new("a", "one two  three")).unwrap(),
            FilterDecision::Keep
        );
        assert_eq!(
            filter.filter(&Document::new("b", "one two")).unwrap(),
            FilterDecision::Drop("too_short".into())
        );
        assert_eq!(
            MinWordsFilter::new(0).filter(&Document::new("c", "")).unwrap(),
            FilterDecision::Keep
        );
    }
}
