//! Input readers.
//!
//! Readers are pipeline steps that first pass through whatever flows into them and then
//! append the documents of their own shard. The shard of task `rank` is
//! `files[rank::world_size]` over the sorted file list, so two tasks never read the same file.

mod jsonl;
mod parquet;

pub use self::jsonl::JsonlReader;
pub use self::parquet::ParquetReader;

use serde::{Deserialize, Serialize};
use sluice_core::{Compression, Document, LocalStorage, MetaValue, Metadata, StorageBackend};

use crate::error::Result;
use crate::step::StepContext;

/// Options shared by every reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderOptions {
    /// Field holding the document text.
    pub text_key: String,
    /// Field holding the document id; absent ids fall back to `"{file}/{row}"`.
    pub id_key: String,
    /// Metadata attached to every document; record fields take precedence.
    #[serde(default)]
    pub default_metadata: Metadata,
    /// Maximum number of documents each task reads.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            text_key: "text".to_string(),
            id_key: "id".to_string(),
            default_metadata: Metadata::new(),
            limit: None,
        }
    }
}

impl ReaderOptions {
    /// Turn one record into a document.
    ///
    /// Returns `None` (and bumps `missing_text`) when the record has no string text field.
    pub(crate) fn assemble(
        &self,
        source: &str,
        row: usize,
        mut fields: Metadata,
        ctx: StepContext<'_>,
    ) -> Option<Document> {
        let text = match fields.remove(&self.text_key) {
            Some(MetaValue::Str(text)) => text,
            _ => {
                ctx.incr("missing_text", 1);
                return None;
            }
        };
        let id = match fields.remove(&self.id_key) {
            Some(MetaValue::Null) | None => format!("{source}/{row}"),
            Some(value) => value.to_string(),
        };

        let mut metadata = self.default_metadata.clone();
        metadata.extend(fields);
        Some(Document { id, text, metadata })
    }
}

/// Sorted keys under `storage` whose name, minus any compression extension, ends with one
/// of `suffixes`.
pub(crate) fn list_files(storage: &LocalStorage, suffixes: &[&str]) -> Result<Vec<String>> {
    let keys = storage.list("")?;
    Ok(keys
        .into_iter()
        .filter(|key| {
            let stem = key
                .strip_suffix(Compression::from_path(key).extension())
                .unwrap_or(key);
            suffixes.iter().any(|suffix| stem.ends_with(suffix))
        })
        .collect())
}

/// The files of one task: every `world_size`-th entry starting at `rank`.
pub fn shard_files<T>(files: Vec<T>, rank: usize, world_size: usize) -> Vec<T> {
    files
        .into_iter()
        .skip(rank)
        .step_by(world_size.max(1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StepStats;
    use std::cell::RefCell;

    #[test]
    fn test_shard_files_interleaves() {
        let files: Vec<_> = (0..7).collect();
        assert_eq!(shard_files(files.clone(), 0, 3), vec![0, 3, 6]);
        assert_eq!(shard_files(files.clone(), 2, 3), vec![2, 5]);
        assert!(shard_files(files, 9, 10).is_empty());
    }

    #[test]
    fn test_assemble_falls_back_to_positional_id() {
        let stats = RefCell::new(StepStats::new("r"));
        let ctx = StepContext::new("s", 0, 1, &stats);
        let options = ReaderOptions {
            default_metadata: Metadata::from([("dump".to_string(), MetaValue::from("cc"))]),
            ..Default::default()
        };

        let mut fields = Metadata::new();
        fields.insert("text".into(), "hello".into());
        fields.insert("url".into(), "http://x".into());
        let doc = options.assemble("shard.jsonl", 4, fields, ctx).unwrap();

        assert_eq!(doc.id, "shard.jsonl/4");
        assert_eq!(doc.metadata["dump"], MetaValue::from("cc"));
        assert_eq!(doc.metadata["url"], MetaValue::from("http://x"));
        assert!(!doc.metadata.contains_key("text"));
    }

    #[test]
    fn test_assemble_skips_missing_text() {
        let stats = RefCell::new(StepStats::new("r"));
        let ctx = StepContext::new("s", 0, 1, &stats);
        let mut fields = Metadata::new();
        fields.insert("id".into(), MetaValue::Int(3));

        assert!(ReaderOptions::default().assemble("f", 0, fields, ctx).is_none());
        assert_eq!(stats.borrow().counter("missing_text"), 1);
    }
}
