//! JSON Lines reader (plain, zstd or lz4).

use std::io::BufRead;
use std::path::Path;

use sluice_core::{Compression, Document, LocalStorage, MetaValue, Metadata, StorageBackend};

use super::{list_files, shard_files, ReaderOptions};
use crate::error::{PipelineError, Result};
use crate::step::{DocumentStream, PipelineStep, StepContext};

const SUFFIXES: &[&str] = &[".jsonl", ".json", ".ndjson"];

/// Reads `*.jsonl` / `*.json` / `*.ndjson` files, optionally compressed.
///
/// A nested `metadata` object is flattened into the document metadata, so files written
/// by [`JsonlWriter`](crate::writers::JsonlWriter) read back unchanged.
#[derive(Debug, Clone)]
pub struct JsonlReader {
    storage: LocalStorage,
    options: ReaderOptions,
}

impl JsonlReader {
    /// Read every JSONL file below `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            storage: LocalStorage::new(data_dir)?,
            options: ReaderOptions::default(),
        })
    }

    /// Replace the reader options.
    #[must_use]
    pub fn with_options(mut self, options: ReaderOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the text field.
    #[must_use]
    pub fn with_text_key(mut self, key: impl Into<String>) -> Self {
        self.options.text_key = key.into();
        self
    }

    /// Set the id field.
    #[must_use]
    pub fn with_id_key(mut self, key: impl Into<String>) -> Self {
        self.options.id_key = key.into();
        self
    }

    /// Cap the number of documents per task.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    fn parse_line(
        &self,
        key: &str,
        row: usize,
        line: &str,
        ctx: StepContext<'_>,
    ) -> Result<Option<Document>> {
        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(line).map_err(|e| PipelineError::Parse {
                source_name: key.to_string(),
                row,
                message: e.to_string(),
            })?;

        let mut fields = Metadata::new();
        for (name, value) in object {
            match value {
                serde_json::Value::Object(nested) if name == "metadata" => {
                    for (k, v) in nested {
                        fields.entry(k).or_insert_with(|| MetaValue::from_json(&v));
                    }
                }
                value => {
                    fields.insert(name, MetaValue::from_json(&value));
                }
            }
        }
        Ok(self.options.assemble(key, row, fields, ctx))
    }

    fn read_file<'a>(&'a self, key: String, ctx: StepContext<'a>) -> DocumentStream<'a> {
        let opened = self
            .storage
            .open(&key)
            .and_then(|raw| Compression::from_path(&key).decoder(raw));
        let reader = match opened {
            Ok(reader) => reader,
            Err(e) => return Box::new(std::iter::once(Err(e.into()))),
        };
        tracing::debug!(file = %key, rank = ctx.rank(), "Reading");

        Box::new(reader.lines().enumerate().filter_map(move |(row, line)| {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                return None;
            }
            self.parse_line(&key, row, &line, ctx).transpose()
        }))
    }
}

impl PipelineStep for JsonlReader {
    fn name(&self) -> &str {
        "jsonl_reader"
    }

    fn fingerprint(&self) -> Option<String> {
        let options = serde_json::to_string(&self.options).ok()?;
        Some(format!("jsonl_reader:{}:{options}", self.storage.describe()))
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> Result<DocumentStream<'a>> {
        let files = shard_files(
            list_files(&self.storage, SUFFIXES)?,
            ctx.rank(),
            ctx.world_size(),
        );
        if files.is_empty() {
            tracing::warn!(
                rank = ctx.rank(),
                dir = %self.storage.describe(),
                "No input files for this task"
            );
        }
        ctx.incr("files", files.len() as u64);

        let docs = files.into_iter().flat_map(move |key| self.read_file(key, ctx));
        Ok(match self.options.limit {
            Some(limit) => Box::new(input.chain(docs.take(limit))),
            None => Box::new(input.chain(docs)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::run_step;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, lines: &[&str]) {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, lines.join("\n")).unwrap();
    }

    #[test]
    fn test_reads_ids_text_and_metadata() {
        let tmp = TempDir::new().unwrap();
        write_file(
            tmp.path(),
            "a.jsonl",
            &[
                r#"{"id": "d1", "text": "hello", "url": "u1"}"#,
                "",
                r#"{"text": "no id", "metadata": {"lang": "en"}}"#,
            ],
        );

        let reader = JsonlReader::new(tmp.path()).unwrap();
        let (docs, stats) = run_step(&reader, vec![], 0, 1).unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "d1");
        assert_eq!(docs[0].metadata["url"], MetaValue::from("u1"));
        assert_eq!(docs[1].id, "a.jsonl/2");
        assert_eq!(docs[1].metadata["lang"], MetaValue::from("en"));
        assert_eq!(stats.counter("files"), 1);
    }

    #[test]
    fn test_custom_keys_and_limit() {
        let tmp = TempDir::new().unwrap();
        write_file(
            tmp.path(),
            "x.jsonl",
            &[
                r#"{"doc": 1, "content": "one"}"#,
                r#"{"doc": 2, "content": "two"}"#,
                r#"{"doc": 3, "content": "three"}"#,
            ],
        );

        let reader = JsonlReader::new(tmp.path())
            .unwrap()
            .with_text_key("content")
            .with_id_key("doc")
            .with_limit(2);
        let (docs, _) = run_step(&reader, vec![], 0, 1).unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].id, "2");
        assert_eq!(docs[1].text, "two");
    }

    #[test]
    fn test_shards_files_across_tasks() {
        let tmp = TempDir::new().unwrap();
        for name in ["a.jsonl", "b.jsonl", "c.jsonl"] {
            write_file(tmp.path(), name, &[r#"{"text": "t"}"#]);
        }
        write_file(tmp.path(), "notes.txt", &["ignored"]);
        let reader = JsonlReader::new(tmp.path()).unwrap();

        let (rank0, _) = run_step(&reader, vec![], 0, 2).unwrap();
        let (rank1, _) = run_step(&reader, vec![], 1, 2).unwrap();
        let ids: Vec<_> = rank0.iter().chain(&rank1).map(|d| d.id.as_str()).collect();

        assert_eq!(ids, vec!["a.jsonl/0", "c.jsonl/0", "b.jsonl/0"]);
    }

    #[test]
    fn test_reads_zstd_and_passes_input_through() {
        let tmp = TempDir::new().unwrap();
        let file = std::fs::File::create(tmp.path().join("z.jsonl.zst")).unwrap();
        let mut encoder = Compression::Zstd.encoder(file).unwrap();
        writeln!(encoder, r#"{{"id": "z", "text": "compressed"}}"#).unwrap();
        encoder.finish().unwrap();

        let reader = JsonlReader::new(tmp.path()).unwrap();
        let (docs, _) = run_step(&reader, vec![Document::new("upstream", "u")], 0, 1).unwrap();

        assert_eq!(docs[0].id, "upstream");
        assert_eq!(docs[1].text, "compressed");
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let tmp = TempDir::new().unwrap();
        write_file(tmp.path(), "bad.jsonl", &["{not json"]);
        let reader = JsonlReader::new(tmp.path()).unwrap();

        let err = run_step(&reader, vec![], 0, 1).unwrap_err();
        assert!(matches!(err, PipelineError::Parse { row: 0, .. }));
    }
}
