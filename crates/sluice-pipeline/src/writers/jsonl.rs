//! JSON Lines writer.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use sluice_core::compression::CompressedWriter;
use sluice_core::{Compression, Document, LocalStorage, ObjectWriter, StorageBackend};

use super::{DocumentSink, SinkStream, Writer};
use crate::error::{PipelineError, Result};
use crate::step::{DocumentStream, PipelineStep, StepContext};

/// Default output filename template.
pub const DEFAULT_TEMPLATE: &str = "${rank}.jsonl";

/// Writes one JSON object per line: `{"id", "text", "metadata"}`.
///
/// The output filename is rendered from a template per document. `${rank}` expands to the
/// zero-padded task rank and `${key}` to the document's `key` metadata value, so a task
/// may produce several files. The compression extension is appended to every name.
#[derive(Debug, Clone)]
pub struct JsonlWriter {
    storage: LocalStorage,
    template: String,
    compression: Compression,
}

impl JsonlWriter {
    /// Write under `output_dir` with the default template and no compression.
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            storage: LocalStorage::new(output_dir)?,
            template: DEFAULT_TEMPLATE.to_string(),
            compression: Compression::None,
        })
    }

    /// Set the filename template.
    #[must_use]
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Set the compression codec.
    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        self.storage.root()
    }

    fn render_key(&self, rank: usize, doc: &Document) -> Result<String> {
        let mut key = String::with_capacity(self.template.len() + 8);
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find("${") {
            key.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                PipelineError::Configuration(format!("unclosed placeholder in '{}'", self.template))
            })?;
            let name = &after[..end];
            if name == "rank" {
                key.push_str(&format!("{rank:05}"));
            } else {
                let value = doc.metadata.get(name).ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "document '{}' has no metadata '{name}' required by '{}'",
                        doc.id, self.template
                    ))
                })?;
                key.push_str(&value.to_string());
            }
            rest = &after[end + 1..];
        }
        key.push_str(rest);
        key.push_str(self.compression.extension());
        Ok(key)
    }
}

impl Writer for JsonlWriter {
    fn name(&self) -> &str {
        "jsonl_writer"
    }

    fn fingerprint(&self) -> Option<String> {
        Some(format!(
            "jsonl_writer:{}:{}:{:?}",
            self.storage.describe(),
            self.template,
            self.compression
        ))
    }

    fn open(&self, rank: usize) -> Result<Box<dyn DocumentSink>> {
        Ok(Box::new(JsonlSink {
            writer: self.clone(),
            rank,
            files: BTreeMap::new(),
        }))
    }
}

impl PipelineStep for JsonlWriter {
    fn name(&self) -> &str {
        Writer::name(self)
    }

    fn fingerprint(&self) -> Option<String> {
        Writer::fingerprint(self)
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> Result<DocumentStream<'a>> {
        Ok(Box::new(SinkStream::new(input, self.open(ctx.rank())?)))
    }
}

struct JsonlSink {
    writer: JsonlWriter,
    rank: usize,
    files: BTreeMap<String, CompressedWriter<Box<dyn ObjectWriter>>>,
}

impl DocumentSink for JsonlSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        let key = self.writer.render_key(self.rank, doc)?;
        let out = match self.files.entry(key) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                let object = self.writer.storage.create(entry.key())?;
                entry.insert(self.writer.compression.encoder(object)?)
            }
        };
        serde_json::to_writer(&mut *out, doc)?;
        out.write_all(b"\n")?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        for (key, out) in self.files {
            out.finish()?.commit()?;
            tracing::debug!(file = %key, "Committed output");
        }
        Ok(())
    }
}
