//! Parquet reader.

use std::path::Path;

use ::arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, LargeStringArray, StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use ::arrow::datatypes::DataType;
use ::arrow::record_batch::RecordBatch;
use ::parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use sluice_core::{Document, LocalStorage, MetaValue, Metadata, StorageBackend};

use super::{list_files, shard_files, ReaderOptions};
use crate::error::Result;
use crate::step::{DocumentStream, PipelineStep, StepContext};

const SUFFIXES: &[&str] = &[".parquet"];

/// Rows per decoded record batch.
const BATCH_SIZE: usize = 4096;

/// Reads `*.parquet` files. Every non-text, non-id column becomes a metadata scalar.
#[derive(Debug, Clone)]
pub struct ParquetReader {
    storage: LocalStorage,
    options: ReaderOptions,
}

impl ParquetReader {
    /// Read every Parquet file below `data_dir`.
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

    /// Set the text column.
    #[must_use]
    pub fn with_text_key(mut self, key: impl Into<String>) -> Self {
        self.options.text_key = key.into();
        self
    }

    /// Set the id column.
    #[must_use]
    pub fn with_id_key(mut self, key: impl Into<String>) -> Self {
        self.options.id_key = key.into();
        self
    }

    fn batch_documents(
        &self,
        key: &str,
        first_row: usize,
        batch: &RecordBatch,
        ctx: StepContext<'_>,
    ) -> Vec<Result<Document>> {
        let schema = batch.schema();
        (0..batch.num_rows())
            .filter_map(|row| {
                let fields: Metadata = schema
                    .fields()
                    .iter()
                    .zip(batch.columns())
                    .map(|(field, column)| (field.name().clone(), meta_value(column.as_ref(), row)))
                    .collect();
                self.options.assemble(key, first_row + row, fields, ctx).map(Ok)
            })
            .collect()
    }

    fn open_batches(&self, key: &str) -> Result<ParquetRecordBatchReader> {
        let data = self.storage.get(key)?;
        Ok(ParquetRecordBatchReaderBuilder::try_new(data)?
            .with_batch_size(BATCH_SIZE)
            .build()?)
    }

    fn read_file<'a>(&'a self, key: String, ctx: StepContext<'a>) -> DocumentStream<'a> {
        let batches = match self.open_batches(&key) {
            Ok(batches) => batches,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        tracing::debug!(file = %key, rank = ctx.rank(), "Reading");

        let mut next_row = 0usize;
        Box::new(batches.flat_map(move |batch| match batch {
            Ok(batch) => {
                let first_row = next_row;
                next_row += batch.num_rows();
                self.batch_documents(&key, first_row, &batch, ctx)
            }
            Err(e) => vec![Err(e.into())],
        }))
    }
}

/// Scalar at `row`; types without a scalar mapping are rendered as text.
fn meta_value(array: &dyn Array, row: usize) -> MetaValue {
    if array.is_null(row) {
        return MetaValue::Null;
    }

    macro_rules! downcast {
        ($ty:ty, $wrap:expr) => {
            if let Some(arr) = array.as_any().downcast_ref::<$ty>() {
                return $wrap(arr.value(row));
            }
        };
    }

    match array.data_type() {
        DataType::Boolean => downcast!(BooleanArray, MetaValue::Bool),
        DataType::Int8 => downcast!(Int8Array, |v| MetaValue::Int(i64::from(v))),
        DataType::Int16 => downcast!(Int16Array, |v| MetaValue::Int(i64::from(v))),
        DataType::Int32 => downcast!(Int32Array, |v| MetaValue::Int(i64::from(v))),
        DataType::Int64 => downcast!(Int64Array, MetaValue::Int),
        DataType::UInt8 => downcast!(UInt8Array, |v| MetaValue::Int(i64::from(v))),
        DataType::UInt16 => downcast!(UInt16Array, |v| MetaValue::Int(i64::from(v))),
        DataType::UInt32 => downcast!(UInt32Array, |v| MetaValue::Int(i64::from(v))),
        DataType::UInt64 => downcast!(UInt64Array, |v: u64| match i64::try_from(v) {
            Ok(i) => MetaValue::Int(i),
            Err(_) => MetaValue::Str(v.to_string()),
        }),
        DataType::Float32 => downcast!(Float32Array, |v| MetaValue::Float(f64::from(v))),
        DataType::Float64 => downcast!(Float64Array, MetaValue::Float),
        DataType::Utf8 => downcast!(StringArray, |v: &str| MetaValue::Str(v.to_string())),
        DataType::LargeUtf8 => downcast!(LargeStringArray, |v: &str| MetaValue::Str(v.to_string())),
        _ => {}
    }

    ::arrow::util::display::array_value_to_string(array, row)
        .map(MetaValue::Str)
        .unwrap_or(MetaValue::Null)
}

impl PipelineStep for ParquetReader {
    fn name(&self) -> &str {
        "parquet_reader"
    }

    fn fingerprint(&self) -> Option<String> {
        let options = serde_json::to_string(&self.options).ok()?;
        Some(format!("parquet_reader:{}:{options}", self.storage.describe()))
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
    use ::arrow::array::ArrayRef;
    use ::arrow::datatypes::{Field, Schema};
    use ::parquet::arrow::ArrowWriter;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_parquet(path: &Path, ids: Option<Vec<&str>>, texts: Vec<&str>, scores: Vec<f64>) {
        let mut fields = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();
        if let Some(ids) = ids {
            fields.push(Field::new("id", DataType::Utf8, false));
            columns.push(Arc::new(StringArray::from(ids)));
        }
        fields.push(Field::new("text", DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(texts)));
        fields.push(Field::new("score", DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from(scores)));

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
        let file = std::fs::File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_reads_columns_as_metadata() {
        let tmp = TempDir::new().unwrap();
        write_parquet(
            &tmp.path().join("part-0.parquet"),
            Some(vec!["x", "y"]),
            vec!["first", "second"],
            vec![0.5, 1.5],
        );

        let reader = ParquetReader::new(tmp.path()).unwrap();
        let (docs, _) = run_step(&reader, vec![], 0, 1).unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "x");
        assert_eq!(docs[1].text, "second");
        assert_eq!(docs[1].metadata["score"], MetaValue::Float(1.5));
    }

    #[test]
    fn test_positional_ids_without_id_column() {
        let tmp = TempDir::new().unwrap();
        write_parquet(
            &tmp.path().join("p.parquet"),
            None,
            vec!["a", "b", "c"],
            vec![0.0, 0.0, 0.0],
        );

        let reader = ParquetReader::new(tmp.path()).unwrap();
        let (docs, _) = run_step(&reader, vec![], 0, 1).unwrap();

        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["p.parquet/0", "p.parquet/1", "p.parquet/2"]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("bad.parquet"), b"not parquet").unwrap();

        let reader = ParquetReader::new(tmp.path()).unwrap();
        assert!(run_step(&reader, vec![], 0, 1).is_err());
    }
}
