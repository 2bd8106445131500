//! Stage 4: drop every document listed in the removal set.

use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;

use sluice_core::{Document, LocalStorage, StorageBackend};
use sluice_pipeline::writers::{DocumentSink, Writer};
use sluice_pipeline::{DocumentStream, PipelineStep, StepContext};
use tracing::debug;

use crate::cluster::{ClusterAssignment, CLUSTERS_FILE, REMOVAL_FILE};
use crate::error::Result;
use crate::records::read_removal_set;

/// Metadata key holding the representative id of a surviving clustered document.
pub const CLUSTER_ID_KEY: &str = "minhash_cluster_id";

/// Metadata key holding the size of that cluster.
pub const CLUSTER_SIZE_KEY: &str = "minhash_cluster_size";

/// Removes duplicates from a re-read corpus.
///
/// The removal set is loaded once per task and held read-only while the task streams.
/// Removed documents may be routed to an exclusion writer. Counters: `kept`, `removed`.
pub struct MinhashDedupFilter {
    storage: LocalStorage,
    load_cluster_ids: bool,
    exclusion: Option<Box<dyn Writer>>,
}

impl MinhashDedupFilter {
    /// Read the removal set from `removal_dir`.
    pub fn new(removal_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            storage: LocalStorage::new(removal_dir)?,
            load_cluster_ids: false,
            exclusion: None,
        })
    }

    /// Annotate kept clustered documents with their cluster id and size.
    ///
    /// Requires the cluster stage to have saved cluster ids.
    #[must_use]
    pub fn with_cluster_ids(mut self, load: bool) -> Self {
        self.load_cluster_ids = load;
        self
    }

    /// Send removed documents to `writer`.
    #[must_use]
    pub fn with_exclusion_writer(mut self, writer: impl Writer + 'static) -> Self {
        self.exclusion = Some(Box::new(writer));
        self
    }

    fn load_removal_set(&self) -> Result<HashSet<String>> {
        let removed = read_removal_set(self.storage.open(REMOVAL_FILE)?, REMOVAL_FILE)?;
        debug!(ids = removed.len(), "Loaded removal set");
        Ok(removed)
    }

    fn load_clusters(&self) -> Result<HashMap<String, (String, usize)>> {
        let reader = std::io::BufReader::new(self.storage.open(CLUSTERS_FILE)?);
        let mut clusters = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let assignment: ClusterAssignment = serde_json::from_str(&line)?;
            clusters.insert(assignment.id, (assignment.cluster, assignment.size));
        }
        Ok(clusters)
    }
}

impl PipelineStep for MinhashDedupFilter {
    fn name(&self) -> &str {
        "minhash_filter"
    }

    fn fingerprint(&self) -> Option<String> {
        let exclusion = self
            .exclusion
            .as_ref()
            .and_then(|w| w.fingerprint())
            .unwrap_or_default();
        Some(format!(
            "dedup_filter:cluster_ids={}|{exclusion}",
            self.load_cluster_ids
        ))
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> sluice_pipeline::Result<DocumentStream<'a>> {
        let removed = self.load_removal_set()?;
        let clusters = if self.load_cluster_ids {
            Some(self.load_clusters()?)
        } else {
            None
        };
        let exclusion = match &self.exclusion {
            Some(writer) => Some(writer.open(ctx.rank())?),
            None => None,
        };
        Ok(Box::new(DuplicateStream {
            input,
            removed,
            clusters,
            exclusion,
            ctx,
            done: false,
        }))
    }
}

struct DuplicateStream<'a> {
    input: DocumentStream<'a>,
    removed: HashSet<String>,
    clusters: Option<HashMap<String, (String, usize)>>,
    exclusion: Option<Box<dyn DocumentSink>>,
    ctx: StepContext<'a>,
    done: bool,
}

impl DuplicateStream<'_> {
    fn process(&mut self, doc: Document) -> sluice_pipeline::Result<Option<Document>> {
        if self.removed.contains(&doc.id) {
            self.ctx.incr("removed", 1);
            if let Some(sink) = self.exclusion.as_mut() {
                sink.write(&doc)?;
            }
            return Ok(None);
        }

        self.ctx.incr("kept", 1);
        let annotation = self
            .clusters
            .as_ref()
            .and_then(|clusters| clusters.get(&doc.id))
            .cloned();
        Ok(Some(match annotation {
            Some((cluster, size)) => doc
                .with_metadata(CLUSTER_ID_KEY, cluster)
                .with_metadata(CLUSTER_SIZE_KEY, size),
            None => doc,
        }))
    }
}

impl Iterator for DuplicateStream<'_> {
    type Item = sluice_pipeline::Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while let Some(doc) = self.input.next() {
            match doc.and_then(|doc| self.process(doc)) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::write_removal_set;
    use sluice_core::MetaValue;
    use sluice_pipeline::run_step;
    use sluice_pipeline::writers::JsonlWriter;
    use tempfile::TempDir;

    fn removal_dir(tmp: &TempDir, ids: &[&str]) -> std::path::PathBuf {
        let dir = tmp.path().join("remove");
        let storage = LocalStorage::new(&dir).unwrap();
        let mut writer = storage.create(REMOVAL_FILE).unwrap();
        write_removal_set(&mut writer, ids.iter().copied()).unwrap();
        writer.commit().unwrap();
        dir
    }

    fn docs() -> Vec<Document> {
        ["d1", "d2", "d3", "d4"]
            .iter()
            .map(|id| Document::new(*id, format!("text of {id}")))
            .collect()
    }

    #[test]
    fn test_drops_exactly_the_removal_set() {
        let tmp = TempDir::new().unwrap();
        let step = MinhashDedupFilter::new(removal_dir(&tmp, &["d2", "d3"])).unwrap();

        let (kept, stats) = run_step(&step, docs(), 0, 1).unwrap();
        let ids: Vec<_> = kept.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d4"]);
        assert_eq!(stats.counter("removed"), 2);
        assert_eq!(stats.counter("kept"), 2);
    }

    #[test]
    fn test_removed_documents_reach_exclusion_writer() {
        let tmp = TempDir::new().unwrap();
        let excluded = tmp.path().join("excluded");
        let step = MinhashDedupFilter::new(removal_dir(&tmp, &["d4"]))
            .unwrap()
            .with_exclusion_writer(JsonlWriter::new(&excluded).unwrap());

        run_step(&step, docs(), 3, 4).unwrap();
        let written = std::fs::read_to_string(excluded.join("00003.jsonl")).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("\"d4\""));
    }

    #[test]
    fn test_cluster_ids_annotate_survivors() {
        let tmp = TempDir::new().unwrap();
        let dir = removal_dir(&tmp, &["d2"]);
        std::fs::write(
            dir.join(CLUSTERS_FILE),
            "{\"id\":\"d1\",\"cluster\":\"d1\",\"size\":2}\n{\"id\":\"d2\",\"cluster\":\"d1\",\"size\":2}\n",
        )
        .unwrap();
        let step = MinhashDedupFilter::new(&dir).unwrap().with_cluster_ids(true);

        let (kept, _) = run_step(&step, docs(), 0, 1).unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(
            kept[0].metadata.get(CLUSTER_ID_KEY),
            Some(&MetaValue::from("d1"))
        );
        assert_eq!(
            kept[0].metadata.get(CLUSTER_SIZE_KEY),
            Some(&MetaValue::from(2usize))
        );
        assert!(kept[1].metadata.is_empty());
    }

    #[test]
    fn test_missing_removal_set_fails_the_task() {
        let tmp = TempDir::new().unwrap();
        let step = MinhashDedupFilter::new(tmp.path()).unwrap();
        assert!(run_step(&step, docs(), 0, 1).is_err());
    }
}
