//! Stage 3: transitive clustering of candidate edges into a removal set.
//!
//! The union-find lives in one task on one thread; every edge file of the bucket stage
//! is read before any cluster is resolved.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sluice_core::{LocalStorage, StorageBackend};
use sluice_pipeline::{DocumentStream, PipelineStep, StepContext};
use tracing::info;

use crate::buckets::EDGES_SUFFIX;
use crate::error::{DedupError, Result};
use crate::records::{read_edges, write_removal_set};

/// Key of the removal set.
pub const REMOVAL_FILE: &str = "removal.ids";

/// Key of the optional per-document cluster assignments.
pub const CLUSTERS_FILE: &str = "clusters.jsonl";

/// Union-Find (Disjoint Set Union) data structure.
///
/// Path compression plus union-by-rank; elements are dense indices and can be added
/// while edges are streamed in.
#[derive(Debug, Default)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    /// Create a structure with `n` singleton sets.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    /// Add a singleton set and return its index.
    pub fn push(&mut self) -> usize {
        let idx = self.parent.len();
        self.parent.push(idx);
        self.rank.push(0);
        idx
    }

    /// Root of the set containing `x`.
    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Merge the sets containing `x` and `y`. Returns true if they were disjoint.
    pub fn union(&mut self, x: usize, y: usize) -> bool {
        let rx = self.find(x);
        let ry = self.find(y);

        if rx == ry {
            return false;
        }

        match self.rank[rx].cmp(&self.rank[ry]) {
            std::cmp::Ordering::Less => self.parent[rx] = ry,
            std::cmp::Ordering::Greater => self.parent[ry] = rx,
            std::cmp::Ordering::Equal => {
                self.parent[ry] = rx;
                self.rank[rx] = self.rank[rx].saturating_add(1);
            }
        }

        true
    }

    /// Check if `x` and `y` are in the same set.
    pub fn connected(&mut self, x: usize, y: usize) -> bool {
        self.find(x) == self.find(y)
    }

    /// Sets with more than one member, keyed by root.
    #[must_use]
    pub fn duplicate_clusters(&mut self) -> HashMap<usize, Vec<usize>> {
        let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..self.parent.len() {
            let root = self.find(i);
            clusters.entry(root).or_default().push(i);
        }
        clusters.retain(|_, members| members.len() > 1);
        clusters
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Check if the structure is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}

/// Union-find over document ids.
#[derive(Debug, Default)]
pub struct DocClusters {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    sets: UnionFind,
}

impl DocClusters {
    fn intern(&mut self, id: String) -> usize {
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.sets.push();
        self.index.insert(id.clone(), idx);
        self.ids.push(id);
        idx
    }

    /// Record that `a` and `b` are duplicates.
    pub fn link(&mut self, a: String, b: String) {
        let a = self.intern(a);
        let b = self.intern(b);
        self.sets.union(a, b);
    }

    /// Number of distinct documents seen in any edge.
    #[must_use]
    pub fn documents(&self) -> usize {
        self.ids.len()
    }

    /// Resolve every cluster: members sorted, representative first, clusters ordered by
    /// representative.
    #[must_use]
    pub fn resolve(mut self) -> Vec<Vec<String>> {
        let mut clusters: Vec<Vec<String>> = self
            .sets
            .duplicate_clusters()
            .into_values()
            .map(|members| {
                let mut ids: Vec<String> = members
                    .into_iter()
                    .map(|i| std::mem::take(&mut self.ids[i]))
                    .collect();
                ids.sort_unstable();
                ids
            })
            .collect();
        clusters.sort_unstable();
        clusters
    }
}

/// One line of `clusters.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    /// Document id.
    pub id: String,
    /// Representative (kept) document id of its cluster.
    pub cluster: String,
    /// Number of documents in the cluster.
    pub size: usize,
}

/// Reads every edge file and writes the removal set.
///
/// Must run as a single task. Each cluster keeps its lexicographically smallest doc id;
/// every other member goes to [`REMOVAL_FILE`]. With `save_cluster_ids`, every clustered
/// document is also listed in [`CLUSTERS_FILE`].
pub struct MinhashDedupCluster {
    input: LocalStorage,
    output: LocalStorage,
    save_cluster_ids: bool,
}

impl MinhashDedupCluster {
    /// Read edges from `edges_dir`, write the removal set to `output_dir`.
    pub fn new(edges_dir: impl AsRef<Path>, output_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            input: LocalStorage::new(edges_dir)?,
            output: LocalStorage::new(output_dir)?,
            save_cluster_ids: false,
        })
    }

    /// Also write `clusters.jsonl`.
    #[must_use]
    pub fn with_cluster_ids(mut self, save: bool) -> Self {
        self.save_cluster_ids = save;
        self
    }

    fn load_edges(&self) -> Result<DocClusters> {
        let mut clusters = DocClusters::default();
        for key in self.input.list("")? {
            if !key.ends_with(EDGES_SUFFIX) {
                continue;
            }
            for (a, b) in read_edges(self.input.open(&key)?, &key)? {
                clusters.link(a, b);
            }
        }
        Ok(clusters)
    }

    fn write_outputs(&self, clusters: &[Vec<String>]) -> Result<usize> {
        let mut removed: Vec<&str> = clusters
            .iter()
            .flat_map(|members| members.iter().skip(1).map(String::as_str))
            .collect();
        removed.sort_unstable();

        let mut writer = self.output.create(REMOVAL_FILE)?;
        write_removal_set(&mut writer, removed.iter().copied())?;
        writer.commit()?;

        if self.save_cluster_ids {
            let mut writer = self.output.create(CLUSTERS_FILE)?;
            for members in clusters {
                let Some(representative) = members.first() else {
                    continue;
                };
                for id in members {
                    let line = ClusterAssignment {
                        id: id.clone(),
                        cluster: representative.clone(),
                        size: members.len(),
                    };
                    serde_json::to_writer(&mut writer, &line)?;
                    writer.write_all(b"\n")?;
                }
            }
            writer.commit()?;
        }
        Ok(removed.len())
    }
}

impl PipelineStep for MinhashDedupCluster {
    fn name(&self) -> &str {
        "minhash_cluster"
    }

    fn fingerprint(&self) -> Option<String> {
        Some(format!("cluster:save_ids={}", self.save_cluster_ids))
    }

    fn run<'a>(
        &'a self,
        input: DocumentStream<'a>,
        ctx: StepContext<'a>,
    ) -> sluice_pipeline::Result<DocumentStream<'a>> {
        if ctx.world_size() != 1 {
            return Err(DedupError::TaskCount {
                stage: "clusters",
                expected: 1,
                actual: ctx.world_size(),
            }
            .into());
        }

        let edges = self.load_edges()?;
        let documents = edges.documents();
        let clusters = edges.resolve();
        let removed = self.write_outputs(&clusters)?;

        ctx.incr("clusters", clusters.len() as u64);
        ctx.incr("documents_removed", removed as u64);
        info!(
            documents,
            clusters = clusters.len(),
            removed,
            "Resolved duplicate clusters"
        );
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::edges_key;
    use crate::records::{read_removal_set, write_edges};
    use sluice_pipeline::run_step;
    use tempfile::TempDir;

    #[test]
    fn test_find_initial() {
        let mut uf = UnionFind::new(5);
        for i in 0..5 {
            assert_eq!(uf.find(i), i);
        }
    }

    #[test]
    fn test_union_basic() {
        let mut uf = UnionFind::new(5);

        assert!(uf.union(0, 1));
        assert!(uf.connected(0, 1));
        assert!(!uf.union(0, 1));
    }

    #[test]
    fn test_push_grows_structure() {
        let mut uf = UnionFind::default();
        assert!(uf.is_empty());
        let a = uf.push();
        let b = uf.push();
        uf.union(a, b);
        assert_eq!(uf.len(), 2);
        assert!(uf.connected(a, b));
    }

    #[test]
    fn test_duplicate_clusters() {
        let mut uf = UnionFind::new(6);

        uf.union(0, 1);
        uf.union(0, 2);
        uf.union(3, 4);

        let clusters = uf.duplicate_clusters();
        assert_eq!(clusters.len(), 2);
        let root = uf.find(0);
        assert_eq!(clusters[&root].len(), 3);
    }

    #[test]
    fn test_path_compression() {
        let mut uf = UnionFind::new(10);
        for i in 0..9 {
            uf.union(i, i + 1);
        }

        let root = uf.find(0);
        for i in 0..10 {
            uf.find(i);
            assert_eq!(uf.parent[i], root);
        }
    }

    #[test]
    fn test_large_union_find() {
        let n = 10000;
        let mut uf = UnionFind::new(n);
        for i in 0..n - 2 {
            uf.union(i, i + 2);
        }

        assert_eq!(uf.duplicate_clusters().len(), 2);
        assert!(uf.connected(0, 100));
        assert!(uf.connected(1, 101));
        assert!(!uf.connected(0, 1));
    }

    #[test]
    fn test_transitive_closure_keeps_smallest_id() {
        let mut clusters = DocClusters::default();
        clusters.link("b".into(), "c".into());
        clusters.link("d".into(), "c".into());
        clusters.link("z".into(), "y".into());
        clusters.link("a".into(), "d".into());

        assert_eq!(
            clusters.resolve(),
            vec![vec!["a", "b", "c", "d"], vec!["y", "z"]]
        );
    }

    fn write_edge_file(dir: &Path, bucket: usize, edges: &[(&str, &str)]) {
        let storage = LocalStorage::new(dir).unwrap();
        let edges: Vec<_> = edges
            .iter()
            .map(|(a, b)| ((*a).to_string(), (*b).to_string()))
            .collect();
        let mut writer = storage.create(&edges_key(bucket, 0)).unwrap();
        write_edges(&mut writer, &edges).unwrap();
        writer.commit().unwrap();
    }

    #[test]
    fn test_cluster_step_joins_edges_across_buckets() {
        let tmp = TempDir::new().unwrap();
        let edges = tmp.path().join("edges");
        write_edge_file(&edges, 3, &[("A", "B")]);
        write_edge_file(&edges, 7, &[("B", "C")]);
        let out = tmp.path().join("out");

        let step = MinhashDedupCluster::new(&edges, &out)
            .unwrap()
            .with_cluster_ids(true);
        let (_, stats) = run_step(&step, vec![], 0, 1).unwrap();
        assert_eq!(stats.counter("clusters"), 1);
        assert_eq!(stats.counter("documents_removed"), 2);

        let removal = std::fs::File::open(out.join(REMOVAL_FILE)).unwrap();
        let removed = read_removal_set(removal, REMOVAL_FILE).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!removed.contains("A"));

        let assignments: Vec<ClusterAssignment> = std::fs::read_to_string(out.join(CLUSTERS_FILE))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(assignments.len(), 3);
        assert!(assignments.iter().all(|a| a.cluster == "A" && a.size == 3));
    }

    #[test]
    fn test_cluster_step_requires_single_task() {
        let tmp = TempDir::new().unwrap();
        let step = MinhashDedupCluster::new(tmp.path(), tmp.path()).unwrap();
        assert!(run_step(&step, vec![], 0, 2).is_err());
    }
}
