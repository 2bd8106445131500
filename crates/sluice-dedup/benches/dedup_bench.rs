use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sluice_core::{Document, HashAlgorithm, HashConfig, Precision};
use sluice_dedup::cluster::DocClusters;
use sluice_dedup::{MinHasher, MinhashConfig, MinhashDedupSignature};
use sluice_pipeline::run_step;
use tempfile::TempDir;

fn generate_documents_with_duplicates(count: usize, dup_ratio: f64) -> Vec<Document> {
    let unique_count = (((1.0 - dup_ratio) * count as f64) as usize).max(1);
    (0..count)
        .map(|i| {
            let source = i % unique_count;
            Document::new(
                format!("doc-{i}"),
                format!(
                    "Document number {source} contains information about topic {} with various keywords and text content for testing",
                    source % 10
                ),
            )
        })
        .collect()
}

fn bench_minhash(c: &mut Criterion) {
    let mut group = c.benchmark_group("minhash");
    let text = "The quick brown fox jumps over the lazy dog and this is some additional text to make it longer for realistic benchmarking purposes";

    for (name, hash_config) in [
        ("xxhash_64", HashConfig::default()),
        ("sha1_32", HashConfig::new(HashAlgorithm::Sha1, Precision::Bits32)),
    ] {
        let hasher = MinHasher::new(MinhashConfig {
            hash_config,
            ..Default::default()
        });
        group.bench_function(format!("signature_112_{name}"), |b| {
            b.iter(|| hasher.signature_from_text(black_box(text)))
        });
    }

    let hasher = MinHasher::new(MinhashConfig::default());
    group.bench_function("tokenize", |b| b.iter(|| hasher.tokenize(black_box(text))));

    group.finish();
}

fn bench_signature_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_step");
    group.sample_size(10);

    for size in [100, 1000, 10000] {
        let docs = generate_documents_with_duplicates(size, 0.3);
        let tmp = TempDir::new().unwrap();
        let step = MinhashDedupSignature::new(tmp.path(), MinhashConfig::default()).unwrap();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &docs, |b, docs| {
            b.iter(|| run_step(&step, black_box(docs.clone()), 0, 1).unwrap())
        });
    }

    group.finish();
}

fn bench_clustering(c: &mut Criterion) {
    let mut group = c.benchmark_group("clustering");
    let edges: Vec<(String, String)> = (0..10_000)
        .map(|i| (format!("doc-{}", i / 4), format!("doc-{}", i)))
        .collect();

    group.throughput(Throughput::Elements(edges.len() as u64));
    group.bench_function("resolve_10k_edges", |b| {
        b.iter(|| {
            let mut clusters = DocClusters::default();
            for (from, to) in &edges {
                clusters.link(from.clone(), to.clone());
            }
            clusters.resolve()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_minhash, bench_signature_step, bench_clustering);
criterion_main!(benches);
