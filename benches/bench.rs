//! Criterion benchmarks for Quiver.
//!
//! Covers the two write paths of the engine:
//! - Flushing analyzed documents into a segment
//! - Merging segments with deletions into one

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use quiver::codec::Codec;
use quiver::codec::live_docs::LiveDocs;
use quiver::config::IndexConfig;
use quiver::index::{
    AnalyzedDocument, AnalyzedField, FieldType, SegmentMerger, SegmentReader, SegmentWriter,
};
use quiver::storage::memory::MemoryStorage;
use quiver::storage::{IoContext, Storage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generate test documents for benchmarking.
fn generate_documents(count: usize, seed: u64) -> Vec<AnalyzedDocument> {
    let words = [
        "segment", "merge", "posting", "term", "field", "document", "commit", "codec",
        "stored", "vector", "offset", "payload", "delete", "generation", "index", "reader",
    ];
    let mut rng = StdRng::seed_from_u64(seed);

    (0..count)
        .map(|i| {
            let len = rng.random_range(8..40);
            let text: Vec<&str> = (0..len)
                .map(|_| words[rng.random_range(0..words.len())])
                .collect();
            AnalyzedDocument::new()
                .with_field(AnalyzedField::text("body", &text.join(" "), FieldType::text()))
                .with_field(AnalyzedField::keyword("id", &format!("doc-{i}")))
        })
        .collect()
}

fn flush_segment(
    storage: &Arc<dyn Storage>,
    codec: &Arc<Codec>,
    name: &str,
    docs: &[AnalyzedDocument],
) -> SegmentReader {
    let mut writer = SegmentWriter::new(Arc::clone(storage), Arc::clone(codec), name).unwrap();
    for doc in docs {
        writer.add_document(doc).unwrap();
    }
    let mut info = writer.flush().unwrap();

    // Delete every tenth document.
    let mut live_docs = LiveDocs::new(docs.len() as u32);
    for doc in (0..docs.len() as u32).step_by(10) {
        live_docs.delete(doc).unwrap();
    }
    info.write_deletes(storage.as_ref(), codec, &live_docs).unwrap();

    SegmentReader::open(Arc::clone(storage), Arc::clone(codec), info, IoContext::Default).unwrap()
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    let config = IndexConfig::default();
    let codec = Arc::new(Codec::quiver10(&config));
    let docs = generate_documents(1000, 1);

    group.throughput(Throughput::Elements(docs.len() as u64));
    group.bench_function("flush_1000_docs", |b| {
        b.iter_batched(
            || Arc::new(MemoryStorage::new()) as Arc<dyn Storage>,
            |storage| {
                let mut writer =
                    SegmentWriter::new(storage, Arc::clone(&codec), "_0").unwrap();
                for doc in &docs {
                    writer.add_document(doc).unwrap();
                }
                black_box(writer.flush().unwrap())
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.sample_size(20);

    let config = IndexConfig::default();
    let codec = Arc::new(Codec::quiver10(&config));
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let readers: Vec<Arc<SegmentReader>> = (0..4)
        .map(|i| {
            let docs = generate_documents(500, i);
            Arc::new(flush_segment(&storage, &codec, &format!("_{i}"), &docs))
        })
        .collect();
    let live: u64 = readers.iter().map(|r| r.num_docs() as u64).sum();

    group.throughput(Throughput::Elements(live));
    group.bench_function("merge_4x500_docs", |b| {
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            let mut merger = SegmentMerger::new(
                Arc::clone(&storage),
                Arc::clone(&codec),
                format!("_m{round}"),
                &config,
            );
            for reader in &readers {
                merger.add(Arc::clone(reader));
            }
            let info = merger.merge().unwrap();
            for file in info.files() {
                storage.delete_file(&file).unwrap();
            }
            black_box(info)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_flush, bench_merge);
criterion_main!(benches);
