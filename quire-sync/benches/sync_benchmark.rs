use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use quire_core::{Block, Document, DocumentId};
use quire_sync::{
    Collaborators, MemoryStore, RocksStore, StoreConfig, SyncConfig, SyncEngine, SyncMessage,
};
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn bench_frame_codec(c: &mut Criterion) {
    let doc = DocumentId::new("ep-1");
    let msg = SyncMessage::update(&doc, 42, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    let mut group = c.benchmark_group("Wire Protocol");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("update_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
    group.bench_function("update_decode_64B", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
    group.finish();
}

fn bench_apply_update(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut config = SyncConfig::for_testing();
    // Keep materialization out of the measurement.
    config.debounce = std::time::Duration::from_secs(3600);
    let engine = SyncEngine::new(Arc::new(MemoryStore::new()), Collaborators::in_memory(), config);
    let doc = DocumentId::new("bench");
    let replica = Document::new();

    let mut group = c.benchmark_group("Engine");
    group.throughput(Throughput::Elements(1));
    group.bench_function("apply_update_memory", |b| {
        b.iter(|| {
            let delta = replica.insert_block(u32::MAX, &Block::paragraph("p", "typing", 0));
            rt.block_on(engine.apply_update(&doc, &delta)).unwrap();
        })
    });
    group.bench_function("diff_full_state", |b| {
        b.iter(|| black_box(rt.block_on(engine.diff(&doc, None)).unwrap()))
    });
    group.finish();
}

fn bench_compaction_rocksdb(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let mut config = SyncConfig::for_testing();
    config.debounce = std::time::Duration::from_secs(3600);
    let engine = SyncEngine::new(store, Collaborators::in_memory(), config);
    let doc = DocumentId::new("bench");
    let replica = Document::new();

    c.bench_function("append_100_then_compact", |b| {
        b.iter(|| {
            rt.block_on(async {
                for i in 0..100u32 {
                    let delta = replica.insert_block(i, &Block::paragraph(format!("b{i}"), "x", i));
                    engine.apply_update(&doc, &delta).await.unwrap();
                }
                black_box(engine.compact(&doc).await.unwrap());
            })
        })
    });
}

criterion_group!(benches, bench_frame_codec, bench_apply_update, bench_compaction_rocksdb);
criterion_main!(benches);
