//! Benchmarks for the fallback embedder and its batch path (§4.A).
//!
//! Without the `fastembed-embeddings` feature this is what every build
//! ships, so it is the meaningful baseline to track; with the feature
//! enabled, swap `FallbackEmbedder` for `FastEmbedEmbedder::new()`.

#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use engrammar::embedding::{Embedder, FallbackEmbedder};

const SHORT_TEXT: &str = "database storage";
const MEDIUM_TEXT: &str = "How do I implement user authentication with OAuth2?";
const LONG_TEXT: &str = "I'm building a new web application that needs to handle \
    user authentication securely across multiple OAuth2 providers including \
    Google, GitHub, and Microsoft, with proper token expiration and refresh.";

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn bench_single_embed(c: &mut Criterion) {
    let embedder = FallbackEmbedder::new();
    let mut group = c.benchmark_group("embedding_single");

    group.bench_function("short_text", |b| b.iter(|| embedder.embed(black_box(SHORT_TEXT))));
    group.bench_function("medium_text", |b| b.iter(|| embedder.embed(black_box(MEDIUM_TEXT))));
    group.bench_function("long_text", |b| b.iter(|| embedder.embed(black_box(LONG_TEXT))));

    group.finish();
}

fn bench_batch_embed(c: &mut Criterion) {
    let embedder = FallbackEmbedder::new();
    let mut group = c.benchmark_group("embedding_batch");

    for size in [1usize, 10, 50] {
        let texts: Vec<&str> = (0..size)
            .map(|i| match i % 3 {
                0 => SHORT_TEXT,
                1 => MEDIUM_TEXT,
                _ => LONG_TEXT,
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("batch_size", size), &texts, |b, texts| {
            b.iter(|| embedder.embed_batch(black_box(texts)));
        });
    }

    group.finish();
}

fn bench_cosine_similarity(c: &mut Criterion) {
    let embedder = FallbackEmbedder::new();
    let a = embedder.embed("PostgreSQL connection pooling").expect("embed");
    let b = embedder.embed("MySQL connection pool configuration").expect("embed");

    c.bench_function("cosine_similarity", |bencher| {
        bencher.iter(|| cosine_similarity(black_box(&a), black_box(&b)));
    });
}

criterion_group!(benches, bench_single_embed, bench_batch_embed, bench_cosine_similarity);
criterion_main!(benches);
