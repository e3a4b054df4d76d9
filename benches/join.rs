//! Join throughput across admission bounds.
//!
//! Every element crosses the rendezvous hand-off one chunk at a time, so
//! this mostly measures coordination overhead: signal checks, semaphore
//! traffic and the rendezvous itself. The sequential flatten baseline has
//! none of that machinery and bounds what a `max_open = 1` join could reach.

use braid::{ChunkStream, par_join};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures::{StreamExt, stream};

const INNERS: usize = 8;
const CHUNKS: usize = 100;

fn build_inners() -> Vec<ChunkStream<u64>> {
    (0..INNERS)
        .map(|i| {
            stream::iter((0..CHUNKS).map(move |j| Ok(vec![(i * CHUNKS + j) as u64]))).boxed()
        })
        .collect()
}

fn bench_par_join(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("par_join");
    for max_open in [1usize, 2, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(max_open),
            &max_open,
            |b, &max_open| {
                b.to_async(&rt).iter(|| async move {
                    let outer = stream::iter(build_inners().into_iter().map(Ok));
                    let total = par_join(outer, max_open)
                        .fold(0usize, |acc, chunk| async move {
                            acc + chunk.expect("no failures in bench").len()
                        })
                        .await;
                    assert_eq!(total, INNERS * CHUNKS);
                })
            },
        );
    }
    group.finish();

    c.bench_function("sequential_flatten", |b| {
        b.to_async(&rt).iter(|| async {
            let total = stream::iter(
                (0..INNERS)
                    .map(|i| stream::iter((0..CHUNKS).map(move |j| vec![(i * CHUNKS + j) as u64]))),
            )
            .flatten()
            .fold(0usize, |acc, chunk| async move { acc + chunk.len() })
            .await;
            assert_eq!(total, INNERS * CHUNKS);
        })
    });
}

criterion_group!(benches, bench_par_join);
criterion_main!(benches);
