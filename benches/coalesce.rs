use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use netbuf::NetBuf;

fn build_chain(segments: usize, size: usize) -> NetBuf {
    let payload = vec![0x5Au8; size];
    let mut head = NetBuf::copy_buffer(&payload, 0, 0).unwrap();
    for _ in 1..segments {
        head.prepend_chain(NetBuf::copy_buffer(&payload, 0, 0).unwrap());
    }
    head
}

fn bench_coalesce(c: &mut Criterion) {
    c.bench_function("coalesce_8x1024", |b| {
        b.iter_batched(
            || build_chain(8, 1024),
            |mut chain| {
                chain.coalesce().unwrap();
                chain
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("gather_4096_of_8x1024", |b| {
        b.iter_batched(
            || build_chain(8, 1024),
            |mut chain| {
                chain.gather(4096).unwrap();
                chain
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("clone_chain_8", |b| {
        b.iter_batched(
            || build_chain(8, 1024),
            |chain| (chain.try_clone().unwrap(), chain),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("create_combined_64", |b| {
        b.iter(|| NetBuf::create_combined(64).unwrap())
    });

    c.bench_function("create_separate_64", |b| {
        b.iter(|| NetBuf::create_separate(64).unwrap())
    });
}

criterion_group!(benches, bench_coalesce);
criterion_main!(benches);
