use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sockshim_protocol::glob::matches_glob;

fn bench_matches_glob(c: &mut Criterion) {
    c.bench_function("glob_literal", |b| {
        b.iter(|| matches_glob(black_box("127.0.0.1"), black_box("127.0.0.1")))
    });

    c.bench_function("glob_address_star", |b| {
        b.iter(|| matches_glob(black_box("10.*"), black_box("10.20.30.40")))
    });

    c.bench_function("glob_classes", |b| {
        b.iter(|| {
            matches_glob(
                black_box("192.168.[0-9].[!0]*"),
                black_box("192.168.7.254"),
            )
        })
    });

    c.bench_function("glob_backtracking_miss", |b| {
        b.iter(|| matches_glob(black_box("*a*a*a*a*b"), black_box("aaaaaaaaaaaaaaaaaaaa")))
    });

    c.bench_function("glob_path_segments", |b| {
        b.iter(|| matches_glob(black_box("/run/*/?*.sock"), black_box("/run/app/web.sock")))
    });
}

criterion_group!(benches, bench_matches_glob);
criterion_main!(benches);
