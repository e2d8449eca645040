//! Criterion benchmarks for the region algebra.
//!
//! Region operations run on every frame tick and on every damage report, so
//! union/subtract latency directly bounds the achievable frame rate with
//! many small damage rectangles.
//!
//! Run with:
//! ```bash
//! cargo bench --package rfbmux-core --bench region_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rfbmux_core::{Point, Rect, Region};

// ── Fixture builders ──────────────────────────────────────────────────────────

/// Builds a region of `n` scattered 32x32 rectangles on a 1920x1080 grid,
/// roughly what a busy desktop reports between two frames.
fn scattered_region(n: usize) -> Region {
    let mut region = Region::new();
    for i in 0..n {
        let x = (i * 173) % 1888;
        let y = (i * 101) % 1048;
        region = region.union_rect(Rect::xywh(x as i32, y as i32, 32, 32));
    }
    region
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_union(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_union");
    for n in [4usize, 16, 64] {
        let a = scattered_region(n);
        let b = scattered_region(n).translate(Point::new(17, 13));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, _| {
            bench.iter(|| black_box(&a).union(black_box(&b)))
        });
    }
    group.finish();
}

fn bench_subtract(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_subtract");
    for n in [4usize, 16, 64] {
        let a = Region::from(Rect::xywh(0, 0, 1920, 1080));
        let b = scattered_region(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, _| {
            bench.iter(|| black_box(&a).subtract(black_box(&b)))
        });
    }
    group.finish();
}

fn bench_intersect_rect(c: &mut Criterion) {
    let a = scattered_region(64);
    let clip = Rect::xywh(480, 270, 960, 540);
    c.bench_function("region_intersect_rect", |bench| {
        bench.iter(|| black_box(&a).intersect_rect(black_box(clip)))
    });
}

criterion_group!(benches, bench_union, bench_subtract, bench_intersect_rect);
criterion_main!(benches);
