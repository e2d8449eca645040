//! Criterion benchmarks for the comparing update tracker.
//!
//! The compare pass reads and hashes framebuffer pixels on every frame, so
//! its throughput matters more than anything else in the core crate.
//!
//! Run with:
//! ```bash
//! cargo bench --package rfbmux-core --bench tracker_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rfbmux_core::{ComparingUpdateTracker, MemoryPixelBuffer, PixelBuffer, Rect, Region};

fn primed_tracker(pb: &MemoryPixelBuffer) -> ComparingUpdateTracker {
    let mut tracker = ComparingUpdateTracker::new(pb);
    tracker.add_changed(&Region::from(pb.rect()));
    tracker.compare(pb);
    tracker.clear();
    tracker
}

/// Full-frame damage report where nothing actually changed: the best case
/// for the tracker and the common case for over-reporting producers.
fn bench_compare_unchanged_frame(c: &mut Criterion) {
    let pb = MemoryPixelBuffer::new(1920, 1080);
    let mut tracker = primed_tracker(&pb);

    c.bench_function("compare_unchanged_1080p", |bench| {
        bench.iter(|| {
            tracker.add_changed(&Region::from(pb.rect()));
            black_box(tracker.compare(&pb));
            tracker.clear();
        })
    });
}

/// Full-frame damage with one dirty tile, the typical cursor-blink frame.
fn bench_compare_one_dirty_tile(c: &mut Criterion) {
    let mut pb = MemoryPixelBuffer::new(1920, 1080);
    let mut tracker = primed_tracker(&pb);
    let mut flip = 0u8;

    c.bench_function("compare_one_dirty_tile_1080p", |bench| {
        bench.iter(|| {
            flip = flip.wrapping_add(1);
            pb.fill_rect(Rect::xywh(512, 512, 8, 8), [flip, flip, flip, 255]);
            tracker.add_changed(&Region::from(pb.rect()));
            black_box(tracker.compare(&pb));
            tracker.clear();
        })
    });
}

criterion_group!(benches, bench_compare_unchanged_frame, bench_compare_one_dirty_tile);
criterion_main!(benches);
