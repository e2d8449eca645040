//! Accumulates damage and suppresses regions whose pixels did not change.
//!
//! Producers report damage optimistically: a window manager will happily
//! report a full-window repaint that altered three pixels. The
//! [`ComparingUpdateTracker`] keeps a snapshot of the pixels each client has
//! already been sent and, at every frame, compares the reported damage
//! against it tile by tile, dropping the tiles that still match. Copies
//! (scrolls) are tracked separately with a single global delta so they can
//! be forwarded as cheap copy operations instead of pixel data.

use tracing::debug;

use crate::domain::framebuffer::PixelBuffer;
use crate::domain::geometry::{Point, Rect, Region};

/// Edge length of the comparison tiles. Damage is culled at this
/// granularity: a tile is dropped only when every pixel in it matches the
/// snapshot.
const TILE_SIZE: i32 = 64;

/// A snapshot of pending damage: what changed, what was copied, and where
/// the copy came from. After [`ComparingUpdateTracker::get_update_info`]
/// the two regions are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    pub changed: Region,
    pub copied: Region,
    /// Translation from copy source to destination: the pixels now at
    /// `copied` used to live at `copied.translate(-copy_delta)`.
    pub copy_delta: Point,
}

impl UpdateInfo {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }
}

/// Damage accumulator with snapshot-based change suppression.
pub struct ComparingUpdateTracker {
    width: i32,
    height: i32,
    bytes_per_pixel: usize,
    /// Previously-sent pixels, tightly packed, validated lazily per tile.
    snapshot: Vec<u8>,
    snapshot_valid: Region,
    changed: Region,
    copied: Region,
    copy_delta: Point,
    enabled: bool,
    pixels_compared: u64,
    pixels_culled: u64,
}

impl ComparingUpdateTracker {
    /// Creates a tracker sized to the given framebuffer. The snapshot starts
    /// out entirely invalid, so the first comparison sends everything.
    pub fn new(pb: &dyn PixelBuffer) -> Self {
        let (width, height) = (pb.width(), pb.height());
        let bytes_per_pixel = pb.bytes_per_pixel();
        Self {
            width,
            height,
            bytes_per_pixel,
            snapshot: vec![0; width as usize * height as usize * bytes_per_pixel],
            snapshot_valid: Region::new(),
            changed: Region::new(),
            copied: Region::new(),
            copy_delta: Point::default(),
            enabled: true,
            pixels_compared: 0,
            pixels_culled: 0,
        }
    }

    fn fb_rect(&self) -> Rect {
        Rect::xywh(0, 0, self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }

    /// Marks `region` as damaged.
    pub fn add_changed(&mut self, region: &Region) {
        self.changed = self.changed.union(&region.intersect_rect(self.fb_rect()));
    }

    /// Marks `dest` as filled by a copy from `dest - delta`. Only one copy
    /// delta is tracked at a time: a copy with a different delta collapses
    /// everything into plain damage.
    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        let dest = dest.intersect_rect(self.fb_rect());
        if dest.is_empty() {
            return;
        }

        // The pixels now at `dest` are whatever the source held, not what
        // the snapshot remembers, so the snapshot is stale there.
        self.snapshot_valid = self.snapshot_valid.subtract(&dest);

        if self.copied.is_empty() {
            self.copy_delta = delta;
            self.copied = dest.subtract(&self.changed);
        } else if delta == self.copy_delta {
            self.copied = self.copied.union(&dest.subtract(&self.changed));
        } else {
            self.changed = self.changed.union(&self.copied).union(&dest);
            self.copied = Region::new();
        }
    }

    /// Returns the pending damage clipped to `clip`, with copied areas
    /// removed from the changed region. Does not modify the tracker, so
    /// repeated calls between mutations return equal results.
    pub fn get_update_info(&self, clip: Rect) -> UpdateInfo {
        let copied = self.copied.intersect_rect(clip);
        let changed = self.changed.intersect_rect(clip).subtract(&copied);
        UpdateInfo {
            changed,
            copied,
            copy_delta: self.copy_delta,
        }
    }

    /// Compares the changed region against the snapshot and drops the tiles
    /// whose pixels still match. Returns `true` when anything was dropped.
    /// When disabled this is the identity.
    pub fn compare(&mut self, pb: &dyn PixelBuffer) -> bool {
        if !self.enabled {
            return false;
        }

        let rects: Vec<Rect> = self.changed.rects().to_vec();
        let mut unchanged = Region::new();
        let mut refreshed = Region::new();

        for rect in rects {
            let mut ty = rect.y1;
            while ty < rect.y2 {
                let mut tx = rect.x1;
                let tile_y2 = (ty + TILE_SIZE).min(rect.y2);
                while tx < rect.x2 {
                    let tile = Rect::new(tx, ty, (tx + TILE_SIZE).min(rect.x2), tile_y2);
                    self.pixels_compared += tile.area();

                    let known = Region::from(tile).subtract(&self.snapshot_valid).is_empty();
                    if known && self.tile_matches(pb, tile) {
                        self.pixels_culled += tile.area();
                        unchanged = unchanged.union_rect(tile);
                    } else {
                        self.store_tile(pb, tile);
                        refreshed = refreshed.union_rect(tile);
                    }
                    tx += TILE_SIZE;
                }
                ty += TILE_SIZE;
            }
        }

        self.snapshot_valid = self.snapshot_valid.union(&refreshed);

        if unchanged.is_empty() {
            return false;
        }
        self.changed = self.changed.subtract(&unchanged);
        true
    }

    /// Empties the pending damage. The snapshot is kept; it describes what
    /// has been handed to clients, not what is pending.
    pub fn clear(&mut self) {
        self.changed = Region::new();
        self.copied = Region::new();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        if !self.enabled {
            self.enabled = true;
            // Pixels sent while comparison was off never reached the
            // snapshot, so nothing in it can be trusted anymore.
            self.snapshot_valid = Region::new();
        }
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Logs and resets the culling statistics.
    pub fn log_stats(&mut self) {
        if self.pixels_compared > 0 {
            debug!(
                compared = self.pixels_compared,
                culled = self.pixels_culled,
                "framebuffer comparison culled {:.1}% of reported damage",
                self.pixels_culled as f64 / self.pixels_compared as f64 * 100.0
            );
        }
        self.pixels_compared = 0;
        self.pixels_culled = 0;
    }

    fn snapshot_offset(&self, x: i32, y: i32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.bytes_per_pixel
    }

    fn tile_matches(&self, pb: &dyn PixelBuffer, tile: Rect) -> bool {
        for y in tile.y1..tile.y2 {
            let start = self.snapshot_offset(tile.x1, y);
            let end = self.snapshot_offset(tile.x2, y);
            if pb.row(y, tile.x1, tile.x2) != &self.snapshot[start..end] {
                return false;
            }
        }
        true
    }

    fn store_tile(&mut self, pb: &dyn PixelBuffer, tile: Rect) {
        for y in tile.y1..tile.y2 {
            let start = self.snapshot_offset(tile.x1, y);
            let end = self.snapshot_offset(tile.x2, y);
            self.snapshot[start..end].copy_from_slice(pb.row(y, tile.x1, tile.x2));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
