//! Cursor image and the software-rendered cursor patch.
//!
//! Clients that support a client-side cursor receive the [`Cursor`] image
//! and draw it themselves. For clients that cannot, the server composites
//! the cursor into the framebuffer pixels it sends; [`RenderedCursor`] holds
//! that composited patch together with the framebuffer rectangle it covers.

use crate::domain::framebuffer::PixelBuffer;
use crate::domain::geometry::{Point, Rect};

const BPP: usize = 4;

/// A cursor image in RGBA with a hotspot. Fully transparent border rows and
/// columns are cropped away on construction so the damage tracking around
/// cursor movement touches as few pixels as possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    width: i32,
    height: i32,
    hotspot: Point,
    pixels: Vec<u8>,
}

impl Cursor {
    /// Builds a cursor from RGBA data, `width * height * 4` bytes.
    pub fn new(width: i32, height: i32, hotspot: Point, data: &[u8]) -> Self {
        assert_eq!(data.len(), width as usize * height as usize * BPP);
        let mut cursor = Self {
            width,
            height,
            hotspot,
            pixels: data.to_vec(),
        };
        cursor.crop();
        cursor
    }

    /// The empty cursor, used until the desktop provides a real one.
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            hotspot: Point::default(),
            pixels: Vec::new(),
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn hotspot(&self) -> Point {
        self.hotspot
    }

    /// RGBA pixel data, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// The cursor rectangle positioned so the hotspot lands on `pos`.
    pub fn rect_at(&self, pos: Point) -> Rect {
        Rect::xywh(0, 0, self.width, self.height).translate(pos.subtract(self.hotspot))
    }

    fn alpha_at(&self, x: i32, y: i32) -> u8 {
        self.pixels[(y as usize * self.width as usize + x as usize) * BPP + 3]
    }

    // Shrinks the image to the bounding box of non-transparent pixels,
    // keeping the hotspot anchored on the same screen position.
    fn crop(&mut self) {
        let mut bounds: Option<Rect> = None;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.alpha_at(x, y) != 0 {
                    bounds = Some(match bounds {
                        None => Rect::new(x, y, x + 1, y + 1),
                        Some(b) => Rect::new(
                            b.x1.min(x),
                            b.y1.min(y),
                            b.x2.max(x + 1),
                            b.y2.max(y + 1),
                        ),
                    });
                }
            }
        }

        let Some(b) = bounds else {
            // Entirely transparent.
            self.width = 0;
            self.height = 0;
            self.hotspot = Point::default();
            self.pixels.clear();
            return;
        };

        if b == Rect::xywh(0, 0, self.width, self.height) {
            return;
        }

        let mut cropped = Vec::with_capacity(b.area() as usize * BPP);
        for y in b.y1..b.y2 {
            let start = (y as usize * self.width as usize + b.x1 as usize) * BPP;
            let end = start + b.width() as usize * BPP;
            cropped.extend_from_slice(&self.pixels[start..end]);
        }
        self.pixels = cropped;
        self.width = b.width();
        self.height = b.height();
        self.hotspot = self.hotspot.subtract(Point::new(b.x1, b.y1));
    }
}

/// The cursor composited over framebuffer pixels, clipped to the
/// framebuffer. Rebuilt whenever the cursor image, its position, or the
/// pixels underneath change.
#[derive(Debug, Default)]
pub struct RenderedCursor {
    rect: Rect,
    buffer: Vec<u8>,
}

impl RenderedCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The framebuffer rectangle the patch covers. Empty when the cursor is
    /// entirely outside the framebuffer or has no visible pixels.
    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// RGBA patch data, `rect.width() * rect.height() * 4` bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Recomposites the patch: framebuffer pixels under the cursor with the
    /// cursor alpha-blended on top. The hotspot is placed on `pos`.
    pub fn update(&mut self, pb: &dyn PixelBuffer, cursor: &Cursor, pos: Point) {
        debug_assert_eq!(pb.bytes_per_pixel(), BPP);

        let origin = pos.subtract(cursor.hotspot());
        self.rect = cursor.rect_at(pos).intersect(&pb.rect());
        self.buffer.clear();
        if self.rect.is_empty() {
            self.rect = Rect::default();
            return;
        }

        for y in self.rect.y1..self.rect.y2 {
            let fb_row = pb.row(y, self.rect.x1, self.rect.x2);
            let cur_y = (y - origin.y) as usize;
            for (i, px) in fb_row.chunks_exact(BPP).enumerate() {
                let cur_x = (self.rect.x1 - origin.x) as usize + i;
                let coff = (cur_y * cursor.width() as usize + cur_x) * BPP;
                let src = &cursor.pixels()[coff..coff + BPP];
                let a = src[3] as u32;
                for c in 0..3 {
                    let blended = (src[c] as u32 * a + px[c] as u32 * (255 - a)) / 255;
                    self.buffer.push(blended as u8);
                }
                self.buffer.push(255);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::framebuffer::MemoryPixelBuffer;

    // A 4x4 cursor whose visible pixels occupy the centre 2x2 square.
    fn padded_cursor() -> Cursor {
        let mut data = vec![0u8; 4 * 4 * 4];
        for y in 1..3 {
            for x in 1..3 {
                let off = (y * 4 + x) * 4;
                data[off..off + 4].copy_from_slice(&[255, 0, 0, 255]);
            }
        }
        Cursor::new(4, 4, Point::new(2, 2), &data)
    }

    #[test]
    fn test_crop_trims_transparent_border() {
        let cursor = padded_cursor();
        assert_eq!(cursor.width(), 2);
        assert_eq!(cursor.height(), 2);
    }

    #[test]
    fn test_crop_keeps_hotspot_anchored() {
        // The hotspot was at (2, 2) in the uncropped image; cropping removes
        // one row and one column, so it lands at (1, 1).
        let cursor = padded_cursor();
        assert_eq!(cursor.hotspot(), Point::new(1, 1));
    }

    #[test]
    fn test_fully_transparent_cursor_crops_to_nothing() {
        let cursor = Cursor::new(8, 8, Point::new(3, 3), &vec![0u8; 8 * 8 * 4]);
        assert_eq!(cursor.width(), 0);
        assert_eq!(cursor.height(), 0);
        assert!(cursor.pixels().is_empty());
    }

    #[test]
    fn test_opaque_cursor_is_not_cropped() {
        let data = vec![255u8; 3 * 3 * 4];
        let cursor = Cursor::new(3, 3, Point::new(0, 0), &data);
        assert_eq!(cursor.width(), 3);
        assert_eq!(cursor.height(), 3);
        assert_eq!(cursor.hotspot(), Point::new(0, 0));
    }

    #[test]
    fn test_rect_at_places_hotspot_on_position() {
        let cursor = padded_cursor();
        let r = cursor.rect_at(Point::new(10, 10));
        // 2x2 image with hotspot (1, 1): top-left at (9, 9).
        assert_eq!(r, Rect::xywh(9, 9, 2, 2));
    }

    #[test]
    fn test_rendered_cursor_clips_to_framebuffer() {
        let pb = MemoryPixelBuffer::new(16, 16);
        let cursor = padded_cursor();
        let mut rendered = RenderedCursor::new();

        // Hotspot at the origin pushes the top-left of the image off-screen.
        rendered.update(&pb, &cursor, Point::new(0, 0));
        assert_eq!(rendered.rect(), Rect::xywh(0, 0, 1, 1));
        assert_eq!(rendered.data().len(), 4);
    }

    #[test]
    fn test_rendered_cursor_blends_opaque_pixels_over_background() {
        let mut pb = MemoryPixelBuffer::new(8, 8);
        pb.fill_rect(Rect::xywh(0, 0, 8, 8), [0, 0, 255, 255]);
        let cursor = padded_cursor();
        let mut rendered = RenderedCursor::new();

        rendered.update(&pb, &cursor, Point::new(4, 4));
        assert_eq!(rendered.rect(), Rect::xywh(3, 3, 2, 2));
        // Opaque red cursor pixels completely replace the blue background.
        assert_eq!(&rendered.data()[0..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_rendered_cursor_outside_framebuffer_is_empty() {
        let pb = MemoryPixelBuffer::new(8, 8);
        let cursor = padded_cursor();
        let mut rendered = RenderedCursor::new();

        rendered.update(&pb, &cursor, Point::new(100, 100));
        assert!(rendered.rect().is_empty());
        assert!(rendered.data().is_empty());
    }
}
