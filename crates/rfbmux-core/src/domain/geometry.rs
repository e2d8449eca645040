//! Integer pixel geometry: points, rectangles, and regions.
//!
//! A [`Region`] is a finite union of axis-aligned rectangles. All the
//! multiplexer's dirty-area bookkeeping is expressed in regions, so the
//! algebra here (union, intersection, subtraction) has to be exact: a pixel
//! is either in a region or it is not, and two regions that cover the same
//! pixels must compare equal no matter how they were built.
//!
//! # Region representation
//!
//! Internally a region is kept in a canonical *band* form: the covered area
//! is sliced into horizontal bands, each band holds a sorted list of
//! non-touching x-intervals, and vertically adjacent bands with identical
//! interval lists are merged. Every set of pixels has exactly one such
//! representation, which is what makes derived equality correct and keeps
//! the rectangle count small after long sequences of updates.

/// A point (or translation delta) in pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns this point moved by `d`.
    pub fn translate(self, d: Point) -> Point {
        Point::new(self.x + d.x, self.y + d.y)
    }

    /// Returns this point moved by `-d`.
    pub fn subtract(self, d: Point) -> Point {
        Point::new(self.x - d.x, self.y - d.y)
    }
}

/// An axis-aligned rectangle, half-open: a pixel `(x, y)` is inside when
/// `x1 <= x < x2` and `y1 <= y < y2`. A rectangle with `x2 <= x1` or
/// `y2 <= y1` is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Builds a rectangle from a top-left corner plus width and height.
    pub fn xywh(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    /// Number of pixels covered. Zero for empty rectangles.
    pub fn area(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.width() as u64 * self.height() as u64
        }
    }

    /// Returns this rectangle moved by `d`.
    pub fn translate(&self, d: Point) -> Rect {
        Rect::new(self.x1 + d.x, self.y1 + d.y, self.x2 + d.x, self.y2 + d.y)
    }

    /// Intersection of two rectangles. The result may be empty; callers are
    /// expected to check [`Rect::is_empty`] rather than compare against a
    /// particular empty value.
    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect::new(
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.x2.min(other.x2),
            self.y2.min(other.y2),
        )
    }

    /// Returns `true` when `other` lies entirely inside this rectangle.
    /// An empty `other` is enclosed by everything.
    pub fn encloses(&self, other: &Rect) -> bool {
        other.is_empty()
            || (other.x1 >= self.x1
                && other.y1 >= self.y1
                && other.x2 <= self.x2
                && other.y2 <= self.y2)
    }

    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.x1 && p.x < self.x2 && p.y >= self.y1 && p.y < self.y2
    }
}

/// A finite union of axis-aligned rectangles, closed under union,
/// intersection, and subtraction. Equality is set equality: two regions
/// covering the same pixels are equal regardless of how they were assembled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    // Canonical band form, sorted by (y1, x1). See the module docs.
    rects: Vec<Rect>,
}

impl Region {
    /// The empty region.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// The rectangles of the canonical decomposition, sorted by row then
    /// column. Disjoint by construction.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Total number of pixels covered.
    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Smallest rectangle enclosing the whole region. Empty for an empty
    /// region.
    pub fn extent(&self) -> Rect {
        let mut it = self.rects.iter();
        let Some(first) = it.next() else {
            return Rect::default();
        };
        let mut r = *first;
        for rect in it {
            r.x1 = r.x1.min(rect.x1);
            r.y1 = r.y1.min(rect.y1);
            r.x2 = r.x2.max(rect.x2);
            r.y2 = r.y2.max(rect.y2);
        }
        r
    }

    pub fn union(&self, other: &Region) -> Region {
        combine(self, other, |a, b| a || b)
    }

    pub fn intersect(&self, other: &Region) -> Region {
        combine(self, other, |a, b| a && b)
    }

    pub fn subtract(&self, other: &Region) -> Region {
        combine(self, other, |a, b| a && !b)
    }

    pub fn union_rect(&self, rect: Rect) -> Region {
        self.union(&Region::from(rect))
    }

    pub fn intersect_rect(&self, rect: Rect) -> Region {
        self.intersect(&Region::from(rect))
    }

    pub fn subtract_rect(&self, rect: Rect) -> Region {
        self.subtract(&Region::from(rect))
    }

    /// Returns the whole region moved by `d`.
    pub fn translate(&self, d: Point) -> Region {
        // Translation preserves the canonical form.
        Region {
            rects: self.rects.iter().map(|r| r.translate(d)).collect(),
        }
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        if rect.is_empty() {
            Region::new()
        } else {
            Region { rects: vec![rect] }
        }
    }
}

// ── Band sweep ────────────────────────────────────────────────────────────────

/// Applies a pixelwise boolean operation to two regions and returns the
/// result in canonical form.
///
/// The sweep slices the plane into horizontal bands at every y-edge of
/// either input, resolves the boolean along each band's x-edges, and then
/// coalesces bands. Quadratic in the rectangle count, which is fine for the
/// handfuls of damage rectangles a frame accumulates.
fn combine(a: &Region, b: &Region, keep: impl Fn(bool, bool) -> bool) -> Region {
    let mut ys: Vec<i32> = Vec::with_capacity(2 * (a.rects.len() + b.rects.len()));
    for r in a.rects.iter().chain(b.rects.iter()) {
        ys.push(r.y1);
        ys.push(r.y2);
    }
    ys.sort_unstable();
    ys.dedup();

    // (y1, y2, x-intervals) per band, before vertical coalescing.
    let mut bands: Vec<(i32, i32, Vec<(i32, i32)>)> = Vec::new();
    for w in ys.windows(2) {
        let (band_y1, band_y2) = (w[0], w[1]);
        let ia = band_intervals(&a.rects, band_y1, band_y2);
        let ib = band_intervals(&b.rects, band_y1, band_y2);

        let mut xs: Vec<i32> = Vec::with_capacity(2 * (ia.len() + ib.len()));
        for &(x1, x2) in ia.iter().chain(ib.iter()) {
            xs.push(x1);
            xs.push(x2);
        }
        xs.sort_unstable();
        xs.dedup();

        let mut out: Vec<(i32, i32)> = Vec::new();
        for seg in xs.windows(2) {
            let (x1, x2) = (seg[0], seg[1]);
            if keep(covers(&ia, x1), covers(&ib, x1)) {
                match out.last_mut() {
                    // Merge with the previous segment when touching.
                    Some(last) if last.1 == x1 => last.1 = x2,
                    _ => out.push((x1, x2)),
                }
            }
        }
        if !out.is_empty() {
            bands.push((band_y1, band_y2, out));
        }
    }

    // Merge vertically adjacent bands with identical interval lists.
    let mut merged: Vec<(i32, i32, Vec<(i32, i32)>)> = Vec::new();
    for band in bands {
        match merged.last_mut() {
            Some(prev) if prev.1 == band.0 && prev.2 == band.2 => prev.1 = band.1,
            _ => merged.push(band),
        }
    }

    let mut rects = Vec::new();
    for (y1, y2, intervals) in merged {
        for (x1, x2) in intervals {
            rects.push(Rect::new(x1, y1, x2, y2));
        }
    }
    Region { rects }
}

/// Sorted x-intervals of the rectangles fully spanning the band `[y1, y2)`.
fn band_intervals(rects: &[Rect], y1: i32, y2: i32) -> Vec<(i32, i32)> {
    let mut out: Vec<(i32, i32)> = rects
        .iter()
        .filter(|r| r.y1 <= y1 && r.y2 >= y2)
        .map(|r| (r.x1, r.x2))
        .collect();
    out.sort_unstable();
    out
}

fn covers(intervals: &[(i32, i32)], x: i32) -> bool {
    intervals.iter().any(|&(x1, x2)| x1 <= x && x < x2)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
