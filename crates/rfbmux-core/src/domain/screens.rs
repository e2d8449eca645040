//! Screen layout types: a framebuffer partitioned into logical monitors.
//!
//! A [`ScreenSet`] describes how viewers should present the framebuffer: one
//! entry per monitor, each a rectangle inside the framebuffer. The
//! multiplexer validates every layout it is handed (from the desktop or from
//! a client resize request) before installing it.

use thiserror::Error;

use crate::domain::geometry::Rect;

/// Maximum number of screens a layout may carry. Matches the limit imposed
/// by the extended-desktop-size wire encoding.
pub const MAX_SCREENS: usize = 255;

/// Why a layout is unusable with a given framebuffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// The layout has no screens at all.
    #[error("layout has no screens")]
    Empty,

    /// The layout holds more screens than the wire format can describe.
    #[error("too many screens: {0} (max {MAX_SCREENS})")]
    TooManyScreens(usize),

    /// A screen id appears more than once in the layout.
    #[error("duplicate screen id: {0}")]
    DuplicateId(u32),

    /// A screen covers no pixels.
    #[error("screen {0} is empty")]
    EmptyScreen(u32),

    /// A screen sticks out of the framebuffer.
    #[error("screen {0} does not fit the framebuffer")]
    OutOfBounds(u32),
}

/// One logical monitor inside the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    /// Identifier chosen by whoever defined the layout. Stable across
    /// resizes of the same monitor.
    pub id: u32,
    /// Position and size in framebuffer coordinates.
    pub rect: Rect,
    /// Opaque per-screen flags, forwarded to clients untouched.
    pub flags: u32,
}

impl Screen {
    pub fn new(id: u32, rect: Rect, flags: u32) -> Self {
        Self { id, rect, flags }
    }
}

/// An ordered collection of screens. Order is preserved because clients see
/// the screens in the order the layout lists them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenSet {
    screens: Vec<Screen>,
}

impl ScreenSet {
    /// Creates an empty layout. An empty layout is only valid while no
    /// framebuffer is installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common single-monitor case: one
    /// screen with id 0 covering `0,0 .. w,h`.
    pub fn single(width: i32, height: i32) -> Self {
        let mut set = Self::new();
        set.add_screen(Screen::new(0, Rect::xywh(0, 0, width, height), 0));
        set
    }

    /// Appends a screen to the layout.
    pub fn add_screen(&mut self, screen: Screen) {
        self.screens.push(screen);
    }

    /// Removes the screen with the given id, if present.
    pub fn remove_screen(&mut self, id: u32) {
        self.screens.retain(|s| s.id != id);
    }

    pub fn num_screens(&self) -> usize {
        self.screens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.screens.is_empty()
    }

    pub fn screens(&self) -> impl Iterator<Item = &Screen> {
        self.screens.iter()
    }

    /// Checks that this layout is usable with a framebuffer of the given
    /// size: at least one screen, no more than [`MAX_SCREENS`], unique ids,
    /// and every screen non-empty and fully inside the framebuffer.
    ///
    /// # Errors
    ///
    /// Returns the first [`LayoutError`] encountered, in list order.
    pub fn check(&self, fb_width: i32, fb_height: i32) -> Result<(), LayoutError> {
        if self.screens.is_empty() {
            return Err(LayoutError::Empty);
        }
        if self.screens.len() > MAX_SCREENS {
            return Err(LayoutError::TooManyScreens(self.screens.len()));
        }

        let fb_rect = Rect::xywh(0, 0, fb_width, fb_height);
        for (i, screen) in self.screens.iter().enumerate() {
            if screen.rect.is_empty() {
                return Err(LayoutError::EmptyScreen(screen.id));
            }
            if !fb_rect.encloses(&screen.rect) {
                return Err(LayoutError::OutOfBounds(screen.id));
            }
            if self.screens[..i].iter().any(|s| s.id == screen.id) {
                return Err(LayoutError::DuplicateId(screen.id));
            }
        }
        Ok(())
    }

    /// [`ScreenSet::check`] as a plain yes/no.
    pub fn validate(&self, fb_width: i32, fb_height: i32) -> bool {
        self.check(fb_width, fb_height).is_ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_layout_covers_framebuffer() {
        let set = ScreenSet::single(1920, 1080);
        assert_eq!(set.num_screens(), 1);
        assert!(set.validate(1920, 1080));
        assert_eq!(set.screens().next().unwrap().rect, Rect::xywh(0, 0, 1920, 1080));
    }

    #[test]
    fn test_check_rejects_empty_layout() {
        assert_eq!(ScreenSet::new().check(1920, 1080), Err(LayoutError::Empty));
    }

    #[test]
    fn test_check_rejects_screen_outside_framebuffer() {
        let mut set = ScreenSet::new();
        set.add_screen(Screen::new(4, Rect::xywh(1000, 0, 1920, 1080), 0));
        assert_eq!(set.check(1920, 1080), Err(LayoutError::OutOfBounds(4)));
    }

    #[test]
    fn test_check_rejects_empty_screen() {
        let mut set = ScreenSet::new();
        set.add_screen(Screen::new(0, Rect::xywh(0, 0, 0, 1080), 0));
        assert_eq!(set.check(1920, 1080), Err(LayoutError::EmptyScreen(0)));
    }

    #[test]
    fn test_check_rejects_duplicate_ids() {
        let mut set = ScreenSet::new();
        set.add_screen(Screen::new(7, Rect::xywh(0, 0, 960, 1080), 0));
        set.add_screen(Screen::new(7, Rect::xywh(960, 0, 960, 1080), 0));
        assert_eq!(set.check(1920, 1080), Err(LayoutError::DuplicateId(7)));
        assert!(!set.validate(1920, 1080));
    }

    #[test]
    fn test_validate_accepts_side_by_side_monitors() {
        let mut set = ScreenSet::new();
        set.add_screen(Screen::new(1, Rect::xywh(0, 0, 960, 1080), 0));
        set.add_screen(Screen::new(2, Rect::xywh(960, 0, 960, 1080), 0));
        assert!(set.validate(1920, 1080));
    }

    #[test]
    fn test_validate_allows_overlapping_screens() {
        // Mirrored monitors legitimately cover the same framebuffer area.
        let mut set = ScreenSet::new();
        set.add_screen(Screen::new(1, Rect::xywh(0, 0, 1920, 1080), 0));
        set.add_screen(Screen::new(2, Rect::xywh(0, 0, 1920, 1080), 0));
        assert!(set.validate(1920, 1080));
    }

    #[test]
    fn test_remove_screen_drops_matching_id_only() {
        let mut set = ScreenSet::new();
        set.add_screen(Screen::new(1, Rect::xywh(0, 0, 960, 1080), 0));
        set.add_screen(Screen::new(2, Rect::xywh(960, 0, 960, 1080), 0));
        set.remove_screen(1);
        assert_eq!(set.num_screens(), 1);
        assert_eq!(set.screens().next().unwrap().id, 2);
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let mut a = ScreenSet::new();
        a.add_screen(Screen::new(1, Rect::xywh(0, 0, 960, 1080), 0));
        a.add_screen(Screen::new(2, Rect::xywh(960, 0, 960, 1080), 0));

        let mut b = ScreenSet::new();
        b.add_screen(Screen::new(2, Rect::xywh(960, 0, 960, 1080), 0));
        b.add_screen(Screen::new(1, Rect::xywh(0, 0, 960, 1080), 0));

        assert_ne!(a, b);
    }
}
