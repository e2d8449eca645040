//! # rfbmux-core
//!
//! Shared library for the rfbmux remote-framebuffer session multiplexer:
//! pixel geometry, screen layouts, cursors, framebuffer access, and the
//! comparing update tracker.
//!
//! This crate is used by the server crate and by anything embedding the
//! multiplexer. It has zero dependencies on OS APIs, async runtimes, or
//! network sockets, so all of its logic is unit-testable on any platform.
//!
//! # Overview
//!
//! A remote-framebuffer server sends viewers incremental updates of a
//! shared screen. The types here are the vocabulary of that process:
//!
//! - **`domain::geometry`** – Rectangles and [`Region`]s. A region is a
//!   set of pixels kept in a canonical rectangle decomposition; all damage
//!   bookkeeping is region arithmetic.
//!
//! - **`domain::screens`** – The [`ScreenSet`]: how the framebuffer is
//!   split into logical monitors from the viewer's point of view.
//!
//! - **`domain::cursor`** – The cursor image, plus the software-composited
//!   [`RenderedCursor`] for viewers that cannot draw a remote cursor.
//!
//! - **`tracker`** – The [`ComparingUpdateTracker`]: accumulates reported
//!   damage and culls the parts whose pixels match what viewers were
//!   already sent.

pub mod domain;
pub mod tracker;

// Re-export the most-used types at the crate root so callers can write
// `rfbmux_core::Region` instead of `rfbmux_core::domain::geometry::Region`.
pub use domain::cursor::{Cursor, RenderedCursor};
pub use domain::framebuffer::{MemoryPixelBuffer, PixelBuffer};
pub use domain::geometry::{Point, Rect, Region};
pub use domain::screens::{LayoutError, Screen, ScreenSet, MAX_SCREENS};
pub use tracker::{ComparingUpdateTracker, UpdateInfo};
