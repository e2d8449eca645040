//! The system-desktop contract.
//!
//! The desktop collaborator is the thing that actually owns the machine's
//! screen and input: it injects pointer and keyboard events, produces the
//! pixel buffer, applies resolution changes, and can terminate the whole
//! process. The multiplexer drives it through [`SystemDesktop`] and never
//! the other way around: anything the desktop wants to tell the server
//! (damage, cursor moves, clipboard changes) goes through the multiplexer's
//! public methods, invoked by the embedding event loop.

use rfbmux_core::{PixelBuffer, Point, ScreenSet};
use thiserror::Error;

use crate::application::socket::SocketId;

/// A pixel buffer as handed around between desktop, multiplexer, and
/// carrier tasks.
pub type BoxedPixelBuffer = Box<dyn PixelBuffer + Send>;

/// Error type for desktop operations that can fail.
#[derive(Debug, Error)]
pub enum DesktopError {
    #[error("{0}")]
    Failed(String),
}

/// What [`SystemDesktop::start`] produces: the screen pixels and,
/// optionally, an explicit monitor layout. Without a layout the multiplexer
/// carries the previous layout over, clipping screens to the new
/// framebuffer and synthesising a single full-screen monitor if none
/// survive.
pub struct DesktopSurface {
    pub buffer: BoxedPixelBuffer,
    pub layout: Option<ScreenSet>,
}

/// Result of a client resize request, as reported back to the requester.
/// The numeric codes are the extended-desktop-size wire values; codes the
/// multiplexer does not know are forwarded verbatim via `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeResult {
    Success,
    ResizeProhibited,
    OutOfResources,
    InvalidLayout,
    Other(u16),
}

impl ResizeResult {
    /// The wire code for this result.
    pub fn code(&self) -> u16 {
        match self {
            ResizeResult::Success => 0,
            ResizeResult::ResizeProhibited => 1,
            ResizeResult::OutOfResources => 2,
            ResizeResult::InvalidLayout => 3,
            ResizeResult::Other(code) => *code,
        }
    }
}

/// The desktop's answer to [`SystemDesktop::set_screen_layout`].
///
/// On acceptance the desktop reports the layout it actually applied, plus a
/// replacement pixel buffer when the framebuffer dimensions changed. A
/// desktop that accepts a request but applies a different layout than it
/// reports is a fatal defect; the multiplexer cross-checks.
pub enum ResizeOutcome {
    Accepted {
        /// New pixel buffer, present iff the framebuffer was reallocated.
        buffer: Option<BoxedPixelBuffer>,
        /// The layout now in effect.
        layout: ScreenSet,
    },
    Rejected(ResizeResult),
}

/// Callbacks into the machine's real desktop.
pub trait SystemDesktop: Send {
    /// Brings the desktop up and returns its surface. Called when the first
    /// client reaches the connection query; until then the desktop may stay
    /// entirely dormant.
    fn start(&mut self) -> Result<DesktopSurface, DesktopError>;

    /// Releases whatever `start` acquired. Called when the last
    /// authenticated client goes away.
    fn stop(&mut self);

    /// Asks the desktop to shut the whole server down (exit timers fire
    /// this). The desktop ends the embedding event loop at its leisure.
    fn terminate(&mut self);

    fn key_event(&mut self, keysym: u32, keycode: u32, down: bool);

    fn pointer_event(&mut self, pos: Point, button_mask: u16);

    /// Applies a client-requested screen layout. The request has already
    /// been validated against the requested dimensions.
    fn set_screen_layout(&mut self, width: i32, height: i32, layout: &ScreenSet) -> ResizeOutcome;

    /// A client asked for the server-side clipboard contents.
    fn handle_clipboard_request(&mut self);

    /// A client announced (or retracted) clipboard contents.
    fn handle_clipboard_announce(&mut self, available: bool);

    /// Clipboard data arrived from the owning client.
    fn handle_clipboard_data(&mut self, data: &str);

    /// Asks the desktop to decide about an incoming connection. The verdict
    /// arrives later through `Multiplexer::approve_connection`.
    fn query_connection(&mut self, socket: SocketId, user_name: &str);

    /// One frame-clock tick has elapsed. `msc` is the new frame counter.
    fn frame_tick(&mut self, msc: u64);
}
