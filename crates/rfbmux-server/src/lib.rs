//! # rfbmux-server
//!
//! The rfbmux session multiplexer: one shared desktop, any number of
//! remote-framebuffer viewers.
//!
//! The heart of the crate is [`Multiplexer`]. It owns every connected
//! client session, the shared pixel buffer and screen layout, four timers
//! (idle, disconnect, connect, frame), and the arbitration state for the
//! inputs all clients share. It is strictly single-threaded: an embedding
//! event loop (see `infrastructure::carrier` for the tokio one) feeds it
//! socket events and timer expiries one at a time.
//!
//! Collaborators are trait seams, injected at construction:
//!
//! - [`SystemDesktop`] injects input into the real desktop, produces the
//!   pixel buffer, and applies resizes.
//! - [`SessionFactory`] / [`ClientSession`] speak the viewer protocol.
//! - [`SocketHandle`] is the carrier-owned transport.
//! - [`Clock`] supplies time, so tests can drive every timer manually.

pub mod application;
pub mod config;
pub mod infrastructure;

pub use application::blacklist::{Blacklist, BlacklistConfig};
pub use application::desktop::{
    BoxedPixelBuffer, DesktopError, DesktopSurface, ResizeOutcome, ResizeResult, SystemDesktop,
};
pub use application::multiplexer::{Multiplexer, MuxError};
pub use application::session::{
    AccessRights, ClientCommand, ClientSession, LayoutChangeReason, SessionCreateError,
    SessionError, SessionFactory,
};
pub use application::socket::{SocketError, SocketHandle, SocketId};
pub use application::timer::{Clock, ManualClock, SystemClock, Timer, TimerId};
pub use config::{AppConfig, CompareMode, ConfigError, KeyMapping, NetworkConfig, ServerConfig};
