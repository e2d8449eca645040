//! The per-client session contract.
//!
//! A session owns the protocol state machine for one viewer: handshake,
//! message parsing, encoding selection, and paced update writing. The
//! multiplexer treats it as an opaque handle with the operations below.
//!
//! # Call direction
//!
//! The multiplexer calls into sessions; sessions never call the server.
//! Client messages that have shared effects (input, clipboard, resize)
//! come back from [`ClientSession::process_messages`] as
//! [`ClientCommand`]s, which the multiplexer dispatches through its own
//! public methods. This keeps a single owner for every session and still
//! preserves run-to-completion ordering: all commands of one readability
//! event are applied before the carrier gets control back.
//!
//! # Failure handling
//!
//! Fallible operations return [`SessionError`]. The multiplexer converts
//! any error into `close(reason)` on that one session and carries on;
//! one broken viewer never disturbs the rest. Closed sessions stay
//! registered (skipped by fan-outs) until the carrier reports their socket
//! gone.

use std::net::IpAddr;
use std::ops::BitOr;

use rfbmux_core::{Point, Region, ScreenSet};
use thiserror::Error;

use crate::application::desktop::ResizeResult;
use crate::application::socket::{SocketError, SocketHandle, SocketId};

/// Keyboard LED bits, as sent to clients.
pub const LED_SCROLL_LOCK: u8 = 1 << 0;
pub const LED_NUM_LOCK: u8 = 1 << 1;
pub const LED_CAPS_LOCK: u8 = 1 << 2;

/// Why a client is being told about a new screen layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutChangeReason {
    /// The server (desktop) changed the layout.
    Server,
    /// Another client requested the change.
    OtherClient,
}

/// What a connection is allowed to do. A bit set mirroring the wire-level
/// permission model; the multiplexer itself only consults `NON_SHARED` and
/// `NO_QUERY`, sessions enforce the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRights(u16);

impl AccessRights {
    pub const NONE: AccessRights = AccessRights(0);
    /// May see the screen.
    pub const VIEW: AccessRights = AccessRights(1 << 0);
    /// May inject key events.
    pub const KEY_EVENTS: AccessRights = AccessRights(1 << 1);
    /// May inject pointer events.
    pub const POINTER_EVENTS: AccessRights = AccessRights(1 << 2);
    /// May exchange clipboard data.
    pub const CUT_TEXT: AccessRights = AccessRights(1 << 3);
    /// May resize the framebuffer.
    pub const SET_DESKTOP_SIZE: AccessRights = AccessRights(1 << 4);
    /// May disconnect other clients by connecting non-shared.
    pub const NON_SHARED: AccessRights = AccessRights(1 << 5);
    /// Bypasses the connection query.
    pub const NO_QUERY: AccessRights = AccessRights(1 << 6);

    /// The rights a plain interactive viewer gets.
    pub const DEFAULT: AccessRights = AccessRights(
        Self::VIEW.0 | Self::KEY_EVENTS.0 | Self::POINTER_EVENTS.0 | Self::CUT_TEXT.0,
    );
    /// Everything.
    pub const FULL: AccessRights = AccessRights(u16::MAX);

    /// True when every bit of `rights` is present.
    pub fn contains(&self, rights: AccessRights) -> bool {
        self.0 & rights.0 == rights.0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl BitOr for AccessRights {
    type Output = AccessRights;

    fn bitor(self, rhs: AccessRights) -> AccessRights {
        AccessRights(self.0 | rhs.0)
    }
}

/// Error type for per-session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    /// The client sent something the protocol state machine rejects.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A client-to-server effect decoded by a session, applied by the
/// multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// The session finished authentication and wants the connection query.
    QueryConnection { user_name: String },
    /// The session completed initialisation. `shared` is the client-init
    /// shared flag.
    ClientReady { shared: bool },
    /// An authentication attempt failed; strikes the peer's blacklist
    /// entry.
    AuthFailed,
    KeyEvent { keysym: u32, keycode: u32, down: bool },
    PointerEvent { pos: Point, button_mask: u16 },
    SetDesktopSize {
        width: i32,
        height: i32,
        layout: ScreenSet,
    },
    /// The client wants the server-side clipboard.
    ClipboardRequest,
    /// The client announced (or retracted) having clipboard contents.
    ClipboardAnnounce { available: bool },
    /// Clipboard data pushed by the client.
    ClipboardData { text: String },
}

/// One connected viewer, as seen by the multiplexer.
pub trait ClientSession: Send {
    fn socket_id(&self) -> SocketId;

    fn peer_address(&self) -> IpAddr;

    fn peer_endpoint(&self) -> String;

    /// Forwarded from the underlying socket; see
    /// [`SocketHandle::requires_query`].
    fn requires_query(&self) -> bool;

    /// Starts the protocol: version exchange, security negotiation setup.
    fn init(&mut self) -> Result<(), SessionError>;

    /// Shuts the session down with a reason the client may get to see.
    /// Idempotent. The socket is shut down; the carrier later reports it
    /// closed and the multiplexer drops the session.
    fn close(&mut self, reason: &str);

    fn is_closed(&self) -> bool;

    fn authenticated(&self) -> bool;

    /// True when the session holds every right in `rights`.
    fn access_check(&self, rights: AccessRights) -> bool;

    /// Whether this client needs the server-side rendered cursor.
    fn need_rendered_cursor(&self) -> bool;

    /// Whether this client opts in to framebuffer comparison (consulted
    /// when the server is configured to compare on demand).
    fn prefers_comparison(&self) -> bool;

    /// Parses everything currently readable and returns the decoded
    /// shared effects, in wire order.
    fn process_messages(&mut self) -> Result<Vec<ClientCommand>, SessionError>;

    /// Pushes buffered output after the carrier reported writability.
    fn flush_socket(&mut self) -> Result<(), SessionError>;

    /// Delivers the connection-query verdict.
    fn approve_connection(&mut self, accept: bool, reason: Option<&str>) -> Result<(), SessionError>;

    /// Delivers the outcome of this session's own resize request.
    fn resize_result(&mut self, result: ResizeResult) -> Result<(), SessionError>;

    /// The framebuffer was replaced; the session re-announces dimensions
    /// and drops stale update state.
    fn pixel_buffer_change(&mut self) -> Result<(), SessionError>;

    fn screen_layout_change(&mut self, reason: LayoutChangeReason) -> Result<(), SessionError>;

    /// The rendered cursor became stale. Bookkeeping only, cannot fail.
    fn rendered_cursor_change(&mut self);

    /// The server moved the pointer (warp); clients tracking the remote
    /// cursor are told explicitly.
    fn cursor_position_change(&mut self) -> Result<(), SessionError>;

    /// A new cursor image is available.
    fn set_cursor(&mut self) -> Result<(), SessionError>;

    fn set_led_state(&mut self, state: u8) -> Result<(), SessionError>;

    fn set_desktop_name(&mut self, name: &str) -> Result<(), SessionError>;

    fn bell(&mut self) -> Result<(), SessionError>;

    fn announce_clipboard(&mut self, available: bool) -> Result<(), SessionError>;

    fn request_clipboard(&mut self) -> Result<(), SessionError>;

    fn send_clipboard_data(&mut self, data: &str) -> Result<(), SessionError>;

    /// Accumulates damage into the session's own update tracker.
    fn add_changed(&mut self, region: &Region);

    fn add_copied(&mut self, region: &Region, delta: Point);

    /// Writes a framebuffer update if the client is ready for one.
    fn write_framebuffer_update(&mut self) -> Result<(), SessionError>;
}

/// Builds sessions for accepted sockets. Injected into the multiplexer so
/// tests and embedders choose the session implementation.
pub trait SessionFactory: Send {
    fn create_session(
        &mut self,
        socket: Box<dyn SocketHandle>,
        outgoing: bool,
        rights: AccessRights,
    ) -> Result<Box<dyn ClientSession>, SessionCreateError>;
}

/// Session construction failed. Carries the socket back out so the caller
/// can shut it down and keep tracking it until the carrier reaps it.
pub struct SessionCreateError {
    pub socket: Box<dyn SocketHandle>,
    pub message: String,
}

impl std::fmt::Debug for SessionCreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCreateError")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for SessionCreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to create session: {}", self.message)
    }
}

impl std::error::Error for SessionCreateError {}

// ── Tests ─────────────────────────────────────────────────────────────────────
