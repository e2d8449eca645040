//! The session multiplexer: one desktop, many viewers.
//!
//! Owns every connected client session, the shared pixel buffer and screen
//! layout, the frame clock that turns accumulated damage into update
//! writes, and the arbitration state for the inputs all clients share
//! (pointer, clipboard, LEDs). Strictly single-threaded: the embedding
//! event loop delivers socket events and expired timers one at a time, and
//! every callback runs to completion before the next one starts.
//!
//! # How sockets get closed
//!
//! Closing is split between three parties, and the split is what makes the
//! lifecycle subtle. The carrier owns the transport and must keep seeing
//! every live socket through [`Multiplexer::sockets`]. The multiplexer may
//! *want* a client gone for many reasons and from many entry points (a
//! non-shared takeover, a fan-out write failure, a policy refusal), but all
//! it ever does is call the session's `close`, which shuts the transport
//! down. Eventually the carrier notices and calls
//! [`Multiplexer::remove_socket`], and only then is the session dropped.
//!
//! Blacklisted peers get no session at all, just a refusal on the raw
//! socket. Their sockets are parked in a separate closing list so
//! [`Multiplexer::sockets`] stays complete and the carrier's eventual
//! `remove_socket` still finds them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use rfbmux_core::{
    ComparingUpdateTracker, Cursor, Point, Region, RenderedCursor, ScreenSet,
};
use thiserror::Error;

use crate::application::blacklist::Blacklist;
use crate::application::desktop::{
    BoxedPixelBuffer, DesktopError, ResizeOutcome, ResizeResult, SystemDesktop,
};
use crate::application::session::{
    AccessRights, ClientCommand, ClientSession, LayoutChangeReason, SessionCreateError,
    SessionError, SessionFactory,
};
use crate::application::socket::{SocketError, SocketHandle, SocketId};
use crate::application::timer::{Clock, Timer, TimerId};
use crate::config::{CompareMode, KeyMapping, ServerConfig};

/// Largest framebuffer edge a client may request.
const MAX_FRAMEBUFFER_DIM: i32 = 16384;

/// How long a client keeps pointer ownership after its last accepted
/// event. Prevents one stalled client from locking the pointer forever.
const POINTER_OWNER_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame clock period while no desktop is running.
const SLOW_TICK: Duration = Duration::from_millis(1000);

/// Error type for multiplexer operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The carrier delivered an event for a socket no session owns.
    #[error("no connection for socket {0}")]
    UnknownSocket(SocketId),

    /// A screen layout does not fit the framebuffer it was offered for.
    #[error("screen layout does not fit the framebuffer")]
    InvalidLayout,

    /// Clipboard data contained carriage returns; clients must only ever
    /// see newline line endings.
    #[error("clipboard data contains carriage returns")]
    InvalidClipboard,
}

/// Pure keysym substitution table applied to incoming key events.
struct KeyRemapper {
    map: HashMap<u32, u32>,
}

impl KeyRemapper {
    fn new(mappings: &[KeyMapping]) -> Self {
        Self {
            map: mappings.iter().map(|m| (m.from, m.to)).collect(),
        }
    }

    fn remap(&self, keysym: u32) -> u32 {
        *self.map.get(&keysym).unwrap_or(&keysym)
    }
}

/// The session multiplexer. See the module docs for the big picture.
pub struct Multiplexer {
    config: ServerConfig,
    name: String,
    desktop: Box<dyn SystemDesktop>,
    session_factory: Box<dyn SessionFactory>,
    clock: Arc<dyn Clock>,
    blacklist: Blacklist,
    key_remapper: KeyRemapper,

    /// Live sessions, newest first. Fan-out follows this order.
    clients: Vec<Box<dyn ClientSession>>,
    /// Sockets refused before a session existed, still owed to the
    /// carrier.
    closing_sockets: Vec<Box<dyn SocketHandle>>,

    pixel_buffer: Option<BoxedPixelBuffer>,
    comparer: Option<ComparingUpdateTracker>,
    screen_layout: ScreenSet,
    desktop_started: bool,
    /// Update-suppression depth. While positive the framebuffer must not
    /// be read and the frame clock stays stopped.
    block_counter: u32,

    cursor: Cursor,
    cursor_pos: Point,
    rendered_cursor: RenderedCursor,
    rendered_cursor_invalid: bool,

    pointer_owner: Option<SocketId>,
    pointer_owner_since: std::time::Instant,
    clipboard_owner: Option<SocketId>,
    clipboard_requestors: Vec<SocketId>,
    led_state: Option<u8>,

    msc: u64,
    queued_msc: u64,

    idle_timer: Timer,
    disconnect_timer: Timer,
    connect_timer: Timer,
    frame_timer: Timer,
}

impl Multiplexer {
    pub fn new(
        config: ServerConfig,
        desktop: Box<dyn SystemDesktop>,
        session_factory: Box<dyn SessionFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        debug!("creating session multiplexer \"{}\"", config.name);

        let blacklist = Blacklist::new(config.blacklist.clone(), clock.clone());
        let key_remapper = KeyRemapper::new(&config.key_remap);
        let name = config.name.clone();
        let now = clock.now();

        let mut mux = Self {
            config,
            name,
            desktop,
            session_factory,
            clock,
            blacklist,
            key_remapper,
            clients: Vec::new(),
            closing_sockets: Vec::new(),
            pixel_buffer: None,
            comparer: None,
            screen_layout: ScreenSet::new(),
            desktop_started: false,
            block_counter: 0,
            cursor: Cursor::empty(),
            cursor_pos: Point::default(),
            rendered_cursor: RenderedCursor::new(),
            rendered_cursor_invalid: false,
            pointer_owner: None,
            pointer_owner_since: now,
            clipboard_owner: None,
            clipboard_requestors: Vec::new(),
            led_state: None,
            msc: 0,
            queued_msc: 0,
            idle_timer: Timer::new(),
            disconnect_timer: Timer::new(),
            connect_timer: Timer::new(),
            frame_timer: Timer::new(),
        };

        if mux.config.max_idle_time > 0 {
            mux.idle_timer
                .start(now, Duration::from_secs(mux.config.max_idle_time));
        }
        if mux.config.max_disconnection_time > 0 {
            mux.disconnect_timer
                .start(now, Duration::from_secs(mux.config.max_disconnection_time));
        }
        mux
    }

    // ── Socket lifecycle ──────────────────────────────────────────────────────

    /// Takes over an accepted socket: refuses it outright when the peer is
    /// blacklisted, otherwise builds a session for it.
    pub fn add_socket(&mut self, socket: Box<dyn SocketHandle>, outgoing: bool, rights: AccessRights) {
        let mut socket = socket;
        let address = socket.peer_address();

        if self.blacklist.is_blackmarked(&address) {
            error!("blacklisted: {address}");
            if let Err(e) = write_rejection(socket.as_mut()) {
                debug!("rejection write failed: {e}");
            }
            socket.shutdown();
            self.closing_sockets.push(socket);
            return;
        }

        info!("accepted: {}", socket.peer_endpoint());

        let now = self.clock.now();
        if self.config.max_connection_time > 0 && self.clients.is_empty() {
            self.connect_timer
                .start(now, Duration::from_secs(self.config.max_connection_time));
        }
        self.disconnect_timer.stop();

        match self.session_factory.create_session(socket, outgoing, rights) {
            Ok(session) => {
                self.clients.insert(0, session);
                if let Err(e) = self.clients[0].init() {
                    self.close_session(0, &e.to_string());
                }
            }
            Err(SessionCreateError {
                mut socket,
                message,
            }) => {
                error!("error accepting client: {message}");
                socket.shutdown();
                self.closing_sockets.push(socket);
            }
        }
    }

    /// Drops everything associated with a socket the carrier has torn
    /// down. Unknown sockets are ignored.
    pub fn remove_socket(&mut self, sock: SocketId) {
        let Some(idx) = self.client_index(sock) else {
            self.closing_sockets.retain(|s| s.id() != sock);
            return;
        };

        if self.pointer_owner == Some(sock) {
            // Release any buttons the client still held.
            self.desktop.pointer_event(self.cursor_pos, 0);
            self.pointer_owner = None;
        }
        if self.clipboard_owner == Some(sock) {
            self.handle_clipboard_announce(sock, false);
        }
        self.clipboard_requestors.retain(|&id| id != sock);

        let peer = self.clients[idx].peer_endpoint();
        self.clients.remove(idx);
        info!("closed: {peer}");

        if self.auth_client_count() == 0 {
            self.stop_desktop();
        }
        if let Some(comparer) = &mut self.comparer {
            comparer.log_stats();
        }

        self.connect_timer.stop();
        if self.config.max_disconnection_time > 0 && self.clients.is_empty() {
            let now = self.clock.now();
            self.disconnect_timer
                .start(now, Duration::from_secs(self.config.max_disconnection_time));
        }
    }

    /// The socket became readable: lets the owning session parse, then
    /// applies whatever shared effects it decoded.
    pub fn process_socket_read_event(&mut self, sock: SocketId) -> Result<(), MuxError> {
        let idx = self
            .client_index(sock)
            .ok_or(MuxError::UnknownSocket(sock))?;

        let commands = match self.clients[idx].process_messages() {
            Ok(commands) => commands,
            Err(e) => {
                self.close_session(idx, &e.to_string());
                return Ok(());
            }
        };
        for command in commands {
            // A command may close this very session; the rest of its batch
            // dies with it.
            match self.client_index(sock) {
                Some(idx) if !self.clients[idx].is_closed() => {}
                _ => break,
            }
            self.dispatch_command(sock, command);
        }
        Ok(())
    }

    /// The socket became writable again: lets the session flush.
    pub fn process_socket_write_event(&mut self, sock: SocketId) -> Result<(), MuxError> {
        let idx = self
            .client_index(sock)
            .ok_or(MuxError::UnknownSocket(sock))?;
        if let Err(e) = self.clients[idx].flush_socket() {
            self.close_session(idx, &e.to_string());
        }
        Ok(())
    }

    /// Every socket the carrier must keep watching: live clients first,
    /// then the parked closing sockets.
    pub fn sockets(&self) -> Vec<SocketId> {
        self.clients
            .iter()
            .map(|c| c.socket_id())
            .chain(self.closing_sockets.iter().map(|s| s.id()))
            .collect()
    }

    /// The session owning `sock`, if any.
    pub fn connection(&self, sock: SocketId) -> Option<&dyn ClientSession> {
        self.clients
            .iter()
            .find(|c| c.socket_id() == sock)
            .map(|c| c.as_ref())
    }

    /// Closes every client except the one on `except`.
    pub fn close_clients(&mut self, reason: &str, except: Option<SocketId>) {
        for idx in 0..self.clients.len() {
            if Some(self.clients[idx].socket_id()) == except {
                continue;
            }
            self.close_session(idx, reason);
        }
    }

    // ── Session policy ────────────────────────────────────────────────────────

    /// A session authenticated and asks whether the connection may
    /// proceed. Clears the peer's blacklist strikes, brings the desktop
    /// up, and either decides locally or defers to the desktop.
    pub fn query_connection(&mut self, sock: SocketId, user_name: &str) {
        let Some(idx) = self.client_index(sock) else {
            return;
        };
        let address = self.clients[idx].peer_address();
        self.blacklist.clear_blackmark(&address);

        // The client starts drawing on resources from here on.
        if self.start_desktop().is_err() {
            return;
        }

        if self.config.never_shared
            && !self.config.disconnect_clients
            && self.auth_client_count() > 0
        {
            self.approve_connection(sock, false, Some("The server is already in use"));
            return;
        }

        let Some(idx) = self.client_index(sock) else {
            return;
        };
        let bypasses_query = (!self.config.query_connect && !self.clients[idx].requires_query())
            || self.clients[idx].access_check(AccessRights::NO_QUERY);
        if bypasses_query {
            self.approve_connection(sock, true, None);
            return;
        }

        self.desktop.query_connection(sock, user_name);
    }

    /// Delivers a connection-query verdict to the session on `sock`.
    pub fn approve_connection(&mut self, sock: SocketId, accept: bool, reason: Option<&str>) {
        self.with_session(sock, |s| s.approve_connection(accept, reason));
    }

    /// A session finished initialisation. Enforces the shared/non-shared
    /// policy.
    pub fn client_ready(&mut self, sock: SocketId, shared: bool) {
        if shared {
            return;
        }
        let Some(idx) = self.client_index(sock) else {
            return;
        };
        if self.config.disconnect_clients
            && self.clients[idx].access_check(AccessRights::NON_SHARED)
        {
            debug!("non-shared connection, closing other clients");
            self.close_clients("Non-shared connection requested", Some(sock));
        } else if self.auth_client_count() > 1 {
            self.close_session(idx, "Server is already in use");
        }
    }

    /// A session reports a failed authentication attempt; the peer earns a
    /// blacklist strike.
    pub fn report_auth_failure(&mut self, sock: SocketId) {
        if let Some(idx) = self.client_index(sock) {
            let address = self.clients[idx].peer_address();
            self.blacklist.add_blackmark(address);
        }
    }

    // ── Shared input ──────────────────────────────────────────────────────────

    /// Forwards a key event to the desktop, after remapping.
    pub fn key_event(&mut self, keysym: u32, keycode: u32, down: bool) {
        if !self.config.accept_key_events {
            return;
        }
        self.restart_idle_timer();

        let mapped = self.key_remapper.remap(keysym);
        if mapped != keysym {
            debug!("keysym {keysym:#06x} remapped to {mapped:#06x}");
        }
        self.desktop.key_event(mapped, keycode, down);
    }

    /// Forwards a pointer event, applying pointer-owner arbitration: while
    /// another client recently held buttons down, this client's events are
    /// dropped.
    pub fn pointer_event(&mut self, sock: SocketId, pos: Point, button_mask: u16) {
        if !self.config.accept_pointer_events {
            return;
        }
        self.restart_idle_timer();

        let now = self.clock.now();
        if let Some(owner) = self.pointer_owner {
            if owner != sock
                && now.duration_since(self.pointer_owner_since) < POINTER_OWNER_TIMEOUT
            {
                return;
            }
        }

        self.pointer_owner_since = now;
        self.pointer_owner = if button_mask != 0 { Some(sock) } else { None };

        self.desktop.pointer_event(pos, button_mask);
    }

    /// Applies a client's resize request. The result code goes back to the
    /// requester; every other client learns about the new layout.
    pub fn set_desktop_size(
        &mut self,
        requester: SocketId,
        width: i32,
        height: i32,
        layout: &ScreenSet,
    ) -> ResizeResult {
        if !self.config.accept_set_desktop_size {
            debug!("rejecting unauthorized framebuffer resize request");
            return ResizeResult::ResizeProhibited;
        }
        if width > MAX_FRAMEBUFFER_DIM || height > MAX_FRAMEBUFFER_DIM {
            error!("rejecting too large framebuffer resize request ({width}x{height})");
            return ResizeResult::ResizeProhibited;
        }
        if !layout.validate(width, height) {
            error!("invalid screen layout requested by client");
            return ResizeResult::InvalidLayout;
        }

        match self.desktop.set_screen_layout(width, height, layout) {
            ResizeOutcome::Rejected(result) => result,
            ResizeOutcome::Accepted {
                buffer,
                layout: applied,
            } => {
                match buffer {
                    Some(pb) => {
                        if self.set_pixel_buffer(pb, applied).is_err() {
                            error!("desktop accepted a resize but produced an invalid layout");
                            panic!("desktop accepted a resize but produced an invalid layout");
                        }
                    }
                    None => {
                        let current = self.pixel_buffer.as_ref().map(|pb| (pb.width(), pb.height()));
                        if current != Some((width, height)) {
                            error!("desktop accepted a resize without reallocating the framebuffer");
                            panic!("desktop accepted a resize without reallocating the framebuffer");
                        }
                        self.screen_layout = applied;
                    }
                }

                if self.screen_layout != *layout {
                    error!("desktop applied a different screen layout than requested");
                    panic!("desktop applied a different screen layout than requested");
                }

                self.for_each_session(Some(requester), |s| {
                    s.screen_layout_change(LayoutChangeReason::OtherClient)
                });
                ResizeResult::Success
            }
        }
    }

    // ── Clipboard ─────────────────────────────────────────────────────────────

    /// The desktop wants the clipboard contents of the owning client.
    pub fn request_clipboard(&mut self) {
        if !self.config.accept_cut_text {
            return;
        }
        let Some(owner) = self.clipboard_owner else {
            debug!("clipboard requested but no client owns the clipboard");
            return;
        };
        self.with_session(owner, |s| s.request_clipboard());
    }

    /// The desktop announces (or retracts) server-side clipboard contents.
    pub fn announce_clipboard(&mut self, available: bool) {
        self.clipboard_requestors.clear();
        if !self.config.send_cut_text {
            return;
        }
        self.for_each_session(None, |s| s.announce_clipboard(available));
    }

    /// The desktop delivers clipboard data to every client that asked for
    /// it.
    pub fn send_clipboard_data(&mut self, data: &str) -> Result<(), MuxError> {
        if !self.config.send_cut_text {
            return Ok(());
        }
        if data.contains('\r') {
            return Err(MuxError::InvalidClipboard);
        }
        let requestors = std::mem::take(&mut self.clipboard_requestors);
        for sock in requestors {
            self.with_session(sock, |s| s.send_clipboard_data(data));
        }
        Ok(())
    }

    /// A client asks for the server-side clipboard. The desktop is only
    /// bothered once per burst of requests.
    pub fn handle_clipboard_request(&mut self, sock: SocketId) {
        self.clipboard_requestors.push(sock);
        if self.clipboard_requestors.len() == 1 {
            self.desktop.handle_clipboard_request();
        }
    }

    /// A client announces (or retracts) clipboard contents. Only the
    /// current owner may retract.
    pub fn handle_clipboard_announce(&mut self, sock: SocketId, available: bool) {
        if available {
            if !self.config.accept_cut_text {
                return;
            }
            self.clipboard_owner = Some(sock);
        } else {
            if self.clipboard_owner != Some(sock) {
                return;
            }
            self.clipboard_owner = None;
        }
        self.desktop.handle_clipboard_announce(available);
    }

    /// Clipboard data from a client; only the owner's data is accepted.
    pub fn handle_clipboard_data(&mut self, sock: SocketId, data: &str) {
        if !self.config.accept_cut_text {
            return;
        }
        if self.clipboard_owner != Some(sock) {
            debug!("ignoring unexpected clipboard data");
            return;
        }
        self.desktop.handle_clipboard_data(data);
    }

    // ── Framebuffer & layout ──────────────────────────────────────────────────

    /// Installs a new pixel buffer with an explicit screen layout. Resets
    /// all content tracking: the whole framebuffer is considered changed
    /// and the rendered cursor stale.
    pub fn set_pixel_buffer(
        &mut self,
        pb: BoxedPixelBuffer,
        layout: ScreenSet,
    ) -> Result<(), MuxError> {
        if !layout.validate(pb.width(), pb.height()) {
            return Err(MuxError::InvalidLayout);
        }

        if let Some(comparer) = &mut self.comparer {
            comparer.log_stats();
        }

        let full = Region::from(pb.rect());
        self.comparer = Some(ComparingUpdateTracker::new(&*pb));
        self.pixel_buffer = Some(pb);
        self.screen_layout = layout;
        self.rendered_cursor_invalid = true;
        self.add_changed(&full);

        // The new pixel buffer forces a full geometry re-announcement
        // anyway, so no separate layout notification is needed.
        self.for_each_session(None, |s| s.pixel_buffer_change());
        Ok(())
    }

    /// Installs a new pixel buffer, carrying the current layout over:
    /// screens are clipped to the new framebuffer, screens left empty are
    /// dropped, and a single full-screen monitor is synthesised if none
    /// survive.
    pub fn replace_pixel_buffer(&mut self, pb: BoxedPixelBuffer) -> Result<(), MuxError> {
        let mut layout = self.screen_layout.clone();
        let fb_rect = pb.rect();

        if !layout.validate(pb.width(), pb.height()) {
            let mut kept = ScreenSet::new();
            for screen in layout.screens() {
                let clipped = screen.rect.intersect(&fb_rect);
                if clipped.is_empty() {
                    info!(
                        "removing screen {} as it is completely outside the new framebuffer",
                        screen.id
                    );
                    continue;
                }
                let mut screen = *screen;
                screen.rect = clipped;
                kept.add_screen(screen);
            }
            layout = kept;
        }

        if layout.is_empty() {
            layout = ScreenSet::single(pb.width(), pb.height());
        }

        self.set_pixel_buffer(pb, layout)
    }

    /// Removes the pixel buffer entirely. Only legal while the desktop is
    /// stopped.
    pub fn clear_pixel_buffer(&mut self) {
        if self.desktop_started {
            error!("pixel buffer cleared while the desktop is running");
            panic!("pixel buffer cleared while the desktop is running");
        }
        if let Some(comparer) = &mut self.comparer {
            comparer.log_stats();
        }
        self.pixel_buffer = None;
        self.comparer = None;
        self.screen_layout = ScreenSet::new();
    }

    /// The desktop changed the monitor arrangement without touching the
    /// framebuffer.
    pub fn set_screen_layout(&mut self, layout: ScreenSet) -> Result<(), MuxError> {
        let Some(pb) = &self.pixel_buffer else {
            error!("screen layout changed without a pixel buffer");
            panic!("screen layout changed without a pixel buffer");
        };
        if !layout.validate(pb.width(), pb.height()) {
            return Err(MuxError::InvalidLayout);
        }
        self.screen_layout = layout;
        self.for_each_session(None, |s| s.screen_layout_change(LayoutChangeReason::Server));
        Ok(())
    }

    pub fn screen_layout(&self) -> &ScreenSet {
        &self.screen_layout
    }

    // ── Damage ────────────────────────────────────────────────────────────────

    /// The desktop reports damaged pixels.
    pub fn add_changed(&mut self, region: &Region) {
        let Some(comparer) = &mut self.comparer else {
            return;
        };
        comparer.add_changed(region);
        self.start_frame_clock();
    }

    /// The desktop reports a copy (scroll) into `dest` from
    /// `dest - delta`.
    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        let Some(comparer) = &mut self.comparer else {
            return;
        };
        comparer.add_copied(dest, delta);
        self.start_frame_clock();
    }

    // ── Cursor, LEDs, bell, name ──────────────────────────────────────────────

    /// Replaces the cursor image.
    pub fn set_cursor(&mut self, width: i32, height: i32, hotspot: Point, data: &[u8]) {
        self.cursor = Cursor::new(width, height, hotspot, data);
        self.rendered_cursor_invalid = true;
        self.for_each_session(None, |s| {
            s.rendered_cursor_change();
            s.set_cursor()
        });
    }

    /// Moves the cursor. `warped` marks server-driven moves, which clients
    /// tracking the remote cursor are told about explicitly.
    pub fn set_cursor_pos(&mut self, pos: Point, warped: bool) {
        if self.cursor_pos == pos {
            return;
        }
        self.cursor_pos = pos;
        self.rendered_cursor_invalid = true;
        self.for_each_session(None, |s| {
            s.rendered_cursor_change();
            if warped {
                s.cursor_position_change()
            } else {
                Ok(())
            }
        });
    }

    /// Updates the keyboard LED state. No-op when nothing changed.
    pub fn set_led_state(&mut self, state: u8) {
        if self.led_state == Some(state) {
            return;
        }
        self.led_state = Some(state);
        self.for_each_session(None, |s| s.set_led_state(state));
    }

    /// Rings the bell on every client.
    pub fn bell(&mut self) {
        self.for_each_session(None, |s| s.bell());
    }

    /// Renames the desktop on every client.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        let name = name.to_string();
        self.for_each_session(None, |s| s.set_desktop_name(&name));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The composited cursor patch, rebuilt on demand. Requires an
    /// installed pixel buffer.
    pub fn rendered_cursor(&mut self) -> &RenderedCursor {
        if self.rendered_cursor_invalid {
            let pb = self
                .pixel_buffer
                .as_ref()
                .expect("rendered cursor requested without a pixel buffer");
            self.rendered_cursor.update(&**pb, &self.cursor, self.cursor_pos);
            self.rendered_cursor_invalid = false;
        }
        &self.rendered_cursor
    }

    // ── Update blocking ───────────────────────────────────────────────────────

    /// Suspends all framebuffer reads and the frame clock. Calls nest.
    pub fn block_updates(&mut self) {
        self.block_counter += 1;
        self.frame_timer.stop();
    }

    /// Undoes one [`Multiplexer::block_updates`]. Restarts the frame clock
    /// when the last block is released.
    pub fn unblock_updates(&mut self) {
        assert!(self.block_counter > 0, "unbalanced update unblock");
        self.block_counter -= 1;
        if self.block_counter == 0 {
            self.start_frame_clock();
        }
    }

    // ── Frame pacing ──────────────────────────────────────────────────────────

    /// Current frame counter.
    pub fn get_msc(&self) -> u64 {
        self.msc
    }

    /// Asks the frame clock to keep running at least until the counter
    /// reaches `target`, even with no damage pending.
    pub fn queue_msc(&mut self, target: u64) {
        if target > self.queued_msc {
            self.queued_msc = target;
        }
        self.start_frame_clock();
    }

    /// Region clients must not read right now: everything while updates
    /// are blocked, otherwise whatever damage is still pending.
    pub fn pending_region(&self) -> Region {
        let Some(pb) = &self.pixel_buffer else {
            return Region::new();
        };
        if self.block_counter > 0 {
            return Region::from(pb.rect());
        }
        let comparer = self
            .comparer
            .as_ref()
            .expect("comparer missing with a pixel buffer installed");
        if comparer.is_empty() {
            return Region::new();
        }
        let ui = comparer.get_update_info(pb.rect());
        ui.changed.union(&ui.copied)
    }

    /// Time until the next update write, for producers pacing themselves
    /// against the frame clock.
    pub fn ms_to_next_update(&self) -> Duration {
        match self.frame_timer.remaining(self.clock.now()) {
            Some(remaining) => remaining,
            None => self.frame_interval() / 2,
        }
    }

    pub fn frame_clock_running(&self) -> bool {
        self.frame_timer.is_started()
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Earliest pending timer deadline, for the embedding event loop.
    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        [
            &self.idle_timer,
            &self.disconnect_timer,
            &self.connect_timer,
            &self.frame_timer,
        ]
        .into_iter()
        .filter_map(Timer::deadline)
        .min()
    }

    /// Fires every timer whose deadline has passed.
    pub fn run_due_timers(&mut self) {
        let now = self.clock.now();
        for id in [
            TimerId::Idle,
            TimerId::Disconnect,
            TimerId::Connect,
            TimerId::Frame,
        ] {
            if self.timer_mut(id).take_if_due(now) {
                self.handle_timeout(id);
            }
        }
    }

    fn timer_mut(&mut self, id: TimerId) -> &mut Timer {
        match id {
            TimerId::Idle => &mut self.idle_timer,
            TimerId::Disconnect => &mut self.disconnect_timer,
            TimerId::Connect => &mut self.connect_timer,
            TimerId::Frame => &mut self.frame_timer,
        }
    }

    fn handle_timeout(&mut self, id: TimerId) {
        match id {
            TimerId::Idle => {
                info!("maximum idle time reached, exiting");
                self.desktop.terminate();
            }
            TimerId::Disconnect => {
                info!("maximum disconnection time reached, exiting");
                self.desktop.terminate();
            }
            TimerId::Connect => {
                info!("maximum connection time reached, exiting");
                self.desktop.terminate();
            }
            TimerId::Frame => self.frame_tick(),
        }
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn desktop_started(&self) -> bool {
        self.desktop_started
    }

    pub fn pointer_owner(&self) -> Option<SocketId> {
        self.pointer_owner
    }

    pub fn clipboard_owner(&self) -> Option<SocketId> {
        self.clipboard_owner
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn client_index(&self, sock: SocketId) -> Option<usize> {
        self.clients.iter().position(|c| c.socket_id() == sock)
    }

    fn dispatch_command(&mut self, sock: SocketId, command: ClientCommand) {
        match command {
            ClientCommand::QueryConnection { user_name } => {
                self.query_connection(sock, &user_name);
            }
            ClientCommand::ClientReady { shared } => self.client_ready(sock, shared),
            ClientCommand::AuthFailed => self.report_auth_failure(sock),
            ClientCommand::KeyEvent {
                keysym,
                keycode,
                down,
            } => self.key_event(keysym, keycode, down),
            ClientCommand::PointerEvent { pos, button_mask } => {
                self.pointer_event(sock, pos, button_mask);
            }
            ClientCommand::SetDesktopSize {
                width,
                height,
                layout,
            } => {
                let result = self.set_desktop_size(sock, width, height, &layout);
                self.with_session(sock, |s| s.resize_result(result));
            }
            ClientCommand::ClipboardRequest => self.handle_clipboard_request(sock),
            ClientCommand::ClipboardAnnounce { available } => {
                self.handle_clipboard_announce(sock, available);
            }
            ClientCommand::ClipboardData { text } => self.handle_clipboard_data(sock, &text),
        }
    }

    /// Runs `op` on every live session (minus `except`), closing any
    /// session whose operation fails. Already-closed sessions are skipped.
    fn for_each_session<F>(&mut self, except: Option<SocketId>, mut op: F)
    where
        F: FnMut(&mut dyn ClientSession) -> Result<(), SessionError>,
    {
        for session in self.clients.iter_mut() {
            if session.is_closed() || Some(session.socket_id()) == except {
                continue;
            }
            if let Err(e) = op(session.as_mut()) {
                let reason = e.to_string();
                warn!("closing {}: {reason}", session.peer_endpoint());
                session.close(&reason);
            }
        }
    }

    /// Runs `op` on the single session owning `sock`, closing it on
    /// failure.
    fn with_session<F>(&mut self, sock: SocketId, op: F)
    where
        F: FnOnce(&mut dyn ClientSession) -> Result<(), SessionError>,
    {
        let Some(idx) = self.client_index(sock) else {
            return;
        };
        let session = &mut self.clients[idx];
        if session.is_closed() {
            return;
        }
        if let Err(e) = op(session.as_mut()) {
            let reason = e.to_string();
            warn!("closing {}: {reason}", session.peer_endpoint());
            session.close(&reason);
        }
    }

    fn close_session(&mut self, idx: usize, reason: &str) {
        let session = &mut self.clients[idx];
        if session.is_closed() {
            return;
        }
        session.close(reason);
    }

    fn auth_client_count(&self) -> usize {
        self.clients.iter().filter(|c| c.authenticated()).count()
    }

    fn restart_idle_timer(&mut self) {
        if self.config.max_idle_time > 0 {
            let now = self.clock.now();
            self.idle_timer
                .start(now, Duration::from_secs(self.config.max_idle_time));
        }
    }

    fn start_desktop(&mut self) -> Result<(), DesktopError> {
        if self.desktop_started {
            return Ok(());
        }
        debug!("starting desktop");

        let surface = match self.desktop.start() {
            Ok(surface) => surface,
            Err(e) => {
                error!("desktop failed to start: {e}");
                self.close_clients(&e.to_string(), None);
                return Err(e);
            }
        };

        let installed = match surface.layout {
            Some(layout) => self.set_pixel_buffer(surface.buffer, layout),
            None => self.replace_pixel_buffer(surface.buffer),
        };
        if installed.is_err() {
            error!("desktop started with an invalid screen layout");
            panic!("desktop started with an invalid screen layout");
        }
        self.desktop_started = true;

        // The tracker may have accumulated damage while we were stopped;
        // flush it out now.
        if self.comparer.as_ref().is_some_and(|c| !c.is_empty()) {
            self.write_update();
        }
        // If the frame clock is running it is running slowly; kick it so
        // it picks up the normal rate right away.
        if self.frame_timer.is_started() {
            self.frame_timer.stop();
            self.start_frame_clock();
        }
        Ok(())
    }

    fn stop_desktop(&mut self) {
        if self.desktop_started {
            debug!("stopping desktop");
            self.desktop_started = false;
            self.desktop.stop();
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis((1000 / self.config.frame_rate.max(1)) as u64)
    }

    fn start_frame_clock(&mut self) {
        if self.frame_timer.is_started() {
            return;
        }
        if self.block_counter > 0 {
            return;
        }

        // Anyone actually interested in frames?
        let comparer_empty = self.comparer.as_ref().map_or(true, |c| c.is_empty());
        if (!self.desktop_started || comparer_empty) && self.queued_msc < self.msc {
            return;
        }

        let now = self.clock.now();

        // Run very slowly while there is no desktop to read from.
        if !self.desktop_started {
            self.frame_timer.start(now, SLOW_TICK);
            return;
        }

        // The first tick is half a frame: a full interval gives a very
        // unstable rate whenever we are perfectly in sync with the
        // producer's own update cadence.
        self.frame_timer.start(now, self.frame_interval() / 2);
    }

    /// The frame timer fired. Reschedules itself while there is work (or
    /// someone waits on the counter), writes an update when damage is
    /// pending, and always advances the frame counter it keeps with the
    /// desktop.
    fn frame_tick(&mut self) {
        let comparer_empty = self.comparer.as_ref().map_or(true, |c| c.is_empty());

        // We keep running until we go a full interval without updates and
        // nobody waits for the counter to advance.
        if (!self.desktop_started || comparer_empty) && self.queued_msc < self.msc {
            return;
        }

        let timeout = if self.desktop_started {
            self.frame_interval()
        } else {
            SLOW_TICK
        };
        let now = self.clock.now();
        self.frame_timer.start(now, timeout);

        if self.desktop_started && !comparer_empty {
            self.write_update();
        }

        self.msc += 1;
        self.desktop.frame_tick(self.msc);
    }

    /// Collects pending damage, culls what did not really change, and fans
    /// the result out to every session.
    fn write_update(&mut self) {
        assert_eq!(self.block_counter, 0, "update write while updates are blocked");
        assert!(self.desktop_started);

        let need_rendered_cursor = self
            .clients
            .iter()
            .any(|c| !c.is_closed() && c.need_rendered_cursor());
        let comparer_on = match self.config.compare_fb {
            CompareMode::Off => false,
            CompareMode::On => true,
            CompareMode::Auto => self
                .clients
                .iter()
                .any(|c| !c.is_closed() && c.prefers_comparison()),
        };

        let pb = self
            .pixel_buffer
            .as_mut()
            .expect("update write without a pixel buffer");
        let comparer = self
            .comparer
            .as_mut()
            .expect("update write without a comparer");
        let fb_rect = pb.rect();

        let mut ui = comparer.get_update_info(fb_rect);
        let to_check = ui.changed.union(&ui.copied);

        if need_rendered_cursor {
            let cursor_rect = self.cursor.rect_at(self.cursor_pos).intersect(&fb_rect);
            if !to_check.intersect_rect(cursor_rect).is_empty() {
                self.rendered_cursor_invalid = true;
            }
        }

        pb.grab(&to_check);

        if comparer_on {
            comparer.enable();
        } else {
            comparer.disable();
        }
        if comparer.compare(&**pb) {
            ui = comparer.get_update_info(fb_rect);
        }
        comparer.clear();

        self.for_each_session(None, |s| {
            s.add_copied(&ui.copied, ui.copy_delta);
            s.add_changed(&ui.changed);
            s.write_framebuffer_update()
        });
    }
}

/// The shortest possible way to tell a client it is not welcome: an RFB
/// 3.3 greeting, a zero security type, and a reason string.
fn write_rejection(socket: &mut dyn SocketHandle) -> Result<(), SocketError> {
    const REASON: &str = "Too many security failures";

    let reason = REASON.as_bytes();
    let mut buf = Vec::with_capacity(12 + 8 + reason.len());
    buf.extend_from_slice(b"RFB 003.003\n");
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&(reason.len() as u32).to_be_bytes());
    buf.extend_from_slice(reason);

    socket.write_all(&buf)?;
    socket.flush()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
