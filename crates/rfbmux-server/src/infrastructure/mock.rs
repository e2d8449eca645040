//! Recording test doubles for the multiplexer's collaborators.
//!
//! Each double is a cheap handle around shared state: tests keep a clone,
//! hand the original to the multiplexer, and assert on the recorded calls
//! afterwards. The demo binary reuses [`MockDesktop`] logic in spirit; in
//! production builds these are replaced by a platform desktop and a real
//! RFB session implementation.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use rfbmux_core::{MemoryPixelBuffer, Point, Region, ScreenSet};
use uuid::Uuid;

use crate::application::desktop::{
    BoxedPixelBuffer, DesktopError, DesktopSurface, ResizeOutcome, ResizeResult, SystemDesktop,
};
use crate::application::session::{
    AccessRights, ClientCommand, ClientSession, LayoutChangeReason, SessionCreateError,
    SessionError, SessionFactory,
};
use crate::application::socket::{SocketError, SocketHandle, SocketId};

// ── Socket ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SocketState {
    written: Vec<u8>,
    shutdown: bool,
}

/// A socket that records everything written to it. Clones share state, so
/// a test keeps one clone and gives the other to the multiplexer.
#[derive(Debug, Clone)]
pub struct MockSocket {
    id: SocketId,
    peer: SocketAddr,
    requires_query: bool,
    state: Arc<Mutex<SocketState>>,
}

impl MockSocket {
    pub fn new(peer: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.parse().expect("test peer address"),
            requires_query: false,
            state: Arc::new(Mutex::new(SocketState::default())),
        }
    }

    pub fn with_requires_query(mut self) -> Self {
        self.requires_query = true;
        self
    }

    /// The socket id, also available without the trait in scope.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }
}

impl SocketHandle for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn peer_address(&self) -> IpAddr {
        self.peer.ip()
    }

    fn peer_endpoint(&self) -> String {
        self.peer.to_string()
    }

    fn requires_query(&self) -> bool {
        self.requires_query
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SocketError> {
        self.state.lock().unwrap().written.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SocketError> {
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state.lock().unwrap().shutdown = true;
    }
}

// ── Desktop ───────────────────────────────────────────────────────────────────

/// One recorded call into the desktop.
#[derive(Debug, Clone, PartialEq)]
pub enum DesktopCall {
    Start,
    Stop,
    Terminate,
    KeyEvent { keysym: u32, keycode: u32, down: bool },
    PointerEvent { pos: Point, button_mask: u16 },
    SetScreenLayout { width: i32, height: i32 },
    ClipboardRequest,
    ClipboardAnnounce(bool),
    ClipboardData(String),
    QueryConnection { socket: SocketId, user_name: String },
    FrameTick(u64),
}

#[derive(Debug)]
struct DesktopState {
    width: i32,
    height: i32,
    calls: Vec<DesktopCall>,
    start_error: Option<String>,
    start_layout: Option<ScreenSet>,
    resize_rejection: Option<ResizeResult>,
    resize_applied_layout: Option<ScreenSet>,
    resize_keep_buffer: bool,
    terminated: bool,
}

/// A desktop whose screen is a zeroed memory buffer. Records every call;
/// clones share state.
#[derive(Debug, Clone)]
pub struct MockDesktop {
    state: Arc<Mutex<DesktopState>>,
}

impl MockDesktop {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(DesktopState {
                width,
                height,
                calls: Vec::new(),
                start_error: None,
                start_layout: None,
                resize_rejection: None,
                resize_applied_layout: None,
                resize_keep_buffer: false,
                terminated: false,
            })),
        }
    }

    /// Makes the next `start` fail with this message.
    pub fn set_start_error(&self, message: &str) {
        self.state.lock().unwrap().start_error = Some(message.to_string());
    }

    /// Makes `start` report this layout instead of letting the server
    /// derive one. Pass a layout that does not fit the buffer to simulate
    /// a misbehaving desktop.
    pub fn set_start_layout(&self, layout: ScreenSet) {
        self.state.lock().unwrap().start_layout = Some(layout);
    }

    /// Makes every resize request come back rejected.
    pub fn set_resize_rejection(&self, result: ResizeResult) {
        self.state.lock().unwrap().resize_rejection = Some(result);
    }

    /// Makes accepted resizes report this layout as applied, regardless
    /// of what was requested. Simulates a desktop that lies about the
    /// layout it configured.
    pub fn set_resize_applied_layout(&self, layout: ScreenSet) {
        self.state.lock().unwrap().resize_applied_layout = Some(layout);
    }

    /// Makes accepted resizes keep the current buffer even when the
    /// requested dimensions differ. Simulates a desktop that forgets to
    /// reallocate.
    pub fn set_resize_keep_buffer(&self) {
        self.state.lock().unwrap().resize_keep_buffer = true;
    }

    pub fn calls(&self) -> Vec<DesktopCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn terminated(&self) -> bool {
        self.state.lock().unwrap().terminated
    }
}

impl SystemDesktop for MockDesktop {
    fn start(&mut self) -> Result<DesktopSurface, DesktopError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DesktopCall::Start);
        if let Some(message) = state.start_error.clone() {
            return Err(DesktopError::Failed(message));
        }
        Ok(DesktopSurface {
            buffer: Box::new(MemoryPixelBuffer::new(state.width, state.height)),
            layout: state.start_layout.clone(),
        })
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().calls.push(DesktopCall::Stop);
    }

    fn terminate(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DesktopCall::Terminate);
        state.terminated = true;
    }

    fn key_event(&mut self, keysym: u32, keycode: u32, down: bool) {
        self.state.lock().unwrap().calls.push(DesktopCall::KeyEvent {
            keysym,
            keycode,
            down,
        });
    }

    fn pointer_event(&mut self, pos: Point, button_mask: u16) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(DesktopCall::PointerEvent { pos, button_mask });
    }

    fn set_screen_layout(&mut self, width: i32, height: i32, layout: &ScreenSet) -> ResizeOutcome {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(DesktopCall::SetScreenLayout { width, height });
        if let Some(result) = state.resize_rejection {
            return ResizeOutcome::Rejected(result);
        }
        // Reallocate only when the dimensions actually change.
        let buffer = if !state.resize_keep_buffer && (width, height) != (state.width, state.height)
        {
            state.width = width;
            state.height = height;
            Some(Box::new(MemoryPixelBuffer::new(width, height)) as BoxedPixelBuffer)
        } else {
            None
        };
        let applied = state
            .resize_applied_layout
            .clone()
            .unwrap_or_else(|| layout.clone());
        ResizeOutcome::Accepted {
            buffer,
            layout: applied,
        }
    }

    fn handle_clipboard_request(&mut self) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(DesktopCall::ClipboardRequest);
    }

    fn handle_clipboard_announce(&mut self, available: bool) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(DesktopCall::ClipboardAnnounce(available));
    }

    fn handle_clipboard_data(&mut self, data: &str) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(DesktopCall::ClipboardData(data.to_string()));
    }

    fn query_connection(&mut self, socket: SocketId, user_name: &str) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(DesktopCall::QueryConnection {
                socket,
                user_name: user_name.to_string(),
            });
    }

    fn frame_tick(&mut self, msc: u64) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(DesktopCall::FrameTick(msc));
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One recorded call into a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCall {
    Init,
    FlushSocket,
    ApproveConnection { accept: bool, reason: Option<String> },
    ResizeResult(ResizeResult),
    PixelBufferChange,
    ScreenLayoutChange(LayoutChangeReason),
    RenderedCursorChange,
    CursorPositionChange,
    SetCursor,
    SetLedState(u8),
    SetDesktopName(String),
    Bell,
    AnnounceClipboard(bool),
    RequestClipboard,
    SendClipboardData(String),
    AddChanged(Region),
    AddCopied(Region, Point),
    WriteFramebufferUpdate,
}

#[derive(Debug)]
struct SessionState {
    socket_id: SocketId,
    peer: SocketAddr,
    requires_query: bool,
    authenticated: bool,
    access: AccessRights,
    need_rendered_cursor: bool,
    prefers_comparison: bool,
    closed: Option<String>,
    fail_ops: bool,
    pending: VecDeque<ClientCommand>,
    calls: Vec<SessionCall>,
}

/// Test-side view of one mock session. Valid even after the multiplexer
/// drops the session itself.
#[derive(Debug, Clone)]
pub struct MockSessionHandle {
    state: Arc<Mutex<SessionState>>,
}

impl MockSessionHandle {
    pub fn socket_id(&self) -> SocketId {
        self.state.lock().unwrap().socket_id
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&SessionCall) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| predicate(c))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed.is_some()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn authenticated(&self) -> bool {
        self.state.lock().unwrap().authenticated
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.state.lock().unwrap().authenticated = authenticated;
    }

    pub fn set_access(&self, access: AccessRights) {
        self.state.lock().unwrap().access = access;
    }

    pub fn set_need_rendered_cursor(&self, value: bool) {
        self.state.lock().unwrap().need_rendered_cursor = value;
    }

    pub fn set_prefers_comparison(&self, value: bool) {
        self.state.lock().unwrap().prefers_comparison = value;
    }

    /// Makes every fallible session operation fail, for exercising the
    /// close-on-error paths.
    pub fn set_fail_ops(&self, value: bool) {
        self.state.lock().unwrap().fail_ops = value;
    }

    /// Queues commands for the next `process_messages`.
    pub fn queue_commands(&self, commands: Vec<ClientCommand>) {
        self.state.lock().unwrap().pending.extend(commands);
    }
}

/// The session object handed to the multiplexer. Owns its socket, as real
/// sessions do.
pub struct MockSession {
    state: Arc<Mutex<SessionState>>,
    _socket: Box<dyn SocketHandle>,
}

impl MockSession {
    fn fallible(&self, call: SessionCall) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_ops {
            return Err(SessionError::Protocol("injected session failure".into()));
        }
        state.calls.push(call);
        Ok(())
    }

    fn record(&self, call: SessionCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl ClientSession for MockSession {
    fn socket_id(&self) -> SocketId {
        self.state.lock().unwrap().socket_id
    }

    fn peer_address(&self) -> IpAddr {
        self.state.lock().unwrap().peer.ip()
    }

    fn peer_endpoint(&self) -> String {
        self.state.lock().unwrap().peer.to_string()
    }

    fn requires_query(&self) -> bool {
        self.state.lock().unwrap().requires_query
    }

    fn init(&mut self) -> Result<(), SessionError> {
        self.fallible(SessionCall::Init)
    }

    fn close(&mut self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed.is_some()
    }

    fn authenticated(&self) -> bool {
        self.state.lock().unwrap().authenticated
    }

    fn access_check(&self, rights: AccessRights) -> bool {
        self.state.lock().unwrap().access.contains(rights)
    }

    fn need_rendered_cursor(&self) -> bool {
        self.state.lock().unwrap().need_rendered_cursor
    }

    fn prefers_comparison(&self) -> bool {
        self.state.lock().unwrap().prefers_comparison
    }

    fn process_messages(&mut self) -> Result<Vec<ClientCommand>, SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_ops {
            return Err(SessionError::Protocol("injected session failure".into()));
        }
        Ok(state.pending.drain(..).collect())
    }

    fn flush_socket(&mut self) -> Result<(), SessionError> {
        self.fallible(SessionCall::FlushSocket)
    }

    fn approve_connection(&mut self, accept: bool, reason: Option<&str>) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_ops {
            return Err(SessionError::Protocol("injected session failure".into()));
        }
        if accept {
            // Real sessions progress to the initialisation phase here.
            state.authenticated = true;
        }
        state.calls.push(SessionCall::ApproveConnection {
            accept,
            reason: reason.map(str::to_string),
        });
        Ok(())
    }

    fn resize_result(&mut self, result: ResizeResult) -> Result<(), SessionError> {
        self.fallible(SessionCall::ResizeResult(result))
    }

    fn pixel_buffer_change(&mut self) -> Result<(), SessionError> {
        self.fallible(SessionCall::PixelBufferChange)
    }

    fn screen_layout_change(&mut self, reason: LayoutChangeReason) -> Result<(), SessionError> {
        self.fallible(SessionCall::ScreenLayoutChange(reason))
    }

    fn rendered_cursor_change(&mut self) {
        self.record(SessionCall::RenderedCursorChange);
    }

    fn cursor_position_change(&mut self) -> Result<(), SessionError> {
        self.fallible(SessionCall::CursorPositionChange)
    }

    fn set_cursor(&mut self) -> Result<(), SessionError> {
        self.fallible(SessionCall::SetCursor)
    }

    fn set_led_state(&mut self, state: u8) -> Result<(), SessionError> {
        self.fallible(SessionCall::SetLedState(state))
    }

    fn set_desktop_name(&mut self, name: &str) -> Result<(), SessionError> {
        self.fallible(SessionCall::SetDesktopName(name.to_string()))
    }

    fn bell(&mut self) -> Result<(), SessionError> {
        self.fallible(SessionCall::Bell)
    }

    fn announce_clipboard(&mut self, available: bool) -> Result<(), SessionError> {
        self.fallible(SessionCall::AnnounceClipboard(available))
    }

    fn request_clipboard(&mut self) -> Result<(), SessionError> {
        self.fallible(SessionCall::RequestClipboard)
    }

    fn send_clipboard_data(&mut self, data: &str) -> Result<(), SessionError> {
        self.fallible(SessionCall::SendClipboardData(data.to_string()))
    }

    fn add_changed(&mut self, region: &Region) {
        self.record(SessionCall::AddChanged(region.clone()));
    }

    fn add_copied(&mut self, region: &Region, delta: Point) {
        self.record(SessionCall::AddCopied(region.clone(), delta));
    }

    fn write_framebuffer_update(&mut self) -> Result<(), SessionError> {
        self.fallible(SessionCall::WriteFramebufferUpdate)
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FactoryState {
    sessions: Vec<MockSessionHandle>,
    fail_next_create: bool,
}

/// Builds [`MockSession`]s and keeps a handle to each for the test to
/// inspect. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockSessionFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `create_session` fail, handing the socket back.
    pub fn set_fail_next_create(&self) {
        self.state.lock().unwrap().fail_next_create = true;
    }

    /// Handle to the `i`-th created session, in creation order.
    pub fn session(&self, i: usize) -> MockSessionHandle {
        self.state.lock().unwrap().sessions[i].clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }
}

impl SessionFactory for MockSessionFactory {
    fn create_session(
        &mut self,
        socket: Box<dyn SocketHandle>,
        _outgoing: bool,
        rights: AccessRights,
    ) -> Result<Box<dyn ClientSession>, SessionCreateError> {
        let mut factory_state = self.state.lock().unwrap();
        if factory_state.fail_next_create {
            factory_state.fail_next_create = false;
            return Err(SessionCreateError {
                socket,
                message: "injected construction failure".to_string(),
            });
        }

        let peer: SocketAddr = socket
            .peer_endpoint()
            .parse()
            .expect("mock sockets use address:port endpoints");
        let state = Arc::new(Mutex::new(SessionState {
            socket_id: socket.id(),
            peer,
            requires_query: socket.requires_query(),
            authenticated: false,
            access: rights,
            need_rendered_cursor: false,
            prefers_comparison: false,
            closed: None,
            fail_ops: false,
            pending: VecDeque::new(),
            calls: Vec::new(),
        }));
        factory_state.sessions.push(MockSessionHandle {
            state: state.clone(),
        });

        Ok(Box::new(MockSession {
            state,
            _socket: socket,
        }))
    }
}
