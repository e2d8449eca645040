//! Demo desktop and sessions for the standalone binary.
//!
//! [`TestPatternDesktop`] paints a moving bar over a gradient so the frame
//! clock, damage tracking, and fan-out paths all have something real to
//! chew on without a platform display driver. [`DemoSession`] speaks no
//! actual viewer protocol: it greets, pretends to authenticate on the
//! first bytes the peer sends, and counts the updates it is offered. Both
//! stand in for the production implementations the same way the mock
//! input emulator stands in for platform input injection.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info};

use rfbmux_core::{PixelBuffer, Point, Rect, Region, ScreenSet};

use crate::application::desktop::{
    DesktopError, DesktopSurface, ResizeOutcome, ResizeResult, SystemDesktop,
};
use crate::application::session::{
    AccessRights, ClientCommand, ClientSession, LayoutChangeReason, SessionCreateError,
    SessionError, SessionFactory,
};
use crate::application::socket::{SocketHandle, SocketId};
use crate::infrastructure::carrier::Inboxes;

const BPP: usize = 4;
const BAR_WIDTH: i32 = 64;
const BAR_STEP: i32 = 2;

// ── Desktop ───────────────────────────────────────────────────────────────────

struct Canvas {
    width: i32,
    height: i32,
    pixels: Mutex<Vec<u8>>,
}

/// Pixel buffer backed by the desktop's shared canvas. `grab` copies the
/// requested region out of the canvas into the local storage the
/// multiplexer reads.
struct SharedPixelBuffer {
    canvas: Arc<Canvas>,
    local: Vec<u8>,
}

impl SharedPixelBuffer {
    fn new(canvas: Arc<Canvas>) -> Self {
        let local = canvas.pixels.lock().unwrap().clone();
        Self { canvas, local }
    }
}

impl PixelBuffer for SharedPixelBuffer {
    fn width(&self) -> i32 {
        self.canvas.width
    }

    fn height(&self) -> i32 {
        self.canvas.height
    }

    fn stride(&self) -> usize {
        self.canvas.width as usize * BPP
    }

    fn data(&self) -> &[u8] {
        &self.local
    }

    fn grab(&mut self, region: &Region) {
        let stride = self.stride();
        let source = self.canvas.pixels.lock().unwrap();
        for rect in region.rects() {
            for y in rect.y1..rect.y2 {
                let start = y as usize * stride + rect.x1 as usize * BPP;
                let end = y as usize * stride + rect.x2 as usize * BPP;
                self.local[start..end].copy_from_slice(&source[start..end]);
            }
        }
    }
}

/// A desktop that renders a bar sweeping across a gradient background.
/// Each frame tick paints the next position and reports the damage through
/// the carrier's damage channel.
pub struct TestPatternDesktop {
    canvas: Arc<Canvas>,
    damage_tx: mpsc::UnboundedSender<Region>,
    bar_x: i32,
}

impl TestPatternDesktop {
    pub fn new(width: i32, height: i32, damage_tx: mpsc::UnboundedSender<Region>) -> Self {
        Self {
            canvas: Arc::new(Canvas {
                width,
                height,
                pixels: Mutex::new(vec![0; width as usize * height as usize * BPP]),
            }),
            damage_tx,
            bar_x: 0,
        }
    }

    fn paint_background(&self) {
        let mut pixels = self.canvas.pixels.lock().unwrap();
        for y in 0..self.canvas.height {
            for x in 0..self.canvas.width {
                let off = (y * self.canvas.width + x) as usize * BPP;
                pixels[off] = (x * 255 / self.canvas.width.max(1)) as u8;
                pixels[off + 1] = (y * 255 / self.canvas.height.max(1)) as u8;
                pixels[off + 2] = 64;
                pixels[off + 3] = 255;
            }
        }
    }

    /// Paints the bar at its next position and returns the damaged region
    /// (old position restored to the gradient, new position filled).
    fn paint_step(&mut self) -> Region {
        let old = Rect::xywh(self.bar_x, 0, BAR_WIDTH, self.canvas.height);
        self.bar_x = (self.bar_x + BAR_STEP) % (self.canvas.width - BAR_WIDTH).max(1);
        let new = Rect::xywh(self.bar_x, 0, BAR_WIDTH, self.canvas.height);

        {
            let mut pixels = self.canvas.pixels.lock().unwrap();
            for y in 0..self.canvas.height {
                // Restore the gradient under the old bar.
                for x in old.x1..old.x2.min(self.canvas.width) {
                    let off = (y * self.canvas.width + x) as usize * BPP;
                    pixels[off] = (x * 255 / self.canvas.width.max(1)) as u8;
                    pixels[off + 1] = (y * 255 / self.canvas.height.max(1)) as u8;
                    pixels[off + 2] = 64;
                }
                for x in new.x1..new.x2.min(self.canvas.width) {
                    let off = (y * self.canvas.width + x) as usize * BPP;
                    pixels[off] = 255;
                    pixels[off + 1] = 255;
                    pixels[off + 2] = 255;
                }
            }
        }

        Region::from(old).union_rect(new)
    }
}

impl SystemDesktop for TestPatternDesktop {
    fn start(&mut self) -> Result<DesktopSurface, DesktopError> {
        info!(
            "test pattern desktop starting at {}x{}",
            self.canvas.width, self.canvas.height
        );
        self.paint_background();
        let buffer = SharedPixelBuffer::new(self.canvas.clone());
        let _ = self.damage_tx.send(Region::from(buffer.rect()));
        Ok(DesktopSurface {
            buffer: Box::new(buffer),
            layout: None,
        })
    }

    fn stop(&mut self) {
        debug!("test pattern desktop stopping");
    }

    fn terminate(&mut self) {
        info!("terminate requested, exiting");
        std::process::exit(0);
    }

    fn key_event(&mut self, keysym: u32, _keycode: u32, down: bool) {
        debug!("key event: keysym={keysym:#06x} down={down}");
    }

    fn pointer_event(&mut self, pos: Point, button_mask: u16) {
        debug!("pointer event: ({}, {}) mask={button_mask:#04x}", pos.x, pos.y);
    }

    fn set_screen_layout(&mut self, width: i32, height: i32, layout: &ScreenSet) -> ResizeOutcome {
        // The canvas never reallocates; only same-size layout shuffles are
        // accepted.
        if (width, height) == (self.canvas.width, self.canvas.height) {
            ResizeOutcome::Accepted {
                buffer: None,
                layout: layout.clone(),
            }
        } else {
            ResizeOutcome::Rejected(ResizeResult::ResizeProhibited)
        }
    }

    fn handle_clipboard_request(&mut self) {
        debug!("clipboard requested; test pattern has none");
    }

    fn handle_clipboard_announce(&mut self, available: bool) {
        debug!("client clipboard available: {available}");
    }

    fn handle_clipboard_data(&mut self, data: &str) {
        debug!("client clipboard data: {} bytes", data.len());
    }

    fn query_connection(&mut self, _socket: SocketId, user_name: &str) {
        debug!("connection query for {user_name} (unused in the demo)");
    }

    fn frame_tick(&mut self, _msc: u64) {
        let damage = self.paint_step();
        let _ = self.damage_tx.send(damage);
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A stand-in viewer session. Treats the first bytes from the peer as a
/// completed handshake and counts the updates it is offered.
pub struct DemoSession {
    socket: Box<dyn SocketHandle>,
    inboxes: Inboxes,
    peer: SocketAddr,
    access: AccessRights,
    authenticated: bool,
    greeted: bool,
    closed: Option<String>,
    updates_written: u64,
}

impl ClientSession for DemoSession {
    fn socket_id(&self) -> SocketId {
        self.socket.id()
    }

    fn peer_address(&self) -> IpAddr {
        self.peer.ip()
    }

    fn peer_endpoint(&self) -> String {
        self.peer.to_string()
    }

    fn requires_query(&self) -> bool {
        self.socket.requires_query()
    }

    fn init(&mut self) -> Result<(), SessionError> {
        self.socket.write_all(b"RFB 003.008\n")?;
        self.socket.flush()?;
        Ok(())
    }

    fn close(&mut self, reason: &str) {
        if self.closed.is_none() {
            info!("closing demo session {}: {reason}", self.peer);
            self.closed = Some(reason.to_string());
            self.socket.shutdown();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn access_check(&self, rights: AccessRights) -> bool {
        self.access.contains(rights)
    }

    fn need_rendered_cursor(&self) -> bool {
        false
    }

    fn prefers_comparison(&self) -> bool {
        true
    }

    fn process_messages(&mut self) -> Result<Vec<ClientCommand>, SessionError> {
        let drained: Vec<u8> = {
            let mut inboxes = self.inboxes.lock().unwrap();
            match inboxes.get_mut(&self.socket.id()) {
                Some(inbox) => inbox.drain(..).collect(),
                None => Vec::new(),
            }
        };
        if drained.is_empty() || self.greeted {
            return Ok(Vec::new());
        }
        // Whatever the peer sent first counts as a finished handshake.
        self.greeted = true;
        Ok(vec![
            ClientCommand::QueryConnection {
                user_name: "(anonymous)".to_string(),
            },
            ClientCommand::ClientReady { shared: true },
        ])
    }

    fn flush_socket(&mut self) -> Result<(), SessionError> {
        self.socket.flush()?;
        Ok(())
    }

    fn approve_connection(&mut self, accept: bool, reason: Option<&str>) -> Result<(), SessionError> {
        if accept {
            self.authenticated = true;
            info!("demo session {} approved", self.peer);
        } else {
            self.close(reason.unwrap_or("connection refused"));
        }
        Ok(())
    }

    fn resize_result(&mut self, _result: ResizeResult) -> Result<(), SessionError> {
        Ok(())
    }

    fn pixel_buffer_change(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn screen_layout_change(&mut self, _reason: LayoutChangeReason) -> Result<(), SessionError> {
        Ok(())
    }

    fn rendered_cursor_change(&mut self) {}

    fn cursor_position_change(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn set_cursor(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn set_led_state(&mut self, _state: u8) -> Result<(), SessionError> {
        Ok(())
    }

    fn set_desktop_name(&mut self, _name: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn bell(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn announce_clipboard(&mut self, _available: bool) -> Result<(), SessionError> {
        Ok(())
    }

    fn request_clipboard(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn send_clipboard_data(&mut self, _data: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn add_changed(&mut self, _region: &Region) {}

    fn add_copied(&mut self, _region: &Region, _delta: Point) {}

    fn write_framebuffer_update(&mut self) -> Result<(), SessionError> {
        self.updates_written += 1;
        if self.updates_written % 60 == 0 {
            debug!(
                "demo session {} offered {} updates",
                self.peer, self.updates_written
            );
        }
        Ok(())
    }
}

/// Builds [`DemoSession`]s over the carrier's inboxes.
pub struct DemoSessionFactory {
    inboxes: Inboxes,
}

impl DemoSessionFactory {
    pub fn new(inboxes: Inboxes) -> Self {
        Self { inboxes }
    }
}

impl SessionFactory for DemoSessionFactory {
    fn create_session(
        &mut self,
        socket: Box<dyn SocketHandle>,
        _outgoing: bool,
        rights: AccessRights,
    ) -> Result<Box<dyn ClientSession>, SessionCreateError> {
        let peer: SocketAddr = match socket.peer_endpoint().parse() {
            Ok(peer) => peer,
            Err(e) => {
                return Err(SessionCreateError {
                    socket,
                    message: format!("unparseable peer endpoint: {e}"),
                })
            }
        };
        Ok(Box::new(DemoSession {
            socket,
            inboxes: self.inboxes.clone(),
            peer,
            access: rights,
            authenticated: false,
            greeted: false,
            closed: None,
            updates_written: 0,
        }))
    }
}
