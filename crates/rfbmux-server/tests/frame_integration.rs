//! Integration tests for the frame clock, update fan-out, shared input
//! arbitration, and resize handling.
//!
//! Timers are driven with the [`ManualClock`]: the tests advance time and
//! call `run_due_timers`, so nothing here sleeps. A 60 Hz configuration
//! gives a 16 ms frame interval with an 8 ms first tick (the half-frame
//! desynchronisation start).

use std::sync::Arc;
use std::time::Duration;

use rfbmux_core::{MemoryPixelBuffer, Point, Rect, Region, Screen, ScreenSet};
use rfbmux_server::infrastructure::mock::{
    DesktopCall, MockDesktop, MockSessionFactory, MockSessionHandle, MockSocket, SessionCall,
};
use rfbmux_server::{
    AccessRights, ClientCommand, ManualClock, Multiplexer, ResizeResult, ServerConfig, SocketId,
};

const FRAME: Duration = Duration::from_millis(16);

// ── Helpers ───────────────────────────────────────────────────────────────────

fn make_server(
    config: ServerConfig,
) -> (Multiplexer, MockSessionFactory, MockDesktop, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let factory = MockSessionFactory::new();
    let desktop = MockDesktop::new(1920, 1080);
    let mux = Multiplexer::new(
        config,
        Box::new(desktop.clone()),
        Box::new(factory.clone()),
        clock.clone(),
    );
    (mux, factory, desktop, clock)
}

/// Connects and authenticates one client; the first call also brings the
/// desktop (1920x1080) up.
fn connect_client(
    mux: &mut Multiplexer,
    factory: &MockSessionFactory,
    peer: &str,
) -> (SocketId, MockSessionHandle) {
    let socket = MockSocket::new(peer);
    let id = socket.id();
    mux.add_socket(Box::new(socket), false, AccessRights::DEFAULT);
    let handle = factory.session(factory.session_count() - 1);
    mux.query_connection(id, "tester");
    (id, handle)
}

/// Ticks the frame clock until it parks itself (or `limit` ticks pass).
fn drain_frame_clock(mux: &mut Multiplexer, clock: &ManualClock, limit: usize) {
    for _ in 0..limit {
        if !mux.frame_clock_running() {
            return;
        }
        clock.advance(FRAME);
        mux.run_due_timers();
    }
    panic!("frame clock still running after {limit} ticks");
}

fn two_screen_layout() -> ScreenSet {
    let mut layout = ScreenSet::new();
    layout.add_screen(Screen::new(1, Rect::xywh(0, 0, 960, 1080), 0));
    layout.add_screen(Screen::new(2, Rect::xywh(960, 0, 960, 1080), 0));
    layout
}

// ── Pointer arbitration ───────────────────────────────────────────────────────

/// While one client holds buttons down, another client's pointer events
/// are dropped; after the owner releases, the other client gets through.
#[test]
fn test_pointer_arbitration_drops_contender_while_owned() {
    let (mut mux, factory, desktop, clock) = make_server(ServerConfig::default());
    let (a, _ha) = connect_client(&mut mux, &factory, "192.0.2.1:41000");
    let (b, _hb) = connect_client(&mut mux, &factory, "192.0.2.2:41001");

    // A presses a button at t=0 and becomes the pointer owner.
    mux.pointer_event(a, Point::new(10, 10), 0b01);
    assert_eq!(mux.pointer_owner(), Some(a));

    // B tries at t=5s and is dropped.
    clock.advance(Duration::from_secs(5));
    mux.pointer_event(b, Point::new(50, 50), 0b01);
    let pointer_events: Vec<_> = desktop
        .calls()
        .into_iter()
        .filter(|c| matches!(c, DesktopCall::PointerEvent { .. }))
        .collect();
    assert_eq!(
        pointer_events,
        vec![DesktopCall::PointerEvent {
            pos: Point::new(10, 10),
            button_mask: 0b01
        }],
        "the desktop must only see A's event"
    );

    // A releases at t=6s, clearing ownership.
    clock.advance(Duration::from_secs(1));
    mux.pointer_event(a, Point::new(10, 10), 0);
    assert_eq!(mux.pointer_owner(), None);

    // B's retry at t=11s is accepted.
    clock.advance(Duration::from_secs(5));
    mux.pointer_event(b, Point::new(50, 50), 0b01);
    assert!(desktop.calls().contains(&DesktopCall::PointerEvent {
        pos: Point::new(50, 50),
        button_mask: 0b01
    }));
    assert_eq!(mux.pointer_owner(), Some(b));
}

/// A stale owner does not lock others out forever: after the 10 second
/// window the next client simply takes over.
#[test]
fn test_pointer_ownership_expires_after_ten_seconds() {
    let (mut mux, factory, desktop, clock) = make_server(ServerConfig::default());
    let (a, _ha) = connect_client(&mut mux, &factory, "192.0.2.3:41002");
    let (b, _hb) = connect_client(&mut mux, &factory, "192.0.2.4:41003");

    // A presses and then goes silent without releasing.
    mux.pointer_event(a, Point::new(0, 0), 0b01);

    clock.advance(Duration::from_secs(11));
    mux.pointer_event(b, Point::new(5, 5), 0b10);
    assert!(desktop.calls().contains(&DesktopCall::PointerEvent {
        pos: Point::new(5, 5),
        button_mask: 0b10
    }));
    assert_eq!(mux.pointer_owner(), Some(b));
}

/// Disabled pointer events never reach the desktop.
#[test]
fn test_pointer_events_can_be_disabled() {
    let mut config = ServerConfig::default();
    config.accept_pointer_events = false;
    let (mut mux, factory, desktop, _clock) = make_server(config);
    let (a, _ha) = connect_client(&mut mux, &factory, "192.0.2.5:41004");

    mux.pointer_event(a, Point::new(1, 1), 0b01);
    assert!(!desktop
        .calls()
        .iter()
        .any(|c| matches!(c, DesktopCall::PointerEvent { .. })));
}

// ── Key events ────────────────────────────────────────────────────────────────

/// Key events pass through the remap table before reaching the desktop.
#[test]
fn test_key_events_are_remapped() {
    let mut config = ServerConfig::default();
    config.key_remap = vec![rfbmux_server::KeyMapping {
        from: 0xffe3,
        to: 0xffe9,
    }];
    let (mut mux, factory, desktop, _clock) = make_server(config);
    let (_a, _ha) = connect_client(&mut mux, &factory, "192.0.2.6:41005");

    mux.key_event(0xffe3, 37, true);
    mux.key_event(0x61, 38, true);

    assert!(desktop.calls().contains(&DesktopCall::KeyEvent {
        keysym: 0xffe9,
        keycode: 37,
        down: true
    }));
    assert!(desktop.calls().contains(&DesktopCall::KeyEvent {
        keysym: 0x61,
        keycode: 38,
        down: true
    }));
}

/// Disabled key events never reach the desktop.
#[test]
fn test_key_events_can_be_disabled() {
    let mut config = ServerConfig::default();
    config.accept_key_events = false;
    let (mut mux, factory, desktop, _clock) = make_server(config);
    let (_a, _ha) = connect_client(&mut mux, &factory, "192.0.2.7:41006");

    mux.key_event(0x61, 38, true);
    assert!(!desktop
        .calls()
        .iter()
        .any(|c| matches!(c, DesktopCall::KeyEvent { .. })));
}

// ── Resize ────────────────────────────────────────────────────────────────────

/// With resizes disabled the request is refused before the desktop hears
/// about it, and no client is notified.
#[test]
fn test_resize_rejected_when_disabled() {
    let mut config = ServerConfig::default();
    config.accept_set_desktop_size = false;
    let (mut mux, factory, desktop, _clock) = make_server(config);
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.10:41010");
    let (b, _hb) = connect_client(&mut mux, &factory, "192.0.2.11:41011");

    let before = mux.screen_layout().clone();
    let result = mux.set_desktop_size(b, 800, 600, &ScreenSet::single(800, 600));

    assert_eq!(result, ResizeResult::ResizeProhibited);
    assert_eq!(mux.screen_layout(), &before);
    assert!(!desktop
        .calls()
        .iter()
        .any(|c| matches!(c, DesktopCall::SetScreenLayout { .. })));
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::ScreenLayoutChange(_))),
        0
    );
}

/// Oversized framebuffer requests are refused outright.
#[test]
fn test_resize_rejects_oversized_framebuffer() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (a, _ha) = connect_client(&mut mux, &factory, "192.0.2.12:41012");

    let result = mux.set_desktop_size(a, 20000, 600, &ScreenSet::single(20000, 600));
    assert_eq!(result, ResizeResult::ResizeProhibited);
}

/// A layout that does not fit the requested framebuffer is invalid and
/// never reaches the desktop.
#[test]
fn test_resize_rejects_invalid_layout() {
    let (mut mux, factory, desktop, _clock) = make_server(ServerConfig::default());
    let (a, _ha) = connect_client(&mut mux, &factory, "192.0.2.13:41013");

    // The single screen hangs out of the requested 800x600 framebuffer.
    let result = mux.set_desktop_size(a, 800, 600, &ScreenSet::single(1000, 600));
    assert_eq!(result, ResizeResult::InvalidLayout);
    assert!(!desktop
        .calls()
        .iter()
        .any(|c| matches!(c, DesktopCall::SetScreenLayout { .. })));
}

/// A rejection from the desktop is forwarded to the requester verbatim,
/// and nobody is notified of a layout change.
#[test]
fn test_resize_desktop_rejection_is_forwarded() {
    let (mut mux, factory, desktop, _clock) = make_server(ServerConfig::default());
    let (a, ha) = connect_client(&mut mux, &factory, "192.0.2.19:41019");
    desktop.set_resize_rejection(ResizeResult::OutOfResources);

    let result = mux.set_desktop_size(a, 1920, 1080, &ScreenSet::single(1920, 1080));

    assert_eq!(result, ResizeResult::OutOfResources);
    assert!(desktop
        .calls()
        .iter()
        .any(|c| matches!(c, DesktopCall::SetScreenLayout { .. })));
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::ScreenLayoutChange(_))),
        0
    );
}

/// Commands a session decodes are dispatched through the policy methods,
/// and a resize requester gets its result code back through the session.
#[test]
fn test_decoded_commands_are_dispatched() {
    let (mut mux, factory, desktop, _clock) = make_server(ServerConfig::default());
    let (a, ha) = connect_client(&mut mux, &factory, "192.0.2.23:41023");

    ha.queue_commands(vec![
        ClientCommand::PointerEvent {
            pos: Point::new(7, 9),
            button_mask: 0,
        },
        ClientCommand::SetDesktopSize {
            width: 1920,
            height: 1080,
            layout: ScreenSet::single(1920, 1080),
        },
    ]);
    mux.process_socket_read_event(a).unwrap();

    assert!(desktop.calls().contains(&DesktopCall::PointerEvent {
        pos: Point::new(7, 9),
        button_mask: 0
    }));
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::ResizeResult(ResizeResult::Success))),
        1
    );
}

/// A successful resize installs the new layout and notifies every client
/// except the requester, with the other-client reason.
#[test]
fn test_resize_notifies_other_clients_only() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.14:41014");
    let (b, hb) = connect_client(&mut mux, &factory, "192.0.2.15:41015");
    let (_c, hc) = connect_client(&mut mux, &factory, "192.0.2.16:41016");

    let layout = two_screen_layout();
    let result = mux.set_desktop_size(b, 1920, 1080, &layout);

    assert_eq!(result, ResizeResult::Success);
    assert_eq!(mux.screen_layout(), &layout);
    for other in [&ha, &hc] {
        assert_eq!(
            other.count_calls(|c| matches!(
                c,
                SessionCall::ScreenLayoutChange(
                    rfbmux_server::LayoutChangeReason::OtherClient
                )
            )),
            1
        );
    }
    assert_eq!(
        hb.count_calls(|c| matches!(c, SessionCall::ScreenLayoutChange(_))),
        0,
        "the requester gets the result code, not a layout notification"
    );
}

/// A desktop-driven layout change notifies every client with the server
/// reason.
#[test]
fn test_server_layout_change_notifies_everyone() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.17:41017");
    let (_b, hb) = connect_client(&mut mux, &factory, "192.0.2.18:41018");

    mux.set_screen_layout(two_screen_layout()).unwrap();

    for handle in [&ha, &hb] {
        assert_eq!(
            handle.count_calls(|c| matches!(
                c,
                SessionCall::ScreenLayoutChange(rfbmux_server::LayoutChangeReason::Server)
            )),
            1
        );
    }
}

// ── Pixel buffer installation ─────────────────────────────────────────────────

/// Bringing the desktop up marks the whole framebuffer changed and pushes
/// a full update to the client immediately.
#[test]
fn test_desktop_start_sends_full_framebuffer() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.20:41020");

    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::PixelBufferChange)),
        1
    );
    let full = Region::from(Rect::xywh(0, 0, 1920, 1080));
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::AddChanged(r) if *r == full)),
        1
    );
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::WriteFramebufferUpdate)),
        1
    );
}

/// Replacing the pixel buffer drops screens that fall entirely outside
/// the new framebuffer and synthesises a single full-screen monitor when
/// none survive.
#[test]
fn test_replace_pixel_buffer_synthesizes_screen_when_all_drop() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, _ha) = connect_client(&mut mux, &factory, "192.0.2.21:41021");

    // One screen tucked into the far right edge of the 1920-wide buffer.
    let mut layout = ScreenSet::new();
    layout.add_screen(Screen::new(7, Rect::xywh(1900, 0, 20, 1080), 0));
    mux.set_screen_layout(layout).unwrap();

    // The new buffer is too small for that screen to survive.
    mux.replace_pixel_buffer(Box::new(MemoryPixelBuffer::new(1000, 800)))
        .unwrap();

    assert_eq!(mux.screen_layout(), &ScreenSet::single(1000, 800));
}

/// A screen straddling the new framebuffer edge is clipped, not dropped,
/// and keeps its identity.
#[test]
fn test_replace_pixel_buffer_clips_straddling_screen() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, _ha) = connect_client(&mut mux, &factory, "192.0.2.22:41022");

    let mut layout = ScreenSet::new();
    layout.add_screen(Screen::new(3, Rect::xywh(500, 0, 1000, 1080), 0));
    mux.set_screen_layout(layout).unwrap();

    mux.replace_pixel_buffer(Box::new(MemoryPixelBuffer::new(1000, 1000)))
        .unwrap();

    let screens: Vec<_> = mux.screen_layout().screens().copied().collect();
    assert_eq!(screens.len(), 1);
    assert_eq!(screens[0].id, 3);
    assert_eq!(screens[0].rect, Rect::new(500, 0, 1000, 1000));
}

// ── Frame clock ───────────────────────────────────────────────────────────────

/// Damage reported while no pixel buffer exists is ignored and the frame
/// clock stays parked.
#[test]
fn test_frame_clock_stays_parked_without_desktop() {
    let (mut mux, _factory, _desktop, _clock) = make_server(ServerConfig::default());
    mux.add_changed(&Region::from(Rect::xywh(0, 0, 100, 100)));
    assert!(!mux.frame_clock_running());
}

/// With an empty comparer but a queued frame target, the clock keeps
/// ticking (without writing updates) until the counter passes the target,
/// then parks itself.
#[test]
fn test_frame_clock_runs_until_queued_msc_reached() {
    let (mut mux, factory, desktop, clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.30:41030");

    // Let the connection-time update drain and the clock park.
    drain_frame_clock(&mut mux, &clock, 10);
    let writes_before = ha.count_calls(|c| matches!(c, SessionCall::WriteFramebufferUpdate));
    let msc_before = mux.get_msc();

    mux.queue_msc(msc_before + 5);
    assert!(mux.frame_clock_running());
    drain_frame_clock(&mut mux, &clock, 20);

    assert!(mux.get_msc() >= msc_before + 5);
    // The desktop saw every tick.
    assert!(desktop
        .calls()
        .iter()
        .any(|c| matches!(c, DesktopCall::FrameTick(n) if *n >= msc_before + 5)));
    // No updates were written along the way; there was no damage.
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::WriteFramebufferUpdate)),
        writes_before
    );
}

/// New damage wakes the clock, the next tick writes the update, and a
/// tick later the clock parks again.
#[test]
fn test_damage_wakes_frame_clock_and_fans_out() {
    let (mut mux, factory, _desktop, clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.31:41031");
    drain_frame_clock(&mut mux, &clock, 10);

    let writes_before = ha.count_calls(|c| matches!(c, SessionCall::WriteFramebufferUpdate));
    mux.add_changed(&Region::from(Rect::xywh(10, 10, 50, 50)));
    assert!(mux.frame_clock_running());

    drain_frame_clock(&mut mux, &clock, 10);
    assert!(
        ha.count_calls(|c| matches!(c, SessionCall::WriteFramebufferUpdate)) > writes_before
    );
}

/// Blocking updates freezes the frame clock even when damage arrives;
/// unblocking restarts it.
#[test]
fn test_block_updates_freezes_frame_clock() {
    let (mut mux, factory, _desktop, clock) = make_server(ServerConfig::default());
    let (_a, _ha) = connect_client(&mut mux, &factory, "192.0.2.32:41032");
    drain_frame_clock(&mut mux, &clock, 10);

    mux.block_updates();
    mux.add_changed(&Region::from(Rect::xywh(0, 0, 10, 10)));
    assert!(!mux.frame_clock_running());

    mux.unblock_updates();
    assert!(mux.frame_clock_running());
}

// ── Cursor, LEDs, bell, name ──────────────────────────────────────────────────

/// A new cursor image reaches every client along with a rendered-cursor
/// invalidation.
#[test]
fn test_set_cursor_fans_out() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.40:41040");

    let data = vec![255u8; 8 * 8 * 4];
    mux.set_cursor(8, 8, Point::new(0, 0), &data);

    assert_eq!(ha.count_calls(|c| matches!(c, SessionCall::SetCursor)), 1);
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::RenderedCursorChange)),
        1
    );
}

/// Warped cursor moves notify clients of the new position; organic moves
/// only invalidate the rendered cursor. A move to the same position does
/// nothing.
#[test]
fn test_cursor_position_change_depends_on_warp() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.41:41041");

    mux.set_cursor_pos(Point::new(100, 100), false);
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::CursorPositionChange)),
        0
    );
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::RenderedCursorChange)),
        1
    );

    mux.set_cursor_pos(Point::new(200, 200), true);
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::CursorPositionChange)),
        1
    );

    // Same position again: no traffic at all.
    mux.set_cursor_pos(Point::new(200, 200), true);
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::CursorPositionChange)),
        1
    );
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::RenderedCursorChange)),
        2
    );
}

/// The rendered cursor patch is composited at the cursor position,
/// clipped to the framebuffer.
#[test]
fn test_rendered_cursor_composites_at_position() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, _ha) = connect_client(&mut mux, &factory, "192.0.2.42:41042");

    let data = vec![255u8; 8 * 8 * 4];
    mux.set_cursor(8, 8, Point::new(0, 0), &data);
    mux.set_cursor_pos(Point::new(100, 100), false);

    let rendered = mux.rendered_cursor();
    assert_eq!(rendered.rect(), Rect::xywh(100, 100, 8, 8));
    assert_eq!(rendered.data().len(), 8 * 8 * 4);
}

/// LED updates are deduplicated against the cached state.
#[test]
fn test_led_state_is_deduplicated() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.43:41043");

    mux.set_led_state(rfbmux_server::application::session::LED_CAPS_LOCK);
    mux.set_led_state(rfbmux_server::application::session::LED_CAPS_LOCK);
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::SetLedState(_))),
        1
    );

    mux.set_led_state(0);
    assert_eq!(
        ha.count_calls(|c| matches!(c, SessionCall::SetLedState(_))),
        2
    );
}

/// Bell and desktop rename reach every connected client.
#[test]
fn test_bell_and_rename_fan_out() {
    let (mut mux, factory, _desktop, _clock) = make_server(ServerConfig::default());
    let (_a, ha) = connect_client(&mut mux, &factory, "192.0.2.44:41044");
    let (_b, hb) = connect_client(&mut mux, &factory, "192.0.2.45:41045");

    mux.bell();
    mux.set_name("busy desktop");

    for handle in [&ha, &hb] {
        assert_eq!(handle.count_calls(|c| matches!(c, SessionCall::Bell)), 1);
        assert_eq!(
            handle.count_calls(
                |c| matches!(c, SessionCall::SetDesktopName(n) if n == "busy desktop")
            ),
            1
        );
    }
    assert_eq!(mux.name(), "busy desktop");
}
