//! One-shot timers and the clock they read.
//!
//! The multiplexer owns four timers (idle, disconnect, connect, frame) and
//! never sleeps itself: the embedding event loop asks for the earliest
//! deadline, waits, and calls back in. Time is read through the [`Clock`]
//! trait so tests can drive the 10-second pointer window and the frame
//! clock without real waiting.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of the current instant. Injected at construction; production code
/// uses [`SystemClock`], tests use [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. Test double, shipped here so
/// integration tests and the unit tests share it.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Moves the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        *self.now.lock().unwrap() += d;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

/// Identifies which of the multiplexer's timers fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerId {
    Idle,
    Disconnect,
    Connect,
    Frame,
}

/// A one-shot deadline. `start` arms it, `stop` cancels any pending fire,
/// and [`Timer::take_if_due`] consumes a fire exactly once. Re-arming from
/// the fire handler turns it into a repeating timer.
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer to fire `timeout` from `now`, replacing any pending
    /// deadline.
    pub fn start(&mut self, now: Instant, timeout: Duration) {
        self.deadline = Some(now + timeout);
    }

    /// Cancels the pending fire, if any. A stopped timer never fires late.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_started(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; zero when overdue, `None` when the
    /// timer is stopped.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// Consumes a due deadline. Returns `true` exactly once per fire; the
    /// handler may re-arm with [`Timer::start`].
    pub fn take_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if d <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
