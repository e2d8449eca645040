//! Infrastructure layer: everything that touches the outside world.
//!
//! Implements the application-layer traits over real transports and test
//! doubles. This layer may depend on `application` and `rfbmux_core`; the
//! application layer never imports from here.
//!
//! # Sub-modules
//!
//! - **`carrier`** – Tokio TCP carrier: accept loop, per-connection read
//!   pumps and write tasks, and the single core-loop task that owns the
//!   multiplexer.
//! - **`demo`** – Test-pattern desktop and stand-in sessions for the
//!   standalone binary.
//! - **`mock`** – Recording doubles shared by unit and integration tests.

pub mod carrier;
pub mod demo;
pub mod mock;
