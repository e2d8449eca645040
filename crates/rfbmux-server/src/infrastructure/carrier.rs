//! Tokio socket carrier: owns the transports, feeds the multiplexer.
//!
//! The multiplexer is strictly single-threaded, so the carrier funnels
//! everything through one event loop task that owns it:
//!
//! 1. An accept task takes incoming TCP connections and splits each into a
//!    read pump and a write task.
//! 2. Read pumps forward received bytes as events; the core loop stashes
//!    them in the per-socket inbox and tells the multiplexer the socket is
//!    readable.
//! 3. Sessions write through a [`SocketHandle`] that enqueues onto the
//!    connection's write task, so a write never blocks the core.
//! 4. Between events the loop sleeps until the multiplexer's earliest
//!    timer deadline and fires due timers on wake-up.
//!
//! Because every multiplexer callback happens on this one task, callbacks
//! run strictly one at a time and each runs to completion, which is
//! exactly the concurrency model the multiplexer is built for.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use rfbmux_core::Region;

use crate::application::desktop::SystemDesktop;
use crate::application::multiplexer::Multiplexer;
use crate::application::session::{AccessRights, SessionFactory};
use crate::application::socket::{SocketError, SocketHandle, SocketId};
use crate::application::timer::SystemClock;
use crate::config::{NetworkConfig, ServerConfig};

/// Bytes received per socket, waiting for the owning session to parse
/// them. Filled by the read pumps, drained by the sessions the factory
/// builds (which is why it is shared with the factory).
pub type Inboxes = Arc<Mutex<HashMap<SocketId, VecDeque<u8>>>>;

pub fn new_inboxes() -> Inboxes {
    Arc::new(Mutex::new(HashMap::new()))
}

enum CarrierEvent {
    Accepted(TcpSocketHandle),
    Readable(SocketId, Vec<u8>),
    Closed(SocketId),
    Shutdown,
}

enum WriteCommand {
    Data(Vec<u8>),
    Shutdown,
}

/// Write side of one TCP connection, as seen by the multiplexer and its
/// sessions. Writes are queued to the connection's write task.
struct TcpSocketHandle {
    id: SocketId,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl SocketHandle for TcpSocketHandle {
    fn id(&self) -> SocketId {
        self.id
    }

    fn peer_address(&self) -> IpAddr {
        self.peer.ip()
    }

    fn peer_endpoint(&self) -> String {
        self.peer.to_string()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SocketError> {
        self.tx
            .send(WriteCommand::Data(bytes.to_vec()))
            .map_err(|_| SocketError::Closed)
    }

    fn flush(&mut self) -> Result<(), SocketError> {
        // The write task flushes as it drains; nothing is held back here.
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
    }
}

/// Runs the carrier until a shutdown signal arrives or the listener dies.
///
/// # Errors
///
/// Returns an error when the TCP listener cannot be bound.
pub async fn run(
    network: &NetworkConfig,
    server_config: ServerConfig,
    desktop: Box<dyn SystemDesktop>,
    factory: Box<dyn SessionFactory>,
    inboxes: Inboxes,
    mut damage_rx: mpsc::UnboundedReceiver<Region>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", network.bind_address, network.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    info!("listening on {addr}");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    // ── Accept task ───────────────────────────────────────────────────────────
    let accept_tx = event_tx.clone();
    let accept_inboxes = inboxes.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    spawn_connection(stream, peer, accept_tx.clone(), accept_inboxes.clone());
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
    });

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(CarrierEvent::Shutdown);
        }
    });

    // ── Core loop ─────────────────────────────────────────────────────────────
    let mut mux = Multiplexer::new(
        server_config,
        desktop,
        factory,
        Arc::new(SystemClock),
    );
    let mut damage_open = true;

    loop {
        let deadline = mux.next_deadline();
        tokio::select! {
            maybe_event = event_rx.recv() => {
                let Some(event) = maybe_event else { break };
                if !handle_event(&mut mux, &inboxes, event) {
                    break;
                }
            }
            maybe_damage = damage_rx.recv(), if damage_open => {
                match maybe_damage {
                    Some(region) => mux.add_changed(&region),
                    None => damage_open = false,
                }
            }
            _ = wait_until(deadline) => {
                mux.run_due_timers();
                trace!("next update write due in {:?}", mux.ms_to_next_update());
            }
        }
    }

    mux.close_clients("Server shutdown", None);
    Ok(())
}

/// Applies one carrier event to the multiplexer. Returns `false` on
/// shutdown.
fn handle_event(mux: &mut Multiplexer, inboxes: &Inboxes, event: CarrierEvent) -> bool {
    match event {
        CarrierEvent::Accepted(handle) => {
            mux.add_socket(Box::new(handle), false, AccessRights::DEFAULT);
        }
        CarrierEvent::Readable(id, bytes) => {
            if let Some(inbox) = inboxes.lock().unwrap().get_mut(&id) {
                inbox.extend(bytes);
            }
            // Sockets parked for closing get no read events.
            if mux.connection(id).is_some() {
                if let Err(e) = mux.process_socket_read_event(id) {
                    debug!("dropping read event: {e}");
                }
            }
        }
        CarrierEvent::Closed(id) => {
            inboxes.lock().unwrap().remove(&id);
            mux.remove_socket(id);
        }
        CarrierEvent::Shutdown => return false,
    }
    true
}

/// Splits an accepted connection into its read pump and write task and
/// announces it to the core loop.
fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<CarrierEvent>,
    inboxes: Inboxes,
) {
    let id = Uuid::new_v4();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {peer}: {e}");
    }
    let (mut read_half, mut write_half) = stream.into_split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel();

    inboxes.lock().unwrap().insert(id, VecDeque::new());

    // Write task: drains queued data, closes on shutdown request.
    tokio::spawn(async move {
        while let Some(command) = write_rx.recv().await {
            match command {
                WriteCommand::Data(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                WriteCommand::Shutdown => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    });

    // Read pump: forwards received bytes, reports the close exactly once.
    let reader_events = events.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if reader_events
                        .send(CarrierEvent::Readable(id, buf[..n].to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let _ = reader_events.send(CarrierEvent::Closed(id));
    });

    let _ = events.send(CarrierEvent::Accepted(TcpSocketHandle {
        id,
        peer,
        tx: write_tx,
    }));
}

async fn wait_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending::<()>().await,
    }
}
