//! rfbmux server — standalone entry point.
//!
//! Wires the session multiplexer to the tokio socket carrier with the demo
//! collaborators: a test-pattern desktop that keeps the frame clock busy
//! and stand-in sessions that accept anyone who talks to them. A real
//! deployment replaces those two with a platform desktop and an RFB
//! session implementation and keeps everything else.
//!
//! # Usage
//!
//! ```text
//! rfbmux-server [OPTIONS]
//!
//! Options:
//!   --config <FILE>  TOML configuration file (defaults apply when absent)
//!   --port <PORT>    Listen port, overriding the configuration
//! ```
//!
//! Logging goes through `tracing`; set `RUST_LOG` to adjust levels.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rfbmux_server::config;
use rfbmux_server::infrastructure::carrier;
use rfbmux_server::infrastructure::demo::{DemoSessionFactory, TestPatternDesktop};

/// Demo framebuffer size.
const WIDTH: i32 = 1024;
const HEIGHT: i32 = 768;

#[derive(Debug, Parser)]
#[command(name = "rfbmux-server", about = "Remote framebuffer session multiplexer")]
struct Args {
    /// TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen port, overriding the configuration file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging. Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut app_config = match &args.config {
        Some(path) => config::load(path)?,
        None => config::AppConfig::default(),
    };
    if let Some(port) = args.port {
        app_config.network.port = port;
    }

    info!(
        "rfbmux server starting (desktop \"{}\", {} Hz)",
        app_config.server.name, app_config.server.frame_rate
    );

    let inboxes = carrier::new_inboxes();
    let (damage_tx, damage_rx) = mpsc::unbounded_channel();
    let desktop = TestPatternDesktop::new(WIDTH, HEIGHT, damage_tx);
    let factory = DemoSessionFactory::new(inboxes.clone());
    let network = app_config.network.clone();

    carrier::run(
        &network,
        app_config.server,
        Box::new(desktop),
        Box::new(factory),
        inboxes,
        damage_rx,
    )
    .await?;

    info!("rfbmux server stopped");
    Ok(())
}
