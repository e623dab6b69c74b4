//! MJPEG gateway – turns multicast RTP video into an HTTP MJPEG stream.
//!
//! This binary:
//! 1. Reads configuration from `gateway.conf`
//! 2. Loads the pipeline table (built-in or `PIPELINES_FILE`)
//! 3. Runs an axum HTTP server; every `/mjpeg` request sniffs or recalls
//!    the payload type and relays a `gst-launch-1.0` pipeline's output.

mod process;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use mcast_mjpeg_common::detector::MulticastDetector;
use mcast_mjpeg_common::pipeline::{Boundary, PipelineTable};

use crate::session::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| mcast_mjpeg_common::config::Config::default_path().to_string());
    let config = mcast_mjpeg_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;
    let table = PipelineTable::from_config(&config).context("Pipeline table load failed")?;
    let boundary = Boundary::generate();

    info!(
        "MJPEG gateway starting (listen={}, gst={}, iface={})",
        config.listen_addr,
        config.gst_bin.display(),
        config.multicast_interface
    );
    info!(
        "Supported payload types: {:?} (multipart boundary={boundary})",
        table.supported().collect::<Vec<_>>()
    );

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── serve ────────────────────────────────────────────────────────
    let detector = Arc::new(MulticastDetector::new(config.multicast_interface));
    let gateway = Arc::new(Gateway::new(
        &config,
        detector,
        table,
        boundary,
        shutdown.clone(),
    ));

    server::run(gateway, &config.listen_addr, shutdown)
        .await
        .context("HTTP server error")?;

    info!("MJPEG gateway stopped");
    Ok(())
}
