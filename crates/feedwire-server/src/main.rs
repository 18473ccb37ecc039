//! # feedwire
//!
//! Server binary: loads settings, initializes logging and metrics, and
//! serves an engine carrying the reserved protocol routes until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use feedwire_core::logging::{init_json_subscriber, init_subscriber};
use feedwire_engine::Engine;
use feedwire_server::FeedwireServer;
use feedwire_server::metrics::install_recorder;
use feedwire_settings::{FeedwireSettings, load_settings, load_settings_from_path};

/// Real-time subscription and delivery server.
#[derive(Parser, Debug)]
#[command(name = "feedwire", about = "Real-time subscription and delivery server")]
struct Cli {
    /// Settings file (defaults to `~/.feedwire/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, `0` for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Do not install the Prometheus recorder.
    #[arg(long)]
    no_metrics: bool,
}

impl Cli {
    fn load(&self) -> Result<FeedwireSettings> {
        let mut settings = match &self.settings {
            Some(path) => load_settings_from_path(path),
            None => load_settings(),
        }
        .context("failed to load settings")?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load()?;

    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    let engine = Arc::new(Engine::new(settings.engine.clone()));
    let mut server = FeedwireServer::new(settings.server.clone(), engine);
    if !args.no_metrics {
        server = server.with_metrics(install_recorder()?);
    }

    let (addr, handle) = server.listen().await.context("failed to bind server")?;
    tracing::info!("feedwire listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    tracing::info!("shutdown complete");
    Ok(())
}
