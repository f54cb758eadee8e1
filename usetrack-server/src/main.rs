//! # Usetrack Server
//!
//! Runs one tracking pipeline with its background reporter and serves the web
//! reporter over HTTP.
//!
//! ## Design Principles
//!
//! 1. **Fail Fast**: Configuration is loaded and validated before anything
//!    starts.
//! 2. **Graceful Stop**: Ctrl-C stops the listener, then the reporter runs its
//!    final flush.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use usetrack_common::ConfigLoader;
use usetrack_server::{logging, routes};
use usetrack_tracker::Usetrack;

#[derive(Debug, Parser)]
#[command(name = "usetrack-server", about = "Usage tracking reporter")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `web.listen`.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Forces verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.file(path);
    }
    let (listen, verbose) = (args.listen, args.verbose);
    let config = loader
        .with_overrides(move |c| {
            if let Some(listen) = listen {
                c.web.listen = listen;
            }
            c.verbose |= verbose;
        })
        .load()
        .context("loading configuration")?;

    logging::init(config.verbose)?;
    let listen = config.web.listen;

    let usetrack = Arc::new(Usetrack::new(config).context("building tracking pipeline")?);
    usetrack.start()?;

    let (addr, server) = warp::serve(routes(usetrack.clone()))
        .try_bind_with_graceful_shutdown(listen, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .with_context(|| format!("binding {listen}"))?;

    info!(address = %addr, "web reporter listening");
    server.await;
    info!("shutting down");

    usetrack.shutdown().await;
    Ok(())
}
