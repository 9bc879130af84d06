// kubo-linux: hosts one node session, logs configured pubsub topics and exposes
// configured local services over p2p until Ctrl+C / SIGTERM.

mod config;

use std::sync::Arc;

use anyhow::Context;
use kubo_core::{Engine, NodeSession};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("kubo-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let session = NodeSession::open(engine()?, cfg.node_options())
        .context("failed to start node session")?;
    match session.peer_id() {
        Ok(Some(id)) => info!(peer_id = %id, repo = %session.repo_path().display(), "node online"),
        Ok(None) => info!(repo = %session.repo_path().display(), "node running offline"),
        Err(e) => warn!(error = %e, "could not resolve peer id"),
    }

    for topic in &cfg.topics {
        let sub = match session.pubsub().subscribe(topic) {
            Ok(sub) => sub,
            Err(e) => {
                error!(topic = %topic, error = %e, "subscribe failed");
                continue;
            }
        };
        let topic = topic.clone();
        sub.subscribe_callback(move |msg| info!(topic = %topic, "{}", msg))
            .context("failed to start subscription worker")?;
    }

    for l in &cfg.listeners {
        match session.p2p().open_listener(&l.name, l.port) {
            Ok(true) => info!(protocol = %l.name, port = l.port, "listener open"),
            Ok(false) => warn!(protocol = %l.name, port = l.port, "engine refused listener"),
            Err(e) => error!(protocol = %l.name, error = %e, "listener failed"),
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(shutdown_signal())?;

    info!("shutting down");
    if let Err(e) = session.p2p().close_all() {
        warn!(error = %e, "error closing p2p mappings");
    }
    session.close();
    Ok(())
}

#[cfg(feature = "libkubo")]
fn engine() -> anyhow::Result<Arc<dyn Engine>> {
    Ok(Arc::new(kubo_core::KuboLibrary::new()))
}

#[cfg(not(feature = "libkubo"))]
fn engine() -> anyhow::Result<Arc<dyn Engine>> {
    anyhow::bail!("kubo-linux was built without the `libkubo` feature; rebuild with --features libkubo")
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
