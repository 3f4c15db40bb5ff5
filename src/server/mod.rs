// src/server/mod.rs

//! Broker startup: wires the shared state, spawns the background sweeper and
//! runs the HTTP surface until the shutdown signal.

use crate::config::Config;
use crate::core::state::BrokerState;
use crate::core::tasks::keep_alive::KeepAliveSweeperTask;
use anyhow::{Result, anyhow};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

mod routes;

pub use routes::router;

/// The main startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    let state = BrokerState::initialize(config).map_err(|e| anyhow!("{e}"))?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // The sweeper is wired to the service lifecycle rather than detached,
    // so restarts don't leak partial stops.
    let sweeper = KeepAliveSweeperTask::new(
        state.manager.clone(),
        Duration::from_secs(state.config.session.sweep_interval_secs),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    let app = routes::router(state.clone());
    let listener = TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
    info!(
        "Rendering resource broker listening on http://{}:{}{}",
        state.config.host, state.config.port, state.config.base_url_prefix
    );

    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received.");
            let _ = signal_tx.send(());
        })
        .await?;

    let _ = shutdown_tx.send(());
    let _ = sweeper_handle.await;
    info!("Broker shut down cleanly.");
    Ok(())
}
