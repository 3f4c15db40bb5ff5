// src/core/tasks/keep_alive.rs

//! The keep-alive sweeper: a background task that expires idle sessions and
//! drives their teardown against whichever backend owns each session.

use crate::core::session::manager::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// The background task struct for the keep-alive sweeper.
pub struct KeepAliveSweeperTask {
    manager: Arc<SessionManager>,
    interval: Duration,
}

impl KeepAliveSweeperTask {
    /// Creates a new `KeepAliveSweeperTask` ticking at `interval`.
    pub fn new(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// The main run loop. Each tick scans for expired sessions and tears
    /// them down; the loop exits on the shutdown signal so restarts don't
    /// leak partial stops.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Keep-alive sweeper started.");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Keep-alive sweeper shutting down.");
                    return;
                }
            }
        }
    }

    /// Performs one sweep cycle. Returns the number of sessions reaped.
    pub async fn sweep_once(&self) -> usize {
        debug!("Checking for inactive sessions");
        let reaped = self.manager.reap_expired().await;
        if reaped > 0 {
            info!("Reaped {reaped} expired session(s)");
        }
        reaped
    }
}
