//! Relay server
//!
//! Accepts TCP connections and hands each one to its own task, runs the
//! periodic lifecycle sweep, and drives graceful shutdown: stop accepting,
//! close every live connection with a going-away code, then wait a bounded
//! grace period before aborting stragglers.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::RelayConfig;
use crate::error::Result;
use crate::protocol::CloseReason;
use crate::server::connection_handler::handle_connection;
use crate::server::{BrokerState, BrokerStats, shutdown_requested};

/// Back-off after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handle used to request a graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// WebSocket relay server
pub struct RelayServer {
    state: Arc<BrokerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RelayServer {
    /// Create a server, connecting the buffer backend chosen by `config`
    pub async fn new(config: RelayConfig) -> Self {
        Self::from_state(BrokerState::connect(config).await)
    }

    pub fn from_state(state: BrokerState) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Get the shared broker state
    pub fn state(&self) -> Arc<BrokerState> {
        Arc::clone(&self.state)
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub async fn stats(&self) -> BrokerStats {
        self.state.stats().await
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.state.config.bind_addr).await?)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown is triggered
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            "Relay listening on {} (buffer backend: {})",
            listener.local_addr()?,
            self.state.buffer.backend_name()
        );

        let mut shutdown = self.shutdown_tx.subscribe();
        let sweeper = tokio::spawn(run_sweeper(
            Arc::clone(&self.state),
            self.shutdown_tx.subscribe(),
        ));
        let mut connections = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                accepted = listener.accept() => accepted,
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted TCP connection from {}", peer);
                    let state = Arc::clone(&self.state);
                    let conn_shutdown = self.shutdown_tx.subscribe();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, state, conn_shutdown).await {
                            debug!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        drop(listener);
        sweeper.abort();

        let stats = self.state.stats().await;
        info!(
            "Final stats: {}",
            serde_json::to_string(&stats).unwrap_or_default()
        );

        let live = self.state.rooms.drain_all().await;
        info!("Shutting down, closing {} live connections", live.len());
        for handle in &live {
            handle.close(CloseReason::ServerShutdown);
        }

        let grace = self.state.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                connections.len(),
                grace
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        info!("Relay shut down");
        Ok(())
    }
}

async fn run_sweeper(state: Arc<BrokerState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.config.sweep_interval());
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }

        let report = state.sweep().await;
        if report.expired > 0 || report.forgotten > 0 {
            info!(
                "Sweep expired {} buffered payloads and forgot {} dormant rooms",
                report.expired, report.forgotten
            );
        }

        let stats = state.stats().await;
        debug!(
            "Broker stats: {}",
            serde_json::to_string(&stats).unwrap_or_default()
        );
    }
}
