//! WebSocket relay broker
//!
//! ## Layout
//!
//! - **Gatekeeper**: per-IP limit, then room checks, then join
//! - **Room manager**: live membership plus sticky async flag and token
//! - **Connection handler**: handshake, read loop, writer task
//! - **Relay**: fan-out to peers, or buffer when alone in an async room
//! - **Catch-up**: flush buffered payloads to a member after it settles
//! - **Relay server**: accept loop, periodic sweep, graceful shutdown

pub mod catch_up;
pub mod connection_handler;
pub mod gatekeeper;
pub mod rate_limiter;
pub mod relay;
pub mod relay_server;
pub mod room_manager;

pub use connection_handler::{ConnectionCommand, ConnectionHandle, ConnectionHandler};
pub use gatekeeper::{Admission, Gatekeeper, IpSlot};
pub use rate_limiter::RateLimiter;
pub use relay::RelayOutcome;
pub use relay_server::{RelayServer, ShutdownTrigger};
pub use room_manager::{RoomLimits, RoomManager, RoomMeta};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::RelayConfig;
use crate::buffer::{BufferQuotas, BufferStats, BufferStore};

/// State shared by every connection task
pub struct BrokerState {
    pub config: RelayConfig,
    pub gatekeeper: Gatekeeper,
    pub rooms: RoomManager,
    pub buffer: BufferStore,
}

impl BrokerState {
    pub fn new(config: RelayConfig, buffer: BufferStore) -> Self {
        let limits = RoomLimits {
            max_rooms: config.max_rooms,
            max_members_per_room: config.max_members_per_room,
        };
        Self {
            gatekeeper: Gatekeeper::new(config.max_connections_per_ip, limits),
            rooms: RoomManager::new(),
            buffer,
            config,
        }
    }

    /// State backed by the volatile buffer
    pub fn with_memory_buffer(config: RelayConfig) -> Self {
        let buffer = BufferStore::memory(BufferQuotas::from_config(&config));
        Self::new(config, buffer)
    }

    /// State with the buffer backend chosen from configuration
    pub async fn connect(config: RelayConfig) -> Self {
        let buffer = BufferStore::from_config(&config).await;
        Self::new(config, buffer)
    }

    pub fn room_limits(&self) -> RoomLimits {
        RoomLimits {
            max_rooms: self.config.max_rooms,
            max_members_per_room: self.config.max_members_per_room,
        }
    }

    /// Expire old buffered payloads. A room whose buffer the expiry emptied
    /// also loses its token and async flag, unless it has live members or
    /// was buffered into again since.
    pub async fn sweep(&self) -> SweepReport {
        let expiry = self.buffer.sweep_expired(self.config.buffer_max_age()).await;

        let mut forgotten = 0;
        for room in &expiry.emptied_rooms {
            if self.buffer.has_pending(room).await {
                continue;
            }
            if self.rooms.forget(room).await {
                debug!("Forgot expired room {}", room);
                forgotten += 1;
            }
        }

        SweepReport {
            expired: expiry.removed,
            forgotten,
        }
    }

    pub async fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.rooms.connection_count().await,
            live_rooms: self.rooms.live_room_count().await,
            dormant_rooms: self.rooms.dormant_rooms().await.len(),
            buffer_backend: self.buffer.backend_name(),
            buffer: self.buffer.stats().await,
            uptime_secs: self.rooms.uptime().as_secs(),
        }
    }
}

/// Result of one lifecycle sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Buffered payloads dropped for age
    pub expired: usize,
    /// Rooms whose metadata was dropped with their expired buffer
    pub forgotten: usize,
}

/// Broker statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStats {
    pub connections: usize,
    pub live_rooms: usize,
    pub dormant_rooms: usize,
    pub buffer_backend: &'static str,
    pub buffer: Option<BufferStats>,
    pub uptime_secs: u64,
}

/// Resolve once shutdown has been requested. Never resolves if the trigger
/// is dropped without firing.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
