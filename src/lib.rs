//! WebSocket room relay with offline catch-up buffering
//!
//! This library provides a broker that multiplexes WebSocket connections into
//! named rooms, relays opaque payloads between the live members of a room, and
//! buffers payloads sent by a lone member so that a peer joining later can
//! catch up.

pub mod buffer;
pub mod error;
pub mod protocol;
pub mod server;

pub use buffer::BufferStore;
pub use error::{RelayError, Result};
pub use server::{BrokerState, BrokerStats, RelayServer, ShutdownTrigger};

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::record::MAX_RECORD_PAYLOAD;

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Relay broker configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Server listen address
    pub bind_addr: SocketAddr,
    /// Redis connection string for the durable buffer backend
    pub redis_url: Option<String>,
    /// How long to wait for Redis at startup before falling back to memory
    pub redis_connect_timeout_ms: u64,

    /// Maximum live connections from one IP
    pub max_connections_per_ip: usize,
    /// Maximum number of live rooms
    pub max_rooms: usize,
    /// Maximum live members in one room
    pub max_members_per_room: usize,
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,

    /// Rate limit window length
    pub rate_limit_window_ms: u64,
    /// Messages allowed per rate limit window
    pub rate_limit_max_messages: u32,

    /// Per-room buffered byte quota
    pub buffer_max_room_bytes: usize,
    /// Per-room buffered message quota (also the Redis trim length)
    pub buffer_max_room_messages: usize,
    /// Global buffered byte quota
    pub buffer_max_total_bytes: usize,
    /// Maximum number of rooms holding buffers at once
    pub buffer_max_rooms: usize,
    /// Age after which buffered payloads expire (also the Redis key TTL)
    pub buffer_max_age_secs: u64,

    /// Delay between join and catch-up delivery
    pub settle_delay_ms: u64,
    /// Interval of the expiry sweep
    pub sweep_interval_secs: u64,
    /// Upper bound on waiting for connections to close during shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            redis_url: None,
            redis_connect_timeout_ms: 3_000,
            max_connections_per_ip: 10,
            max_rooms: 1_000,
            max_members_per_room: 50,
            max_message_size: 1024 * 1024, // 1MB
            rate_limit_window_ms: 1_000,
            rate_limit_max_messages: 100,
            buffer_max_room_bytes: 5 * 1024 * 1024,
            buffer_max_room_messages: 1_000,
            buffer_max_total_bytes: 100 * 1024 * 1024,
            buffer_max_rooms: 1_000,
            buffer_max_age_secs: 24 * 60 * 60,
            settle_delay_ms: 1_000,
            sweep_interval_secs: 60,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl RelayConfig {
    /// Load a configuration from a JSON file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: RelayConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Apply `RELAY_PORT` / `PORT` and `REDIS_URL` from the environment
    pub fn apply_env(&mut self) -> Result<()> {
        let port = std::env::var("RELAY_PORT").or_else(|_| std::env::var("PORT"));
        if let Ok(port) = port {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| RelayError::config(format!("Invalid port: {}", port)))?;
            self.bind_addr.set_port(port);
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            let url = url.trim();
            self.redis_url = if url.is_empty() {
                None
            } else {
                Some(url.to_string())
            };
        }

        Ok(())
    }

    /// Reject limits that would make the broker unusable
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.max_connections_per_ip == 0, "max_connections_per_ip"),
            (self.max_rooms == 0, "max_rooms"),
            (self.max_members_per_room == 0, "max_members_per_room"),
            (self.max_message_size == 0, "max_message_size"),
            (self.rate_limit_window_ms == 0, "rate_limit_window_ms"),
            (self.rate_limit_max_messages == 0, "rate_limit_max_messages"),
            (self.buffer_max_room_messages == 0, "buffer_max_room_messages"),
            (self.buffer_max_age_secs == 0, "buffer_max_age_secs"),
            (self.sweep_interval_secs == 0, "sweep_interval_secs"),
        ];

        for (is_zero, name) in checks {
            if is_zero {
                return Err(RelayError::config(format!("{} must be greater than zero", name)));
            }
        }

        if self.max_message_size > MAX_RECORD_PAYLOAD {
            return Err(RelayError::config(format!(
                "max_message_size must not exceed {} bytes",
                MAX_RECORD_PAYLOAD
            )));
        }

        Ok(())
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn buffer_max_age(&self) -> Duration {
        Duration::from_secs(self.buffer_max_age_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn redis_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_connect_timeout_ms)
    }
}
