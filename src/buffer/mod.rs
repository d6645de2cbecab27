//! Buffer store for payloads sent while a room has a single member
//!
//! Two interchangeable backends sit behind [`BufferStore`]: a volatile
//! in-process store with quotas and a sweep, and a durable Redis store that
//! relies on key TTLs. The backend is chosen once at startup.

pub mod durable;
pub mod memory;

pub use durable::DurableBuffer;
pub use memory::MemoryBuffer;

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::RelayConfig;
use crate::protocol::Payload;
use crate::server::connection_handler::ConnectionHandle;

/// Quotas enforced by the volatile backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferQuotas {
    pub max_room_bytes: usize,
    pub max_room_messages: usize,
    pub max_total_bytes: usize,
    pub max_rooms: usize,
}

impl BufferQuotas {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_room_bytes: config.buffer_max_room_bytes,
            max_room_messages: config.buffer_max_room_messages,
            max_total_bytes: config.buffer_max_total_bytes,
            max_rooms: config.buffer_max_rooms,
        }
    }
}

/// Buffer usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub rooms: usize,
    pub messages: usize,
    pub bytes: usize,
}

/// Outcome of an expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirySweep {
    /// Payloads dropped for age
    pub removed: usize,
    /// Rooms whose buffer the sweep emptied
    pub emptied_rooms: Vec<String>,
}

/// Buffer store backend
pub enum BufferStore {
    Memory(MemoryBuffer),
    Durable(DurableBuffer),
}

impl BufferStore {
    /// Volatile backend
    pub fn memory(quotas: BufferQuotas) -> Self {
        BufferStore::Memory(MemoryBuffer::new(quotas))
    }

    /// Pick the backend from configuration: Redis when a URL is configured
    /// and reachable, otherwise the volatile store.
    pub async fn from_config(config: &RelayConfig) -> Self {
        let quotas = BufferQuotas::from_config(config);

        let url = match config.redis_url.as_deref() {
            Some(url) => url,
            None => return Self::memory(quotas),
        };

        match DurableBuffer::connect(
            url,
            config.redis_connect_timeout(),
            config.buffer_max_age(),
            config.buffer_max_room_messages,
        )
        .await
        {
            Ok(durable) => BufferStore::Durable(durable),
            Err(e) => {
                warn!("Redis unavailable ({}), falling back to in-memory buffer", e);
                Self::memory(quotas)
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            BufferStore::Memory(_) => "memory",
            BufferStore::Durable(_) => "redis",
        }
    }

    /// Buffer a payload for a room; `false` if refused or failed
    pub async fn add(&self, room: &str, payload: Payload) -> bool {
        match self {
            BufferStore::Memory(store) => store.add(room, payload).await,
            BufferStore::Durable(store) => store.add(room, payload).await,
        }
    }

    /// Deliver and clear a room's buffer; returns the number flushed
    pub async fn flush(&self, room: &str, handle: &ConnectionHandle) -> usize {
        match self {
            BufferStore::Memory(store) => store.flush(room, handle).await,
            BufferStore::Durable(store) => store.flush(room, handle).await,
        }
    }

    pub async fn has_pending(&self, room: &str) -> bool {
        match self {
            BufferStore::Memory(store) => store.has_pending(room).await,
            BufferStore::Durable(store) => store.has_pending(room).await,
        }
    }

    /// Expire old payloads; the durable backend relies on key TTLs instead
    pub async fn sweep_expired(&self, max_age: Duration) -> ExpirySweep {
        match self {
            BufferStore::Memory(store) => store.sweep_expired(max_age).await,
            BufferStore::Durable(_) => ExpirySweep::default(),
        }
    }

    /// Usage stats, available for the volatile backend only
    pub async fn stats(&self) -> Option<BufferStats> {
        match self {
            BufferStore::Memory(store) => Some(store.stats().await),
            BufferStore::Durable(_) => None,
        }
    }
}
