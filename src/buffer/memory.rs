//! In-process buffer backend
//!
//! Each room keeps an arrival-ordered queue plus its byte size; a single
//! global byte total backs the process-wide quota. One mutex covers both.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{BufferQuotas, BufferStats, ExpirySweep};
use crate::current_timestamp;
use crate::protocol::{BufferedRecord, Payload};
use crate::server::connection_handler::ConnectionHandle;

#[derive(Debug, Default)]
struct RoomBuffer {
    entries: VecDeque<BufferedRecord>,
    bytes: usize,
}

#[derive(Debug, Default)]
struct MemoryInner {
    rooms: HashMap<String, RoomBuffer>,
    total_bytes: usize,
}

/// Volatile buffer store with per-room and global quotas
pub struct MemoryBuffer {
    inner: Mutex<MemoryInner>,
    quotas: BufferQuotas,
}

impl MemoryBuffer {
    pub fn new(quotas: BufferQuotas) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            quotas,
        }
    }

    /// Append a payload stamped with the current time
    pub async fn add(&self, room: &str, payload: Payload) -> bool {
        self.add_at(room, payload, current_timestamp()).await
    }

    /// Append a payload with an explicit arrival timestamp (ms).
    ///
    /// Quotas are checked in order: room bytes, room messages, global bytes,
    /// number of buffered rooms. Any breach discards the payload.
    pub async fn add_at(&self, room: &str, payload: Payload, timestamp: u64) -> bool {
        let len = payload.len();
        let mut inner = self.inner.lock().await;

        let (room_bytes, room_count) = inner
            .rooms
            .get(room)
            .map_or((0, 0), |b| (b.bytes, b.entries.len()));

        if room_bytes + len > self.quotas.max_room_bytes {
            warn!("Buffer for room {} over byte quota, dropping {} bytes", room, len);
            return false;
        }
        if room_count >= self.quotas.max_room_messages {
            warn!("Buffer for room {} over message quota, dropping payload", room);
            return false;
        }
        if inner.total_bytes + len > self.quotas.max_total_bytes {
            warn!("Global buffer quota reached, dropping payload for room {}", room);
            return false;
        }
        if !inner.rooms.contains_key(room) && inner.rooms.len() >= self.quotas.max_rooms {
            warn!("Buffered room limit reached, dropping payload for room {}", room);
            return false;
        }

        let buffer = inner.rooms.entry(room.to_string()).or_default();
        buffer.entries.push_back(BufferedRecord::new(payload, timestamp));
        buffer.bytes += len;
        inner.total_bytes += len;
        true
    }

    /// Deliver every buffered payload in arrival order and clear the room.
    ///
    /// Payloads are cleared even if the connection has closed in the meantime;
    /// the returned count is the number cleared.
    pub async fn flush(&self, room: &str, handle: &ConnectionHandle) -> usize {
        let buffer = {
            let mut inner = self.inner.lock().await;
            match inner.rooms.remove(room) {
                Some(buffer) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(buffer.bytes);
                    buffer
                }
                None => return 0,
            }
        };

        let count = buffer.entries.len();
        for record in buffer.entries {
            if handle.is_open() {
                handle.send(record.payload);
            }
        }

        debug!("Flushed {} buffered payloads for room {}", count, room);
        count
    }

    pub async fn has_pending(&self, room: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.rooms.get(room).is_some_and(|b| !b.entries.is_empty())
    }

    /// Drop payloads older than `max_age`
    pub async fn sweep_expired(&self, max_age: Duration) -> ExpirySweep {
        let cutoff = current_timestamp().saturating_sub(max_age.as_millis() as u64);
        self.sweep_before(cutoff).await
    }

    /// Drop payloads with a timestamp before `cutoff` (ms). Rooms left empty
    /// lose their buffer entirely and are reported back.
    pub async fn sweep_before(&self, cutoff: u64) -> ExpirySweep {
        let mut inner = self.inner.lock().await;
        let mut sweep = ExpirySweep::default();
        let mut freed = 0;

        inner.rooms.retain(|room, buffer| {
            let before = buffer.entries.len();
            buffer.entries.retain(|record| record.timestamp >= cutoff);
            let expired = before - buffer.entries.len();
            if expired > 0 {
                let bytes: usize = buffer.entries.iter().map(|r| r.payload.len()).sum();
                freed += buffer.bytes - bytes;
                buffer.bytes = bytes;
                sweep.removed += expired;
                debug!("Expired {} buffered payloads in room {}", expired, room);
            }
            if buffer.entries.is_empty() {
                sweep.emptied_rooms.push(room.clone());
                return false;
            }
            true
        });

        inner.total_bytes = inner.total_bytes.saturating_sub(freed);
        sweep
    }

    pub async fn stats(&self) -> BufferStats {
        let inner = self.inner.lock().await;
        BufferStats {
            rooms: inner.rooms.len(),
            messages: inner.rooms.values().map(|b| b.entries.len()).sum(),
            bytes: inner.total_bytes,
        }
    }

    /// Buffered `(bytes, messages)` for one room
    pub async fn room_usage(&self, room: &str) -> Option<(usize, usize)> {
        let inner = self.inner.lock().await;
        inner.rooms.get(room).map(|b| (b.bytes, b.entries.len()))
    }
}
