//! Redis-backed buffer backend
//!
//! Each room is a Redis list of encoded [`BufferedRecord`]s. Appends refresh
//! the key TTL and trim the list to the retention length in one MULTI/EXEC;
//! expiry is left to Redis, so this backend is never swept.

use std::time::Duration;

use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::error::{RelayError, Result};
use crate::protocol::{BufferedRecord, Payload};
use crate::server::connection_handler::ConnectionHandle;

/// Key prefix for buffered room lists
pub const KEY_PREFIX: &str = "relay:buffer:";

/// Durable buffer store on an external Redis
pub struct DurableBuffer {
    conn: MultiplexedConnection,
    ttl_secs: u64,
    max_room_messages: usize,
}

impl DurableBuffer {
    /// Connect and verify the server answers PING within `timeout`
    pub async fn connect(
        url: &str,
        timeout: Duration,
        ttl: Duration,
        max_room_messages: usize,
    ) -> Result<Self> {
        let client = redis::Client::open(url)?;

        let mut conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| RelayError::timeout(format!("Connecting to Redis at {}", url)))??;

        let _: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| RelayError::timeout(format!("PING to Redis at {}", url)))??;

        info!("Connected to Redis buffer backend at {}", url);
        Ok(Self {
            conn,
            ttl_secs: ttl.as_secs().max(1),
            max_room_messages,
        })
    }

    /// Redis key holding a room's buffer
    pub fn key(room: &str) -> String {
        format!("{}{}", KEY_PREFIX, room)
    }

    /// Append a payload; failures are logged and reported as `false`
    pub async fn add(&self, room: &str, payload: Payload) -> bool {
        match self.try_add(room, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to buffer payload for room {}: {}", room, e);
                false
            }
        }
    }

    async fn try_add(&self, room: &str, payload: Payload) -> Result<()> {
        let key = Self::key(room);
        let record = BufferedRecord::new(payload, current_timestamp()).encode_to_bytes();
        let keep = self.max_room_messages as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("RPUSH")
            .arg(&key)
            .arg(record.to_vec())
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(-keep)
            .arg(-1)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Read and delete the room's list, then deliver each record in order.
    /// Failures are logged and reported as zero delivered.
    pub async fn flush(&self, room: &str, handle: &ConnectionHandle) -> usize {
        let entries = match self.take_all(room).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read buffer for room {}: {}", room, e);
                return 0;
            }
        };

        let mut delivered = 0;
        for raw in entries {
            match BufferedRecord::decode_complete(&raw) {
                Ok(record) => {
                    if handle.is_open() {
                        handle.send(record.payload);
                    }
                    delivered += 1;
                }
                Err(e) => {
                    warn!("Skipping undecodable buffered record in room {}: {}", room, e);
                }
            }
        }

        debug!("Flushed {} buffered payloads for room {}", delivered, room);
        delivered
    }

    async fn take_all(&self, room: &str) -> Result<Vec<Bytes>> {
        let key = Self::key(room);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(&key)
            .ignore();

        let mut conn = self.conn.clone();
        let (entries,): (Vec<Vec<u8>>,) = pipe.query_async(&mut conn).await?;
        Ok(entries.into_iter().map(Bytes::from).collect())
    }

    pub async fn has_pending(&self, room: &str) -> bool {
        let mut conn = self.conn.clone();
        let len: redis::RedisResult<usize> = redis::cmd("LLEN")
            .arg(Self::key(room))
            .query_async(&mut conn)
            .await;
        match len {
            Ok(len) => len > 0,
            Err(e) => {
                warn!("Failed to check buffer for room {}: {}", room, e);
                false
            }
        }
    }
}
