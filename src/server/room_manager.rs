//! Room registry for the relay broker
//!
//! This module tracks live room membership plus the per-room metadata (async
//! flag and access token) that outlives membership gaps until the lifecycle
//! sweep prunes it.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::request::is_valid_room_id;
use crate::protocol::{CloseReason, JoinRequest};
use crate::server::connection_handler::ConnectionHandle;

/// Capacity limits checked while admitting a joiner
#[derive(Debug, Clone, Copy)]
pub struct RoomLimits {
    /// Maximum number of live rooms
    pub max_rooms: usize,
    /// Maximum live members per room
    pub max_members_per_room: usize,
}

/// Metadata retained for a room across zero-member gaps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomMeta {
    /// Sticky once set
    pub async_enabled: bool,
    /// First token-bearing joiner's token
    pub token: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    /// Live members by room
    live: HashMap<String, HashMap<Uuid, ConnectionHandle>>,
    /// Async flag and token by room
    meta: HashMap<String, RoomMeta>,
}

/// Room registry mapping room identifiers to live connections
pub struct RoomManager {
    inner: RwLock<RegistryInner>,
    created_at: Instant,
}

impl RoomManager {
    /// Create a new room registry
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            created_at: Instant::now(),
        }
    }

    /// Run the room-level admission checks and join in one critical section.
    ///
    /// Checks, in order: live room capacity, room id, token, member capacity.
    /// On success the token (if the room had none) and the async flag are
    /// recorded and the live member count is returned.
    pub async fn try_join(
        &self,
        request: &JoinRequest,
        handle: ConnectionHandle,
        limits: RoomLimits,
    ) -> Result<usize, CloseReason> {
        let mut inner = self.inner.write().await;

        let is_live = inner.live.contains_key(&request.room);
        if inner.live.len() >= limits.max_rooms && !is_live {
            return Err(CloseReason::ServerAtCapacity);
        }

        if !is_valid_room_id(&request.room) {
            return Err(CloseReason::InvalidRoomId);
        }

        let stored_token = inner
            .meta
            .get(&request.room)
            .and_then(|meta| meta.token.as_deref());
        if let Some(stored) = stored_token {
            if request.token.as_deref() != Some(stored) {
                return Err(CloseReason::InvalidToken);
            }
        }

        let members = inner.live.get(&request.room).map_or(0, |m| m.len());
        if members >= limits.max_members_per_room {
            return Err(CloseReason::RoomFull);
        }

        if request.async_mode || request.token.is_some() {
            let meta = inner.meta.entry(request.room.clone()).or_default();
            if meta.token.is_none() {
                meta.token = request.token.clone();
            }
            if request.async_mode {
                meta.async_enabled = true;
            }
        }

        let room = inner.live.entry(request.room.clone()).or_default();
        room.insert(handle.id(), handle);
        Ok(room.len())
    }

    /// Add a connection to a room without admission checks
    pub async fn join(&self, room: &str, handle: ConnectionHandle) -> usize {
        let mut inner = self.inner.write().await;
        let members = inner.live.entry(room.to_string()).or_default();
        members.insert(handle.id(), handle);
        members.len()
    }

    /// Remove a connection from a room, returning the remaining member count.
    /// An emptied room leaves the live index; its metadata stays.
    pub async fn leave(&self, room: &str, conn_id: Uuid) -> usize {
        let mut inner = self.inner.write().await;
        let remaining = match inner.live.get_mut(room) {
            Some(members) => {
                members.remove(&conn_id);
                members.len()
            }
            None => return 0,
        };

        if remaining == 0 {
            inner.live.remove(room);
            debug!("Room {} has no live members", room);
        }
        remaining
    }

    /// Snapshot of the live members of a room
    pub async fn members(&self, room: &str) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .live
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the live members of a room except one connection
    pub async fn members_except(&self, room: &str, exclude: Uuid) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .live
            .get(room)
            .map(|members| {
                members
                    .values()
                    .filter(|h| h.id() != exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get live member count of a room
    pub async fn member_count(&self, room: &str) -> usize {
        let inner = self.inner.read().await;
        inner.live.get(room).map_or(0, |m| m.len())
    }

    /// Get the number of rooms with at least one live member
    pub async fn live_room_count(&self) -> usize {
        self.inner.read().await.live.len()
    }

    /// Get the number of live connections across all rooms
    pub async fn connection_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.live.values().map(|m| m.len()).sum()
    }

    /// Check whether a room is async-enabled
    pub async fn is_async(&self, room: &str) -> bool {
        let inner = self.inner.read().await;
        inner.meta.get(room).is_some_and(|m| m.async_enabled)
    }

    /// Get a room's metadata, if any was recorded
    pub async fn meta(&self, room: &str) -> Option<RoomMeta> {
        self.inner.read().await.meta.get(room).cloned()
    }

    /// Get a room's access token, if one was recorded
    pub async fn token(&self, room: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.meta.get(room).and_then(|m| m.token.clone())
    }

    /// Rooms holding metadata but no live members
    pub async fn dormant_rooms(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .meta
            .keys()
            .filter(|room| !inner.live.contains_key(*room))
            .cloned()
            .collect()
    }

    /// Drop a dormant room's metadata. Refused while the room has live members.
    pub async fn forget(&self, room: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.live.contains_key(room) {
            return false;
        }
        inner.meta.remove(room).is_some()
    }

    /// Clear every registry and hand back all live connections
    pub async fn drain_all(&self) -> Vec<ConnectionHandle> {
        let mut inner = self.inner.write().await;
        inner.meta.clear();
        inner
            .live
            .drain()
            .flat_map(|(_, members)| members.into_values())
            .collect()
    }

    /// Get uptime of the registry
    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: RoomLimits = RoomLimits {
        max_rooms: 10,
        max_members_per_room: 3,
    };

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new("127.0.0.1".parse().unwrap()).0
    }

    fn request(target: &str) -> JoinRequest {
        JoinRequest::from_target(target)
    }

    #[tokio::test]
    async fn test_join_leave_room() {
        let rooms = RoomManager::new();
        let alice = handle();
        let bob = handle();

        assert_eq!(rooms.join("room1", alice.clone()).await, 1);
        assert_eq!(rooms.join("room1", bob.clone()).await, 2);
        assert_eq!(rooms.live_room_count().await, 1);

        assert_eq!(rooms.leave("room1", bob.id()).await, 1);
        assert_eq!(rooms.member_count("room1").await, 1);

        assert_eq!(rooms.leave("room1", alice.id()).await, 0);
        assert_eq!(rooms.live_room_count().await, 0);
        assert!(rooms.members("room1").await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_unknown_room_is_noop() {
        let rooms = RoomManager::new();
        assert_eq!(rooms.leave("nowhere", Uuid::new_v4()).await, 0);
    }

    #[tokio::test]
    async fn test_members_except_sender() {
        let rooms = RoomManager::new();
        let alice = handle();
        let bob = handle();
        rooms.join("room1", alice.clone()).await;
        rooms.join("room1", bob.clone()).await;

        let others = rooms.members_except("room1", alice.id()).await;
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id(), bob.id());
    }

    #[tokio::test]
    async fn test_invalid_room_rejected() {
        let rooms = RoomManager::new();
        let result = rooms.try_join(&request("/bad%20room"), handle(), LIMITS).await;
        assert_eq!(result, Err(CloseReason::InvalidRoomId));
        assert_eq!(rooms.live_room_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_token_wins() {
        let rooms = RoomManager::new();

        assert!(rooms.try_join(&request("/r?token=abc"), handle(), LIMITS).await.is_ok());
        assert_eq!(
            rooms.try_join(&request("/r?token=xyz"), handle(), LIMITS).await,
            Err(CloseReason::InvalidToken)
        );
        assert_eq!(
            rooms.try_join(&request("/r"), handle(), LIMITS).await,
            Err(CloseReason::InvalidToken)
        );
        assert_eq!(
            rooms.try_join(&request("/r?token=abc"), handle(), LIMITS).await,
            Ok(2)
        );
    }

    #[tokio::test]
    async fn test_token_survives_empty_room() {
        let rooms = RoomManager::new();
        let alice = handle();
        rooms
            .try_join(&request("/r?token=abc"), alice.clone(), LIMITS)
            .await
            .unwrap();
        rooms.leave("r", alice.id()).await;

        assert_eq!(rooms.live_room_count().await, 0);
        assert_eq!(rooms.token("r").await.as_deref(), Some("abc"));
        assert_eq!(
            rooms.try_join(&request("/r"), handle(), LIMITS).await,
            Err(CloseReason::InvalidToken)
        );
    }

    #[tokio::test]
    async fn test_tokenless_room_accepts_tokenless_joiners() {
        let rooms = RoomManager::new();
        assert!(rooms.try_join(&request("/open"), handle(), LIMITS).await.is_ok());
        assert!(rooms.try_join(&request("/open"), handle(), LIMITS).await.is_ok());
        assert!(rooms.meta("open").await.is_none());
    }

    #[tokio::test]
    async fn test_room_full() {
        let rooms = RoomManager::new();
        for _ in 0..LIMITS.max_members_per_room {
            rooms.try_join(&request("/r"), handle(), LIMITS).await.unwrap();
        }
        assert_eq!(
            rooms.try_join(&request("/r"), handle(), LIMITS).await,
            Err(CloseReason::RoomFull)
        );
    }

    #[tokio::test]
    async fn test_server_at_capacity_only_for_new_rooms() {
        let rooms = RoomManager::new();
        let limits = RoomLimits {
            max_rooms: 1,
            max_members_per_room: 5,
        };
        rooms.try_join(&request("/a"), handle(), limits).await.unwrap();

        assert_eq!(
            rooms.try_join(&request("/b"), handle(), limits).await,
            Err(CloseReason::ServerAtCapacity)
        );
        assert_eq!(rooms.try_join(&request("/a"), handle(), limits).await, Ok(2));
    }

    #[tokio::test]
    async fn test_async_flag_is_sticky() {
        let rooms = RoomManager::new();
        rooms
            .try_join(&request("/r?async=1"), handle(), LIMITS)
            .await
            .unwrap();
        rooms.try_join(&request("/r"), handle(), LIMITS).await.unwrap();
        rooms
            .try_join(&request("/r?async=0"), handle(), LIMITS)
            .await
            .unwrap();

        assert!(rooms.is_async("r").await);
    }

    #[tokio::test]
    async fn test_dormant_rooms_and_forget() {
        let rooms = RoomManager::new();
        let alice = handle();
        rooms
            .try_join(&request("/r?async=1"), alice.clone(), LIMITS)
            .await
            .unwrap();

        assert!(rooms.dormant_rooms().await.is_empty());
        assert!(!rooms.forget("r").await);

        rooms.leave("r", alice.id()).await;
        assert_eq!(rooms.dormant_rooms().await, vec!["r".to_string()]);
        assert!(rooms.is_async("r").await);

        assert!(rooms.forget("r").await);
        assert!(!rooms.is_async("r").await);
        assert!(rooms.dormant_rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_all() {
        let rooms = RoomManager::new();
        rooms.join("a", handle()).await;
        rooms.join("b", handle()).await;
        rooms
            .try_join(&request("/c?async=1"), handle(), LIMITS)
            .await
            .unwrap();

        let drained = rooms.drain_all().await;
        assert_eq!(drained.len(), 3);
        assert_eq!(rooms.connection_count().await, 0);
        assert!(rooms.meta("c").await.is_none());
    }
}
