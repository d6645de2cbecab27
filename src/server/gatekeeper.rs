//! Connection admission
//!
//! The per-IP live-connection count is held as an RAII [`IpSlot`]: admission
//! takes a slot, and dropping it (rejection or disconnect) gives it back,
//! so every close path decrements exactly once.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::protocol::{CloseReason, JoinRequest};
use crate::server::connection_handler::ConnectionHandle;
use crate::server::room_manager::{RoomLimits, RoomManager};

type IpCounts = Arc<Mutex<HashMap<IpAddr, usize>>>;

/// One live connection's share of its IP's connection count
#[derive(Debug)]
pub struct IpSlot {
    ip: IpAddr,
    counts: IpCounts,
}

impl IpSlot {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for IpSlot {
    fn drop(&mut self) {
        if let Ok(mut counts) = self.counts.lock() {
            if let Some(count) = counts.get_mut(&self.ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(&self.ip);
                }
            }
        }
    }
}

/// A successful admission
#[derive(Debug)]
pub struct Admission {
    /// Released when the connection ends
    pub slot: IpSlot,
    /// Live members in the room after joining
    pub members: usize,
}

/// Admits or rejects incoming connections
pub struct Gatekeeper {
    counts: IpCounts,
    max_per_ip: usize,
    limits: RoomLimits,
}

impl Gatekeeper {
    pub fn new(max_per_ip: usize, limits: RoomLimits) -> Self {
        Self {
            counts: Arc::new(Mutex::new(HashMap::new())),
            max_per_ip,
            limits,
        }
    }

    /// Take a per-IP slot, or reject with `TooManyConnections`
    pub fn acquire(&self, ip: IpAddr) -> Result<IpSlot, CloseReason> {
        let mut counts = self
            .counts
            .lock()
            .map_err(|_| CloseReason::TooManyConnections)?;
        let count = counts.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return Err(CloseReason::TooManyConnections);
        }
        *count += 1;

        Ok(IpSlot {
            ip,
            counts: Arc::clone(&self.counts),
        })
    }

    /// Run the full admission sequence and join the room on success.
    ///
    /// The per-IP slot is taken first; any later rejection drops it again.
    pub async fn admit(
        &self,
        rooms: &RoomManager,
        ip: IpAddr,
        request: &JoinRequest,
        handle: ConnectionHandle,
    ) -> Result<Admission, CloseReason> {
        let slot = self.acquire(ip).map_err(|reason| {
            warn!("Rejecting {} for room {}: {}", ip, request.room, reason);
            reason
        })?;

        match rooms.try_join(request, handle, self.limits).await {
            Ok(members) => {
                debug!(
                    "Admitted {} to room {} ({} members)",
                    ip, request.room, members
                );
                Ok(Admission { slot, members })
            }
            Err(reason) => {
                warn!("Rejecting {} for room {}: {}", ip, request.room, reason);
                Err(reason)
            }
        }
    }

    /// Live connections from one IP
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.counts
            .lock()
            .map(|counts| counts.get(&ip).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Live connections across all IPs
    pub fn total_connections(&self) -> usize {
        self.counts
            .lock()
            .map(|counts| counts.values().sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: RoomLimits = RoomLimits {
        max_rooms: 10,
        max_members_per_room: 10,
    };

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_per_ip_limit() {
        let gate = Gatekeeper::new(2, LIMITS);
        let a = ip("192.0.2.1");

        let s1 = gate.acquire(a).unwrap();
        let _s2 = gate.acquire(a).unwrap();
        assert_eq!(gate.acquire(a).unwrap_err(), CloseReason::TooManyConnections);

        // Other IPs are unaffected
        assert!(gate.acquire(ip("192.0.2.2")).is_ok());

        drop(s1);
        assert_eq!(gate.connections_from(a), 1);
        assert!(gate.acquire(a).is_ok());
    }

    #[test]
    fn test_slot_released_once() {
        let gate = Gatekeeper::new(5, LIMITS);
        let a = ip("192.0.2.1");
        {
            let _s1 = gate.acquire(a).unwrap();
            let _s2 = gate.acquire(a).unwrap();
            assert_eq!(gate.total_connections(), 2);
        }
        assert_eq!(gate.connections_from(a), 0);
        assert_eq!(gate.total_connections(), 0);
    }

    #[tokio::test]
    async fn test_rejection_rolls_back_ip_count() {
        let gate = Gatekeeper::new(5, LIMITS);
        let rooms = RoomManager::new();
        let a = ip("192.0.2.1");

        let (handle, _rx) = ConnectionHandle::new(a);
        let result = gate
            .admit(&rooms, a, &JoinRequest::from_target("/bad room"), handle)
            .await;
        assert_eq!(result.unwrap_err(), CloseReason::InvalidRoomId);
        assert_eq!(gate.connections_from(a), 0);
    }

    #[tokio::test]
    async fn test_admission_keeps_slot() {
        let gate = Gatekeeper::new(5, LIMITS);
        let rooms = RoomManager::new();
        let a = ip("192.0.2.1");

        let (handle, _rx) = ConnectionHandle::new(a);
        let admission = gate
            .admit(&rooms, a, &JoinRequest::from_target("/room1"), handle)
            .await
            .unwrap();
        assert_eq!(admission.members, 1);
        assert_eq!(gate.connections_from(a), 1);

        drop(admission);
        assert_eq!(gate.connections_from(a), 0);
    }

    #[tokio::test]
    async fn test_ip_check_precedes_room_checks() {
        let gate = Gatekeeper::new(1, LIMITS);
        let rooms = RoomManager::new();
        let a = ip("192.0.2.1");

        let _held = gate.acquire(a).unwrap();
        let (handle, _rx) = ConnectionHandle::new(a);
        let result = gate
            .admit(&rooms, a, &JoinRequest::from_target("/bad room"), handle)
            .await;
        assert_eq!(result.unwrap_err(), CloseReason::TooManyConnections);
    }
}
