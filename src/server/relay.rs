//! Relay engine
//!
//! Forwards a payload to every other live member of the sender's room. When
//! nobody received it and the room is asynchronous, the payload is buffered
//! for the next member to join.

use tracing::debug;

use crate::protocol::Payload;
use crate::server::BrokerState;
use crate::server::connection_handler::ConnectionHandle;

/// What happened to a relayed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Delivered to this many peers
    Delivered(usize),
    /// No peers; stored for catch-up
    Buffered,
    /// No peers; the buffer refused it
    BufferRejected,
    /// No peers and the room does not buffer
    Dropped,
}

/// Relay one payload from `sender` to the rest of `room`
pub async fn relay(
    state: &BrokerState,
    room: &str,
    sender: &ConnectionHandle,
    payload: Payload,
) -> RelayOutcome {
    let recipients = state.rooms.members_except(room, sender.id()).await;

    let mut delivered = 0;
    for recipient in &recipients {
        if recipient.is_open() && recipient.send(payload.clone()) {
            delivered += 1;
        }
    }

    if delivered > 0 {
        return RelayOutcome::Delivered(delivered);
    }

    if !state.rooms.is_async(room).await {
        debug!("No peers in room {}, dropping {} bytes", room, payload.len());
        return RelayOutcome::Dropped;
    }

    if state.buffer.add(room, payload).await {
        debug!("Buffered payload for room {}", room);
        RelayOutcome::Buffered
    } else {
        RelayOutcome::BufferRejected
    }
}
