//! Catch-up dispatcher
//!
//! After a member joins an asynchronous room, waits for the connection to
//! settle and then flushes whatever was buffered while the room was empty.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::{BrokerState, shutdown_requested};
use crate::server::connection_handler::ConnectionHandle;

/// Schedule a catch-up delivery for a freshly joined member
pub fn schedule(
    state: Arc<BrokerState>,
    room: String,
    handle: ConnectionHandle,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<usize> {
    let delay = state.config.settle_delay();
    tokio::spawn(async move { deliver_after(&state, &room, &handle, delay, shutdown).await })
}

/// Wait `delay`, then flush the room's buffer to `handle`.
///
/// Nothing is delivered if shutdown begins first, the connection has closed,
/// or the buffer is empty. Returns the number of payloads flushed.
pub async fn deliver_after(
    state: &BrokerState,
    room: &str,
    handle: &ConnectionHandle,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown_requested(&mut shutdown) => {
            debug!("Skipping catch-up for room {}: shutting down", room);
            return 0;
        }
    }

    if !handle.is_open() {
        debug!("Skipping catch-up for room {}: connection {} closed", room, handle.id());
        return 0;
    }

    if !state.buffer.has_pending(room).await {
        return 0;
    }

    let flushed = state.buffer.flush(room, handle).await;
    info!(
        "Delivered {} buffered payloads to {} in room {}",
        flushed,
        handle.id(),
        room
    );
    flushed
}
