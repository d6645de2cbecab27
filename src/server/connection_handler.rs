//! Connection handler for one WebSocket client
//!
//! This module performs the handshake, runs admission, and then drives the
//! session: a writer task drains the connection's command channel while the
//! read loop applies the size limit and rate limiter before relaying.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, WebSocketConfig};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{CloseReason, JoinRequest, Payload, PayloadKind, client_ip};
use crate::server::rate_limiter::RateLimiter;
use crate::server::{BrokerState, catch_up, relay};

/// How long to wait for the close handshake to finish
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Commands that can be sent to a connection's writer
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Deliver a payload to this client
    Send(Payload),
    /// Close the connection with the given cause
    Close(CloseReason),
}

/// Cheap, cloneable reference to a live connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    ip: IpAddr,
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer drains
    pub fn new(ip: IpAddr) -> (Self, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: Uuid::new_v4(),
            ip,
            command_tx,
        };
        (handle, command_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Whether the writer side is still draining commands
    pub fn is_open(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Queue a payload; `false` if the connection is gone
    pub fn send(&self, payload: Payload) -> bool {
        self.command_tx.send(ConnectionCommand::Send(payload)).is_ok()
    }

    /// Queue a close; `false` if the connection is gone
    pub fn close(&self, reason: CloseReason) -> bool {
        self.command_tx.send(ConnectionCommand::Close(reason)).is_ok()
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Peer closed, errored or went away
    PeerClosed,
    /// The broker closed the connection
    Closed(CloseReason),
}

/// Inbound side of an admitted connection
pub struct ConnectionHandler {
    state: Arc<BrokerState>,
    handle: ConnectionHandle,
    room: String,
    limiter: RateLimiter,
}

impl ConnectionHandler {
    pub fn new(state: Arc<BrokerState>, handle: ConnectionHandle, room: String) -> Self {
        let limiter = RateLimiter::new(
            state.config.rate_limit_window(),
            state.config.rate_limit_max_messages,
        );
        Self {
            state,
            handle,
            room,
            limiter,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Process one inbound payload.
    ///
    /// Oversized payloads end the connection; rate-limited payloads are
    /// dropped and the connection stays open. Returns the close cause when
    /// the connection must be closed.
    pub async fn on_payload(&mut self, payload: Payload) -> Option<CloseReason> {
        let max = self.state.config.max_message_size;
        if payload.len() > max {
            warn!(
                "Message of {} bytes from {} exceeds {} bytes, closing",
                payload.len(),
                self.handle.ip(),
                max
            );
            return Some(CloseReason::MessageTooLarge);
        }

        if !self.limiter.check() {
            debug!(
                "Rate limit exceeded for {} in room {}, dropping message",
                self.handle.ip(),
                self.room
            );
            return None;
        }

        relay::relay(&self.state, &self.room, &self.handle, payload).await;
        None
    }
}

#[derive(Debug, Clone, Default)]
struct HandshakeInfo {
    target: String,
    forwarded_for: Option<String>,
}

/// Transport limits sit at twice `max_message_size` (at least 64 KiB) so the
/// broker's own size check normally fires first. Anything past the transport
/// limit surfaces as a capacity error, which [`read_error_end`] maps to the
/// same `MessageTooLarge` close.
fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let transport_limit = max_message_size.saturating_mul(2).max(64 * 1024);
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(transport_limit);
    config.max_frame_size = Some(transport_limit);
    config
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.reason().into(),
    }
}

fn to_message(payload: Payload) -> Message {
    match payload.kind {
        PayloadKind::Binary => Message::Binary(payload.data),
        PayloadKind::Text => match std::str::from_utf8(&payload.data) {
            Ok(text) => Message::text(text.to_string()),
            Err(_) => Message::Binary(payload.data),
        },
    }
}

fn to_payload(message: Message) -> Option<Payload> {
    match message {
        Message::Binary(data) => Some(Payload::binary(data)),
        Message::Text(text) => Some(Payload::text(Bytes::copy_from_slice(text.as_bytes()))),
        _ => None,
    }
}

/// Run one client connection from handshake to teardown
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<BrokerState>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let captured: Arc<OnceLock<HandshakeInfo>> = Arc::new(OnceLock::new());
    let capture = Arc::clone(&captured);

    let mut ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            let target = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| req.uri().path().to_string());
            let forwarded_for = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let _ = capture.set(HandshakeInfo {
                target,
                forwarded_for,
            });
            Ok(response)
        },
        Some(ws_config(state.config.max_message_size)),
    )
    .await?;

    let info = captured.get().cloned().unwrap_or_default();
    let ip = client_ip(info.forwarded_for.as_deref(), peer.ip());
    let request = JoinRequest::from_target(&info.target);
    let (handle, command_rx) = ConnectionHandle::new(ip);

    let admission = match state
        .gatekeeper
        .admit(&state.rooms, ip, &request, handle.clone())
        .await
    {
        Ok(admission) => admission,
        Err(reason) => {
            let _ = ws.close(Some(close_frame(reason))).await;
            let _ = tokio::time::timeout(CLOSE_GRACE, async {
                while let Some(Ok(_)) = ws.next().await {}
            })
            .await;
            return Ok(());
        }
    };

    info!(
        "Connection {} from {} joined room {} ({} members)",
        handle.id(),
        ip,
        request.room,
        admission.members
    );

    let (sink, mut source) = ws.split();
    let mut writer = tokio::spawn(write_loop(sink, command_rx));

    // Admitted after shutdown began; the drain has already run
    if *shutdown.borrow() {
        handle.close(CloseReason::ServerShutdown);
    } else if state.rooms.is_async(&request.room).await {
        catch_up::schedule(
            Arc::clone(&state),
            request.room.clone(),
            handle.clone(),
            shutdown,
        );
    }

    let mut handler = ConnectionHandler::new(Arc::clone(&state), handle.clone(), request.room);
    let end = read_loop(&mut handler, &mut source).await;

    let remaining = state.rooms.leave(handler.room(), handle.id()).await;
    drop(admission);

    match end {
        SessionEnd::PeerClosed => writer.abort(),
        SessionEnd::Closed(reason) => {
            handle.close(reason);
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
            let _ = tokio::time::timeout(CLOSE_GRACE, async {
                while let Some(Ok(message)) = source.next().await {
                    if message.is_close() {
                        break;
                    }
                }
            })
            .await;
        }
    }

    info!(
        "Connection {} left room {} ({} remaining)",
        handle.id(),
        handler.room(),
        remaining
    );
    Ok(())
}

/// How a read error ends the session
fn read_error_end(error: &WsError) -> SessionEnd {
    match error {
        WsError::Capacity(_) => SessionEnd::Closed(CloseReason::MessageTooLarge),
        _ => SessionEnd::PeerClosed,
    }
}

async fn read_loop(handler: &mut ConnectionHandler, source: &mut WsSource) -> SessionEnd {
    loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                let end = read_error_end(&e);
                if end == SessionEnd::PeerClosed {
                    debug!("Read error on {}: {}", handler.handle().id(), e);
                } else {
                    warn!(
                        "Message from {} exceeds the transport limit, closing: {}",
                        handler.handle().ip(),
                        e
                    );
                }
                return end;
            }
            None => return SessionEnd::PeerClosed,
        };

        if message.is_close() {
            return SessionEnd::PeerClosed;
        }

        let payload = match to_payload(message) {
            Some(payload) => payload,
            None => continue,
        };

        if let Some(reason) = handler.on_payload(payload).await {
            return SessionEnd::Closed(reason);
        }
    }
}

async fn write_loop(mut sink: WsSink, mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>) {
    while let Some(command) = command_rx.recv().await {
        match command {
            ConnectionCommand::Send(payload) => {
                if sink.send(to_message(payload)).await.is_err() {
                    break;
                }
            }
            ConnectionCommand::Close(reason) => {
                let _ = sink.send(Message::Close(Some(close_frame(reason)))).await;
                break;
            }
        }
    }
}
