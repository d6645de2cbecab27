//! End-to-end relay scenarios over real WebSocket connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use room_relay::error::Result;
use room_relay::{BrokerState, RelayConfig, RelayServer, ShutdownTrigger};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestRelay {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    trigger: ShutdownTrigger,
    task: JoinHandle<Result<()>>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Self {
        let server = RelayServer::from_state(BrokerState::with_memory_buffer(config));
        let state = server.state();
        let trigger = server.shutdown_trigger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(server.serve(listener));
        Self {
            addr,
            state,
            trigger,
            task,
        }
    }

    fn url(&self, target: &str) -> String {
        format!("ws://{}{}", self.addr, target)
    }

    async fn connect(&self, target: &str) -> Client {
        let (ws, _) = connect_async(self.url(target)).await.unwrap();
        ws
    }

    async fn connect_from(&self, target: &str, forwarded_for: &str) -> Client {
        let mut request = self.url(target).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("x-forwarded-for", forwarded_for.parse().unwrap());
        let (ws, _) = connect_async(request).await.unwrap();
        ws
    }

    async fn wait_for_members(&self, room: &str, count: usize) {
        let state = Arc::clone(&self.state);
        let room = room.to_string();
        tokio::time::timeout(WAIT, async move {
            while state.rooms.member_count(&room).await != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room never reached expected member count");
    }

    async fn wait_for_buffered(&self, messages: usize) {
        let state = Arc::clone(&self.state);
        tokio::time::timeout(WAIT, async move {
            loop {
                let buffered = state.buffer.stats().await.map_or(0, |s| s.messages);
                if buffered == messages {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("buffer never reached expected size");
    }
}

fn test_config() -> RelayConfig {
    RelayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        settle_delay_ms: 100,
        shutdown_grace_ms: 1_000,
        ..Default::default()
    }
}

/// Next data or close message, skipping pings and pongs
async fn next_message(ws: &mut Client) -> Message {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(message)) => return message,
                other => panic!("connection ended unexpectedly: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

async fn expect_close_code(ws: &mut Client) -> u16 {
    match next_message(ws).await {
        Message::Close(Some(frame)) => u16::from(frame.code),
        other => panic!("expected close frame, got {:?}", other),
    }
}

async fn expect_text(ws: &mut Client) -> String {
    match next_message(ws).await {
        Message::Text(text) => text.as_str().to_string(),
        other => panic!("expected text message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_live_members_receive_relayed_payloads() {
    let relay = TestRelay::start(test_config()).await;
    let mut alice = relay.connect("/room1").await;
    let mut bob = relay.connect("/room1").await;
    relay.wait_for_members("room1", 2).await;

    alice.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    match next_message(&mut bob).await {
        Message::Binary(data) => assert_eq!(&data[..], &[1u8, 2, 3]),
        other => panic!("expected binary message, got {:?}", other),
    }

    bob.send(Message::text("hello")).await.unwrap();
    assert_eq!(expect_text(&mut alice).await, "hello");

    // Live delivery never touches the buffer
    assert_eq!(relay.state.buffer.stats().await.map(|s| s.messages), Some(0));
}

#[tokio::test]
async fn test_legacy_path_joins_same_room() {
    let relay = TestRelay::start(test_config()).await;
    let mut alice = relay.connect("/ws/lobby").await;
    let mut bob = relay.connect("/lobby").await;
    relay.wait_for_members("lobby", 2).await;

    alice.send(Message::text("via legacy path")).await.unwrap();
    assert_eq!(expect_text(&mut bob).await, "via legacy path");
}

#[tokio::test]
async fn test_lone_member_payloads_caught_up_in_order() {
    let relay = TestRelay::start(test_config()).await;

    let mut alice = relay.connect("/notes?async=1").await;
    relay.wait_for_members("notes", 1).await;
    alice.send(Message::text("first")).await.unwrap();
    alice.send(Message::text("second")).await.unwrap();
    relay.wait_for_buffered(2).await;

    alice.close(None).await.unwrap();
    relay.wait_for_members("notes", 0).await;

    // The async flag is sticky; the late joiner need not repeat it
    let mut bob = relay.connect("/notes").await;
    assert_eq!(expect_text(&mut bob).await, "first");
    assert_eq!(expect_text(&mut bob).await, "second");

    relay.wait_for_buffered(0).await;
    assert!(!relay.state.buffer.has_pending("notes").await);
}

#[tokio::test]
async fn test_sync_room_does_not_buffer() {
    let relay = TestRelay::start(test_config()).await;
    let mut alice = relay.connect("/plain").await;
    relay.wait_for_members("plain", 1).await;

    alice.send(Message::text("nobody hears this")).await.unwrap();
    alice.send(Message::text("marker")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!relay.state.buffer.has_pending("plain").await);
}

#[tokio::test]
async fn test_per_ip_limit_closes_excess_connection() {
    let relay = TestRelay::start(RelayConfig {
        max_connections_per_ip: 2,
        ..test_config()
    })
    .await;

    let mut a = relay.connect("/room1").await;
    let mut b = relay.connect("/room1").await;
    relay.wait_for_members("room1", 2).await;

    let mut c = relay.connect("/room1").await;
    assert_eq!(expect_close_code(&mut c).await, 4029);

    // The connections already admitted are unaffected
    a.send(Message::text("still here")).await.unwrap();
    assert_eq!(expect_text(&mut b).await, "still here");
    assert_eq!(relay.state.rooms.member_count("room1").await, 2);

    // A different forwarded address has its own allowance
    let _d = relay.connect_from("/room1", "198.51.100.7").await;
    relay.wait_for_members("room1", 3).await;
}

#[tokio::test]
async fn test_oversized_message_closes_with_1009() {
    let relay = TestRelay::start(RelayConfig {
        max_message_size: 16,
        ..test_config()
    })
    .await;

    let mut alice = relay.connect("/room1").await;
    relay.wait_for_members("room1", 1).await;

    alice.send(Message::binary(vec![0u8; 17])).await.unwrap();
    assert_eq!(expect_close_code(&mut alice).await, 1009);
    relay.wait_for_members("room1", 0).await;
}

#[tokio::test]
async fn test_token_mismatch_rejected() {
    let relay = TestRelay::start(test_config()).await;

    let _owner = relay.connect("/vault?token=abc").await;
    relay.wait_for_members("vault", 1).await;

    let mut intruder = relay.connect("/vault?token=nope").await;
    assert_eq!(expect_close_code(&mut intruder).await, 4001);

    let mut anonymous = relay.connect("/vault").await;
    assert_eq!(expect_close_code(&mut anonymous).await, 4001);

    let _friend = relay.connect("/vault?token=abc").await;
    relay.wait_for_members("vault", 2).await;
}

#[tokio::test]
async fn test_invalid_room_and_full_room_rejected() {
    let relay = TestRelay::start(RelayConfig {
        max_members_per_room: 1,
        ..test_config()
    })
    .await;

    let mut bad = relay.connect("/has!bang").await;
    assert_eq!(expect_close_code(&mut bad).await, 4000);

    let _first = relay.connect("/small").await;
    relay.wait_for_members("small", 1).await;
    let mut second = relay.connect("/small").await;
    assert_eq!(expect_close_code(&mut second).await, 4002);
}

#[tokio::test]
async fn test_new_room_rejected_at_capacity() {
    let relay = TestRelay::start(RelayConfig {
        max_rooms: 1,
        ..test_config()
    })
    .await;

    let _first = relay.connect("/one").await;
    relay.wait_for_members("one", 1).await;

    let mut other = relay.connect("/two").await;
    assert_eq!(expect_close_code(&mut other).await, 1013);

    // Joining a room that is already live is still allowed
    let _second = relay.connect("/one").await;
    relay.wait_for_members("one", 2).await;
}

#[tokio::test]
async fn test_shutdown_closes_live_connections() {
    let relay = TestRelay::start(test_config()).await;
    let mut alice = relay.connect("/room1").await;
    relay.wait_for_members("room1", 1).await;

    relay.trigger.trigger();
    assert_eq!(expect_close_code(&mut alice).await, 1001);

    let result = tokio::time::timeout(WAIT, relay.task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}
