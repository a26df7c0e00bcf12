//! End-to-end tests: real server on an ephemeral port, real WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use parley_db::Database;
use parley_gateway::auth::JwtVerifier;
use parley_gateway::connection::Heartbeat;
use parley_gateway::registry::ConnectionRegistry;
use parley_gateway::router::MessageRouter;
use parley_gateway::store::{ChatStore, SqliteStore};
use parley_gateway::typing::TYPING_TIMEOUT;
use parley_server::routes::{AppState, build_router};
use parley_types::api::Claims;
use parley_types::models::{Conversation, Message as ChatMessage};

const SECRET: &str = "integration-test-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn sqlite_store() -> SqliteStore {
    SqliteStore::new(Arc::new(Database::open_in_memory().expect("in-memory db")))
}

fn app_state_with(store: Arc<dyn ChatStore>, heartbeat: Heartbeat) -> AppState {
    AppState {
        router: MessageRouter::new(store, ConnectionRegistry::new(), TYPING_TIMEOUT),
        verifier: Arc::new(JwtVerifier::new(SECRET)),
        heartbeat,
    }
}

fn app_state() -> AppState {
    app_state_with(Arc::new(sqlite_store()), Heartbeat::default())
}

async fn start_test_server() -> (SocketAddr, MessageRouter) {
    serve(app_state()).await
}

/// Start the server on a random port. Returns its address and the router so
/// tests can observe registry state.
async fn serve(state: AppState) -> (SocketAddr, MessageRouter) {
    let router = state.router.clone();
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, router)
}

fn token_for(sub: Option<&str>, ttl_secs: i64) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    let claims = Claims {
        sub: sub.map(str::to_string),
        exp: (now + ttl_secs) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn connect_with(addr: SocketAddr, authorization: Option<String>) -> Result<Client, tungstenite::Error> {
    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    if let Some(value) = authorization {
        request
            .headers_mut()
            .insert("Authorization", value.parse().unwrap());
    }
    tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws)
}

/// Connect as `user` and wait until the server has registered the socket.
async fn connect_as(addr: SocketAddr, router: &MessageRouter, user: &str) -> Client {
    let ws = connect_with(addr, Some(format!("Bearer {}", token_for(Some(user), 3600))))
        .await
        .expect("authorized connect");

    for _ in 0..200 {
        if router.registry().is_online(user) {
            return ws;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never came online", user);
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "expected no frame, got {:?}", result);
}

/// Wait for the server to end the connection, by close frame or by dropping it.
async fn assert_closed(ws: &mut Client) {
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed");
}

fn assert_unauthorized(result: Result<Client, tungstenite::Error>) {
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
        Err(other) => panic!("expected HTTP 401, got {:?}", other),
        Ok(_) => panic!("expected HTTP 401, connection was accepted"),
    }
}

#[tokio::test]
async fn rejects_bad_credentials() {
    let (addr, router) = start_test_server().await;

    assert_unauthorized(connect_with(addr, None).await);
    assert_unauthorized(connect_with(addr, Some("Basic Zm9vOmJhcg==".into())).await);
    assert_unauthorized(connect_with(addr, Some("Bearer not-a-jwt".into())).await);
    assert_unauthorized(connect_with(addr, Some(format!("Bearer {}", token_for(Some("alice"), -3600)))).await);
    assert_unauthorized(connect_with(addr, Some(format!("Bearer {}", token_for(None, 3600)))).await);
    assert_unauthorized(connect_with(addr, Some(format!("Bearer {}", token_for(Some(""), 3600)))).await);

    assert_eq!(router.registry().online_count(), 0);
}

#[tokio::test]
async fn plain_get_is_a_bad_request() {
    let app = build_router(app_state());
    let response = app
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_is_delivered_and_acknowledged() {
    let (addr, router) = start_test_server().await;
    let mut alice = connect_as(addr, &router, "alice").await;
    let mut bob = connect_as(addr, &router, "bob").await;

    send_json(&mut alice, json!({"type": "chat", "recipientId": "bob", "message": "hi"})).await;

    let delivery = next_json(&mut bob).await;
    assert_eq!(delivery["from"], "alice");
    assert_eq!(delivery["message"], "hi");
    assert!(delivery.get("type").is_none());
    let message_id = delivery["messageId"].as_str().unwrap().to_string();

    let ack = next_json(&mut alice).await;
    assert_eq!(ack["type"], "message_sent");
    assert_eq!(ack["messageId"], message_id.as_str());
    assert_eq!(ack["recipientId"], "bob");
}

#[tokio::test]
async fn typing_then_send_then_read() {
    let (addr, router) = start_test_server().await;
    let mut alice = connect_as(addr, &router, "alice").await;
    let mut bob = connect_as(addr, &router, "bob").await;

    send_json(&mut alice, json!({"type": "typing_start", "recipientId": "bob"})).await;
    let typing = next_json(&mut bob).await;
    assert_eq!(typing, json!({"type": "user_typing", "from": "alice", "isTyping": true}));

    // A repeated start while typing is not re-announced
    send_json(&mut alice, json!({"type": "typing_start", "recipientId": "bob"})).await;
    send_json(&mut alice, json!({"recipientId": "bob", "message": "there?"})).await;

    let stopped = next_json(&mut bob).await;
    assert_eq!(stopped, json!({"type": "user_typing", "from": "alice", "isTyping": false}));
    let delivery = next_json(&mut bob).await;
    assert_eq!(delivery["message"], "there?");
    let message_id = delivery["messageId"].clone();
    next_json(&mut alice).await; // message_sent

    send_json(&mut bob, json!({"type": "mark_read", "messageIds": [message_id]})).await;
    let receipt = next_json(&mut alice).await;
    assert_eq!(receipt["type"], "messages_read");
    assert_eq!(receipt["readBy"], "bob");
    assert_eq!(receipt["messageIds"], json!([message_id]));

    // Marking again changes nothing and tells no one
    send_json(&mut bob, json!({"type": "mark_read", "messageIds": [message_id]})).await;
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn malformed_frames_keep_the_connection_open() {
    let (addr, router) = start_test_server().await;
    let mut alice = connect_as(addr, &router, "alice").await;
    let mut bob = connect_as(addr, &router, "bob").await;

    alice.send(Message::text("not json".to_string())).await.unwrap();
    send_json(&mut alice, json!({"type": "wave", "recipientId": "bob"})).await;
    assert_silent(&mut bob).await;
    assert_silent(&mut alice).await;

    send_json(&mut alice, json!({"type": "chat", "recipientId": "bob", "message": "still here"})).await;
    assert_eq!(next_json(&mut bob).await["message"], "still here");
}

#[tokio::test]
async fn disconnect_clears_presence_and_typing() {
    let (addr, router) = start_test_server().await;
    let mut alice = connect_as(addr, &router, "alice").await;
    let mut bob = connect_as(addr, &router, "bob").await;

    send_json(&mut alice, json!({"type": "typing_start", "recipientId": "bob"})).await;
    assert_eq!(next_json(&mut bob).await["isTyping"], true);

    alice.close(None).await.unwrap();

    let stopped = next_json(&mut bob).await;
    assert_eq!(stopped, json!({"type": "user_typing", "from": "alice", "isTyping": false}));
    assert!(!router.registry().is_online("alice"));
    assert_eq!(router.typing().active_timers(), 0);
}

#[tokio::test]
async fn newer_connection_replaces_older() {
    let (addr, router) = start_test_server().await;
    let mut first = connect_as(addr, &router, "alice").await;
    let mut second = connect_with(addr, Some(format!("Bearer {}", token_for(Some("alice"), 3600))))
        .await
        .unwrap();

    // The superseded socket is closed by the server
    assert_closed(&mut first).await;

    // The old socket's cleanup must not evict the new registration
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(router.registry().is_online("alice"));
    assert_eq!(router.registry().online_count(), 1);

    let mut bob = connect_as(addr, &router, "bob").await;
    send_json(&mut bob, json!({"type": "chat", "recipientId": "alice", "message": "which one?"})).await;
    assert_eq!(next_json(&mut second).await["message"], "which one?");
}

#[tokio::test]
async fn unanswered_pings_drop_the_connection() {
    let heartbeat = Heartbeat {
        interval: Duration::from_millis(200),
        max_missed_pongs: 2,
    };
    let (addr, router) = serve(app_state_with(Arc::new(sqlite_store()), heartbeat)).await;
    let mut alice = connect_as(addr, &router, "alice").await;
    let mut bob = connect_as(addr, &router, "bob").await;

    send_json(&mut alice, json!({"type": "typing_start", "recipientId": "bob"})).await;
    assert_eq!(next_json(&mut bob).await["isTyping"], true);

    // alice stops reading, so her client never answers a ping. bob keeps
    // reading (and ponging) while he waits, and well inside the typing timeout
    // the drop clears her indicator.
    let stopped = next_json(&mut bob).await;
    assert_eq!(stopped, json!({"type": "user_typing", "from": "alice", "isTyping": false}));
    assert!(!router.registry().is_online("alice"));
    assert!(router.registry().is_online("bob"));
    assert_eq!(router.typing().active_timers(), 0);

    assert_closed(&mut alice).await;
}

/// Delegates to SQLite but holds every message write for `delay`.
struct SlowStore {
    inner: SqliteStore,
    delay: Duration,
}

#[async_trait]
impl ChatStore for SlowStore {
    async fn find_or_create_conversation(&self, a: &str, b: &str) -> anyhow::Result<Conversation> {
        self.inner.find_or_create_conversation(a, b).await
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> anyhow::Result<ChatMessage> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .create_message(conversation_id, sender_id, receiver_id, content)
            .await
    }

    async fn update_conversation_activity(&self, conversation_id: &str, last_message_id: &str) -> anyhow::Result<()> {
        self.inner
            .update_conversation_activity(conversation_id, last_message_id)
            .await
    }

    async fn mark_as_read(&self, ids: &[String], reader: &str, read_at: DateTime<Utc>) -> anyhow::Result<usize> {
        self.inner.mark_as_read(ids, reader, read_at).await
    }

    async fn fetch_just_read(
        &self,
        ids: &[String],
        reader: &str,
        read_at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        self.inner.fetch_just_read(ids, reader, read_at).await
    }
}

#[tokio::test]
async fn replaced_connection_finishes_the_frame_it_was_handling() {
    let store = SlowStore {
        inner: sqlite_store(),
        delay: Duration::from_millis(500),
    };
    let (addr, router) = serve(app_state_with(Arc::new(store), Heartbeat::default())).await;
    let mut first = connect_as(addr, &router, "alice").await;
    let mut bob = connect_as(addr, &router, "bob").await;

    send_json(&mut first, json!({"type": "chat", "recipientId": "bob", "message": "in flight"})).await;

    // Take over the session while the message write is still pending
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = connect_with(addr, Some(format!("Bearer {}", token_for(Some("alice"), 3600))))
        .await
        .unwrap();
    assert_closed(&mut first).await;

    // The old socket's chat still completes: delivery, then the ack lands on
    // the connection that now owns alice
    let delivery = next_json(&mut bob).await;
    assert_eq!(delivery["from"], "alice");
    assert_eq!(delivery["message"], "in flight");

    let ack = next_json(&mut second).await;
    assert_eq!(ack["type"], "message_sent");
    assert_eq!(ack["messageId"], delivery["messageId"]);
}
