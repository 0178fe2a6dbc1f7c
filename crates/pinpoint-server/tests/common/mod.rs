use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use pinpoint_core::catalog::BuiltinCatalog;
use pinpoint_core::identity::TokenType;
use pinpoint_core::net::messages::{ClientMessage, GuessMsg, ServerMessage};
use pinpoint_core::net::protocol::{decode_server_message, encode_client_message};
use pinpoint_core::player::UserId;

use pinpoint_server::auth::JwtVerifier;
use pinpoint_server::config::ServerConfig;
use pinpoint_server::persistence::{MemoryResultStore, ResultStore};
use pinpoint_server::state::{AppState, Backends};
use pinpoint_server::store::MemoryLobbyStore;
use pinpoint_server::{build_app, spawn_reaper};

pub const SECRET: &str = "integration-secret";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub results: Arc<MemoryResultStore>,
    minter: JwtVerifier,
    _server: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Start a server with a short start delay so games move quickly.
    pub async fn new() -> Self {
        Self::from_config(Self::config()).await
    }

    pub fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.listen_addr = "127.0.0.1:0".to_string();
        config.auth.jwt_secret = SECRET.to_string();
        config.lobbies.start_delay_ms = 50;
        config.lobbies.default_round_count = 2;
        config.lobbies.default_round_time_limit_secs = 5;
        config
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let results = Arc::new(MemoryResultStore::new());
        let (app, state) = build_app(
            config,
            Backends {
                store: Arc::new(MemoryLobbyStore::new()),
                results: Arc::clone(&results) as Arc<dyn ResultStore>,
                catalog: Arc::new(BuiltinCatalog::new()),
            },
        );
        spawn_reaper(state.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            state,
            results,
            minter: JwtVerifier::new(SECRET.as_bytes(), None),
            _server: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, lobby_id: &str, token: &str) -> String {
        format!("ws://{}/ws/lobbies/{lobby_id}?token={token}", self.addr)
    }

    /// Access token for `user_id`, named `player<user_id>`.
    pub fn token(&self, user_id: UserId) -> String {
        self.minter
            .mint(user_id, &format!("player{user_id}"), TokenType::Access, 3600)
            .unwrap()
    }

    pub fn refresh_token(&self, user_id: UserId) -> String {
        self.minter
            .mint(user_id, &format!("player{user_id}"), TokenType::Refresh, 3600)
            .unwrap()
    }

    /// POST /api/v1/lobbies as `host`; returns the response body.
    pub async fn create_lobby(&self, host: UserId, body: Value) -> Value {
        let resp = reqwest::Client::new()
            .post(format!("{}/api/v1/lobbies", self.base_url()))
            .bearer_auth(self.token(host))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201, "create lobby failed");
        resp.json().await.unwrap()
    }

    /// Create a lobby and return its id.
    pub async fn create_lobby_id(&self, host: UserId, body: Value) -> String {
        let created = self.create_lobby(host, body).await;
        created["lobby"]["id"].as_str().unwrap().to_string()
    }

    /// Open a socket for `user_id` and consume its snapshot.
    pub async fn connect(&self, lobby_id: &str, user_id: UserId) -> WsStream {
        let mut stream = ws_connect(&self.ws_url(lobby_id, &self.token(user_id))).await;
        match ws_read_server_msg(&mut stream).await {
            ServerMessage::LobbySnapshot(_) => {},
            other => panic!("Expected lobby_snapshot, got: {other:?}"),
        }
        stream
    }
}

pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Read the next text frame (5s timeout).
pub async fn ws_read_text(stream: &mut WsStream) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let text = ws_read_text(stream).await;
    decode_server_message(&text).unwrap()
}

/// Read messages until one with `type_name` arrives, returning it.
pub async fn ws_read_until(stream: &mut WsStream, type_name: &str) -> ServerMessage {
    for _ in 0..50 {
        let msg = ws_read_server_msg(stream).await;
        if msg.type_name() == type_name {
            return msg;
        }
    }
    panic!("no {type_name} message within 50 frames");
}

/// Try to read a message, returning None on timeout.
pub async fn ws_try_read(stream: &mut WsStream, timeout_ms: u64) -> Option<ServerMessage> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return decode_server_message(text.as_str()).ok(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                _ => continue,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Wait for the server to close the socket (5s timeout).
pub async fn ws_expect_close(stream: &mut WsStream) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for close");
}

pub async fn ws_send_client_msg(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Text(encoded.into())).await.unwrap();
}

pub async fn ws_send_raw(stream: &mut WsStream, text: &str) {
    stream.send(Message::Text(text.to_string().into())).await.unwrap();
}

pub async fn ws_guess(stream: &mut WsStream, round: u32, lat: f64, lng: f64) {
    ws_send_client_msg(stream, &ClientMessage::Guess(GuessMsg { round, lat, lng })).await;
}
