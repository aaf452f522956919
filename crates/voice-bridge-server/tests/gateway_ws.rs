//! Gateway-facing behavior over a real WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use voice_bridge_config::{AuthorizationMode, Settings};
use voice_bridge_core::{
    AgentDelta, AgentEngine, AgentRequest, NullSessionStore, NullToolExecutor, Result,
};
use voice_bridge_pipeline::SpeechSynthesizer;
use voice_bridge_server::{create_router, AppState, BridgeDeps};

const SECRET: &str = "0123456789abcdef0123456789abcdef";

struct IdleEngine;

#[async_trait]
impl AgentEngine for IdleEngine {
    async fn stream_reply(
        &self,
        _request: AgentRequest,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentDelta>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

struct SilenceSynth;

#[async_trait]
impl SpeechSynthesizer for SilenceSynth {
    async fn synthesize(
        &self,
        _text: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        Ok(vec![0u8; 960])
    }
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.bridge.secret = SECRET.into();
    settings.authorization.mode = AuthorizationMode::Allowlist;
    settings
}

async fn spawn_bridge(settings: Settings) -> SocketAddr {
    let deps = BridgeDeps {
        engine: Arc::new(IdleEngine),
        synthesizer: Arc::new(SilenceSynth),
        tool_executor: Arc::new(NullToolExecutor),
        session_store: Arc::new(NullSessionStore),
    };
    let state = AppState::new(settings, deps);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn ws_request(addr: SocketAddr, secret: Option<&str>) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://{}/voice", addr).into_client_request().unwrap();
    if let Some(secret) = secret {
        request
            .headers_mut()
            .insert("x-bridge-secret", secret.parse().unwrap());
    }
    request
}

#[tokio::test]
async fn bad_secret_closes_with_4001() {
    let addr = spawn_bridge(test_settings()).await;

    // Equal length, one byte different.
    let mut wrong = SECRET.to_string();
    wrong.replace_range(0..1, "X");
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(&wrong)))
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
    {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4001);
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_secret_closes_with_4001() {
    let addr = spawn_bridge(test_settings()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_request(addr, None))
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
    {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4001);
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn eleventh_upgrade_from_one_source_is_rejected() {
    let addr = spawn_bridge(test_settings()).await;

    let mut sockets = Vec::new();
    for _ in 0..10 {
        let (socket, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(SECRET)))
            .await
            .unwrap();
        sockets.push(socket);
    }

    let denied = tokio_tungstenite::connect_async(ws_request(addr, Some(SECRET))).await;
    match denied {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 429);
        }
        other => panic!("expected HTTP 429, got {:?}", other.map(|_| "connected")),
    }
}

#[tokio::test]
async fn empty_allowlist_denies_with_allowlist_strategy() {
    let addr = spawn_bridge(test_settings()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(SECRET)))
        .await
        .unwrap();

    let request = json!({
        "type": "auth_request",
        "callId": "c-auth-1",
        "correlationId": "corr-1",
        "metadata": {"tenantId": "T1", "userId": "U1"}
    });
    socket
        .send(Message::Text(request.to_string()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = reply else {
        panic!("expected text reply");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "auth_response");
    assert_eq!(value["callId"], "c-auth-1");
    assert_eq!(value["correlationId"], "corr-1");
    assert_eq!(value["authorized"], false);
    assert_eq!(value["strategy"], "allowlist");
    assert!(value["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn allowlisted_user_is_authorized() {
    let mut settings = test_settings();
    settings.authorization.allow_from = vec!["u1".into()];
    let addr = spawn_bridge(settings).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(SECRET)))
        .await
        .unwrap();

    let request = json!({
        "type": "auth_request",
        "callId": "c-auth-2",
        "correlationId": "corr-2",
        "metadata": {"tenantId": "T1", "userId": "U1"}
    });
    socket
        .send(Message::Text(request.to_string()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = reply else {
        panic!("expected text reply");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["authorized"], true);
    assert_eq!(value["strategy"], "allowlist");
}

#[tokio::test]
async fn pstn_caller_is_blocked_under_open_mode() {
    let mut settings = test_settings();
    settings.authorization.mode = AuthorizationMode::Open;
    settings.authorization.allow_pstn = false;
    let addr = spawn_bridge(settings).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(SECRET)))
        .await
        .unwrap();

    let request = json!({
        "type": "auth_request",
        "callId": "c-auth-3",
        "correlationId": "corr-3",
        "metadata": {"tenantId": "T1", "userId": "U1", "phoneNumber": "+15550001"}
    });
    socket
        .send(Message::Text(request.to_string()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = reply else {
        panic!("expected text reply");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["authorized"], false);
    assert_eq!(value["strategy"], "pstn-blocked");
}

#[tokio::test]
async fn application_ping_gets_pong() {
    let addr = spawn_bridge(test_settings()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(SECRET)))
        .await
        .unwrap();

    socket
        .send(Message::Text(
            json!({"type": "ping", "callId": "c-ping"}).to_string(),
        ))
        .await
        .unwrap();

    loop {
        let reply = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match reply {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "pong");
                assert_eq!(value["callId"], "c-ping");
                break;
            }
            // Protocol-level pings from the health task are not the reply.
            Message::Ping(_) => continue,
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}

#[tokio::test]
async fn malformed_messages_do_not_kill_the_connection() {
    let addr = spawn_bridge(test_settings()).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_request(addr, Some(SECRET)))
        .await
        .unwrap();

    socket
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    socket
        .send(Message::Text(
            json!({"type": "mystery", "callId": "c1"}).to_string(),
        ))
        .await
        .unwrap();

    // Still alive: a ping round-trips.
    socket
        .send(Message::Text(
            json!({"type": "ping", "callId": "c-still-alive"}).to_string(),
        ))
        .await
        .unwrap();

    loop {
        let reply = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match reply {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "pong");
                break;
            }
            Message::Ping(_) => continue,
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
