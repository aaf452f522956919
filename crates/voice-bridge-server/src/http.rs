//! Upgrade handshake.
//!
//! One route: a GET on the configured path that checks the per-address
//! rate limit and the shared secret, then upgrades. A bad secret still
//! upgrades — the 4001 close code is the contract with the gateway — and
//! closes immediately.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::auth::{verify_secret, SECRET_HEADER};
use crate::bridge;
use crate::protocol::CLOSE_UNAUTHORIZED;
use crate::state::AppState;

/// Build the bridge's router.
pub fn create_router(state: AppState) -> Router {
    let path = state.settings.serve.path.clone();
    Router::new()
        .route(&path, get(upgrade_handler))
        .with_state(state)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let source = addr.ip().to_string();
    if !state.rate_limiter.allow(&source) {
        tracing::warn!(%source, "Upgrade rate limit exceeded");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    let authorized = verify_secret(presented, &state.settings.bridge.secret);

    ws.on_upgrade(move |mut socket| async move {
        if !authorized {
            tracing::warn!(%source, "Upgrade with bad secret rejected");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_UNAUTHORIZED,
                    reason: "unauthorized".into(),
                })))
                .await;
            return;
        }
        bridge::handle_socket(socket, state).await;
    })
}
