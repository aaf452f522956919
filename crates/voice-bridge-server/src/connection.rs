//! Gateway connection bookkeeping.
//!
//! One `Connection` per accepted WebSocket. Everything outbound — wire
//! messages, health pings, the occasional close frame — goes through a
//! bounded channel drained by the connection's writer task, so the socket
//! has a single writer. A connection carries at most one active call in
//! this version.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voice_bridge_core::{BridgeError, CallId, Result};

use crate::protocol::ServerMessage;

/// Outbound queue depth per connection; audio pacing keeps this shallow.
pub const OUTBOUND_QUEUE: usize = 64;

/// What the writer task puts on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterItem {
    /// A JSON wire message.
    Message(ServerMessage),
    /// A protocol-level ping for idle-health checking.
    Ping,
    /// Close the socket with a code and reason, then stop writing.
    Close(u16, &'static str),
}

/// One live gateway connection.
pub struct Connection {
    id: String,
    outbound: mpsc::Sender<WriterItem>,
    call_id: Mutex<Option<CallId>>,
    pong_seen: AtomicBool,
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection and the receiver its writer task drains.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<WriterItem>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let connection = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            outbound,
            call_id: Mutex::new(None),
            pong_seen: AtomicBool::new(true),
            closed: CancellationToken::new(),
        });
        (connection, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a wire message for the writer task.
    pub async fn send(&self, message: ServerMessage) -> Result<()> {
        self.outbound
            .send(WriterItem::Message(message))
            .await
            .map_err(|_| BridgeError::GatewayNotConnected)
    }

    /// Queue a health ping.
    pub async fn ping(&self) -> Result<()> {
        self.outbound
            .send(WriterItem::Ping)
            .await
            .map_err(|_| BridgeError::GatewayNotConnected)
    }

    /// Queue a close frame; the writer stops after sending it.
    pub async fn close_with(&self, code: u16, reason: &'static str) {
        let _ = self.outbound.send(WriterItem::Close(code, reason)).await;
        self.closed.cancel();
    }

    pub fn bind_call(&self, call_id: CallId) {
        *self.call_id.lock() = Some(call_id);
    }

    pub fn clear_call(&self) {
        *self.call_id.lock() = None;
    }

    pub fn bound_call(&self) -> Option<CallId> {
        self.call_id.lock().clone()
    }

    /// Record that the peer answered a ping.
    pub fn mark_pong(&self) {
        self.pong_seen.store(true, Ordering::SeqCst);
    }

    /// Consume the pong flag for one health interval.
    pub fn take_pong(&self) -> bool {
        self.pong_seen.swap(false, Ordering::SeqCst)
    }

    /// Token that fires when the connection must shut down.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// All live connections, with round-robin selection for outbound calls.
#[derive(Default)]
pub struct ConnectionSet {
    connections: RwLock<Vec<Arc<Connection>>>,
    next_pick: AtomicUsize,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.write().push(connection);
    }

    pub fn remove(&self, id: &str) {
        self.connections.write().retain(|c| c.id() != id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().iter().find(|c| c.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live connection, for shutdown sweeps.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    /// Round-robin pick of a live connection for an outbound call.
    pub fn pick(&self) -> Option<Arc<Connection>> {
        let connections = self.connections.read();
        if connections.is_empty() {
            return None;
        }
        let index = self.next_pick.fetch_add(1, Ordering::Relaxed) % connections.len();
        Some(connections[index].clone())
    }
}
