//! Outbound call coordination.
//!
//! `initiate` sends `initiate_call` over a live gateway connection and
//! parks the caller on a one-shot until the gateway reports back. The
//! first matching `session_start` resolves success; a terminal
//! `call_status` resolves failure; `ringing` (or a bare `answered` with
//! no session) is informational and resolves nothing. The deadline wins
//! otherwise.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use voice_bridge_core::{BridgeError, CallId, CallStatus, Result};

use crate::connection::ConnectionSet;
use crate::protocol::{CallTarget, ServerMessage};

struct Pending {
    connection_id: String,
    resolve: oneshot::Sender<Result<()>>,
}

/// Tracks calls the bridge has asked the gateway to place.
pub struct OutboundCoordinator {
    enabled: bool,
    pending: Mutex<HashMap<CallId, Pending>>,
}

impl OutboundCoordinator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Place an outbound call and wait for it to be answered.
    pub async fn initiate(
        &self,
        connections: &ConnectionSet,
        call_id: CallId,
        target: CallTarget,
        message: Option<String>,
        ring_timeout: Duration,
    ) -> Result<()> {
        if !self.enabled {
            return Err(BridgeError::Disabled("outbound calling".into()));
        }
        let connection = connections.pick().ok_or(BridgeError::GatewayNotConnected)?;

        let (resolve, resolved) = oneshot::channel();
        self.pending.lock().insert(
            call_id.clone(),
            Pending {
                connection_id: connection.id().to_string(),
                resolve,
            },
        );

        let initiate = ServerMessage::InitiateCall {
            call_id: call_id.clone(),
            target,
            message,
        };
        if connection.send(initiate).await.is_err() {
            self.pending.lock().remove(&call_id);
            return Err(BridgeError::GatewayNotConnected);
        }
        tracing::info!(call_id = %call_id, "Outbound call initiated");

        match tokio::time::timeout(ring_timeout, resolved).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Internal("outbound resolver dropped".into())),
            Err(_) => {
                self.pending.lock().remove(&call_id);
                tracing::warn!(call_id = %call_id, "Outbound call timed out ringing");
                Err(BridgeError::Timeout("outbound ring".into()))
            }
        }
    }

    /// A `session_start` arrived; resolves the pending call if one matches.
    pub fn note_session_start(&self, call_id: &CallId) -> bool {
        if let Some(pending) = self.pending.lock().remove(call_id) {
            let _ = pending.resolve.send(Ok(()));
            true
        } else {
            false
        }
    }

    /// A `call_status` arrived. Terminal failures resolve the pending
    /// call; progress statuses are informational.
    pub fn note_call_status(&self, call_id: &CallId, status: CallStatus, error: Option<String>) {
        if !status.is_terminal_failure() {
            tracing::debug!(call_id = %call_id, %status, "Outbound call progress");
            return;
        }
        if let Some(pending) = self.pending.lock().remove(call_id) {
            let detail = error.unwrap_or_else(|| status.to_string());
            let _ = pending.resolve.send(Err(BridgeError::CallFailed(detail)));
        }
    }

    /// The connection carrying these calls is gone.
    pub fn fail_for_connection(&self, connection_id: &str) {
        let mut pending = self.pending.lock();
        let failed: Vec<CallId> = pending
            .iter()
            .filter(|(_, p)| p.connection_id == connection_id)
            .map(|(id, _)| id.clone())
            .collect();
        for call_id in failed {
            if let Some(entry) = pending.remove(&call_id) {
                let _ = entry.resolve.send(Err(BridgeError::GatewayNotConnected));
            }
        }
    }

    /// Bridge shutdown: everything still pending fails.
    pub fn fail_all(&self) {
        for (_, entry) in self.pending.lock().drain() {
            let _ = entry.resolve.send(Err(BridgeError::GatewayNotConnected));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, WriterItem};
    use std::sync::Arc;

    fn call_id(s: &str) -> CallId {
        CallId::parse(s).unwrap()
    }

    fn target() -> CallTarget {
        CallTarget::User {
            user_id: "U9".into(),
        }
    }

    fn set_with_connection() -> (ConnectionSet, Arc<Connection>, tokio::sync::mpsc::Receiver<WriterItem>) {
        let set = ConnectionSet::new();
        let (conn, rx) = Connection::new();
        set.insert(conn.clone());
        (set, conn, rx)
    }

    #[tokio::test]
    async fn disabled_fails_immediately() {
        let coordinator = OutboundCoordinator::new(false);
        let (set, _conn, _rx) = set_with_connection();
        let result = coordinator
            .initiate(&set, call_id("c1"), target(), None, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(BridgeError::Disabled(_))));
    }

    #[tokio::test]
    async fn no_gateway_fails_immediately() {
        let coordinator = OutboundCoordinator::new(true);
        let set = ConnectionSet::new();
        let result = coordinator
            .initiate(&set, call_id("c1"), target(), None, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(BridgeError::GatewayNotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn ringing_does_not_resolve_and_deadline_fails() {
        let coordinator = Arc::new(OutboundCoordinator::new(true));
        let (set, _conn, mut rx) = set_with_connection();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .initiate(&set, call_id("C2"), target(), None, Duration::from_millis(500))
                    .await
            })
        };

        // The gateway received initiate_call.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            rx.try_recv(),
            Ok(WriterItem::Message(ServerMessage::InitiateCall { .. }))
        ));

        // Ringing is informational only.
        coordinator.note_call_status(&call_id("C2"), CallStatus::Ringing, None);
        assert_eq!(coordinator.pending_count(), 1);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_start_resolves_success() {
        let coordinator = Arc::new(OutboundCoordinator::new(true));
        let (set, _conn, _rx) = set_with_connection();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .initiate(&set, call_id("C3"), target(), None, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.note_session_start(&call_id("C3")));
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_resolves_failure_with_detail() {
        let coordinator = Arc::new(OutboundCoordinator::new(true));
        let (set, _conn, _rx) = set_with_connection();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .initiate(&set, call_id("C4"), target(), None, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.note_call_status(&call_id("C4"), CallStatus::Busy, Some("line busy".into()));

        match pending.await.unwrap() {
            Err(BridgeError::CallFailed(detail)) => assert_eq!(detail, "line busy"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_fails_pending_calls() {
        let coordinator = Arc::new(OutboundCoordinator::new(true));
        let (set, conn, _rx) = set_with_connection();
        let conn_id = conn.id().to_string();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .initiate(&set, call_id("C5"), target(), None, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.fail_for_connection(&conn_id);

        assert!(matches!(
            pending.await.unwrap(),
            Err(BridgeError::GatewayNotConnected)
        ));
    }

    #[tokio::test]
    async fn unmatched_session_start_is_ignored() {
        let coordinator = OutboundCoordinator::new(true);
        assert!(!coordinator.note_session_start(&call_id("nobody")));
    }
}
