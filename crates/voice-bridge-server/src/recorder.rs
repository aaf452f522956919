//! Best-effort session recording.
//!
//! Three record kinds go to the external session store: call start, final
//! transcripts, call end. A store failure is logged and swallowed — it
//! must never affect the call.

use std::sync::Arc;

use chrono::Utc;

use voice_bridge_core::{
    EndReason, MsgContext, SessionRecord, SessionStore, TurnRole,
};

use crate::session::CallSession;

const BRIDGE_PARTY: &str = "voice-bridge";

/// Writes call lifecycle records to the injected session store.
#[derive(Clone)]
pub struct SessionRecorder {
    store: Arc<dyn SessionStore>,
}

impl SessionRecorder {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub async fn record_call_start(&self, session: &CallSession) {
        let body = format!("[call started: {:?}]", session.direction);
        self.write(session, TurnRole::User, body).await;
    }

    pub async fn record_final_transcript(
        &self,
        session: &CallSession,
        role: TurnRole,
        text: &str,
    ) {
        if text.trim().is_empty() {
            return;
        }
        self.write(session, role, text.to_string()).await;
    }

    pub async fn record_call_end(&self, session: &CallSession, reason: EndReason) {
        let body = format!("[call ended: {:?}]", reason);
        self.write(session, TurnRole::User, body).await;
    }

    async fn write(&self, session: &CallSession, role: TurnRole, body: String) {
        let Some(session_key) = session.caller.conversation_key() else {
            // No caller identity, nothing to key the record under.
            return;
        };

        let caller_id = session.caller.user_id.clone().unwrap_or_default();
        let caller_name = session
            .caller
            .display_name
            .clone()
            .unwrap_or_else(|| caller_id.clone());

        let (from, to, sender_id, sender_name) = match role {
            TurnRole::User => (caller_id.clone(), BRIDGE_PARTY.into(), caller_id, caller_name),
            TurnRole::Bot => (
                BRIDGE_PARTY.into(),
                caller_id.clone(),
                BRIDGE_PARTY.into(),
                BRIDGE_PARTY.into(),
            ),
        };

        let record = SessionRecord {
            session_key,
            ctx: MsgContext::for_call(
                body,
                from,
                to,
                sender_id,
                sender_name,
                Utc::now().timestamp_millis(),
            ),
            create_if_missing: true,
        };

        if let Err(e) = self.store.record_session(record).await {
            tracing::warn!(call_id = %session.call_id, error = %e, "Session record write failed");
        }
    }
}
