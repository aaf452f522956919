//! Session store seam.
//!
//! The bridge records call lifecycle events and final transcripts into an
//! external session store it does not interpret; only the key format and
//! the context envelope are fixed here. All writes are best-effort.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Message-context envelope written with every record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgContext {
    pub body: String,
    pub from: String,
    pub to: String,
    pub sender_id: String,
    pub sender_name: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub provider: String,
    pub surface: String,
    pub chat_type: String,
}

impl MsgContext {
    /// Envelope for a voice-call record. Provider and surface are fixed to
    /// `msteams-call`; calls are always direct chats.
    pub fn for_call(
        body: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            body: body.into(),
            from: from.into(),
            to: to.into(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            timestamp,
            provider: "msteams-call".into(),
            surface: "msteams-call".into(),
            chat_type: "direct".into(),
        }
    }
}

/// One record to append to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// `msteams-call:{lowercased-user-id}`.
    pub session_key: String,
    pub ctx: MsgContext,
    pub create_if_missing: bool,
}

/// External session store the host injects.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn record_session(&self, record: SessionRecord) -> Result<()>;
}

/// Store that drops every record; used when the host wires none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSessionStore;

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn record_session(&self, _record: SessionRecord) -> Result<()> {
        Ok(())
    }
}
