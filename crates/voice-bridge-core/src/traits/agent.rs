//! Agent engine seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Who spoke a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Bot,
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A piece of streamed agent output.
#[derive(Debug, Clone)]
pub enum AgentDelta {
    /// Plain response text.
    Text(String),
    /// Narration of a tool result; spoken exactly like ordinary text.
    ToolNote(String),
}

impl AgentDelta {
    pub fn as_text(&self) -> &str {
        match self {
            AgentDelta::Text(t) | AgentDelta::ToolNote(t) => t,
        }
    }
}

/// A streaming response request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Model identifier the host configured for voice responses.
    pub model: String,
    /// System prompt, already combined with voice guidelines.
    pub system_prompt: String,
    /// Conversation history, oldest first. The final entry is the user
    /// turn that triggered this request.
    pub history: Vec<Turn>,
}

/// Streaming language-model engine.
///
/// The returned channel yields deltas as they arrive and closes when the
/// response is complete. Implementations must stop promptly when `cancel`
/// fires; a cancelled stream simply closes early.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    async fn stream_reply(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentDelta>>;
}
