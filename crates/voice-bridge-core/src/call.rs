//! Call identifiers and caller metadata.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

static CALL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("call id regex"));

/// Validated call identifier.
///
/// Server-chosen for outbound calls, gateway-chosen for inbound ones; either
/// way it must match `^[A-Za-z0-9_-]{1,128}$` before it touches any table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallId(String);

impl CallId {
    /// Validate and wrap a raw identifier.
    pub fn parse(raw: impl Into<String>) -> Result<Self, BridgeError> {
        let raw = raw.into();
        if CALL_ID_RE.is_match(&raw) {
            Ok(Self(raw))
        } else {
            Err(BridgeError::Protocol(format!("invalid call id: {:?}", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CallId {
    type Error = BridgeError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        CallId::parse(raw)
    }
}

impl From<CallId> for String {
    fn from(id: CallId) -> Self {
        id.0
    }
}

/// Direction of a call relative to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Progress status reported by the gateway for an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Ringing,
    Answered,
    Failed,
    Busy,
    NoAnswer,
}

impl CallStatus {
    /// Terminal statuses resolve a pending outbound call as failed.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, CallStatus::Failed | CallStatus::Busy | CallStatus::NoAnswer)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Failed => "failed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no-answer",
        };
        f.write_str(label)
    }
}

/// Reason a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    HangupUser,
    HangupBot,
    Error,
    Timeout,
}

/// Caller metadata carried on `auth_request` and `session_start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Platform-side call identifier, distinct from our call id.
    #[serde(default)]
    pub teams_call_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl CallerInfo {
    /// Conversation-store key for this caller: `msteams-call:{user id}`,
    /// lowercased so the same person maps to one session across calls.
    pub fn conversation_key(&self) -> Option<String> {
        self.user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| format!("msteams-call:{}", id.to_lowercase()))
    }

    /// True when the caller arrives over the phone network.
    pub fn is_pstn(&self) -> bool {
        self.phone_number.as_deref().is_some_and(|p| !p.is_empty())
    }
}
