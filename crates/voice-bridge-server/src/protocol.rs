//! Wire protocol between the media gateway and the bridge.
//!
//! Every message is one UTF-8 JSON object per WebSocket text frame with a
//! `type` discriminator. Violations are protocol errors: the offending
//! message is dropped and the connection survives, except repeated
//! oversize frames which close with 1009.

use serde::{Deserialize, Serialize};

use voice_bridge_core::{
    BridgeError, CallDirection, CallId, CallStatus, CallerInfo, EndReason, Result,
};

/// Hard cap on one wire message.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Hard cap on a base64 audio payload.
pub const MAX_AUDIO_B64_BYTES: usize = 2048;

/// Oversize strikes before the connection closes with 1009.
pub const MAX_OVERSIZE_STRIKES: u32 = 3;

/// WebSocket close code for repeated oversize frames.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// WebSocket close code for a failed secret check.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Gateway → bridge messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Sent before the gateway accepts a call.
    #[serde(rename_all = "camelCase")]
    AuthRequest {
        call_id: CallId,
        correlation_id: String,
        metadata: CallerInfo,
    },
    /// Call media established.
    #[serde(rename_all = "camelCase")]
    SessionStart {
        call_id: CallId,
        direction: CallDirection,
        metadata: CallerInfo,
    },
    /// Outbound call progress.
    #[serde(rename_all = "camelCase")]
    CallStatus {
        call_id: CallId,
        status: CallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 20 ms of caller audio at 16 kHz.
    #[serde(rename_all = "camelCase")]
    AudioIn {
        call_id: CallId,
        seq: u64,
        data: String,
    },
    /// Call terminated on the gateway side.
    #[serde(rename_all = "camelCase")]
    SessionEnd { call_id: CallId, reason: EndReason },
    /// Rebind an existing session after a reconnect.
    #[serde(rename_all = "camelCase")]
    SessionResume {
        call_id: CallId,
        last_received_seq: u64,
    },
    /// Application-level health probe.
    #[serde(rename_all = "camelCase")]
    Ping { call_id: CallId },
}

impl ClientMessage {
    pub fn call_id(&self) -> &CallId {
        match self {
            ClientMessage::AuthRequest { call_id, .. }
            | ClientMessage::SessionStart { call_id, .. }
            | ClientMessage::CallStatus { call_id, .. }
            | ClientMessage::AudioIn { call_id, .. }
            | ClientMessage::SessionEnd { call_id, .. }
            | ClientMessage::SessionResume { call_id, .. }
            | ClientMessage::Ping { call_id } => call_id,
        }
    }
}

/// Target of an outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CallTarget {
    #[serde(rename_all = "camelCase")]
    User { user_id: String },
    Phone { number: String },
}

/// Bridge → gateway messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Synchronous reply to `auth_request`.
    #[serde(rename_all = "camelCase")]
    AuthResponse {
        call_id: CallId,
        correlation_id: String,
        authorized: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        strategy: String,
        timestamp: i64,
    },
    /// Ask the gateway to start an outbound call.
    #[serde(rename_all = "camelCase")]
    InitiateCall {
        call_id: CallId,
        target: CallTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// 20 ms of bot audio at 16 kHz.
    #[serde(rename_all = "camelCase")]
    AudioOut {
        call_id: CallId,
        seq: u64,
        data: String,
    },
    /// Drop buffered playout on the gateway (barge-in).
    #[serde(rename_all = "camelCase")]
    Flush { call_id: CallId },
    /// Bridge-initiated call end.
    #[serde(rename_all = "camelCase")]
    Hangup { call_id: CallId },
    /// Health reply.
    #[serde(rename_all = "camelCase")]
    Pong { call_id: CallId },
}

/// Decode one inbound text frame.
pub fn decode_client_message(text: &str) -> Result<ClientMessage> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(BridgeError::Protocol(format!(
            "message of {} bytes exceeds limit",
            text.len()
        )));
    }
    let message: ClientMessage = serde_json::from_str(text)
        .map_err(|e| BridgeError::Protocol(format!("malformed message: {}", e)))?;
    if let ClientMessage::AudioIn { data, .. } = &message {
        if data.len() > MAX_AUDIO_B64_BYTES {
            return Err(BridgeError::Protocol(format!(
                "audio payload of {} bytes exceeds limit",
                data.len()
            )));
        }
    }
    Ok(message)
}

/// Serialize one outbound message. Our own types always serialize.
pub fn encode_server_message(message: &ServerMessage) -> String {
    serde_json::to_string(message).unwrap()
}
