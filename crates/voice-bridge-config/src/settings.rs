//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ConfigError;

/// Realtime sessions may never outlive the upstream hard cap.
pub const REALTIME_SESSION_HARD_CAP_MS: u64 = 900_000;

/// Main bridge settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Gateway-facing secret and identity
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Listener configuration
    #[serde(default)]
    pub serve: ServeConfig,

    /// Inbound-call handling
    #[serde(default)]
    pub inbound: InboundConfig,

    /// Outbound-call handling
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Speech synthesis
    #[serde(default)]
    pub tts: TtsConfig,

    /// Streaming pipeline (chunked mode) tuning
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Realtime-mode session configuration
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Caller authorization policy
    #[serde(default)]
    pub authorization: AuthorizationConfig,

    /// Call-level resource limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Response generation
    #[serde(default)]
    pub response: ResponseConfig,

    /// Cloud speech API key; may instead come from the environment.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Settings {
    /// Load settings from an optional file layered under `VOICE_BRIDGE_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let cfg = builder
            .add_source(Environment::with_prefix("VOICE_BRIDGE").separator("__"))
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Resolve the cloud speech API key: config first, then environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()))
    }

    /// Validate every bounded option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.secret.len() < 32 {
            return Err(ConfigError::InvalidValue {
                field: "bridge.secret".into(),
                message: "must be at least 32 characters".into(),
            });
        }

        check_range("tts.speed", self.tts.speed, 0.25, 4.0)?;

        let s = &self.streaming;
        check_range("streaming.silence_duration_ms", s.silence_duration_ms, 100, 5_000)?;
        check_range("streaming.vad_threshold", s.vad_threshold, 0.0, 1.0)?;
        check_range("streaming.sentence_min_chars", s.sentence_min_chars, 10, 200)?;
        check_range("streaming.sentence_max_chars", s.sentence_max_chars, 50, 500)?;
        if s.sentence_min_chars >= s.sentence_max_chars {
            return Err(ConfigError::InvalidValue {
                field: "streaming.sentence_min_chars".into(),
                message: "must be below sentence_max_chars".into(),
            });
        }
        check_range("streaming.max_parallel_tts", s.max_parallel_tts, 1, 5)?;
        check_range("streaming.jitter_buffer_frames", s.jitter_buffer_frames, 10, 100)?;

        if self.realtime.max_session_duration_ms > REALTIME_SESSION_HARD_CAP_MS {
            return Err(ConfigError::InvalidValue {
                field: "realtime.max_session_duration_ms".into(),
                message: format!("hard cap is {} ms", REALTIME_SESSION_HARD_CAP_MS),
            });
        }

        check_range("limits.max_concurrent_calls", self.limits.max_concurrent_calls, 1, 100)?;
        check_range("limits.max_duration_seconds", self.limits.max_duration_seconds, 60, 86_400)?;

        Ok(())
    }

    /// Effective mode for a new chunked/realtime decision: `auto` resolves
    /// to realtime only when a realtime-capable model is configured.
    pub fn effective_tts_mode(&self) -> TtsMode {
        match self.streaming.tts_mode {
            TtsMode::Auto => {
                if self.streaming.realtime_model.as_deref().is_some_and(|m| !m.is_empty()) {
                    TtsMode::Realtime
                } else {
                    TtsMode::Chunked
                }
            }
            other => other,
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display + Copy>(
    field: &str,
    value: T,
    min: T,
    max: T,
) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::InvalidValue {
            field: field.into(),
            message: format!("{} is outside [{}, {}]", value, min, max),
        });
    }
    Ok(())
}

/// Gateway-facing identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Shared secret the gateway presents on upgrade (min 32 chars).
    #[serde(default)]
    pub secret: String,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_path")]
    pub path: String,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            path: default_path(),
        }
    }
}

fn default_port() -> u16 {
    8190
}
fn default_bind() -> String {
    "127.0.0.1".into()
}
fn default_path() -> String {
    "/voice".into()
}

/// Inbound-call handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Spoken as soon as an inbound call is established.
    #[serde(default)]
    pub greeting: Option<String>,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            greeting: None,
        }
    }
}

/// Default behavior of an outbound call once answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundMode {
    /// Speak the message and hang up.
    Notify,
    /// Speak the message, then stay on the line and converse.
    Conversation,
}

/// Outbound-call handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ring_timeout_ms")]
    pub ring_timeout_ms: u64,
    #[serde(default = "default_outbound_mode")]
    pub default_mode: OutboundMode,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ring_timeout_ms: default_ring_timeout_ms(),
            default_mode: default_outbound_mode(),
        }
    }
}

fn default_ring_timeout_ms() -> u64 {
    30_000
}
fn default_outbound_mode() -> OutboundMode {
    OutboundMode::Conversation
}

/// Speech synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    /// Speaking rate multiplier, 0.25–4.0.
    #[serde(default = "default_tts_speed")]
    pub speed: f64,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model: default_tts_model(),
            voice: default_tts_voice(),
            speed: default_tts_speed(),
            instructions: None,
        }
    }
}

fn default_tts_model() -> String {
    "gpt-4o-mini-tts".into()
}
fn default_tts_voice() -> String {
    "alloy".into()
}
fn default_tts_speed() -> f64 {
    1.0
}

/// Which response path a call uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsMode {
    Auto,
    Realtime,
    Chunked,
}

/// Streaming pipeline (chunked mode) tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    /// Server-side VAD silence window, 100–5000 ms.
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u64,
    /// Server-side VAD threshold, 0–1.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,
    /// Lower bound for a synthesis chunk, 10–200 chars.
    #[serde(default = "default_sentence_min_chars")]
    pub sentence_min_chars: usize,
    /// Upper bound for a synthesis chunk, 50–500 chars.
    #[serde(default = "default_sentence_max_chars")]
    pub sentence_max_chars: usize,
    /// Concurrent synthesis jobs, 1–5.
    #[serde(default = "default_max_parallel_tts")]
    pub max_parallel_tts: usize,
    /// Initial playout fill, 10–100 frames.
    #[serde(default = "default_jitter_buffer_frames")]
    pub jitter_buffer_frames: usize,
    #[serde(default = "default_tts_mode")]
    pub tts_mode: TtsMode,
    /// Realtime-capable model; presence switches `auto` to realtime.
    #[serde(default)]
    pub realtime_model: Option<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            stt_model: default_stt_model(),
            silence_duration_ms: default_silence_duration_ms(),
            vad_threshold: default_vad_threshold(),
            sentence_min_chars: default_sentence_min_chars(),
            sentence_max_chars: default_sentence_max_chars(),
            max_parallel_tts: default_max_parallel_tts(),
            jitter_buffer_frames: default_jitter_buffer_frames(),
            tts_mode: default_tts_mode(),
            realtime_model: None,
        }
    }
}

fn default_stt_model() -> String {
    "gpt-4o-mini-transcribe".into()
}
fn default_silence_duration_ms() -> u64 {
    700
}
fn default_vad_threshold() -> f64 {
    0.5
}
fn default_sentence_min_chars() -> usize {
    20
}
fn default_sentence_max_chars() -> usize {
    200
}
fn default_max_parallel_tts() -> usize {
    3
}
fn default_jitter_buffer_frames() -> usize {
    25
}
fn default_tts_mode() -> TtsMode {
    TtsMode::Auto
}

/// Upstream turn-detection flavor for realtime sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnDetectionKind {
    ServerVad,
    None,
}

/// Turn detection for realtime sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    #[serde(default = "default_turn_detection_kind")]
    pub kind: TurnDetectionKind,
    #[serde(default = "default_vad_threshold")]
    pub threshold: f64,
    #[serde(default = "default_silence_duration_ms")]
    pub silence_duration_ms: u64,
    #[serde(default = "default_prefix_padding_ms")]
    pub prefix_padding_ms: u64,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            kind: default_turn_detection_kind(),
            threshold: default_vad_threshold(),
            silence_duration_ms: default_silence_duration_ms(),
            prefix_padding_ms: default_prefix_padding_ms(),
        }
    }
}

fn default_turn_detection_kind() -> TurnDetectionKind {
    TurnDetectionKind::ServerVad
}
fn default_prefix_padding_ms() -> u64 {
    300
}

/// Tool exposure overrides for realtime sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceToolsConfig {
    /// Replaces the built-in allow set when present.
    #[serde(default)]
    pub allow: Option<Vec<String>>,
    /// Unioned with the built-in deny set.
    #[serde(default)]
    pub deny: Option<Vec<String>>,
}

/// Realtime-mode session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_realtime_model")]
    pub model: String,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    #[serde(default)]
    pub turn_detection: TurnDetectionConfig,
    #[serde(default)]
    pub tools: VoiceToolsConfig,
    /// Session lifetime; hard-capped at 900 000 ms upstream.
    #[serde(default = "default_max_session_duration_ms")]
    pub max_session_duration_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            model: default_realtime_model(),
            voice: default_tts_voice(),
            turn_detection: TurnDetectionConfig::default(),
            tools: VoiceToolsConfig::default(),
            max_session_duration_ms: default_max_session_duration_ms(),
        }
    }
}

fn default_realtime_model() -> String {
    "gpt-4o-realtime-preview".into()
}
fn default_max_session_duration_ms() -> u64 {
    840_000
}

/// Caller authorization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorizationMode {
    Disabled,
    Open,
    Allowlist,
    TenantOnly,
}

/// Caller authorization policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default = "default_authorization_mode")]
    pub mode: AuthorizationMode,
    /// Lowercased user ids or UPNs accepted under `allowlist`.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Tenant ids accepted under `tenant-only`.
    #[serde(default)]
    pub allowed_tenants: Vec<String>,
    #[serde(default)]
    pub allow_pstn: bool,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            mode: default_authorization_mode(),
            allow_from: Vec::new(),
            allowed_tenants: Vec::new(),
            allow_pstn: false,
        }
    }
}

fn default_authorization_mode() -> AuthorizationMode {
    AuthorizationMode::Disabled
}

/// Call-level resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// 1–100 concurrent calls.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// 60–86400 seconds per call.
    #[serde(default = "default_max_duration_seconds")]
    pub max_duration_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent_calls(),
            max_duration_seconds: default_max_duration_seconds(),
        }
    }
}

fn default_max_concurrent_calls() -> usize {
    5
}
fn default_max_duration_seconds() -> u64 {
    3_600
}

/// Response generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default = "default_response_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_response_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            model: default_response_model(),
            system_prompt: default_system_prompt(),
            timeout_ms: default_response_timeout_ms(),
        }
    }
}

fn default_response_model() -> String {
    "gpt-4o-mini".into()
}
fn default_system_prompt() -> String {
    "You are a helpful assistant on a voice call. Keep answers short and speakable.".into()
}
fn default_response_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        Settings {
            bridge: BridgeConfig {
                secret: "0123456789abcdef0123456789abcdef".into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn defaults_carry_documented_values() {
        let s = Settings::default();
        assert_eq!(s.streaming.sentence_min_chars, 20);
        assert_eq!(s.streaming.sentence_max_chars, 200);
        assert_eq!(s.streaming.max_parallel_tts, 3);
        assert_eq!(s.streaming.jitter_buffer_frames, 25);
        assert_eq!(s.limits.max_concurrent_calls, 5);
        assert_eq!(s.limits.max_duration_seconds, 3_600);
        assert_eq!(s.realtime.max_session_duration_ms, 840_000);
    }

    #[test]
    fn short_secret_rejected() {
        let mut s = valid();
        s.bridge.secret = "short".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn ranges_enforced() {
        let mut s = valid();
        s.tts.speed = 5.0;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.streaming.jitter_buffer_frames = 101;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.realtime.max_session_duration_ms = 900_001;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.limits.max_concurrent_calls = 0;
        assert!(s.validate().is_err());

        assert!(valid().validate().is_ok());
    }

    #[test]
    fn min_chars_must_stay_below_max() {
        let mut s = valid();
        s.streaming.sentence_min_chars = 200;
        s.streaming.sentence_max_chars = 200;
        assert!(s.validate().is_err());
    }

    #[test]
    fn auto_mode_resolution() {
        let mut s = valid();
        s.streaming.tts_mode = TtsMode::Auto;
        assert_eq!(s.effective_tts_mode(), TtsMode::Chunked);

        s.streaming.realtime_model = Some("gpt-4o-realtime-preview".into());
        assert_eq!(s.effective_tts_mode(), TtsMode::Realtime);

        s.streaming.tts_mode = TtsMode::Chunked;
        assert_eq!(s.effective_tts_mode(), TtsMode::Chunked);
    }
}
