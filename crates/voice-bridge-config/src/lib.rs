//! Configuration for the voice call bridge.

mod settings;

pub use settings::{
    AuthorizationConfig, AuthorizationMode, BridgeConfig, InboundConfig, LimitsConfig,
    OutboundConfig, OutboundMode, RealtimeConfig, ResponseConfig, ServeConfig, Settings,
    StreamingConfig, TtsConfig, TtsMode, TurnDetectionConfig, TurnDetectionKind, VoiceToolsConfig,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}
