//! Speech synthesis client.
//!
//! One operation: text in, 24 kHz mono PCM out. The request is aborted the
//! moment the response token fires; partial bodies are discarded, never
//! played.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use voice_bridge_core::{BridgeError, Result};

use crate::scheduler::SpeechSynthesizer;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Per-request budget; synthesis of a sentence chunk is fast or failed.
const SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(15);

/// Synthesis client configuration.
#[derive(Debug, Clone)]
pub struct TtsClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub speed: f64,
    pub instructions: Option<String>,
}

impl TtsClientConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
            speed: 1.0,
            instructions: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }
}

/// HTTP speech-synthesis client returning raw 24 kHz PCM.
pub struct TtsClient {
    config: TtsClientConfig,
    http: reqwest::Client,
}

impl TtsClient {
    pub fn new(config: TtsClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SYNTHESIS_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn speech_url(&self) -> String {
        format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'))
    }

    async fn request(&self, text: &str) -> Result<Vec<u8>> {
        let mut body = json!({
            "model": self.config.model,
            "input": text,
            "voice": self.config.voice,
            "speed": self.config.speed,
            "response_format": "pcm",
        });
        if let Some(instructions) = &self.config.instructions {
            body["instructions"] = json!(instructions);
        }

        let response = self
            .http
            .post(self.speech_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("synthesis request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BridgeError::UpstreamUnavailable(format!(
                "synthesis HTTP {}: {}",
                status, detail
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("synthesis body: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for TtsClient {
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            result = self.request(text) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speech_url_joins_cleanly() {
        let config = TtsClientConfig::new("key", "gpt-4o-mini-tts", "alloy")
            .with_base_url("http://localhost:1234/v1/");
        let client = TtsClient::new(config);
        assert_eq!(client.speech_url(), "http://localhost:1234/v1/audio/speech");
    }

    #[tokio::test]
    async fn cancellation_beats_the_network() {
        // Unroutable address: the request would hang or fail slowly; the
        // pre-cancelled token must win immediately.
        let config = TtsClientConfig::new("key", "gpt-4o-mini-tts", "alloy")
            .with_base_url("http://192.0.2.1:9/v1");
        let client = TtsClient::new(config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client.synthesize("hello", &cancel).await;
        assert!(matches!(result, Err(BridgeError::Cancelled)));
    }
}
