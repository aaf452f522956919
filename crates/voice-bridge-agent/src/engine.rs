//! Streaming chat engine client.
//!
//! Speaks the OpenAI-compatible chat completion API with `stream: true`
//! and turns server-sent-event deltas into [`AgentDelta`]s. Any endpoint
//! accepting the same request shape works by overriding the base URL.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voice_bridge_core::{AgentDelta, AgentEngine, AgentRequest, BridgeError, Result, TurnRole};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Engine client configuration.
#[derive(Debug, Clone)]
pub struct ChatEngineConfig {
    pub base_url: String,
    pub api_key: String,
}

impl ChatEngineConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// OpenAI-compatible streaming chat client.
pub struct ChatEngine {
    config: ChatEngineConfig,
    http: reqwest::Client,
}

impl ChatEngine {
    pub fn new(config: ChatEngineConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_messages(request: &AgentRequest) -> Vec<Value> {
        let mut messages = vec![json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        for turn in &request.history {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Bot => "assistant",
            };
            messages.push(json!({ "role": role, "content": turn.content }));
        }
        messages
    }
}

#[async_trait]
impl AgentEngine for ChatEngine {
    async fn stream_reply(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentDelta>> {
        let body = json!({
            "model": request.model,
            "messages": Self::build_messages(&request),
            "stream": true,
        });

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("chat request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BridgeError::UpstreamUnavailable(format!(
                "chat completion HTTP {}: {}",
                status, detail
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        let model = request.model.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        tracing::warn!(model = %model, error = %e, "Chat stream read failed");
                        break;
                    }
                    None => break,
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    let Ok(event) = serde_json::from_str::<Value>(payload) else {
                        tracing::debug!(model = %model, "Skipping unparseable stream event");
                        continue;
                    };
                    let delta = event
                        .pointer("/choices/0/delta/content")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if !delta.is_empty() && tx.send(AgentDelta::Text(delta.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
