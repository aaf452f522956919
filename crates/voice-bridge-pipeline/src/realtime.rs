//! Realtime voice agent.
//!
//! The alternative to the chunked pipeline: one bidirectional session with
//! a realtime AI endpoint that does STT, response generation and synthesis
//! in-house. The bridge's job shrinks to shipping caller audio up,
//! pacing response audio down through the same playout machinery as
//! chunked mode, executing tool calls, and honoring the endpoint's own
//! barge-in signalling. The endpoint cancels its own response on user
//! speech; the bridge never sends a client-side cancel.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use voice_bridge_agent::{clamp_tool_result, filter_voice_tools};
use voice_bridge_config::{TurnDetectionConfig, TurnDetectionKind};
use voice_bridge_core::{BridgeError, Result, ToolCallContext, ToolExecutor, ToolSpec};

use crate::frames::FrameAssembler;
use crate::ordered_queue::OrderedAudioQueue;
use crate::pacer::PlayoutPacer;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the realtime session needs from configuration, flattened.
#[derive(Debug, Clone)]
pub struct RealtimeConfigView {
    /// Realtime endpoint, e.g. `wss://api.openai.com/v1/realtime`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    /// Agent system prompt combined with voice guidelines.
    pub instructions: String,
    pub turn_detection: TurnDetectionConfig,
    pub tools_allow: Option<Vec<String>>,
    pub tools_deny: Option<Vec<String>>,
    pub max_session_duration: Duration,
    pub jitter_buffer_frames: usize,
}

/// Events the per-call control task consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// Final transcript of a user turn.
    UserTranscript(String),
    /// Transcript of a finished bot response.
    BotTranscript(String),
    /// The session hit its configured duration limit.
    SessionExpired,
    /// The upstream socket died; the call must end.
    Failed(String),
}

/// Handle to a live realtime session.
pub struct RealtimeVoiceAgent {
    audio_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl RealtimeVoiceAgent {
    /// Connect, configure the session and start the event loop.
    pub async fn connect(
        view: RealtimeConfigView,
        executor: Arc<dyn ToolExecutor>,
        tool_ctx: ToolCallContext,
        pacer: Arc<PlayoutPacer>,
        session_cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<RealtimeEvent>)> {
        let socket = dial(&view).await?;

        let tools = filter_voice_tools(
            executor.list_tools(),
            view.tools_allow.as_deref(),
            view.tools_deny.as_deref(),
        );

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (event_tx, event_rx) = mpsc::channel::<RealtimeEvent>(32);
        let cancel = session_cancel.child_token();

        let session = SessionTask {
            view,
            tools,
            executor,
            tool_ctx,
            pacer,
            event_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(session.run(socket, audio_rx));

        Ok((Self { audio_tx, cancel }, event_rx))
    }

    /// Forward one 24 kHz frame of caller audio.
    pub fn send_audio(&self, pcm24: Vec<u8>) {
        if self.audio_tx.try_send(pcm24).is_err() {
            tracing::trace!("Realtime uplink full, dropping frame");
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RealtimeVoiceAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dial(view: &RealtimeConfigView) -> Result<Socket> {
    let url = format!("{}?model={}", view.base_url, view.model);
    let mut request = url
        .into_client_request()
        .map_err(|e| BridgeError::UpstreamUnavailable(format!("bad realtime url: {}", e)))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", view.api_key)
            .parse()
            .map_err(|_| BridgeError::Internal("invalid api key header".into()))?,
    );
    request.headers_mut().insert(
        "OpenAI-Beta",
        "realtime=v1"
            .parse()
            .map_err(|_| BridgeError::Internal("invalid beta header".into()))?,
    );

    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| BridgeError::UpstreamUnavailable(format!("realtime connect: {}", e)))?;
    Ok(socket)
}

/// Build the session configuration message.
fn build_session_update(view: &RealtimeConfigView, tools: &[ToolSpec]) -> Value {
    let turn_detection = match view.turn_detection.kind {
        TurnDetectionKind::ServerVad => json!({
            "type": "server_vad",
            "threshold": view.turn_detection.threshold,
            "silence_duration_ms": view.turn_detection.silence_duration_ms,
            "prefix_padding_ms": view.turn_detection.prefix_padding_ms,
        }),
        TurnDetectionKind::None => Value::Null,
    };

    let tool_defs: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();

    json!({
        "type": "session.update",
        "session": {
            "voice": view.voice,
            "instructions": view.instructions,
            "modalities": ["audio", "text"],
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "turn_detection": turn_detection,
            "tools": tool_defs,
            "tool_choice": "auto",
        },
    })
}

/// One in-flight response's playout state.
struct Playback {
    queue: Arc<OrderedAudioQueue>,
    finished_tx: watch::Sender<bool>,
    assembler: FrameAssembler,
    /// Set on barge-in; deltas are discarded until the endpoint confirms
    /// the response is over.
    interrupted: bool,
}

struct SessionTask {
    view: RealtimeConfigView,
    tools: Vec<ToolSpec>,
    executor: Arc<dyn ToolExecutor>,
    tool_ctx: ToolCallContext,
    pacer: Arc<PlayoutPacer>,
    event_tx: mpsc::Sender<RealtimeEvent>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(self, mut socket: Socket, mut audio_rx: mpsc::Receiver<Vec<u8>>) {
        let update = build_session_update(&self.view, &self.tools);
        if let Ok(json) = serde_json::to_string(&update) {
            if socket.send(WsMessage::Text(json)).await.is_err() {
                let _ = self
                    .event_tx
                    .send(RealtimeEvent::Failed("session configuration failed".into()))
                    .await;
                return;
            }
        }
        tracing::info!(model = %self.view.model, tools = self.tools.len(), "Realtime session configured");

        let expiry = tokio::time::sleep(self.view.max_session_duration);
        tokio::pin!(expiry);

        let mut playback: Option<Playback> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = socket.close(None).await;
                    break;
                }
                _ = &mut expiry => {
                    tracing::info!("Realtime session reached its duration limit");
                    let _ = self.event_tx.send(RealtimeEvent::SessionExpired).await;
                    let _ = socket.close(None).await;
                    break;
                }
                frame = audio_rx.recv() => {
                    let Some(pcm) = frame else { break };
                    let append = json!({
                        "type": "input_audio_buffer.append",
                        "audio": BASE64.encode(&pcm),
                    })
                    .to_string();
                    if socket.send(WsMessage::Text(append)).await.is_err() {
                        let _ = self
                            .event_tx
                            .send(RealtimeEvent::Failed("realtime socket send failed".into()))
                            .await;
                        break;
                    }
                }
                message = socket.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if self.handle_event(&text, &mut playback, &mut socket).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            let _ = self
                                .event_tx
                                .send(RealtimeEvent::Failed("realtime socket closed".into()))
                                .await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = self
                                .event_tx
                                .send(RealtimeEvent::Failed(format!("realtime socket error: {}", e)))
                                .await;
                            break;
                        }
                    }
                }
            }
        }

        if let Some(playback) = playback.take() {
            playback.queue.clear();
            let _ = playback.finished_tx.send(true);
        }
    }

    async fn handle_event(
        &self,
        text: &str,
        playback: &mut Option<Playback>,
        socket: &mut Socket,
    ) -> Result<()> {
        let event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable realtime event");
                return Ok(());
            }
        };
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");

        match event_type {
            "session.created" | "session.updated" => {
                tracing::debug!(event_type, "Realtime session ready");
            }

            "response.created" => {
                let queue = Arc::new(OrderedAudioQueue::new(self.view.jitter_buffer_frames));
                let (finished_tx, finished_rx) = watch::channel(false);
                // The pacer's drain lock queues this behind any playout
                // still finishing from the previous response.
                let _ = self
                    .pacer
                    .start_drain(queue.clone(), finished_rx, self.cancel.clone());
                *playback = Some(Playback {
                    queue,
                    finished_tx,
                    assembler: FrameAssembler::new(),
                    interrupted: false,
                });
            }

            "response.audio.delta" => {
                if let Some(pb) = playback.as_mut() {
                    if pb.interrupted || self.pacer.in_recovery_window() {
                        // Stale audio from a response that was barged in.
                        return Ok(());
                    }
                    if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                        if let Ok(pcm24) = BASE64.decode(delta) {
                            for frame in pb.assembler.push_pcm24(&pcm24) {
                                pb.queue.push_frame(0, frame);
                            }
                        }
                    }
                }
            }

            "response.audio.done" => {
                if let Some(pb) = playback.as_mut() {
                    if !pb.interrupted {
                        if let Some(tail) = pb.assembler.flush() {
                            pb.queue.push_frame(0, tail);
                        }
                    }
                    pb.queue.complete(0);
                }
            }

            "response.done" | "response.cancelled" => {
                if let Some(pb) = playback.take() {
                    pb.queue.complete(0);
                    let _ = pb.finished_tx.send(true);
                }
            }

            "input_audio_buffer.speech_started" => {
                // The endpoint cancels its own response; locally we stop
                // playout and tell the gateway to drop its buffer.
                if let Some(pb) = playback.as_mut() {
                    if !pb.interrupted {
                        tracing::info!("Realtime barge-in: clearing playout");
                        pb.interrupted = true;
                        pb.assembler.clear();
                        self.pacer.interrupt(&pb.queue).await;
                        let _ = pb.finished_tx.send(true);
                    }
                }
            }

            "conversation.item.input_audio_transcription.completed" => {
                if let Some(transcript) = event.get("transcript").and_then(Value::as_str) {
                    let _ = self
                        .event_tx
                        .send(RealtimeEvent::UserTranscript(transcript.to_string()))
                        .await;
                }
            }

            "response.audio_transcript.done" => {
                if let Some(transcript) = event.get("transcript").and_then(Value::as_str) {
                    let _ = self
                        .event_tx
                        .send(RealtimeEvent::BotTranscript(transcript.to_string()))
                        .await;
                }
            }

            "response.function_call_arguments.done" => {
                self.run_tool_call(&event, socket).await?;
            }

            "error" => {
                tracing::warn!(event = %text, "Realtime service error event");
            }

            _ => {}
        }

        Ok(())
    }

    /// Execute a completed tool call and hand the result back so the model
    /// can continue its response.
    async fn run_tool_call(&self, event: &Value, socket: &mut Socket) -> Result<()> {
        let name = event.get("name").and_then(Value::as_str).unwrap_or("");
        let call_id = event.get("call_id").and_then(Value::as_str).unwrap_or("");
        let raw_args = event.get("arguments").and_then(Value::as_str).unwrap_or("{}");

        if !self.tools.iter().any(|t| t.name == name) {
            tracing::warn!(tool = name, "Model called a tool outside the advertised set");
            return Ok(());
        }

        let args: Value = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));
        let mut ctx = self.tool_ctx.clone();
        ctx.tool_call_id = Some(call_id.to_string());

        let output = match self.executor.execute(name, args, &ctx).await {
            Ok(value) => clamp_tool_result(&value),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "Tool execution failed");
                format!("error: {}", e)
            }
        };

        let item = json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            },
        })
        .to_string();
        let trigger = json!({ "type": "response.create" }).to_string();

        socket
            .send(WsMessage::Text(item))
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("tool result send: {}", e)))?;
        socket
            .send(WsMessage::Text(trigger))
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("response trigger send: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view() -> RealtimeConfigView {
        RealtimeConfigView {
            base_url: "wss://example.test/v1/realtime".into(),
            api_key: "key".into(),
            model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
            instructions: "be brief".into(),
            turn_detection: TurnDetectionConfig::default(),
            tools_allow: None,
            tools_deny: None,
            max_session_duration: Duration::from_secs(840),
            jitter_buffer_frames: 25,
        }
    }

    fn tool(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: "a tool".into(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn session_update_carries_voice_and_formats() {
        let update = build_session_update(&view(), &[]);
        assert_eq!(update["type"], "session.update");
        let session = &update["session"];
        assert_eq!(session["voice"], "alloy");
        assert_eq!(session["input_audio_format"], "pcm16");
        assert_eq!(session["output_audio_format"], "pcm16");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
    }

    #[test]
    fn session_update_disables_turn_detection_when_configured() {
        let mut v = view();
        v.turn_detection.kind = TurnDetectionKind::None;
        let update = build_session_update(&v, &[]);
        assert!(update["session"]["turn_detection"].is_null());
    }

    #[test]
    fn session_update_advertises_tools_as_functions() {
        let tools = vec![tool("get_weather"), tool("set_reminder")];
        let update = build_session_update(&view(), &tools);
        let defs = update["session"]["tools"].as_array().unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0]["type"], "function");
        assert_eq!(defs[0]["name"], "get_weather");
        assert!(defs[0]["parameters"].is_object());
    }
}
