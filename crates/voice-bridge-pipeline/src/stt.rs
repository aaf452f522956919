//! Streaming transcription adapter.
//!
//! Holds one WebSocket to the transcription service per call, pushing
//! 24 kHz PCM up and surfacing transcript events back. The upstream does
//! the voice-activity detection; its speech-started notice is what
//! triggers barge-in downstream.
//!
//! A dropped socket reconnects with exponential backoff. Frames that
//! arrive while the socket is down are discarded — the caller is still
//! talking and the transcript of that gap is simply lost, which beats
//! stalling the call.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use voice_bridge_core::{BridgeError, Result};

/// Consecutive reconnect attempts before the stream gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transcription adapter configuration.
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Realtime endpoint, e.g. `wss://api.openai.com/v1/realtime`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub vad_threshold: f64,
    pub silence_duration_ms: u64,
}

/// Events surfaced to the per-call control task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Intermediate transcript; may arrive out of order, never drives turns.
    Partial(String),
    /// Final transcript for one user turn.
    Final(String),
    /// Upstream VAD heard the user start talking.
    SpeechStarted,
    /// Reconnect budget exhausted; the session should end.
    Failed(String),
}

/// Handle to a live transcription stream.
pub struct SttStream {
    audio_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl SttStream {
    /// Open the stream. The first connection must succeed; a session is
    /// never created around a transcription stream that never came up.
    pub async fn connect(config: SttConfig) -> Result<(Self, mpsc::Receiver<SttEvent>)> {
        let socket = dial(&config).await?;

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (event_tx, event_rx) = mpsc::channel::<SttEvent>(64);
        let cancel = CancellationToken::new();

        tokio::spawn(run(config, socket, audio_rx, event_tx, cancel.clone()));

        Ok((Self { audio_tx, cancel }, event_rx))
    }

    /// Queue one 24 kHz frame for upload. Drops the frame when the
    /// uplink is saturated rather than blocking the receive loop.
    pub fn send_frame(&self, pcm24: Vec<u8>) {
        if self.audio_tx.try_send(pcm24).is_err() {
            tracing::trace!("Transcription uplink full, dropping frame");
        }
    }

    /// Close the stream and its socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SttStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Backoff before reconnect attempt `n` (1-based): 1 s × 2^(n−1).
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1) * 2u32.saturating_pow(attempt.saturating_sub(1))
}

async fn dial(config: &SttConfig) -> Result<Socket> {
    let url = format!("{}?intent=transcription", config.base_url);
    let mut request = url
        .into_client_request()
        .map_err(|e| BridgeError::UpstreamUnavailable(format!("bad transcription url: {}", e)))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.api_key)
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
        .map_err(|e| BridgeError::UpstreamUnavailable(format!("transcription connect: {}", e)))?;
    Ok(socket)
}

fn session_update(config: &SttConfig) -> String {
    json!({
        "type": "transcription_session.update",
        "session": {
            "input_audio_format": "pcm16",
            "input_audio_transcription": { "model": config.model },
            "turn_detection": {
                "type": "server_vad",
                "threshold": config.vad_threshold,
                "silence_duration_ms": config.silence_duration_ms,
            },
        },
    })
    .to_string()
}

/// Parse one upstream event into an [`SttEvent`], when it maps to one.
fn parse_event(text: &str) -> Option<SttEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let event_type = value.get("type").and_then(|v| v.as_str())?;

    match event_type {
        "conversation.item.input_audio_transcription.delta" => value
            .get("delta")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .map(|t| SttEvent::Partial(t.to_string())),
        "conversation.item.input_audio_transcription.completed" => value
            .get("transcript")
            .and_then(|v| v.as_str())
            .map(|t| SttEvent::Final(t.to_string())),
        "input_audio_buffer.speech_started" => Some(SttEvent::SpeechStarted),
        "error" => {
            tracing::warn!(event = %text, "Transcription service error event");
            None
        }
        _ => None,
    }
}

async fn run(
    config: SttConfig,
    initial: Socket,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<SttEvent>,
    cancel: CancellationToken,
) {
    let mut socket = Some(initial);
    let mut attempt: u32 = 0;

    loop {
        let current = match socket.take() {
            Some(s) => s,
            None => {
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    tracing::error!(attempts = MAX_RECONNECT_ATTEMPTS, "Transcription reconnect budget exhausted");
                    let _ = event_tx
                        .send(SttEvent::Failed("transcription reconnect failed".into()))
                        .await;
                    return;
                }
                let delay = backoff_delay(attempt);
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting transcription stream");
                if drop_frames_during(delay, &mut audio_rx, &cancel).await {
                    return;
                }
                match dial(&config).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "Transcription reconnect failed");
                        continue;
                    }
                }
            }
        };

        match pump(&config, current, &mut audio_rx, &event_tx, &cancel).await {
            PumpExit::Cancelled => return,
            // A socket that saw traffic earns a fresh retry budget when it
            // drops; one that never came up keeps burning the current one.
            PumpExit::Connected => attempt = 0,
            PumpExit::SocketLost => {}
        }
    }
}

enum PumpExit {
    Cancelled,
    SocketLost,
    /// Session configured and traffic flowed; resets the retry budget.
    Connected,
}

async fn pump(
    config: &SttConfig,
    mut socket: Socket,
    audio_rx: &mut mpsc::Receiver<Vec<u8>>,
    event_tx: &mpsc::Sender<SttEvent>,
    cancel: &CancellationToken,
) -> PumpExit {
    if socket
        .send(WsMessage::Text(session_update(config)))
        .await
        .is_err()
    {
        return PumpExit::SocketLost;
    }

    let mut saw_traffic = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket.close(None).await;
                return PumpExit::Cancelled;
            }
            frame = audio_rx.recv() => {
                let Some(pcm) = frame else {
                    let _ = socket.close(None).await;
                    return PumpExit::Cancelled;
                };
                let append = json!({
                    "type": "input_audio_buffer.append",
                    "audio": BASE64.encode(&pcm),
                })
                .to_string();
                if socket.send(WsMessage::Text(append)).await.is_err() {
                    return if saw_traffic { PumpExit::Connected } else { PumpExit::SocketLost };
                }
            }
            message = socket.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        saw_traffic = true;
                        if let Some(event) = parse_event(&text) {
                            if event_tx.send(event).await.is_err() {
                                return PumpExit::Cancelled;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return if saw_traffic { PumpExit::Connected } else { PumpExit::SocketLost };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Transcription socket error");
                        return if saw_traffic { PumpExit::Connected } else { PumpExit::SocketLost };
                    }
                }
            }
        }
    }
}

/// Sleep out a backoff while discarding inbound frames. Returns true when
/// the stream was cancelled mid-backoff.
async fn drop_frames_during(
    delay: Duration,
    audio_rx: &mut mpsc::Receiver<Vec<u8>>,
    cancel: &CancellationToken,
) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return true,
            _ = &mut deadline => return false,
            frame = audio_rx.recv() => {
                if frame.is_none() {
                    return true;
                }
            }
        }
    }
}
