//! Per-connection bridge runtime.
//!
//! One `handle_socket` per accepted gateway WebSocket: a writer task
//! drains the connection's outbound queue (with a hard per-send budget),
//! a health task pings on an interval, and the read loop dispatches wire
//! messages. `session_start` wires up the per-call pipeline — upstream
//! first, so a session is never stored around a transcription stream that
//! never came up — and hands it to a dedicated call task.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use voice_bridge_config::TtsMode;
use voice_bridge_core::{
    pcm_bytes_to_samples, samples_to_pcm_bytes, BridgeError, CallDirection, CallId, CallStatus,
    CallerInfo, EndReason, Result, ToolCallContext, TurnRole, FRAME_BYTES_16K,
};
use voice_bridge_pipeline::{
    upsample_16k_to_24k, ChunkedVoiceController, FrameSink, PlayoutPacer, RealtimeEvent,
    RealtimeVoiceAgent, SttEvent, SttStream,
};

use crate::connection::{Connection, WriterItem};
use crate::protocol::{
    decode_client_message, encode_server_message, ClientMessage, ServerMessage, CLOSE_TOO_BIG,
    MAX_MESSAGE_BYTES, MAX_OVERSIZE_STRIKES,
};
use crate::session::CallSession;
use crate::state::AppState;

/// Budget for one socket send before the connection is declared dead.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Health ping cadence; one missed pong terminates the connection.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a dropped connection's session waits for `session_resume`
/// before it is torn down.
const RESUME_GRACE: Duration = Duration::from_secs(5);

/// Drive one gateway connection to completion.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (conn, mut outbound_rx) = Connection::new();
    state.connections.insert(conn.clone());
    tracing::info!(connection = conn.id(), "Gateway connected");

    let writer = {
        let conn = conn.clone();
        tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                let frame = match item {
                    WriterItem::Message(message) => {
                        Message::Text(encode_server_message(&message))
                    }
                    WriterItem::Ping => Message::Ping(Vec::new()),
                    WriterItem::Close(code, reason) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                };
                match tokio::time::timeout(SEND_TIMEOUT, ws_tx.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(connection = conn.id(), error = %e, "Socket write failed");
                        conn.close();
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(connection = conn.id(), "Socket write timed out");
                        conn.close();
                        break;
                    }
                }
            }
        })
    };

    let health = {
        let conn = conn.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = conn.closed().cancelled() => break,
                    _ = interval.tick() => {
                        if !conn.take_pong() {
                            tracing::warn!(connection = conn.id(), "Missed pong, terminating connection");
                            conn.close();
                            break;
                        }
                        if conn.ping().await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let mut oversize_strikes: u32 = 0;

    loop {
        tokio::select! {
            _ = conn.closed().cancelled() => break,
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_MESSAGE_BYTES {
                            oversize_strikes += 1;
                            tracing::warn!(
                                connection = conn.id(),
                                bytes = text.len(),
                                strikes = oversize_strikes,
                                "Oversize message dropped"
                            );
                            if oversize_strikes >= MAX_OVERSIZE_STRIKES {
                                conn.close_with(CLOSE_TOO_BIG, "too many oversize messages").await;
                                break;
                            }
                            continue;
                        }
                        match decode_client_message(&text) {
                            Ok(message) => dispatch(&state, &conn, message).await,
                            Err(e) => {
                                tracing::debug!(connection = conn.id(), error = %e, "Dropped malformed message");
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => conn.mark_pong(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(connection = conn.id(), error = %e, "Socket read failed");
                        break;
                    }
                }
            }
        }
    }

    conn.close();
    state.connections.remove(conn.id());
    state.coordinator.fail_for_connection(conn.id());

    // Leave the session in place briefly so a reconnecting gateway can
    // claim it with session_resume; tear it down if nobody does.
    if let Some(call_id) = conn.bound_call() {
        let state = state.clone();
        let conn_id = conn.id().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(RESUME_GRACE).await;
            let still_bound = state
                .registry
                .get(&call_id)
                .is_some_and(|s| s.is_bound_to(&conn_id));
            if still_bound {
                tracing::warn!(call_id = %call_id, "Connection lost and no resume arrived, ending call");
                end_call(&state, &call_id, EndReason::Error, false).await;
            }
        });
    }

    writer.abort();
    health.abort();
    tracing::info!(connection = conn.id(), "Gateway disconnected");
}

async fn dispatch(state: &AppState, conn: &Arc<Connection>, message: ClientMessage) {
    match message {
        ClientMessage::AuthRequest {
            call_id,
            correlation_id,
            metadata,
        } => {
            let decision = crate::authorize::authorize(
                &state.settings.authorization,
                &metadata,
                &call_id,
            );
            let response = ServerMessage::AuthResponse {
                call_id,
                correlation_id,
                authorized: decision.authorized,
                reason: decision.reason,
                strategy: decision.strategy.to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            let _ = conn.send(response).await;
        }

        ClientMessage::SessionStart {
            call_id,
            direction,
            metadata,
        } => {
            start_call(state, conn, call_id, direction, metadata).await;
        }

        ClientMessage::AudioIn { call_id, seq, data } => {
            let Some(session) = state.registry.get(&call_id) else {
                tracing::debug!(call_id = %call_id, "Audio for unknown call dropped");
                return;
            };
            if !session.is_bound_to(conn.id()) {
                // Frames from a connection that does not own the call.
                session.note_frame_dropped();
                return;
            }
            let Ok(pcm16) = BASE64.decode(&data) else {
                session.note_frame_dropped();
                return;
            };
            if pcm16.len() != FRAME_BYTES_16K {
                session.note_frame_dropped();
                return;
            }
            session.note_frame_received(seq);
            session.forward_audio(pcm16);
        }

        ClientMessage::CallStatus {
            call_id,
            status,
            error,
        } => {
            state.coordinator.note_call_status(&call_id, status, error);
        }

        ClientMessage::SessionEnd { call_id, reason } => {
            end_call(state, &call_id, reason, false).await;
            conn.clear_call();
        }

        ClientMessage::SessionResume {
            call_id,
            last_received_seq,
        } => {
            match state.registry.get(&call_id) {
                Some(session) => {
                    session.rebind(conn.id().to_string());
                    conn.bind_call(call_id.clone());
                    tracing::info!(
                        call_id = %call_id,
                        last_received_seq,
                        "Session resumed on new connection"
                    );
                }
                None => {
                    tracing::warn!(call_id = %call_id, "Resume for unknown call ignored");
                }
            }
        }

        ClientMessage::Ping { call_id } => {
            conn.mark_pong();
            let _ = conn.send(ServerMessage::Pong { call_id }).await;
        }
    }
}

enum Upstream {
    Chunked(SttStream, mpsc::Receiver<SttEvent>),
    Realtime(RealtimeVoiceAgent, mpsc::Receiver<RealtimeEvent>),
}

async fn start_call(
    state: &AppState,
    conn: &Arc<Connection>,
    call_id: CallId,
    direction: CallDirection,
    metadata: CallerInfo,
) {
    if direction == CallDirection::Inbound && !state.settings.inbound.enabled {
        tracing::info!(call_id = %call_id, "Inbound calling disabled, hanging up");
        let _ = conn.send(ServerMessage::Hangup { call_id }).await;
        return;
    }
    if let Some(existing) = conn.bound_call() {
        if existing != call_id {
            tracing::warn!(
                call_id = %call_id,
                existing = %existing,
                "Connection already carries a call, ignoring session_start"
            );
            return;
        }
    }

    let session = CallSession::new(
        call_id.clone(),
        direction,
        metadata.clone(),
        conn.id().to_string(),
    );
    let sink: Arc<dyn FrameSink> = Arc::new(ConnectionFrameSink {
        connections: state.connections.clone(),
        session: session.clone(),
    });
    let pacer = Arc::new(PlayoutPacer::new(sink));

    // Upstream first: if the speech pipeline cannot come up, the session
    // is never stored and any pending outbound call is rejected now.
    let upstream = match connect_upstream(state, &session, pacer.clone()).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::error!(call_id = %call_id, error = %e, "Speech pipeline failed to start");
            state
                .coordinator
                .note_call_status(&call_id, CallStatus::Failed, Some(e.to_string()));
            let _ = conn.send(ServerMessage::Hangup { call_id }).await;
            return;
        }
    };

    if let Err(e) = state.registry.admit(session.clone()) {
        tracing::warn!(call_id = %call_id, error = %e, "Session rejected");
        state
            .coordinator
            .note_call_status(&call_id, CallStatus::Failed, Some(e.to_string()));
        let _ = conn.send(ServerMessage::Hangup { call_id }).await;
        return;
    }
    conn.bind_call(call_id.clone());
    session.mark_answered();
    if direction == CallDirection::Outbound {
        state.coordinator.note_session_start(&call_id);
    }
    state.recorder.record_call_start(&session).await;

    // Max-duration watchdog.
    {
        let state = state.clone();
        let session = session.clone();
        let max_duration = state.registry.max_duration();
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = tokio::time::sleep(max_duration) => {
                    tracing::warn!(call_id = %session.call_id, "Call hit max duration");
                    end_call(&state, &session.call_id, EndReason::Timeout, true).await;
                }
            }
        });
    }

    let greeting = match direction {
        CallDirection::Inbound => state.settings.inbound.greeting.clone(),
        CallDirection::Outbound => None,
    };

    match upstream {
        Upstream::Chunked(stt, events) => {
            let state = state.clone();
            tokio::spawn(run_call_chunked(state, session, pacer, stt, events, greeting));
        }
        Upstream::Realtime(agent, events) => {
            let state = state.clone();
            tokio::spawn(run_call_realtime(state, session, agent, events));
        }
    }
}

async fn connect_upstream(
    state: &AppState,
    session: &Arc<CallSession>,
    pacer: Arc<PlayoutPacer>,
) -> Result<Upstream> {
    match state.settings.effective_tts_mode() {
        TtsMode::Realtime => {
            let view = state.realtime_view()?;
            let conversation_key = session.caller.conversation_key();
            let conversation = conversation_key
                .as_deref()
                .map(|k| state.conversations.acquire(k));
            let ctx = ToolCallContext {
                call_id: session.call_id.to_string(),
                user_id: session.caller.user_id.clone(),
                session_id: conversation.as_ref().map(|c| c.session_id().to_string()),
                session_key: conversation_key,
                ..Default::default()
            };
            let (agent, events) = RealtimeVoiceAgent::connect(
                view,
                state.tool_executor.clone(),
                ctx,
                pacer,
                session.cancel.clone(),
            )
            .await?;
            Ok(Upstream::Realtime(agent, events))
        }
        _ => {
            let (stt, events) = SttStream::connect(state.stt_config()?).await?;
            Ok(Upstream::Chunked(stt, events))
        }
    }
}

async fn run_call_chunked(
    state: AppState,
    session: Arc<CallSession>,
    pacer: Arc<PlayoutPacer>,
    stt: SttStream,
    mut stt_events: mpsc::Receiver<SttEvent>,
    greeting: Option<String>,
) {
    let controller = Arc::new(ChunkedVoiceController::new(
        state.controller_config(),
        state.engine.clone(),
        state.synthesizer.clone(),
        pacer,
    ));
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
    session.set_audio_tx(audio_tx);
    let conversation = session
        .caller
        .conversation_key()
        .map(|key| state.conversations.acquire(&key));

    if let Some(text) = greeting {
        let controller = controller.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.speak(&text, &session.cancel).await {
                tracing::debug!(call_id = %session.call_id, error = %e, "Greeting playback ended early");
            }
        });
    }

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,

            frame = audio_rx.recv() => {
                let Some(pcm16) = frame else { break };
                let samples = pcm_bytes_to_samples(&pcm16);
                let upsampled = upsample_16k_to_24k(&samples);
                stt.send_frame(samples_to_pcm_bytes(&upsampled));
            }

            event = stt_events.recv() => {
                match event {
                    Some(SttEvent::Partial(text)) => {
                        tracing::trace!(call_id = %session.call_id, %text, "Partial transcript");
                    }
                    Some(SttEvent::Final(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        tracing::info!(call_id = %session.call_id, %text, "Final transcript");
                        state
                            .recorder
                            .record_final_transcript(&session, TurnRole::User, &text)
                            .await;

                        let history = match &conversation {
                            Some(c) => {
                                c.append(TurnRole::User, &text);
                                c.history()
                            }
                            None => vec![voice_bridge_core::Turn::new(TurnRole::User, &text)],
                        };

                        // Respond on its own task so caller audio keeps
                        // flowing to the transcription stream meanwhile.
                        let controller = controller.clone();
                        let session = session.clone();
                        let conversation = conversation.clone();
                        let state = state.clone();
                        tokio::spawn(async move {
                            match controller.respond(history, &session.cancel).await {
                                Ok(reply) => {
                                    if let Some(c) = &conversation {
                                        c.append(TurnRole::Bot, &reply);
                                    }
                                    state
                                        .recorder
                                        .record_final_transcript(&session, TurnRole::Bot, &reply)
                                        .await;
                                }
                                Err(BridgeError::Cancelled) => {
                                    tracing::debug!(call_id = %session.call_id, "Response cancelled");
                                }
                                Err(BridgeError::Timeout(_)) => {
                                    // Turn ended quietly; the call stays up.
                                }
                                Err(e) => {
                                    tracing::warn!(call_id = %session.call_id, error = %e, "Response failed");
                                }
                            }
                        });
                    }
                    Some(SttEvent::SpeechStarted) => {
                        controller.on_user_speaking().await;
                    }
                    Some(SttEvent::Failed(message)) => {
                        tracing::error!(call_id = %session.call_id, %message, "Transcription stream lost");
                        end_call(&state, &session.call_id, EndReason::Error, true).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    stt.close();
    tracing::debug!(call_id = %session.call_id, "Chunked call task finished");
}

async fn run_call_realtime(
    state: AppState,
    session: Arc<CallSession>,
    agent: RealtimeVoiceAgent,
    mut events: mpsc::Receiver<RealtimeEvent>,
) {
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
    session.set_audio_tx(audio_tx);
    let conversation = session
        .caller
        .conversation_key()
        .map(|key| state.conversations.acquire(&key));

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,

            frame = audio_rx.recv() => {
                let Some(pcm16) = frame else { break };
                let samples = pcm_bytes_to_samples(&pcm16);
                let upsampled = upsample_16k_to_24k(&samples);
                agent.send_audio(samples_to_pcm_bytes(&upsampled));
            }

            event = events.recv() => {
                match event {
                    Some(RealtimeEvent::UserTranscript(text)) => {
                        if let Some(c) = &conversation {
                            c.append(TurnRole::User, &text);
                        }
                        state
                            .recorder
                            .record_final_transcript(&session, TurnRole::User, &text)
                            .await;
                    }
                    Some(RealtimeEvent::BotTranscript(text)) => {
                        if let Some(c) = &conversation {
                            c.append(TurnRole::Bot, &text);
                        }
                        state
                            .recorder
                            .record_final_transcript(&session, TurnRole::Bot, &text)
                            .await;
                    }
                    Some(RealtimeEvent::SessionExpired) => {
                        end_call(&state, &session.call_id, EndReason::Timeout, true).await;
                        break;
                    }
                    Some(RealtimeEvent::Failed(message)) => {
                        tracing::error!(call_id = %session.call_id, %message, "Realtime session lost");
                        end_call(&state, &session.call_id, EndReason::Error, true).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    agent.close();
    tracing::debug!(call_id = %session.call_id, "Realtime call task finished");
}

/// Tear a call down: cancel its tasks, record the end, optionally tell
/// the gateway to hang up.
pub async fn end_call(state: &AppState, call_id: &CallId, reason: EndReason, notify_gateway: bool) {
    let Some(session) = state.registry.remove(call_id) else {
        return;
    };
    session.cancel.cancel();
    state.recorder.record_call_end(&session, reason).await;

    if let Some(conn) = state.connections.get(&session.connection_id()) {
        if notify_gateway {
            let _ = conn
                .send(ServerMessage::Hangup {
                    call_id: call_id.clone(),
                })
                .await;
        }
        conn.clear_call();
    }
    tracing::info!(call_id = %call_id, ?reason, "Call ended");
}

/// Shutdown sweep: hang up every live call and fail pending dials.
pub async fn stop_all(state: &AppState) {
    state.coordinator.fail_all();
    for session in state.registry.all() {
        end_call(state, &session.call_id, EndReason::HangupBot, true).await;
    }
}

/// Routes paced frames onto whichever connection currently owns the call.
struct ConnectionFrameSink {
    connections: Arc<crate::connection::ConnectionSet>,
    session: Arc<CallSession>,
}

#[async_trait::async_trait]
impl FrameSink for ConnectionFrameSink {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let conn = self
            .connections
            .get(&self.session.connection_id())
            .ok_or(BridgeError::GatewayNotConnected)?;
        let seq = self.session.next_sent_seq();
        conn.send(ServerMessage::AudioOut {
            call_id: self.session.call_id.clone(),
            seq,
            data: BASE64.encode(&frame),
        })
        .await?;
        self.session.note_frame_sent();
        Ok(())
    }

    async fn send_flush(&self) -> Result<()> {
        let conn = self
            .connections
            .get(&self.session.connection_id())
            .ok_or(BridgeError::GatewayNotConnected)?;
        conn.send(ServerMessage::Flush {
            call_id: self.session.call_id.clone(),
        })
        .await
    }
}
