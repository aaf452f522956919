//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use voice_bridge_agent::{ChatEngine, ChatEngineConfig, ConversationStore};
use voice_bridge_config::Settings;
use voice_bridge_core::{
    AgentEngine, BridgeError, CallId, NullSessionStore, NullToolExecutor, Result, SessionStore,
    ToolExecutor,
};
use voice_bridge_pipeline::{
    ControllerConfig, RealtimeConfigView, SpeechSynthesizer, SttConfig, TtsClient, TtsClientConfig,
};

use crate::connection::ConnectionSet;
use crate::outbound::OutboundCoordinator;
use crate::protocol::CallTarget;
use crate::rate_limit::SlidingWindowRateLimiter;
use crate::recorder::SessionRecorder;
use crate::session::SessionRegistry;

const REALTIME_WS_URL: &str = "wss://api.openai.com/v1/realtime";

/// Everything the host injects behind trait seams.
pub struct BridgeDeps {
    pub engine: Arc<dyn AgentEngine>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub session_store: Arc<dyn SessionStore>,
}

impl BridgeDeps {
    /// Default wiring against the cloud speech vendor named in settings.
    /// Hosts embedding the bridge replace any of these.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .resolve_api_key()
            .ok_or_else(|| BridgeError::Internal("no speech API key configured".into()))?;

        let engine = ChatEngine::new(ChatEngineConfig::new(api_key.clone()));
        let synthesizer = TtsClient::new(
            TtsClientConfig::new(
                api_key,
                settings.tts.model.clone(),
                settings.tts.voice.clone(),
            )
            .with_speed(settings.tts.speed)
            .with_instructions(settings.tts.instructions.clone()),
        );

        Ok(Self {
            engine: Arc::new(engine),
            synthesizer: Arc::new(synthesizer),
            tool_executor: Arc::new(NullToolExecutor),
            session_store: Arc::new(NullSessionStore),
        })
    }
}

/// Shared state handed to every connection handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionSet>,
    pub rate_limiter: Arc<SlidingWindowRateLimiter>,
    pub coordinator: Arc<OutboundCoordinator>,
    pub recorder: SessionRecorder,
    pub conversations: Arc<ConversationStore>,
    pub engine: Arc<dyn AgentEngine>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub tool_executor: Arc<dyn ToolExecutor>,
}

impl AppState {
    pub fn new(settings: Settings, deps: BridgeDeps) -> Self {
        let registry = SessionRegistry::new(
            settings.limits.max_concurrent_calls,
            Duration::from_secs(settings.limits.max_duration_seconds),
        );
        let coordinator = OutboundCoordinator::new(settings.outbound.enabled);

        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            connections: Arc::new(ConnectionSet::new()),
            rate_limiter: Arc::new(SlidingWindowRateLimiter::for_listener()),
            coordinator: Arc::new(coordinator),
            recorder: SessionRecorder::new(deps.session_store),
            conversations: Arc::new(ConversationStore::new()),
            engine: deps.engine,
            synthesizer: deps.synthesizer,
            tool_executor: deps.tool_executor,
        }
    }

    /// Controller parameters for a chunked-mode call.
    pub fn controller_config(&self) -> ControllerConfig {
        let s = &self.settings;
        ControllerConfig {
            sentence_min_chars: s.streaming.sentence_min_chars,
            sentence_max_chars: s.streaming.sentence_max_chars,
            max_parallel_tts: s.streaming.max_parallel_tts,
            jitter_buffer_frames: s.streaming.jitter_buffer_frames,
            response_timeout: Duration::from_millis(s.response.timeout_ms),
            model: s.response.model.clone(),
            system_prompt: s.response.system_prompt.clone(),
        }
    }

    /// Transcription adapter parameters.
    pub fn stt_config(&self) -> Result<SttConfig> {
        let s = &self.settings;
        Ok(SttConfig {
            base_url: REALTIME_WS_URL.into(),
            api_key: self.require_api_key()?,
            model: s.streaming.stt_model.clone(),
            vad_threshold: s.streaming.vad_threshold,
            silence_duration_ms: s.streaming.silence_duration_ms,
        })
    }

    /// Realtime session parameters.
    pub fn realtime_view(&self) -> Result<RealtimeConfigView> {
        let s = &self.settings;
        let model = s
            .streaming
            .realtime_model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| s.realtime.model.clone());
        Ok(RealtimeConfigView {
            base_url: REALTIME_WS_URL.into(),
            api_key: self.require_api_key()?,
            model,
            voice: s.realtime.voice.clone(),
            instructions: format!(
                "{}\n\nYou are on a live voice call. Keep replies short, \
                 conversational and free of markup.",
                s.response.system_prompt
            ),
            turn_detection: s.realtime.turn_detection.clone(),
            tools_allow: s.realtime.tools.allow.clone(),
            tools_deny: s.realtime.tools.deny.clone(),
            max_session_duration: Duration::from_millis(s.realtime.max_session_duration_ms),
            jitter_buffer_frames: s.streaming.jitter_buffer_frames,
        })
    }

    fn require_api_key(&self) -> Result<String> {
        self.settings
            .resolve_api_key()
            .ok_or_else(|| BridgeError::Internal("no speech API key configured".into()))
    }

    /// Public API: place an outbound call and wait for it to be answered.
    pub async fn dial(&self, target: CallTarget, message: Option<String>) -> Result<CallId> {
        let call_id = CallId::parse(format!("out-{}", uuid::Uuid::new_v4()))?;
        let ring_timeout = Duration::from_millis(self.settings.outbound.ring_timeout_ms);
        self.coordinator
            .initiate(
                &self.connections,
                call_id.clone(),
                target,
                message,
                ring_timeout,
            )
            .await?;
        Ok(call_id)
    }
}
