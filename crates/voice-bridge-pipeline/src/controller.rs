//! Chunked-mode voice controller.
//!
//! Drives one response at a time: final transcript in, streamed agent text
//! through the chunker into parallel synthesis, reassembled frames out
//! through the pacer. Exactly one response token exists per response; it
//! is the only way playout, pending synthesis and the agent stream stop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use voice_bridge_core::{AgentEngine, AgentRequest, BridgeError, Result, Turn, FRAME_DURATION_MS};

use crate::chunker::SentenceChunker;
use crate::ordered_queue::OrderedAudioQueue;
use crate::pacer::PlayoutPacer;
use crate::scheduler::{SpeechSynthesizer, TtsScheduler};

/// Controller configuration, cut from the streaming/response settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub sentence_min_chars: usize,
    pub sentence_max_chars: usize,
    pub max_parallel_tts: usize,
    pub jitter_buffer_frames: usize,
    pub response_timeout: Duration,
    pub model: String,
    pub system_prompt: String,
}

/// Where the controller is in its response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Streaming,
    Draining,
}

struct ActiveResponse {
    cancel: CancellationToken,
    queue: Arc<OrderedAudioQueue>,
}

/// Per-call controller for the chunked pipeline.
pub struct ChunkedVoiceController {
    config: ControllerConfig,
    engine: Arc<dyn AgentEngine>,
    synth: Arc<dyn SpeechSynthesizer>,
    pacer: Arc<PlayoutPacer>,
    state: Mutex<ControllerState>,
    active: Mutex<Option<ActiveResponse>>,
}

impl ChunkedVoiceController {
    pub fn new(
        config: ControllerConfig,
        engine: Arc<dyn AgentEngine>,
        synth: Arc<dyn SpeechSynthesizer>,
        pacer: Arc<PlayoutPacer>,
    ) -> Self {
        Self {
            config,
            engine,
            synth,
            pacer,
            state: Mutex::new(ControllerState::Idle),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    pub fn pacer(&self) -> &Arc<PlayoutPacer> {
        &self.pacer
    }

    /// Generate and play one response for the given history.
    ///
    /// Returns the full response text once the queue has drained. A
    /// barge-in surfaces as `Cancelled`; a generation timeout cancels the
    /// stream and surfaces as `Timeout` — either way the call stays up.
    pub async fn respond(
        &self,
        history: Vec<Turn>,
        session_cancel: &CancellationToken,
    ) -> Result<String> {
        self.cancel_active();

        let cancel = session_cancel.child_token();
        let queue = Arc::new(OrderedAudioQueue::new(self.config.jitter_buffer_frames));
        *self.active.lock() = Some(ActiveResponse {
            cancel: cancel.clone(),
            queue: queue.clone(),
        });
        *self.state.lock() = ControllerState::Streaming;

        let result = self.run_response(history, cancel.clone(), queue).await;

        *self.active.lock() = None;
        *self.state.lock() = ControllerState::Idle;
        result
    }

    async fn run_response(
        &self,
        history: Vec<Turn>,
        cancel: CancellationToken,
        queue: Arc<OrderedAudioQueue>,
    ) -> Result<String> {
        let scheduler = TtsScheduler::new(
            self.synth.clone(),
            queue.clone(),
            self.config.max_parallel_tts,
        );
        let (finished_tx, finished_rx) = watch::channel(false);
        let mut drain = self
            .pacer
            .start_drain(queue.clone(), finished_rx, cancel.clone());

        let request = AgentRequest {
            model: self.config.model.clone(),
            system_prompt: self.config.system_prompt.clone(),
            history,
        };
        let mut deltas = match self.engine.stream_reply(request, cancel.clone()).await {
            Ok(deltas) => deltas,
            Err(e) => {
                cancel.cancel();
                let _ = drain.await;
                return Err(e);
            }
        };

        let mut chunker = SentenceChunker::new(
            self.config.sentence_min_chars,
            self.config.sentence_max_chars,
        );
        let mut full_text = String::new();
        let deadline = tokio::time::Instant::now() + self.config.response_timeout;

        loop {
            let delta = tokio::select! {
                // The drain exits on the same token; await it so the
                // pacer's playing flag settles before we report back.
                _ = cancel.cancelled() => {
                    let _ = drain.await;
                    return Err(BridgeError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("Response generation timed out, ending turn");
                    cancel.cancel();
                    let _ = drain.await;
                    return Err(BridgeError::Timeout("response generation".into()));
                }
                delta = deltas.recv() => delta,
            };
            let Some(delta) = delta else { break };

            full_text.push_str(delta.as_text());
            for chunk in chunker.push(delta.as_text()) {
                scheduler.schedule(chunk, cancel.clone());
            }
        }
        if let Some(tail) = chunker.flush() {
            scheduler.schedule(tail, cancel.clone());
        }

        // Generation is done; wait for synthesis to settle, then drain.
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = drain.await;
                return Err(BridgeError::Cancelled);
            }
            _ = scheduler.wait_idle() => {}
        }

        *self.state.lock() = ControllerState::Draining;
        let _ = finished_tx.send(true);
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = drain.await;
                return Err(BridgeError::Cancelled);
            }
            res = &mut drain => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "Playout drain task failed");
                }
            }
        }

        Ok(full_text)
    }

    /// Synthesize and play a fixed utterance (greeting) without the
    /// engine in the loop. Interruptible like any response.
    pub async fn speak(&self, text: &str, session_cancel: &CancellationToken) -> Result<()> {
        self.cancel_active();

        let cancel = session_cancel.child_token();
        let queue = Arc::new(OrderedAudioQueue::new(self.config.jitter_buffer_frames));
        *self.active.lock() = Some(ActiveResponse {
            cancel: cancel.clone(),
            queue: queue.clone(),
        });
        *self.state.lock() = ControllerState::Streaming;

        let result = self.play_text(text, cancel, queue).await;

        *self.active.lock() = None;
        *self.state.lock() = ControllerState::Idle;
        result
    }

    async fn play_text(
        &self,
        text: &str,
        cancel: CancellationToken,
        queue: Arc<OrderedAudioQueue>,
    ) -> Result<()> {
        let scheduler = TtsScheduler::new(
            self.synth.clone(),
            queue.clone(),
            self.config.max_parallel_tts,
        );
        let (finished_tx, finished_rx) = watch::channel(false);
        let mut drain = self
            .pacer
            .start_drain(queue.clone(), finished_rx, cancel.clone());

        let mut chunker = SentenceChunker::new(
            self.config.sentence_min_chars,
            self.config.sentence_max_chars,
        );
        for chunk in chunker.push(text) {
            scheduler.schedule(chunk, cancel.clone());
        }
        if let Some(tail) = chunker.flush() {
            scheduler.schedule(tail, cancel.clone());
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = drain.await;
                return Err(BridgeError::Cancelled);
            }
            _ = scheduler.wait_idle() => {}
        }

        *self.state.lock() = ControllerState::Draining;
        let _ = finished_tx.send(true);
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = drain.await;
                Err(BridgeError::Cancelled)
            }
            _ = &mut drain => Ok(()),
        }
    }

    /// Upstream VAD heard the user while we may be speaking.
    ///
    /// Returns true when a response was actually interrupted. Events
    /// landing inside the echo-suppression window — the jitter-buffer
    /// span right after playout starts, when the gateway loopback can
    /// reflect our own audio — are ignored.
    pub async fn on_user_speaking(&self) -> bool {
        if !self.pacer.is_playing() {
            return false;
        }

        let echo_window =
            Duration::from_millis(self.config.jitter_buffer_frames as u64 * FRAME_DURATION_MS);
        if self
            .pacer
            .playout_elapsed()
            .is_some_and(|elapsed| elapsed < echo_window)
        {
            tracing::debug!("Ignoring speech start inside echo-suppression window");
            return false;
        }

        let Some(active) = self.active.lock().take() else {
            return false;
        };
        tracing::info!("Barge-in: cancelling active response");
        active.cancel.cancel();
        self.pacer.interrupt(&active.queue).await;
        *self.state.lock() = ControllerState::Idle;
        true
    }

    fn cancel_active(&self) {
        if let Some(active) = self.active.lock().take() {
            active.cancel.cancel();
            active.queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use voice_bridge_core::{AgentDelta, TurnRole, FRAME_BYTES_24K};

    use crate::frames::FrameSink;

    /// Engine that streams a fixed script, one delta every few millis.
    struct ScriptedEngine {
        deltas: Vec<String>,
        delta_gap: Duration,
    }

    #[async_trait]
    impl AgentEngine for ScriptedEngine {
        async fn stream_reply(
            &self,
            _request: AgentRequest,
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<AgentDelta>> {
            let (tx, rx) = mpsc::channel(8);
            let deltas = self.deltas.clone();
            let gap = self.delta_gap;
            tokio::spawn(async move {
                for delta in deltas {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(gap) => {}
                    }
                    if tx.send(AgentDelta::Text(delta)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    /// Engine that never produces anything.
    struct SilentEngine;

    #[async_trait]
    impl AgentEngine for SilentEngine {
        async fn stream_reply(
            &self,
            _request: AgentRequest,
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<AgentDelta>> {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                cancel.cancelled().await;
                drop(tx);
            });
            Ok(rx)
        }
    }

    /// Synthesizer returning `frames_per_chunk` cloud frames instantly.
    struct FixedSynth {
        cloud_frames: usize,
    }

    #[async_trait]
    impl SpeechSynthesizer for FixedSynth {
        async fn synthesize(&self, _text: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            Ok(vec![0u8; FRAME_BYTES_24K * self.cloud_frames])
        }
    }

    struct CountingSink {
        frames: AtomicUsize,
        flushes: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                frames: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FrameSink for CountingSink {
        async fn send_frame(&self, _frame: Vec<u8>) -> Result<()> {
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(jitter: usize, timeout_ms: u64) -> ControllerConfig {
        ControllerConfig {
            sentence_min_chars: 10,
            sentence_max_chars: 100,
            max_parallel_tts: 3,
            jitter_buffer_frames: jitter,
            response_timeout: Duration::from_millis(timeout_ms),
            model: "test-model".into(),
            system_prompt: "test".into(),
        }
    }

    fn history() -> Vec<Turn> {
        vec![Turn::new(TurnRole::User, "hello?")]
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_plays_everything_and_returns_text() {
        let engine = Arc::new(ScriptedEngine {
            deltas: vec!["First sentence here. ".into(), "Second sentence too.".into()],
            delta_gap: Duration::from_millis(5),
        });
        let synth = Arc::new(FixedSynth { cloud_frames: 3 });
        let sink = Arc::new(CountingSink::new());
        let pacer = Arc::new(PlayoutPacer::new(sink.clone()));
        let controller =
            ChunkedVoiceController::new(config(2, 10_000), engine, synth, pacer.clone());

        let cancel = CancellationToken::new();
        let text = controller.respond(history(), &cancel).await.unwrap();

        assert_eq!(text, "First sentence here. Second sentence too.");
        // Two chunks, three gateway frames each.
        assert_eq!(sink.frames.load(Ordering::SeqCst), 6);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(!pacer.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_cancels_clears_and_flushes() {
        // 3 s of speech per chunk keeps playout busy well past the test.
        let engine = Arc::new(ScriptedEngine {
            deltas: vec!["A fairly long sentence to synthesize. And another one.".into()],
            delta_gap: Duration::from_millis(1),
        });
        let synth = Arc::new(FixedSynth { cloud_frames: 150 });
        let sink = Arc::new(CountingSink::new());
        let pacer = Arc::new(PlayoutPacer::new(sink.clone()));
        // Jitter of 10 frames: echo window is 200 ms.
        let controller = Arc::new(ChunkedVoiceController::new(
            config(10, 10_000),
            engine,
            synth,
            pacer.clone(),
        ));

        let cancel = CancellationToken::new();
        let respond = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.respond(history(), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pacer.is_playing());
        assert!(controller.on_user_speaking().await);

        let result = respond.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Cancelled)));
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
        // Jitter head plus what played in 300 ms stays well under 40.
        assert!(sink.frames.load(Ordering::SeqCst) <= 40);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn speech_inside_echo_window_is_ignored() {
        let engine = Arc::new(ScriptedEngine {
            deltas: vec!["A fairly long sentence to synthesize right now.".into()],
            delta_gap: Duration::from_millis(1),
        });
        let synth = Arc::new(FixedSynth { cloud_frames: 100 });
        let sink = Arc::new(CountingSink::new());
        let pacer = Arc::new(PlayoutPacer::new(sink.clone()));
        // Jitter 25 frames: echo window 500 ms.
        let controller = Arc::new(ChunkedVoiceController::new(
            config(25, 10_000),
            engine,
            synth,
            pacer.clone(),
        ));

        let cancel = CancellationToken::new();
        let respond = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.respond(history(), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pacer.is_playing());
        // Inside the window: treated as our own echo.
        assert!(!controller.on_user_speaking().await);
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(controller.on_user_speaking().await);

        let _ = respond.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn generation_timeout_ends_turn_quietly() {
        let engine = Arc::new(SilentEngine);
        let synth = Arc::new(FixedSynth { cloud_frames: 1 });
        let sink = Arc::new(CountingSink::new());
        let pacer = Arc::new(PlayoutPacer::new(sink.clone()));
        let controller =
            ChunkedVoiceController::new(config(2, 250), engine, synth, pacer);

        let cancel = CancellationToken::new();
        let result = controller.respond(history(), &cancel).await;

        assert!(matches!(result, Err(BridgeError::Timeout(_))));
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(sink.frames.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn speak_plays_a_greeting_without_the_engine() {
        let engine = Arc::new(SilentEngine);
        let synth = Arc::new(FixedSynth { cloud_frames: 2 });
        let sink = Arc::new(CountingSink::new());
        let pacer = Arc::new(PlayoutPacer::new(sink.clone()));
        let controller = ChunkedVoiceController::new(config(2, 10_000), engine, synth, pacer);

        let cancel = CancellationToken::new();
        controller
            .speak("Hello, thanks for calling.", &cancel)
            .await
            .unwrap();

        assert_eq!(sink.frames.load(Ordering::SeqCst), 2);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn user_speaking_while_idle_is_a_no_op() {
        let engine = Arc::new(SilentEngine);
        let synth = Arc::new(FixedSynth { cloud_frames: 1 });
        let sink = Arc::new(CountingSink::new());
        let pacer = Arc::new(PlayoutPacer::new(sink.clone()));
        let controller = ChunkedVoiceController::new(config(2, 250), engine, synth, pacer);

        assert!(!controller.on_user_speaking().await);
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 0);
    }
}
