//! Parallel synthesis with in-order delivery.
//!
//! Chunks are synthesized concurrently under a bounded semaphore and land
//! in the ordered queue keyed by their sequence; the pacer on the other
//! side only ever sees them in order. Back-pressure drops (skips) chunks
//! rather than queueing unbounded text behind a slow synthesizer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use voice_bridge_core::{comfort_tone_24k, BridgeError, Result};

use crate::chunker::TextChunk;
use crate::frames::frames_from_pcm24;
use crate::ordered_queue::OrderedAudioQueue;

/// Hard cap on chunks awaiting synthesis; beyond it new chunks are skipped.
pub const MAX_PENDING_SENTENCES: usize = 5;

/// Synthesis seam: text in, 24 kHz PCM out, cooperative cancellation.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;
}

/// Schedules chunk synthesis into an ordered queue.
pub struct TtsScheduler {
    synth: Arc<dyn SpeechSynthesizer>,
    queue: Arc<OrderedAudioQueue>,
    semaphore: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TtsScheduler {
    pub fn new(
        synth: Arc<dyn SpeechSynthesizer>,
        queue: Arc<OrderedAudioQueue>,
        max_parallel: usize,
    ) -> Self {
        Self {
            synth,
            queue,
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Schedule one chunk. Returns immediately; the result lands in the
    /// queue under the chunk's sequence (or the sequence is skipped).
    pub fn schedule(&self, chunk: TextChunk, cancel: CancellationToken) {
        if self.outstanding.load(Ordering::SeqCst) >= MAX_PENDING_SENTENCES {
            tracing::warn!(seq = chunk.seq, "Synthesis backlog full, dropping chunk");
            self.queue.skip(chunk.seq);
            return;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        let synth = self.synth.clone();
        let queue = self.queue.clone();
        let semaphore = self.semaphore.clone();
        let outstanding = self.outstanding.clone();
        let idle = self.idle.clone();

        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };

            match permit {
                None => queue.skip(chunk.seq),
                Some(_permit) => match synth.synthesize(&chunk.text, &cancel).await {
                    Ok(_) | Err(_) if cancel.is_cancelled() => queue.skip(chunk.seq),
                    Ok(pcm) => queue.enqueue_chunk(chunk.seq, frames_from_pcm24(&pcm)),
                    Err(BridgeError::Cancelled) => queue.skip(chunk.seq),
                    Err(e) => {
                        // Substitute a second of silence so the turn
                        // completes instead of stalling behind this seq.
                        tracing::warn!(seq = chunk.seq, error = %e, "Synthesis failed, inserting comfort tone");
                        queue.enqueue_chunk(chunk.seq, frames_from_pcm24(&comfort_tone_24k()));
                    }
                },
            }

            if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    /// Chunks scheduled but not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every scheduled chunk has settled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use voice_bridge_core::{FRAME_BYTES_24K, SAMPLE_RATE_16K};

    /// Synthesizer that returns one cloud frame per chunk after an
    /// optionally gated delay, so tests control completion order.
    struct ScriptedSynth {
        delays: Mutex<HashMap<String, Duration>>,
        fail_on: Option<String>,
    }

    impl ScriptedSynth {
        fn new() -> Self {
            Self {
                delays: Mutex::new(HashMap::new()),
                fail_on: None,
            }
        }

        fn delay(self, text: &str, ms: u64) -> Self {
            self.delays.lock().insert(text.into(), Duration::from_millis(ms));
            self
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for ScriptedSynth {
        async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
            let delay = self.delays.lock().get(text).copied().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            if self.fail_on.as_deref() == Some(text) {
                return Err(BridgeError::UpstreamUnavailable("synth down".into()));
            }
            // Tag the audio with the first byte of the text.
            Ok(vec![text.as_bytes()[0]; FRAME_BYTES_24K])
        }
    }

    fn chunk(seq: u64, text: &str) -> TextChunk {
        TextChunk {
            seq,
            text: text.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_completion_dequeues_in_order() {
        let synth = Arc::new(
            ScriptedSynth::new()
                .delay("alpha", 10)
                .delay("bravo", 50)
                .delay("charlie", 20),
        );
        let queue = Arc::new(OrderedAudioQueue::new(1));
        let scheduler = TtsScheduler::new(synth, queue.clone(), 3);
        let cancel = CancellationToken::new();

        scheduler.schedule(chunk(0, "alpha"), cancel.clone());
        scheduler.schedule(chunk(1, "bravo"), cancel.clone());
        scheduler.schedule(chunk(2, "charlie"), cancel.clone());
        scheduler.wait_idle().await;

        let mut tags = Vec::new();
        while let Some(frame) = queue.dequeue() {
            tags.push(frame[0]);
        }
        assert_eq!(tags, vec![b'a', b'b', b'c']);
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_overflow_skips_new_chunks() {
        let synth = Arc::new(ScriptedSynth::new().delay("slow", 1_000));
        let queue = Arc::new(OrderedAudioQueue::new(1));
        let scheduler = TtsScheduler::new(synth, queue.clone(), 1);
        let cancel = CancellationToken::new();

        for seq in 0..MAX_PENDING_SENTENCES as u64 {
            scheduler.schedule(chunk(seq, "slow"), cancel.clone());
        }
        // Give the spawned tasks a chance to register.
        tokio::task::yield_now().await;
        assert_eq!(scheduler.outstanding(), MAX_PENDING_SENTENCES);

        scheduler.schedule(chunk(99, "slow"), cancel.clone());
        assert_eq!(scheduler.outstanding(), MAX_PENDING_SENTENCES);

        cancel.cancel();
        scheduler.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failure_inserts_comfort_tone() {
        let synth = Arc::new(ScriptedSynth {
            delays: Mutex::new(HashMap::new()),
            fail_on: Some("broken".into()),
        });
        let queue = Arc::new(OrderedAudioQueue::new(1));
        let scheduler = TtsScheduler::new(synth, queue.clone(), 2);
        let cancel = CancellationToken::new();

        scheduler.schedule(chunk(0, "broken"), cancel.clone());
        scheduler.wait_idle().await;

        // One second of silence paces out as 50 gateway frames.
        let expected = SAMPLE_RATE_16K as usize / 320;
        assert_eq!(queue.len(), expected);
        let frame = queue.dequeue().unwrap();
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips_pending_chunks() {
        let synth = Arc::new(ScriptedSynth::new().delay("slow", 1_000));
        let queue = Arc::new(OrderedAudioQueue::new(1));
        let scheduler = TtsScheduler::new(synth, queue.clone(), 1);
        let cancel = CancellationToken::new();

        scheduler.schedule(chunk(0, "slow"), cancel.clone());
        scheduler.schedule(chunk(1, "slow"), cancel.clone());
        tokio::task::yield_now().await;

        cancel.cancel();
        scheduler.wait_idle().await;

        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }
}
