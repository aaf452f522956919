//! Paced playout of outbound frames.
//!
//! The gateway expects one frame every 20 ms of wall clock. Dispatch is
//! scheduled against absolute targets (`start + n * 20 ms`) so jitter in
//! the loop body never accumulates into drift. A drain lock serializes
//! drains per call; barge-in cancels the running drain, clears the queue
//! and tells the gateway to flush, then holds a short recovery window in
//! which stale upstream audio is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use voice_bridge_core::FRAME_DURATION_MS;

use crate::frames::FrameSink;
use crate::ordered_queue::OrderedAudioQueue;

/// After a flush, upstream audio deltas are discarded for this long; they
/// belong to the response that was just cancelled.
pub const FLUSH_RECOVERY_WINDOW: Duration = Duration::from_millis(100);

/// Drives outbound audio at the frame cadence.
pub struct PlayoutPacer {
    sink: Arc<dyn FrameSink>,
    drain_lock: Arc<tokio::sync::Mutex<()>>,
    playing: Arc<AtomicBool>,
    playout_started: Arc<Mutex<Option<Instant>>>,
    last_flush: Mutex<Option<Instant>>,
}

impl PlayoutPacer {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            drain_lock: Arc::new(tokio::sync::Mutex::new(())),
            playing: Arc::new(AtomicBool::new(false)),
            playout_started: Arc::new(Mutex::new(None)),
            last_flush: Mutex::new(None),
        }
    }

    /// Spawn a drain task over `queue`.
    ///
    /// The drain runs until `cancel` fires, or until `finished` turns true
    /// and the queue is empty. Only one drain runs at a time; a second
    /// call queues behind the first on the drain lock.
    pub fn start_drain(
        &self,
        queue: Arc<OrderedAudioQueue>,
        mut finished: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let sink = self.sink.clone();
        let lock = self.drain_lock.clone();
        let playing = self.playing.clone();
        let playout_started = self.playout_started.clone();

        tokio::spawn(async move {
            let _guard = lock.lock().await;
            playing.store(true, Ordering::SeqCst);
            *playout_started.lock() = None;

            let mut start: Option<Instant> = None;
            let mut n: u32 = 0;

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match queue.dequeue() {
                    Some(frame) => {
                        let base = *start.get_or_insert_with(|| {
                            let now = Instant::now();
                            *playout_started.lock() = Some(now);
                            now
                        });
                        let target = base + Duration::from_millis(FRAME_DURATION_MS) * n;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep_until(target) => {}
                        }
                        if cancel.is_cancelled() {
                            break;
                        }
                        if let Err(e) = sink.send_frame(frame).await {
                            tracing::warn!(error = %e, "Frame send failed, stopping drain");
                            break;
                        }
                        n += 1;
                    }
                    None => {
                        if *finished.borrow() && queue.is_empty() {
                            break;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = queue.changed() => {}
                            res = finished.changed() => {
                                if res.is_err() && queue.is_empty() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            playing.store(false, Ordering::SeqCst);
            *playout_started.lock() = None;
        })
    }

    /// True while a drain is delivering frames.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Time since the first frame of the current playout, if any.
    pub fn playout_elapsed(&self) -> Option<Duration> {
        self.playout_started.lock().map(|t| t.elapsed())
    }

    /// Barge-in: clear pending audio and tell the gateway to flush.
    ///
    /// The caller cancels the response token first; this clears what is
    /// already queued and opens the recovery window.
    pub async fn interrupt(&self, queue: &OrderedAudioQueue) {
        queue.clear();
        queue.wake();
        *self.last_flush.lock() = Some(Instant::now());
        if let Err(e) = self.sink.send_flush().await {
            tracing::warn!(error = %e, "Flush send failed");
        }
    }

    /// True while deltas from the cancelled response must be discarded.
    pub fn in_recovery_window(&self) -> bool {
        self.last_flush
            .lock()
            .is_some_and(|t| t.elapsed() < FLUSH_RECOVERY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use voice_bridge_core::Result;

    struct CapturingSink {
        base: Instant,
        sent_at: Mutex<Vec<Duration>>,
        flushes: AtomicUsize,
    }

    impl CapturingSink {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                sent_at: Mutex::new(Vec::new()),
                flushes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FrameSink for CapturingSink {
        async fn send_frame(&self, _frame: Vec<u8>) -> Result<()> {
            self.sent_at.lock().push(self.base.elapsed());
            Ok(())
        }

        async fn send_flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn frames(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; 4]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn frames_pace_at_twenty_ms() {
        let sink = Arc::new(CapturingSink::new());
        let pacer = PlayoutPacer::new(sink.clone());
        let queue = Arc::new(OrderedAudioQueue::new(1));
        queue.enqueue_chunk(0, frames(5));

        let (done_tx, done_rx) = watch::channel(true);
        let cancel = CancellationToken::new();
        let handle = pacer.start_drain(queue, done_rx, cancel);
        handle.await.unwrap();
        drop(done_tx);

        let sent = sink.sent_at.lock().clone();
        assert_eq!(sent.len(), 5);
        for (i, t) in sent.iter().enumerate() {
            let offset = *t - sent[0];
            assert_eq!(offset, Duration::from_millis(20 * i as u64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_late_frames() {
        let sink = Arc::new(CapturingSink::new());
        let pacer = PlayoutPacer::new(sink.clone());
        let queue = Arc::new(OrderedAudioQueue::new(1));
        queue.enqueue_chunk(0, frames(2));

        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let handle = pacer.start_drain(queue.clone(), done_rx, cancel);

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.enqueue_chunk(1, frames(1));
        done_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(sink.sent_at.lock().len(), 3);
        assert!(!pacer.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_stops_drain_and_flushes_once() {
        let sink = Arc::new(CapturingSink::new());
        let pacer = Arc::new(PlayoutPacer::new(sink.clone()));
        let queue = Arc::new(OrderedAudioQueue::new(1));
        queue.enqueue_chunk(0, frames(150));

        let (_done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let handle = pacer.start_drain(queue.clone(), done_rx, cancel.clone());

        tokio::time::sleep(Duration::from_millis(65)).await;
        cancel.cancel();
        pacer.interrupt(&queue).await;
        handle.await.unwrap();

        let sent = sink.sent_at.lock().len();
        assert!(sent <= 5, "sent {} frames after barge-in", sent);
        assert!(queue.is_empty());
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
        assert!(!pacer.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_window_closes_after_100ms() {
        let sink = Arc::new(CapturingSink::new());
        let pacer = PlayoutPacer::new(sink);
        let queue = OrderedAudioQueue::new(1);

        assert!(!pacer.in_recovery_window());
        pacer.interrupt(&queue).await;
        assert!(pacer.in_recovery_window());
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert!(!pacer.in_recovery_window());
    }
}
