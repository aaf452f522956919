//! Ordered reassembly of out-of-order synthesis results.
//!
//! Parallel TTS finishes in arbitrary order; playout must not. Frames are
//! keyed by chunk sequence and released strictly in order. First delivery
//! waits behind a jitter gate — enough total frames buffered, or the head
//! chunk present — after which the gate stays open for the rest of the
//! response.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner {
    frames: HashMap<u64, VecDeque<Vec<u8>>>,
    /// Chunks whose frame list is final.
    complete: HashSet<u64>,
    skipped: HashSet<u64>,
    next_seq: u64,
    total_frames: usize,
    jitter_open: bool,
}

impl Inner {
    /// Move `next_seq` past skipped chunks and exhausted complete chunks.
    fn advance(&mut self) {
        loop {
            if self.skipped.remove(&self.next_seq) {
                self.frames.remove(&self.next_seq);
                self.next_seq += 1;
                continue;
            }
            let exhausted = self.complete.contains(&self.next_seq)
                && self.frames.get(&self.next_seq).is_none_or(|q| q.is_empty());
            if exhausted {
                self.frames.remove(&self.next_seq);
                self.complete.remove(&self.next_seq);
                self.next_seq += 1;
                continue;
            }
            break;
        }
    }
}

/// Reassembly queue between the TTS scheduler and the playout pacer.
pub struct OrderedAudioQueue {
    inner: Mutex<Inner>,
    jitter_threshold: usize,
    notify: Notify,
}

impl OrderedAudioQueue {
    pub fn new(jitter_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: HashMap::new(),
                complete: HashSet::new(),
                skipped: HashSet::new(),
                next_seq: 0,
                total_frames: 0,
                jitter_open: false,
            }),
            jitter_threshold,
            notify: Notify::new(),
        }
    }

    /// Enqueue the complete frame list for a chunk.
    pub fn enqueue_chunk(&self, seq: u64, frames: Vec<Vec<u8>>) {
        {
            let mut inner = self.inner.lock();
            if seq < inner.next_seq || inner.skipped.contains(&seq) {
                // Late result for a chunk playout already passed or dropped.
                return;
            }
            inner.total_frames += frames.len();
            inner.frames.entry(seq).or_default().extend(frames);
            inner.complete.insert(seq);
            inner.advance();
        }
        self.notify.notify_one();
    }

    /// Append a single frame to a still-open chunk (realtime deltas).
    pub fn push_frame(&self, seq: u64, frame: Vec<u8>) {
        {
            let mut inner = self.inner.lock();
            if seq < inner.next_seq || inner.skipped.contains(&seq) {
                return;
            }
            inner.total_frames += 1;
            inner.frames.entry(seq).or_default().push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Mark an open chunk as final.
    pub fn complete(&self, seq: u64) {
        {
            let mut inner = self.inner.lock();
            if seq < inner.next_seq {
                return;
            }
            inner.complete.insert(seq);
            inner.advance();
        }
        self.notify.notify_one();
    }

    /// Record a chunk that will never produce frames.
    pub fn skip(&self, seq: u64) {
        {
            let mut inner = self.inner.lock();
            if seq < inner.next_seq {
                return;
            }
            if let Some(q) = inner.frames.remove(&seq) {
                inner.total_frames -= q.len();
            }
            inner.complete.remove(&seq);
            inner.skipped.insert(seq);
            inner.advance();
        }
        self.notify.notify_one();
    }

    /// Take the next in-order frame, if the gate allows one.
    pub fn dequeue(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();

        if !inner.jitter_open {
            let head_ready = inner
                .frames
                .get(&inner.next_seq)
                .is_some_and(|q| !q.is_empty());
            if inner.total_frames < self.jitter_threshold && !head_ready {
                return None;
            }
            inner.jitter_open = true;
        }

        let next_seq = inner.next_seq;
        let frame = inner.frames.get_mut(&next_seq)?.pop_front()?;
        inner.total_frames -= 1;
        inner.advance();
        Some(frame)
    }

    /// Frames currently buffered across all chunks.
    pub fn len(&self) -> usize {
        self.inner.lock().total_frames
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything; subsequent enqueues for passed chunks are ignored.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.frames.clear();
            inner.complete.clear();
            inner.skipped.clear();
            inner.total_frames = 0;
        }
        self.notify.notify_one();
    }

    /// Wait until the queue changes.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// Wake any pacer blocked on [`changed`].
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}
