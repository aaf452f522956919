//! Call sessions and their registry.
//!
//! A session is the per-call mutable state, bound to exactly one live
//! connection at a time. Only the session's own call task mutates it;
//! everything else reads snapshots or the atomic counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voice_bridge_core::{BridgeError, CallDirection, CallId, CallerInfo, Result};

/// One live call.
pub struct CallSession {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub caller: CallerInfo,
    started_at: DateTime<Utc>,
    answered_at: Mutex<Option<DateTime<Utc>>>,
    connection_id: Mutex<String>,
    /// Next outbound seq to assign; dense across successful sends.
    next_sent_seq: AtomicU64,
    last_recv_seq: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    /// Caller audio entry point into the call task, once it is running.
    audio_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Session token; parents every response token of the call.
    pub cancel: CancellationToken,
}

impl CallSession {
    /// Build a session before it is admitted to the registry, so the
    /// audio path can be wired up first.
    pub fn new(
        call_id: CallId,
        direction: CallDirection,
        caller: CallerInfo,
        connection_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            direction,
            caller,
            started_at: Utc::now(),
            answered_at: Mutex::new(None),
            connection_id: Mutex::new(connection_id),
            next_sent_seq: AtomicU64::new(0),
            last_recv_seq: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            audio_tx: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn mark_answered(&self) {
        *self.answered_at.lock() = Some(Utc::now());
    }

    /// Claim the next outbound sequence number.
    pub fn next_sent_seq(&self) -> u64 {
        self.next_sent_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn note_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_frame_received(&self, seq: u64) {
        self.last_recv_seq.store(seq, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_bound_to(&self, connection_id: &str) -> bool {
        *self.connection_id.lock() == connection_id
    }

    pub fn connection_id(&self) -> String {
        self.connection_id.lock().clone()
    }

    /// Swap the session onto a new connection (`session_resume`).
    pub fn rebind(&self, connection_id: String) {
        let mut current = self.connection_id.lock();
        tracing::info!(
            call_id = %self.call_id,
            from = %*current,
            to = %connection_id,
            "Rebinding session to new connection"
        );
        *current = connection_id;
    }

    /// Install the call task's audio entry point.
    pub fn set_audio_tx(&self, tx: mpsc::Sender<Vec<u8>>) {
        *self.audio_tx.lock() = Some(tx);
    }

    /// Forward one validated caller frame to the call task.
    pub fn forward_audio(&self, pcm16: Vec<u8>) {
        let tx = self.audio_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.try_send(pcm16).is_err() {
                self.note_frame_dropped();
            }
        } else {
            self.note_frame_dropped();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_id: self.call_id.clone(),
            direction: self.direction,
            started_at: self.started_at,
            answered_at: *self.answered_at.lock(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            last_recv_seq: self.last_recv_seq.load(Ordering::Relaxed),
        }
    }
}

/// Read-only copy of session state for observers.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub last_recv_seq: u64,
}

/// Registry of live sessions, capped at the configured concurrency.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<CallId, Arc<CallSession>>>,
    max_sessions: usize,
    max_duration: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, max_duration: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            max_duration,
        }
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Create and store a session, enforcing the concurrency cap and
    /// one-call-per-id uniqueness.
    pub fn create(
        &self,
        call_id: CallId,
        direction: CallDirection,
        caller: CallerInfo,
        connection_id: String,
    ) -> Result<Arc<CallSession>> {
        let session = CallSession::new(call_id, direction, caller, connection_id);
        self.admit(session.clone())?;
        Ok(session)
    }

    /// Store an already-built session, enforcing the same caps.
    pub fn admit(&self, session: Arc<CallSession>) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.call_id) {
            return Err(BridgeError::Protocol(format!(
                "session {} already exists",
                session.call_id
            )));
        }
        if sessions.len() >= self.max_sessions {
            return Err(BridgeError::Internal("max concurrent calls reached".into()));
        }
        tracing::info!(
            call_id = %session.call_id,
            direction = ?session.direction,
            active = sessions.len() + 1,
            "Created session"
        );
        sessions.insert(session.call_id.clone(), session);
        Ok(())
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.sessions.read().get(call_id).cloned()
    }

    /// Remove and return a session; the caller owns teardown.
    pub fn remove(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        let removed = self.sessions.write().remove(call_id);
        if removed.is_some() {
            tracing::info!(call_id = %call_id, "Removed session");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot every live session.
    pub fn all(&self) -> Vec<Arc<CallSession>> {
        self.sessions.read().values().cloned().collect()
    }
}
