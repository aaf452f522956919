//! Per-caller conversation state.
//!
//! One session per caller identity, keyed `msteams-call:{lowercased-user-id}`
//! so a caller who hangs up and calls back within the idle window resumes
//! the same transcript.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use voice_bridge_core::{Turn, TurnRole};

/// Maximum turns retained per session; older turns fall off the front.
const MAX_TRANSCRIPT_TURNS: usize = 50;

/// Sessions idle longer than this are dropped.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How many recent turns feed a response request.
const HISTORY_WINDOW: usize = 10;

/// Conversation state for one caller identity.
pub struct ConversationSession {
    key: String,
    session_id: String,
    transcript: Mutex<Vec<Turn>>,
    last_activity: Mutex<Instant>,
}

impl ConversationSession {
    fn new(key: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            session_id: session_id.into(),
            transcript: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append a turn, trimming the log to its cap.
    pub fn append(&self, role: TurnRole, content: impl Into<String>) {
        let mut log = self.transcript.lock();
        log.push(Turn::new(role, content));
        if log.len() > MAX_TRANSCRIPT_TURNS {
            let excess = log.len() - MAX_TRANSCRIPT_TURNS;
            log.drain(..excess);
        }
        *self.last_activity.lock() = Instant::now();
    }

    /// The most recent turns, oldest first, for prompting.
    pub fn history(&self) -> Vec<Turn> {
        let log = self.transcript.lock();
        let start = log.len().saturating_sub(HISTORY_WINDOW);
        log[start..].to_vec()
    }

    pub fn turn_count(&self) -> usize {
        self.transcript.lock().len()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.lock().elapsed() > timeout
    }
}

/// Store of conversation sessions keyed by caller identity.
///
/// Expired sessions are reaped opportunistically on access, so no
/// background task is needed.
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, Arc<ConversationSession>>>,
    idle_timeout: Duration,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::with_idle_timeout(SESSION_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Fetch the caller's session, creating it if absent or expired.
    pub fn acquire(&self, key: &str) -> Arc<ConversationSession> {
        {
            let sessions = self.sessions.read();
            if let Some(session) = sessions.get(key) {
                if !session.is_expired(self.idle_timeout) {
                    session.touch();
                    return session.clone();
                }
            }
        }

        let mut sessions = self.sessions.write();
        self.reap_expired(&mut sessions);
        sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                let session_id = format!("{}:{}", key, chrono::Utc::now().timestamp_millis());
                tracing::debug!(key, session_id = %session_id, "Created conversation session");
                Arc::new(ConversationSession::new(key, session_id))
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<ConversationSession>> {
        self.sessions.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn reap_expired(&self, sessions: &mut HashMap<String, Arc<ConversationSession>>) {
        let timeout = self.idle_timeout;
        sessions.retain(|key, session| {
            let keep = !session.is_expired(timeout);
            if !keep {
                tracing::debug!(key, "Expired conversation session");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_is_capped_fifo() {
        let store = ConversationStore::new();
        let session = store.acquire("msteams-call:u1");

        for i in 0..60 {
            session.append(TurnRole::User, format!("turn {}", i));
        }

        assert_eq!(session.turn_count(), MAX_TRANSCRIPT_TURNS);
        let history = session.history();
        // Oldest surviving turn is number 10; history window shows the tail.
        assert_eq!(history.last().unwrap().content, "turn 59");
        assert_eq!(history.len(), HISTORY_WINDOW);
    }

    #[test]
    fn history_window_is_ten_turns() {
        let store = ConversationStore::new();
        let session = store.acquire("msteams-call:u2");
        for i in 0..4 {
            session.append(TurnRole::User, format!("u{}", i));
            session.append(TurnRole::Bot, format!("b{}", i));
        }
        assert_eq!(session.history().len(), 8);
        session.append(TurnRole::User, "u4");
        session.append(TurnRole::Bot, "b4");
        assert_eq!(session.history().len(), HISTORY_WINDOW);
    }

    #[test]
    fn same_key_resumes_same_session() {
        let store = ConversationStore::new();
        let a = store.acquire("msteams-call:u3");
        a.append(TurnRole::User, "hello");
        let b = store.acquire("msteams-call:u3");
        assert_eq!(b.turn_count(), 1);
        assert_eq!(a.session_id(), b.session_id());
    }

    #[test]
    fn expired_session_is_replaced() {
        let store = ConversationStore::with_idle_timeout(Duration::from_millis(0));
        let a = store.acquire("msteams-call:u4");
        a.append(TurnRole::User, "hello");
        std::thread::sleep(Duration::from_millis(5));
        let b = store.acquire("msteams-call:u4");
        assert_eq!(b.turn_count(), 0);
    }
}
