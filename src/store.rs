//! In-memory session store.
//!
//! Sessions are keyed by an opaque id the store itself mints, so a
//! destroyed id can never be silently recreated. The map lock is held only
//! long enough to fetch a handle; all per-session work happens under that
//! session's own mutex, so calls against different sessions never
//! serialize on each other while calls against the same session always do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::ImportError;
use crate::session::{ImportSession, State};

pub struct SessionStore {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Arc<Mutex<ImportSession>>>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        SessionStore {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Registers a freshly built session and returns its id.
    pub fn create(&self, session: ImportSession) -> String {
        let id = session.id.clone();
        tracing::debug!(session = %id, rows = session.raw_rows.len(), "import session created");
        let previous = self
            .sessions
            .lock()
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        debug_assert!(previous.is_none(), "uuid session ids never collide");
        id
    }

    /// Snapshot of a session for read-only callers (status reporting).
    pub fn get(&self, id: &str) -> Result<ImportSession, ImportError> {
        let handle = self.handle(id)?;
        let guard = handle.lock();
        if guard.expired(Instant::now()) {
            return Err(ImportError::SessionNotFound { id: id.to_string() });
        }
        Ok(guard.clone())
    }

    /// The single mutation entry point. Verifies the session is in
    /// `expected` state, applies `mutate` to a working copy, and installs
    /// the copy with the advanced state and a refreshed expiry only if
    /// `mutate` succeeds; an error leaves the stored session untouched.
    /// A concurrent caller that already moved the session is reported as
    /// `StateConflict`; terminal sessions reject every call.
    pub fn transition<T>(
        &self,
        id: &str,
        expected: State,
        mutate: impl FnOnce(&mut ImportSession) -> Result<(State, T), ImportError>,
    ) -> Result<T, ImportError> {
        let handle = self.handle(id)?;
        let mut guard = handle.lock();
        if guard.expired(Instant::now()) {
            return Err(ImportError::SessionNotFound { id: id.to_string() });
        }
        if guard.state.is_terminal() {
            return Err(ImportError::SessionTerminal { state: guard.state });
        }
        if guard.state != expected {
            return Err(ImportError::StateConflict {
                expected,
                actual: guard.state,
            });
        }

        let mut draft = guard.clone();
        let (next, value) = mutate(&mut draft)?;
        assert!(
            guard.state.allows(next),
            "illegal transition {} -> {}",
            guard.state,
            next
        );
        draft.state = next;
        draft.expires_at = Instant::now() + self.ttl;
        tracing::debug!(session = %id, from = %guard.state, to = %next, "session advanced");
        *guard = draft;
        Ok(value)
    }

    /// Drops sessions that sat idle past their expiry. A session whose
    /// lock is currently held (a commit in flight) is left alone; its
    /// expiry was refreshed when it last advanced anyway.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|id, handle| match handle.try_lock() {
            Some(guard) => {
                let keep = !guard.expired(now);
                if !keep {
                    tracing::info!(session = %id, state = %guard.state, "session expired");
                }
                keep
            }
            None => true,
        });
        before - sessions.len()
    }

    fn handle(&self, id: &str) -> Result<Arc<Mutex<ImportSession>>, ImportError> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ImportError::SessionNotFound { id: id.to_string() })
    }
}
