// In-memory import sessions held between preview and commit

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::database_ops::catalog_import::{ImportSession, ImportState};

/// Sessions idle longer than this are dropped on the next insert.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);
/// Upper bound on sessions kept at once; the oldest goes first.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

struct Entry {
    session: ImportSession,
    touched: Instant,
}

pub struct SessionStore {
    entries: HashMap<Uuid, Entry>,
    ttl: Duration,
    max: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL, DEFAULT_MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration, max: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max: max.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, id: Uuid, session: ImportSession) {
        self.insert_at(id, session, Instant::now());
    }

    pub(crate) fn insert_at(&mut self, id: Uuid, session: ImportSession, now: Instant) {
        self.prune(now);
        while self.entries.len() >= self.max && !self.entries.contains_key(&id) {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(id, _)| *id)
            else {
                break;
            };
            self.entries.remove(&oldest);
            tracing::debug!(session = %oldest, "evicted import session at capacity");
        }
        self.entries.insert(
            id,
            Entry {
                session,
                touched: now,
            },
        );
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<ImportSession> {
        self.entries.remove(id).map(|e| e.session)
    }

    /// Current state of a session. Terminal states are handed out once and then dropped.
    pub fn read_state(&mut self, id: &Uuid) -> Option<ImportState> {
        let state = self.entries.get(id)?.session.state().clone();
        if matches!(
            state,
            ImportState::Completed { .. } | ImportState::Failed { .. } | ImportState::Aborted { .. }
        ) {
            self.entries.remove(id);
        }
        Some(state)
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.touched) < ttl);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "expired import sessions");
        }
    }
}
