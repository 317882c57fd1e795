//! Owned session registry.
//!
//! The map itself sits behind a short-held `parking_lot` lock; each session
//! has its own `tokio::sync::Mutex`, which queues waiters in arrival order,
//! so turns on one session serialize while distinct sessions run in parallel.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use persona_health::SessionActivity;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub persona_id: String,
    pub client_id: String,
}

impl SessionKey {
    pub fn new(persona_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.persona_id, self.client_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub request_count: u64,
    pub active_persona: String,
    pub rolling_summary: VecDeque<String>,
    /// Turns answered by the terminal fallback rather than a real backend.
    pub fallback_turns: u64,
}

impl Session {
    pub fn new(key: SessionKey, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            active_persona: key.persona_id.clone(),
            key,
            created_at: now,
            last_activity: now,
            request_count: 0,
            rolling_summary: VecDeque::new(),
            fallback_turns: 0,
        }
    }

    /// Record a completed turn and keep at most `limit` summaries.
    pub fn record_turn(&mut self, summary: String, used_fallback: bool, limit: usize, now: DateTime<Utc>) {
        self.last_activity = now;
        self.request_count += 1;
        if used_fallback {
            self.fallback_turns += 1;
        }
        self.rolling_summary.push_back(summary);
        while self.rolling_summary.len() > limit.max(1) {
            self.rolling_summary.pop_front();
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        now - self.last_activity > ttl
    }
}

pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &SessionKey, now: DateTime<Utc>) -> SessionHandle {
        self.sessions
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Session::new(key.clone(), now))))
            .clone()
    }

    /// Lock the live session for `key`, creating it if needed.  A handle
    /// that was expired between lookup and lock is discarded and the lookup
    /// retried, so the returned guard is always the registered session.
    pub async fn acquire(&self, key: &SessionKey, now: DateTime<Utc>) -> OwnedMutexGuard<Session> {
        loop {
            let handle = self.get_or_create(key, now);
            let guard = handle.clone().lock_owned().await;
            let current = self
                .sessions
                .lock()
                .get(key)
                .is_some_and(|registered| Arc::ptr_eq(registered, &handle));
            if current {
                return guard;
            }
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.sessions.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.sessions.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn handles(&self) -> Vec<(SessionKey, SessionHandle)> {
        self.sessions
            .lock()
            .iter()
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect()
    }

    /// Last activity of every idle session.  Sessions mid-turn are busy, not
    /// stale, and are left out.
    pub fn activity(&self) -> Vec<SessionActivity> {
        self.handles()
            .into_iter()
            .filter_map(|(key, handle)| {
                let session = handle.try_lock().ok()?;
                Some(SessionActivity {
                    key: key.to_string(),
                    last_activity: session.last_activity,
                })
            })
            .collect()
    }

    /// Remove idle sessions past `ttl` and return them.
    pub fn expire(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<Session> {
        let mut expired = Vec::new();
        for (key, handle) in self.handles() {
            let Ok(session) = handle.try_lock() else {
                continue;
            };
            if !session.is_expired(now, ttl) {
                continue;
            }
            // The session guard is held across removal so `acquire` cannot
            // validate a handle that is about to be dropped.
            let mut sessions = self.sessions.lock();
            if sessions.get(&key).is_some_and(|current| Arc::ptr_eq(current, &handle)) {
                sessions.remove(&key);
                expired.push(session.clone());
            }
        }
        expired
    }
}
