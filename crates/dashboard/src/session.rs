//! In-memory interactive sessions.
//!
//! A session remembers the last upload and the last outcome so the page can
//! be reloaded and an upload retried. Nothing is written to disk; idle
//! sessions are dropped after the TTL, and once the store is full the least
//! recently seen session makes room for a new one.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use actix_web::web::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{client::ProcessResult, messages::UserMessage};

pub const SESSION_COOKIE: &str = "dashboard_session";

#[derive(Clone, Debug)]
pub struct StoredUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LastOutcome {
    Success { result: ProcessResult },
    Failure { error: UserMessage },
}

#[derive(Debug)]
struct Session {
    upload: Option<StoredUpload>,
    outcome: Option<LastOutcome>,
    attempts: u32,
    last_seen: Instant,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            upload: None,
            outcome: None,
            attempts: 0,
            last_seen: now,
        }
    }
}

/// What `GET /session` reports.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionView {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<usize>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub outcome: Option<LastOutcome>,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    max_sessions: usize,
}

impl SessionStore {
    /// `max_sessions` is clamped to at least one.
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resume the session named by `id` or start a new one. Returns the
    /// session id and whether it was created.
    pub fn open(&self, id: Option<&str>) -> (String, bool) {
        let now = Instant::now();
        let mut sessions = self.lock();
        purge(&mut sessions, now, self.ttl);
        if let Some(id) = id {
            if let Some(session) = sessions.get_mut(id) {
                session.last_seen = now;
                return (id.to_string(), false);
            }
        }
        let id = Uuid::new_v4().to_string();
        self.insert(&mut sessions, id.clone(), now);
        (id, true)
    }

    /// Resume the session named by `id` without ever creating one.
    pub fn resume(&self, id: &str) -> Option<String> {
        let now = Instant::now();
        let mut sessions = self.lock();
        purge(&mut sessions, now, self.ttl);
        let session = sessions.get_mut(id)?;
        session.last_seen = now;
        Some(id.to_string())
    }

    pub fn record_upload(&self, id: &str, upload: StoredUpload) {
        let now = Instant::now();
        let mut sessions = self.lock();
        if !sessions.contains_key(id) {
            self.insert(&mut sessions, id.to_string(), now);
        }
        if let Some(session) = sessions.get_mut(id) {
            session.upload = Some(upload);
            session.outcome = None;
            session.attempts = 0;
            session.last_seen = now;
        }
    }

    pub fn last_upload(&self, id: &str) -> Option<StoredUpload> {
        self.lock().get(id).and_then(|session| session.upload.clone())
    }

    pub fn record_outcome(&self, id: &str, outcome: LastOutcome) {
        if let Some(session) = self.lock().get_mut(id) {
            session.attempts += 1;
            session.outcome = Some(outcome);
            session.last_seen = Instant::now();
        }
    }

    pub fn view(&self, id: &str) -> SessionView {
        let sessions = self.lock();
        let Some(session) = sessions.get(id) else {
            return SessionView::default();
        };
        let upload = session.upload.as_ref();
        SessionView {
            file_name: upload.map(|u| u.file_name.clone()),
            content_type: upload.map(|u| u.content_type.clone()),
            size_bytes: upload.map(|u| u.bytes.len()),
            uploaded_at: upload.map(|u| u.uploaded_at),
            attempts: session.attempts,
            outcome: session.outcome.clone(),
        }
    }

    /// Forget a session; returns whether it existed.
    pub fn clear(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) {
        purge(&mut self.lock(), now, self.ttl);
    }

    fn insert(&self, sessions: &mut HashMap<String, Session>, id: String, now: Instant) {
        while sessions.len() >= self.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, session)| session.last_seen)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
        }
        sessions.insert(id, Session::new(now));
    }
}

fn purge(sessions: &mut HashMap<String, Session>, now: Instant, ttl: Duration) {
    sessions.retain(|_, session| now.saturating_duration_since(session.last_seen) <= ttl);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages;

    fn upload(name: &str) -> StoredUpload {
        StoredUpload {
            file_name: name.into(),
            content_type: "image/png".into(),
            bytes: Bytes::from_static(b"\x89PNG"),
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn open_resumes_known_sessions_only() {
        let store = SessionStore::new(Duration::from_secs(60), 16);
        let (id, created) = store.open(None);
        assert!(created);
        assert_eq!(store.open(Some(&id)), (id.clone(), false));

        let (other, created) = store.open(Some("forged-id"));
        assert!(created);
        assert_ne!(other, "forged-id");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn uploads_and_outcomes_are_kept_per_session() {
        let store = SessionStore::new(Duration::from_secs(60), 16);
        let (a, _) = store.open(None);
        let (b, _) = store.open(None);
        store.record_upload(&a, upload("a.png"));
        store.record_outcome(&a, LastOutcome::Failure {
            error: messages::local("overloaded", None),
        });

        let view = store.view(&a);
        assert_eq!(view.file_name.as_deref(), Some("a.png"));
        assert_eq!(view.size_bytes, Some(4));
        assert_eq!(view.attempts, 1);
        assert!(matches!(view.outcome, Some(LastOutcome::Failure { .. })));
        assert!(store.last_upload(&b).is_none());
        assert!(store.view(&b).outcome.is_none());
    }

    #[test]
    fn new_upload_resets_previous_outcome() {
        let store = SessionStore::new(Duration::from_secs(60), 16);
        let (id, _) = store.open(None);
        store.record_upload(&id, upload("first.png"));
        store.record_outcome(&id, LastOutcome::Failure {
            error: messages::local("timeout", None),
        });
        store.record_upload(&id, upload("second.png"));
        let view = store.view(&id);
        assert_eq!(view.file_name.as_deref(), Some("second.png"));
        assert_eq!(view.attempts, 0);
        assert!(view.outcome.is_none());
    }

    #[test]
    fn idle_sessions_expire() {
        let store = SessionStore::new(Duration::from_secs(1), 16);
        let (id, _) = store.open(None);
        store.record_upload(&id, upload("x.png"));
        store.purge_expired_at(Instant::now() + Duration::from_secs(5));
        assert!(store.is_empty());
        assert!(store.last_upload(&id).is_none());
    }

    #[test]
    fn full_store_evicts_the_least_recently_seen_session() {
        let store = SessionStore::new(Duration::from_secs(60), 2);
        let (first, _) = store.open(None);
        std::thread::sleep(Duration::from_millis(2));
        let (second, _) = store.open(None);
        std::thread::sleep(Duration::from_millis(2));
        store.record_upload(&first, upload("kept.png"));

        for _ in 0..50 {
            let (newest, created) = store.open(None);
            assert!(created);
            assert!(store.len() <= 2);
            assert!(store.resume(&newest).is_some());
            std::thread::sleep(Duration::from_millis(1));
            assert_eq!(store.resume(&first), Some(first.clone()));
        }
        assert_eq!(store.len(), 2);
        assert!(store.resume(&second).is_none());
        assert_eq!(store.last_upload(&first).unwrap().file_name, "kept.png");
    }

    #[test]
    fn resume_never_creates_a_session() {
        let store = SessionStore::new(Duration::from_secs(60), 4);
        for n in 0..10 {
            assert!(store.resume(&format!("unknown-{n}")).is_none());
        }
        assert!(store.is_empty());

        let (id, _) = store.open(None);
        assert_eq!(store.resume(&id), Some(id.clone()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_forgets_everything() {
        let store = SessionStore::new(Duration::from_secs(60), 16);
        let (id, _) = store.open(None);
        store.record_upload(&id, upload("x.png"));
        assert!(store.clear(&id));
        assert!(!store.clear(&id));
        assert!(store.view(&id).file_name.is_none());
    }
}
