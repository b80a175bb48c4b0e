//! In-memory conversation state keyed by session id.
//!
//! Each entry holds the bounded transcript plus the two candidate lists used for
//! ordinal references. All mutations complete under the map's shard lock and never
//! await.

use crate::outcome::Intent;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nt_llm::ChatMessage;
use nt_tasks::Task;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub pending_intent: Option<Intent>,
    pub pending_candidates: Vec<Task>,
    pub recent_candidates: Vec<Task>,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            created_at: now,
            last_active: now,
            pending_intent: None,
            pending_candidates: Vec::new(),
            recent_candidates: Vec::new(),
        }
    }

    fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    fn truncate_to(&mut self, max_messages: usize) {
        if self.messages.len() > max_messages {
            let overflow = self.messages.len() - max_messages;
            self.messages.drain(..overflow);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub messages: usize,
    pub pending_intent: Option<Intent>,
    pub pending_candidates: usize,
    pub recent_candidates: usize,
}

pub struct SessionStore {
    sessions: DashMap<String, Session>,
    max_messages: usize,
}

impl SessionStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_messages: max_messages.max(1),
        }
    }

    /// Returns a snapshot of the session, creating it (with a fresh id when none is
    /// given) on first reference.
    pub fn get_or_create(&self, session_id: Option<&str>) -> Session {
        let id = session_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut entry = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id));
        entry.touch();
        entry.clone()
    }

    fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id.to_string()));
        entry.touch();
        f(&mut entry)
    }

    pub fn replace_messages(&self, session_id: &str, messages: Vec<ChatMessage>) {
        let max = self.max_messages;
        self.with_session(session_id, |session| {
            session.messages = messages;
            session.truncate_to(max);
        });
    }

    pub fn append_messages(&self, session_id: &str, messages: Vec<ChatMessage>) {
        let max = self.max_messages;
        self.with_session(session_id, |session| {
            session.messages.extend(messages);
            session.truncate_to(max);
        });
    }

    pub fn messages(&self, session_id: &str) -> Vec<ChatMessage> {
        self.sessions
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    pub fn set_pending(&self, session_id: &str, intent: Intent, candidates: Vec<Task>) {
        self.with_session(session_id, |session| {
            session.pending_intent = Some(intent);
            session.pending_candidates = candidates;
        });
    }

    pub fn clear_pending(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.pending_intent = None;
            session.pending_candidates.clear();
            session.touch();
        }
    }

    pub fn pending(&self, session_id: &str) -> (Option<Intent>, Vec<Task>) {
        self.sessions
            .get(session_id)
            .map(|s| (s.pending_intent, s.pending_candidates.clone()))
            .unwrap_or_default()
    }

    pub fn set_recent(&self, session_id: &str, candidates: Vec<Task>) {
        self.with_session(session_id, |session| {
            session.recent_candidates = candidates;
        });
    }

    pub fn clear_recent(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.recent_candidates.clear();
            session.touch();
        }
    }

    pub fn recent(&self, session_id: &str) -> Vec<Task> {
        self.sessions
            .get(session_id)
            .map(|s| s.recent_candidates.clone())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let s = entry.value();
                SessionSummary {
                    id: s.id.clone(),
                    created_at: s.created_at,
                    last_active: s.last_active,
                    messages: s.messages.len(),
                    pending_intent: s.pending_intent,
                    pending_candidates: s.pending_candidates.len(),
                    recent_candidates: s.recent_candidates.len(),
                }
            })
            .collect();
        out.sort_by_key(|s| s.last_active);
        out.reverse();
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> ChatMessage {
        ChatMessage::user(text)
    }

    #[test]
    fn get_or_create_is_stable_and_generates_ids() {
        let store = SessionStore::new(12);
        let fresh = store.get_or_create(None);
        assert!(Uuid::parse_str(&fresh.id).is_ok());
        let again = store.get_or_create(Some(&fresh.id));
        assert_eq!(again.id, fresh.id);
        let named = store.get_or_create(Some("abc"));
        assert_eq!(named.id, "abc");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn message_ring_drops_oldest() {
        let store = SessionStore::new(3);
        let id = store.get_or_create(None).id;
        store.append_messages(&id, vec![user("1"), user("2")]);
        store.append_messages(&id, vec![user("3"), user("4")]);
        let contents: Vec<String> = store
            .messages(&id)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["2", "3", "4"]);

        store.replace_messages(&id, vec![user("a"), user("b"), user("c"), user("d"), user("e")]);
        let contents: Vec<String> = store
            .messages(&id)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["c", "d", "e"]);
    }

    #[test]
    fn pending_and_recent_are_independent() {
        let store = SessionStore::new(12);
        let id = store.get_or_create(None).id;
        store.set_recent(&id, vec![Task::new("r1", "recent")]);
        store.set_pending(&id, Intent::Update, vec![Task::new("p1", "pending")]);

        let (intent, pending) = store.pending(&id);
        assert_eq!(intent, Some(Intent::Update));
        assert_eq!(pending.len(), 1);

        store.clear_pending(&id);
        assert_eq!(store.pending(&id), (None, Vec::new()));
        assert_eq!(store.recent(&id).len(), 1);

        store.clear_recent(&id);
        assert!(store.recent(&id).is_empty());
    }

    #[test]
    fn unknown_sessions_read_as_empty() {
        let store = SessionStore::new(12);
        assert!(store.messages("missing").is_empty());
        assert!(store.recent("missing").is_empty());
        store.clear_pending("missing");
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn list_reports_counts() {
        let store = SessionStore::new(12);
        let id = store.get_or_create(Some("s1")).id;
        store.append_messages(&id, vec![user("hi")]);
        store.set_recent(&id, vec![Task::new("a", "a"), Task::new("b", "b")]);
        let summaries = store.list();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].messages, 1);
        assert_eq!(summaries[0].recent_candidates, 2);
        assert_eq!(summaries[0].pending_candidates, 0);
    }
}
