//! In-process session registry.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::types::{ChatMessage, QueryResponse, Session, SessionSummary};
use crate::utils::TextUtils;

const TITLE_MAX_CHARS: usize = 50;

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session if the id is unseen.
    pub fn ensure(&self, session_id: &str) {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Append the user question and the assistant response as one exchange.
    pub fn record_exchange(&self, session_id: &str, question: &str, response: QueryResponse) {
        self.record_exchange_with(session_id, question, response, || {});
    }

    /// As [`record_exchange`](Self::record_exchange), running `also` while the session entry is
    /// held so a concurrent removal sees both or neither.
    pub fn record_exchange_with(&self, session_id: &str, question: &str, response: QueryResponse, also: impl FnOnce()) {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.messages.push(ChatMessage::user(question));
        session.messages.push(ChatMessage::assistant(response));
        session.updated_at = Utc::now();
        if session.title.is_none() {
            session.title = Some(TextUtils::truncate_chars(question.trim(), TITLE_MAX_CHARS).into_owned());
        }
        also();
        debug!("Session {} now has {} messages", session_id, session.messages.len());
    }

    /// The question of the user message preceding the given assistant message.
    pub fn question_for_message(&self, session_id: &str, message_id: &str) -> Option<String> {
        let session = self.sessions.get(session_id)?;
        let index = session.messages.iter().position(|m| m.id == message_id)?;
        session.messages[..index]
            .iter()
            .rev()
            .find(|m| m.role == super::types::Role::User)
            .map(|m| m.content.clone())
    }

    /// Most recently updated first.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self.sessions.iter().map(|s| SessionSummary::from(s.value())).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.into_iter().skip(offset).take(limit).collect()
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.remove_with(session_id, || {})
    }

    /// Remove the session, running `also` under the same entry lock whether or not it existed.
    pub fn remove_with(&self, session_id: &str, also: impl FnOnce()) -> bool {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => {
                also();
                entry.remove();
                true
            }
            Entry::Vacant(_) => {
                also();
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_exchange_titles_session() {
        let store = SessionStore::new();
        let long = "Show me the total revenue broken down by product category and region for last year";
        store.record_exchange("s1", long, QueryResponse::running("s1", "m1"));
        store.record_exchange("s1", "and this year?", QueryResponse::running("s1", "m2"));

        let session = store.get("s1").unwrap();
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.title.as_deref().map(|t| t.chars().count()), Some(50));
        assert!(long.starts_with(session.title.as_deref().unwrap()));
        assert_eq!(store.question_for_message("s1", "m2").as_deref(), Some("and this year?"));
        assert_eq!(store.question_for_message("s1", "missing"), None);
    }

    #[test]
    fn test_list_orders_by_update_and_paginates() {
        let store = SessionStore::new();
        for id in ["a", "b", "c"] {
            store.record_exchange(id, id, QueryResponse::running(id, format!("m-{}", id)));
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let ids: Vec<String> = store.list(10, 0).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        let page: Vec<String> = store.list(1, 1).into_iter().map(|s| s.id).collect();
        assert_eq!(page, vec!["b"]);
    }

    #[test]
    fn test_remove() {
        let store = SessionStore::new();
        store.ensure("s1");
        assert!(store.contains("s1"));
        assert!(store.remove("s1"));
        assert!(!store.remove("s1"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_with_runs_callback_either_way() {
        let store = SessionStore::new();
        store.ensure("s1");
        let mut calls = 0;
        assert!(store.remove_with("s1", || calls += 1));
        assert!(!store.remove_with("s1", || calls += 1));
        assert_eq!(calls, 2);
        assert!(!store.contains("s1"));
    }
}
