//! Per-session conversation window used to resolve follow-up questions.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_WINDOW_SIZE: usize = 5;

/// One accepted question/query/summary triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub question: String,
    pub sql: String,
    pub summary: String,
}

impl Interaction {
    pub fn new(question: impl Into<String>, sql: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            sql: sql.into(),
            summary: summary.into(),
        }
    }
}

/// Bounded FIFO windows keyed by session id.
#[derive(Clone)]
pub struct ConversationMemory {
    windows: Arc<DashMap<String, VecDeque<Interaction>>>,
    max_entries: usize,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl ConversationMemory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Append an interaction, evicting the oldest entries beyond capacity.
    pub fn add_interaction(&self, session_id: &str, interaction: Interaction) {
        let mut window = self
            .windows
            .entry(session_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.max_entries));
        window.push_back(interaction);
        while window.len() > self.max_entries {
            window.pop_front();
        }
    }

    pub fn history(&self, session_id: &str) -> Vec<Interaction> {
        self.windows
            .get(session_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.windows.get(session_id).map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, session_id: &str) -> bool {
        self.len(session_id) == 0
    }

    /// The window as prompt text, oldest first. Empty when there is no history.
    pub fn context_text(&self, session_id: &str) -> String {
        let Some(window) = self.windows.get(session_id) else {
            return String::new();
        };
        window
            .iter()
            .enumerate()
            .map(|(i, item)| {
                format!(
                    "Previous Question {}: {}\nSQL Used: {}\nResult Summary: {}",
                    i + 1,
                    item.question,
                    item.sql,
                    item.summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn clear_session(&self, session_id: &str) {
        self.windows.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(i: usize) -> Interaction {
        Interaction::new(format!("q{}", i), format!("SELECT {}", i), format!("s{}", i))
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let memory = ConversationMemory::default();
        for i in 0..23 {
            memory.add_interaction("s", item(i));
            assert!(memory.len("s") <= DEFAULT_WINDOW_SIZE);
        }
        assert_eq!(memory.len("s"), 5);
    }

    #[test]
    fn test_eviction_is_fifo() {
        let memory = ConversationMemory::default();
        for i in 0..8 {
            memory.add_interaction("s", item(i));
        }
        let questions: Vec<String> = memory.history("s").into_iter().map(|i| i.question).collect();
        assert_eq!(questions, vec!["q3", "q4", "q5", "q6", "q7"]);
    }

    #[test]
    fn test_sessions_are_independent() {
        let memory = ConversationMemory::default();
        memory.add_interaction("a", item(1));
        memory.add_interaction("b", item(2));
        memory.clear_session("a");
        assert!(memory.is_empty("a"));
        assert_eq!(memory.len("b"), 1);
    }

    #[test]
    fn test_context_text_format() {
        let memory = ConversationMemory::default();
        assert_eq!(memory.context_text("s"), "");
        memory.add_interaction("s", Interaction::new("total sales?", "SELECT SUM(x) FROM t", "42"));
        memory.add_interaction("s", Interaction::new("by region?", "SELECT r, SUM(x) FROM t GROUP BY r", "3 rows"));
        let text = memory.context_text("s");
        assert!(text.starts_with("Previous Question 1: total sales?\nSQL Used: SELECT SUM(x) FROM t\nResult Summary: 42"));
        assert!(text.contains("Previous Question 2: by region?"));
    }

    #[test]
    fn test_concurrent_appends_stay_bounded() {
        let memory = ConversationMemory::default();
        std::thread::scope(|scope| {
            for t in 0..4 {
                let memory = memory.clone();
                scope.spawn(move || {
                    for i in 0..50 {
                        memory.add_interaction("shared", item(t * 100 + i));
                    }
                });
            }
        });
        assert_eq!(memory.len("shared"), 5);
    }
}
