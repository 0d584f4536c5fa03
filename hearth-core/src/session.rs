//! Conversation sessions with bounded turn history.
//!
//! The core keeps only a bounded in-memory window per session; durable
//! transcripts belong to the persistence collaborator. Sessions hold a
//! model *id* binding, never a handle, so an evicted model can never be
//! dangled into; the next turn simply reloads it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

/// One completed prompt/response exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub request_id: Uuid,
    pub model_id: String,
    pub prompt: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation session.
#[derive(Debug, Serialize)]
pub struct ConversationSession {
    pub id: String,
    bound_model: Option<String>,
    turns: VecDeque<Turn>,
    capacity: usize,
    last_active: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            bound_model: None,
            turns: VecDeque::new(),
            capacity: capacity.max(1),
            last_active: Utc::now(),
        }
    }

    /// The model this session is bound to, if any.
    pub fn bound_model(&self) -> Option<&str> {
        self.bound_model.as_deref()
    }

    /// Bind (or rebind, on hot-swap) the session to a model id.
    pub fn bind_model(&mut self, model_id: impl Into<String>) {
        self.bound_model = Some(model_id.into());
        self.last_active = Utc::now();
    }

    /// Append a turn, evicting the oldest once past capacity.
    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.capacity {
            self.turns.pop_front();
        }
        self.last_active = Utc::now();
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(prompt: &str) -> Turn {
        Turn {
            request_id: Uuid::new_v4(),
            model_id: "m".into(),
            prompt: prompt.into(),
            response: format!("re: {prompt}"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_history_is_bounded_oldest_first() {
        let mut session = ConversationSession::new("s1", 3);
        for i in 0..5 {
            session.push_turn(turn(&format!("p{i}")));
        }
        assert_eq!(session.turn_count(), 3);
        let prompts: Vec<_> = session.turns().map(|t| t.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["p2", "p3", "p4"]);
    }

    #[test]
    fn test_binding_can_be_rebound() {
        let mut session = ConversationSession::new("s1", 8);
        assert!(session.bound_model().is_none());
        session.bind_model("a");
        assert_eq!(session.bound_model(), Some("a"));
        session.bind_model("b");
        assert_eq!(session.bound_model(), Some("b"));
    }

    #[test]
    fn test_capacity_of_zero_keeps_one_turn() {
        let mut session = ConversationSession::new("s1", 0);
        session.push_turn(turn("p0"));
        session.push_turn(turn("p1"));
        assert_eq!(session.turn_count(), 1);
    }
}
