// protocol/conversation.rs - Conversation correlation and deadlines

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::state_machine::{ProtocolError, Role};
use crate::acl_message::ConversationId;

#[derive(Debug)]
struct Tracked<S> {
    state: S,
    opened_at: Instant,
    deadline: Option<Instant>,
}

/// Per-behaviour table of open conversations.
///
/// Replies are correlated by conversation id. Each entry may carry a
/// deadline; `expired` lists the entries whose deadline has passed so the
/// owner can time them out from a timer callback.
#[derive(Debug)]
pub struct ConversationTracker<S> {
    role: Role,
    entries: HashMap<ConversationId, Tracked<S>>,
}

impl<S> ConversationTracker<S> {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            entries: HashMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Start tracking a conversation; ids must be unique
    pub fn open(
        &mut self,
        id: ConversationId,
        state: S,
        timeout: Option<Duration>,
    ) -> Result<&mut S, ProtocolError> {
        if self.entries.contains_key(&id) {
            return Err(ProtocolError::DuplicateConversation(id.to_string()));
        }
        let now = Instant::now();
        let tracked = self.entries.entry(id).or_insert(Tracked {
            state,
            opened_at: now,
            deadline: timeout.map(|t| now + t),
        });
        Ok(&mut tracked.state)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&S> {
        self.entries.get(id).map(|t| &t.state)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut S> {
        self.entries.get_mut(id).map(|t| &mut t.state)
    }

    /// Like `get_mut` but an unknown id is an error
    pub fn require(&mut self, id: &ConversationId) -> Result<&mut S, ProtocolError> {
        self.get_mut(id)
            .ok_or_else(|| ProtocolError::UnknownConversation(id.to_string()))
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.entries.contains_key(id)
    }

    /// Replace the deadline, counting from now
    pub fn set_timeout(&mut self, id: &ConversationId, timeout: Option<Duration>) {
        if let Some(tracked) = self.entries.get_mut(id) {
            tracked.deadline = timeout.map(|t| Instant::now() + t);
        }
    }

    /// Time since the conversation was opened
    pub fn age(&self, id: &ConversationId) -> Option<Duration> {
        self.entries.get(id).map(|t| t.opened_at.elapsed())
    }

    /// Conversations whose deadline is at or before `now`
    pub fn expired(&self, now: Instant) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, t)| t.deadline.is_some_and(|d| d <= now))
            .map(|(id, t)| (t.opened_at, id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn close(&mut self, id: &ConversationId) -> Option<S> {
        self.entries.remove(id).map(|t| t.state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConversationId, &S)> {
        self.entries.iter().map(|(id, t)| (id, &t.state))
    }
}
