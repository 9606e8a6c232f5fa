// protocol/subscribe.rs - FIPA Subscribe Protocol

use std::collections::BTreeMap;

use super::state_machine::ProtocolStateMachine;
use crate::acl_message::Address;

/// Subscriber-side states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribeState {
    #[default]
    Idle,
    SubscribeSent,
    Subscribed,
    CancelSent,
}

/// Subscriber-side events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeEvent {
    SubscribeSent,
    Agreed,
    Refused,
    CancelSent,
    CancelDone,
}

impl ProtocolStateMachine for SubscribeState {
    type Event = SubscribeEvent;

    fn as_str(&self) -> &'static str {
        match self {
            SubscribeState::Idle => "idle",
            SubscribeState::SubscribeSent => "subscribe_sent",
            SubscribeState::Subscribed => "subscribed",
            SubscribeState::CancelSent => "cancel_sent",
        }
    }

    fn next(self, event: &SubscribeEvent) -> Option<Self> {
        use SubscribeEvent as E;
        use SubscribeState::*;

        match (self, event) {
            (Idle, E::SubscribeSent) => Some(SubscribeSent),
            (SubscribeSent, E::Agreed) => Some(Subscribed),
            (SubscribeSent, E::Refused) => Some(Idle),
            (SubscribeSent | Subscribed, E::CancelSent) => Some(CancelSent),
            (CancelSent, E::CancelDone) => Some(Idle),
            _ => None,
        }
    }
}

/// Publisher-side registry: topic to subscriber set.
///
/// Each topic keeps its subscribers in registration order, without duplicates.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    topics: BTreeMap<String, Vec<Address>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` on `topic`; returns false if it was already there
    pub fn add(&mut self, topic: &str, subscriber: Address) -> bool {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        if subscribers.contains(&subscriber) {
            return false;
        }
        subscribers.push(subscriber);
        true
    }

    /// Remove `subscriber` from every topic; returns the topics it left
    pub fn remove_everywhere(&mut self, subscriber: &Address) -> Vec<String> {
        let mut left = Vec::new();
        for (topic, subscribers) in self.topics.iter_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s != subscriber);
            if subscribers.len() != before {
                left.push(topic.clone());
            }
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
        left
    }

    /// Point-in-time copy of one topic's subscribers
    pub fn subscribers(&self, topic: &str) -> Vec<Address> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &str, subscriber: &Address) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subscribers| subscribers.contains(subscriber))
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    /// Total subscriptions across topics
    pub fn len(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_lifecycle() {
        let mut state = SubscribeState::default();
        state.apply(SubscribeEvent::SubscribeSent).unwrap();
        state.apply(SubscribeEvent::Agreed).unwrap();
        assert_eq!(state, SubscribeState::Subscribed);

        assert!(state.apply(SubscribeEvent::Agreed).is_err());
        assert_eq!(state, SubscribeState::Subscribed);

        state.apply(SubscribeEvent::CancelSent).unwrap();
        state.apply(SubscribeEvent::CancelDone).unwrap();
        assert_eq!(state, SubscribeState::Idle);
    }

    #[test]
    fn test_refusal_returns_to_idle() {
        let mut state = SubscribeState::SubscribeSent;
        assert_eq!(state.apply(SubscribeEvent::Refused), Ok(SubscribeState::Idle));
        assert!(!state.can_apply(&SubscribeEvent::CancelSent));
    }

    #[test]
    fn test_registry_add_and_remove() {
        let m1 = Address::local("machine_1", 20001);
        let m2 = Address::local("machine_2", 20002);
        let job = Address::local("job_1", 30100);

        let mut registry = SubscriptionRegistry::new();
        assert!(registry.add("machine", m1.clone()));
        assert!(!registry.add("machine", m1.clone()));
        assert!(registry.add("machine", m2.clone()));
        assert!(registry.add("job", job.clone()));
        assert!(registry.add("job", m1.clone()));

        assert_eq!(registry.subscribers("machine"), vec![m1.clone(), m2.clone()]);
        assert_eq!(registry.len(), 4);

        let left = registry.remove_everywhere(&m1);
        assert_eq!(left, vec!["job".to_string(), "machine".to_string()]);
        assert_eq!(registry.subscribers("machine"), vec![m2]);
        assert!(!registry.is_subscribed("job", &m1));

        registry.remove_everywhere(&job);
        assert_eq!(registry.topics(), vec!["machine".to_string()]);
        assert!(registry.subscribers("job").is_empty());
    }
}
