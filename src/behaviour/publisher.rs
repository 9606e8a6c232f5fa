// behaviour/publisher.rs - FIPA Subscribe, publisher side

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{AgentContext, Behaviour, BehaviourError};
use crate::acl_message::{AclMessage, Address, Performative, ProtocolType};
use crate::observability;
use crate::protocol::{ProtocolError, SubscriptionRegistry};

type SubscribeHook = Box<dyn FnMut(&Address, &str, &mut AgentContext) + Send>;

/// Read-only view of a publisher's registry.
///
/// Handed to sibling behaviours of the same agent (the contract-net
/// initiator resolves its participants through it). Only the publisher
/// writes to the registry.
#[derive(Clone, Default)]
pub struct SubscriberView {
    registry: Arc<RwLock<SubscriptionRegistry>>,
}

impl SubscriberView {
    /// Point-in-time snapshot of one topic's subscribers
    pub fn get_partial_subscribers(&self, topic: &str) -> Vec<Address> {
        self.registry.read().subscribers(topic)
    }

    pub fn is_subscribed(&self, topic: &str, subscriber: &Address) -> bool {
        self.registry.read().is_subscribed(topic, subscriber)
    }

    pub fn topics(&self) -> Vec<String> {
        self.registry.read().topics()
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }
}

/// Keeps the topic registry, answers SUBSCRIBE with AGREE, and broadcasts
/// notifications to a topic's subscribers.
pub struct Publisher {
    name: String,
    view: SubscriberView,
    on_subscribe: Option<SubscribeHook>,
    published: u64,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            name: String::from("publisher"),
            view: SubscriberView::default(),
            on_subscribe: None,
            published: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Called after each accepted SUBSCRIBE with the subscriber and topic
    pub fn on_subscribe<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&Address, &str, &mut AgentContext) + Send + 'static,
    {
        self.on_subscribe = Some(Box::new(hook));
        self
    }

    /// Shared read-only view for sibling behaviours
    pub fn subscribers(&self) -> SubscriberView {
        self.view.clone()
    }

    pub fn get_partial_subscribers(&self, topic: &str) -> Vec<Address> {
        self.view.get_partial_subscribers(topic)
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Send `msg` to the subscribers of its topic.
    ///
    /// Without a topic the message goes to every subscriber once. Returns the
    /// number of receivers; nothing is sent when there are none.
    pub fn publish(&mut self, mut msg: AclMessage, ctx: &mut AgentContext) -> usize {
        let receivers = match msg.topic.as_deref() {
            Some(topic) => self.view.get_partial_subscribers(topic),
            None => {
                let registry = self.view.registry.read();
                let mut all = Vec::new();
                for topic in registry.topics() {
                    for subscriber in registry.subscribers(&topic) {
                        if !all.contains(&subscriber) {
                            all.push(subscriber);
                        }
                    }
                }
                all
            }
        };

        if receivers.is_empty() {
            debug!(agent = %ctx.agent_name(), topic = ?msg.topic, "No subscribers, nothing published");
            return 0;
        }

        for receiver in receivers {
            msg.add_receiver(receiver);
        }
        let count = msg.receivers.len();
        self.published += 1;
        info!(agent = %ctx.agent_name(), topic = ?msg.topic, receivers = count, "Publishing");
        ctx.send(msg);
        count
    }

    fn subscribe(&mut self, msg: &AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let sender = msg.sender.clone().ok_or(ProtocolError::MissingSender)?;

        let Some(topic) = msg.topic.clone() else {
            let mut refuse = msg.create_reply();
            refuse.set_performative(Performative::Refuse);
            refuse.set_content("missing topic");
            ctx.send(refuse);
            warn!(agent = %ctx.agent_name(), from = %sender, "SUBSCRIBE without topic refused");
            return Ok(());
        };

        let (added, count) = {
            let mut registry = self.view.registry.write();
            let added = registry.add(&topic, sender.clone());
            (added, registry.count(&topic))
        };
        observability::record_subscriptions(&topic, count);

        let mut agree = msg.create_reply();
        agree.set_performative(Performative::Agree);
        ctx.send(agree);

        if added {
            info!(agent = %ctx.agent_name(), subscriber = %sender, topic = %topic, "Subscriber registered");
        } else {
            debug!(agent = %ctx.agent_name(), subscriber = %sender, topic = %topic, "Already subscribed");
        }

        if let Some(hook) = self.on_subscribe.as_mut() {
            hook(&sender, &topic, ctx);
        }
        Ok(())
    }

    fn cancel(&mut self, msg: &AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let sender = msg.sender.clone().ok_or(ProtocolError::MissingSender)?;

        let mut registry = self.view.registry.write();
        let left = registry.remove_everywhere(&sender);
        for topic in &left {
            observability::record_subscriptions(topic, registry.count(topic));
        }
        drop(registry);

        if left.is_empty() {
            debug!(agent = %ctx.agent_name(), from = %sender, "CANCEL from unknown subscriber");
        } else {
            info!(agent = %ctx.agent_name(), subscriber = %sender, topics = ?left, "Subscriber removed");
        }
        Ok(())
    }
}

impl Behaviour for Publisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Option<ProtocolType> {
        Some(ProtocolType::Subscribe)
    }

    fn status(&self) -> String {
        format!("{} subscriptions", self.view.len())
    }

    fn accepts(&self, msg: &AclMessage) -> bool {
        matches!(msg.performative, Performative::Subscribe | Performative::Cancel)
    }

    fn handle(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        match msg.performative {
            Performative::Subscribe => self.subscribe(&msg, ctx),
            Performative::Cancel => self.cancel(&msg, ctx),
            other => Err(ProtocolError::UnexpectedPerformative {
                state: "publishing",
                performative: other,
            }
            .into()),
        }
    }

    /// Local notifications are broadcast; subscription control is not ours
    fn notify(&mut self, msg: &AclMessage, ctx: &mut AgentContext) -> Result<bool, BehaviourError> {
        if matches!(msg.performative, Performative::Subscribe | Performative::Cancel) {
            return Ok(false);
        }
        self.publish(msg.clone(), ctx);
        Ok(true)
    }
}
