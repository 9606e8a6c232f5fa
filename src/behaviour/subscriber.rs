// behaviour/subscriber.rs - FIPA Subscribe, subscriber side

use std::time::Duration;
use tracing::{info, warn};

use super::{AgentContext, Behaviour, BehaviourError};
use crate::acl_message::{AclMessage, Address, ConversationId, Performative, ProtocolType};
use crate::protocol::{ProtocolError, ProtocolStateMachine, SubscribeEvent, SubscribeState};

const CANCEL_TOKEN: u64 = 1;

type MessageHook = Box<dyn FnMut(&AclMessage, &mut AgentContext) + Send>;

/// Subscribes to one topic of one publisher.
///
/// Sends SUBSCRIBE when the behaviour starts; there is no resend. INFORMs
/// from the publisher are passed to the `on_inform` hook while subscribed.
pub struct Subscriber {
    name: String,
    publisher: Address,
    topic: String,
    state: SubscribeState,
    conversation: Option<ConversationId>,
    cancel_after: Option<Duration>,
    on_agree: Option<MessageHook>,
    on_inform: Option<MessageHook>,
    informs: u64,
}

impl Subscriber {
    pub fn new(publisher: Address, topic: impl Into<String>) -> Self {
        Self {
            name: String::from("subscriber"),
            publisher,
            topic: topic.into(),
            state: SubscribeState::Idle,
            conversation: None,
            cancel_after: None,
            on_agree: None,
            on_inform: None,
            informs: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Send CANCEL this long after starting
    pub fn cancel_after(mut self, delay: Duration) -> Self {
        self.cancel_after = Some(delay);
        self
    }

    pub fn on_agree<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&AclMessage, &mut AgentContext) + Send + 'static,
    {
        self.on_agree = Some(Box::new(hook));
        self
    }

    pub fn on_inform<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&AclMessage, &mut AgentContext) + Send + 'static,
    {
        self.on_inform = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> SubscribeState {
        self.state
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn informs_received(&self) -> u64 {
        self.informs
    }

    /// Withdraw the subscription. The publisher sends no reply, so the
    /// behaviour goes straight back to idle once CANCEL is out.
    pub fn cancel(&mut self, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        self.state.apply(SubscribeEvent::CancelSent)?;

        let mut cancel = AclMessage::new(Performative::Cancel, ProtocolType::Subscribe)
            .with_receiver(self.publisher.clone())
            .with_topic(self.topic.clone());
        if let Some(id) = &self.conversation {
            cancel = cancel.with_conversation(id.clone());
        }
        ctx.send(cancel);
        info!(agent = %ctx.agent_name(), topic = %self.topic, "CANCEL sent");

        self.state.apply(SubscribeEvent::CancelDone)?;
        self.conversation = None;
        Ok(())
    }

    fn unexpected(&self, performative: Performative) -> BehaviourError {
        ProtocolError::UnexpectedPerformative {
            state: self.state.as_str(),
            performative,
        }
        .into()
    }
}

impl Behaviour for Subscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Option<ProtocolType> {
        Some(ProtocolType::Subscribe)
    }

    fn status(&self) -> String {
        format!("{} on '{}'", self.state.as_str(), self.topic)
    }

    fn on_start(&mut self, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        self.state.apply(SubscribeEvent::SubscribeSent)?;

        let subscribe = AclMessage::new(Performative::Subscribe, ProtocolType::Subscribe)
            .with_receiver(self.publisher.clone())
            .with_topic(self.topic.clone());
        self.conversation = Some(subscribe.conversation_id.clone());
        ctx.send(subscribe);
        info!(agent = %ctx.agent_name(), publisher = %self.publisher, topic = %self.topic, "SUBSCRIBE sent");

        if let Some(delay) = self.cancel_after {
            ctx.schedule(delay, CANCEL_TOKEN);
        }
        Ok(())
    }

    fn owns_conversation(&self, id: &ConversationId) -> bool {
        self.conversation.as_ref() == Some(id)
    }

    fn accepts(&self, msg: &AclMessage) -> bool {
        msg.performative == Performative::Inform && msg.sender.as_ref() == Some(&self.publisher)
    }

    fn handle(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        match msg.performative {
            Performative::Agree => {
                self.state.apply(SubscribeEvent::Agreed)?;
                info!(agent = %ctx.agent_name(), publisher = %self.publisher, topic = %self.topic, "Subscription agreed");
                if let Some(hook) = self.on_agree.as_mut() {
                    hook(&msg, ctx);
                }
                Ok(())
            }
            Performative::Refuse => {
                self.state.apply(SubscribeEvent::Refused)?;
                self.conversation = None;
                warn!(agent = %ctx.agent_name(), publisher = %self.publisher, reason = %msg.content, "Subscription refused");
                Ok(())
            }
            Performative::Inform if self.state == SubscribeState::Subscribed => {
                self.informs += 1;
                info!(agent = %ctx.agent_name(), from = %msg.sender_name(), content = %msg.content, "INFORM received");
                if let Some(hook) = self.on_inform.as_mut() {
                    hook(&msg, ctx);
                }
                Ok(())
            }
            other => Err(self.unexpected(other)),
        }
    }

    fn on_time(&mut self, token: u64, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        if token == CANCEL_TOKEN && self.state != SubscribeState::Idle {
            self.cancel(ctx)?;
        }
        Ok(())
    }

    /// A local CANCEL on this topic (or without a topic) withdraws the subscription
    fn notify(&mut self, msg: &AclMessage, ctx: &mut AgentContext) -> Result<bool, BehaviourError> {
        let for_us = msg.topic.as_deref().is_none_or(|t| t == self.topic);
        if msg.performative != Performative::Cancel || !for_us {
            return Ok(false);
        }
        self.cancel(ctx)?;
        Ok(true)
    }
}
