// behaviour/mod.rs - Protocol behaviours bound to an agent
//
//! Behaviours are the protocol roles an agent plays.
//!
//! An agent owns an ordered list of behaviours. The runtime routes each
//! inbound message to them, fires their timers, and applies the effects they
//! record on the `AgentContext`. Every callback runs to completion on the
//! agent's loop, so behaviour state needs no locking.
//!
//! # Behaviour Types
//!
//! - `Subscriber` - FIPA Subscribe, subscriber side
//! - `Publisher` - FIPA Subscribe, publisher side with a topic registry
//! - `ContractNetInitiator` - issues CFPs and awards contracts
//! - `ContractNetParticipant` - bids on CFPs
//! - `TimedBehaviour` - fixed-period repeater
//!
//! # Example
//!
//! ```ignore
//! let publisher = Publisher::new();
//! let initiator = ContractNetInitiator::new(publisher.subscribers(), InitiatorConfig::default());
//! let spec = AgentSpec::new(pool_address)
//!     .with_behaviour(publisher)
//!     .with_behaviour(initiator);
//! ```

mod context;
mod initiator;
mod participant;
mod publisher;
mod subscriber;
mod timed;

pub use context::{AgentContext, BlockingJob, Continuation, Effect};
pub use initiator::{ContractNetInitiator, RoundOutcome};
pub use participant::{BidStrategy, ContractNetParticipant};
pub use publisher::{Publisher, SubscriberView};
pub use subscriber::Subscriber;
pub use timed::TimedBehaviour;

use crate::acl_message::{AclMessage, ConversationId, MessageError, ProtocolType};
use crate::protocol::ProtocolError;

/// Position of a behaviour in its agent; behaviours are never removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BehaviourId(pub usize);

/// Behaviour error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum BehaviourError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("{0}")]
    Failed(String),
}

/// A protocol role attached to one agent
pub trait Behaviour: Send + 'static {
    fn name(&self) -> &str;

    /// Protocol this behaviour speaks; `None` receives no messages
    fn protocol(&self) -> Option<ProtocolType> {
        None
    }

    /// Short state description for status reports
    fn status(&self) -> String {
        String::from("active")
    }

    fn on_start(&mut self, _ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        Ok(())
    }

    /// The behaviour has an open conversation with this id
    fn owns_conversation(&self, _id: &ConversationId) -> bool {
        false
    }

    /// Willing to take a message that no behaviour owns
    fn accepts(&self, _msg: &AclMessage) -> bool {
        false
    }

    fn handle(&mut self, _msg: AclMessage, _ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        Ok(())
    }

    fn on_time(&mut self, _token: u64, _ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        Ok(())
    }

    /// Local request from the agent or a sibling behaviour; `Ok(true)` if taken
    fn notify(&mut self, _msg: &AclMessage, _ctx: &mut AgentContext) -> Result<bool, BehaviourError> {
        Ok(false)
    }
}

/// Pick the behaviours an inbound message goes to.
///
/// Among behaviours of the message's protocol, the one owning the
/// conversation gets it alone; otherwise every behaviour that accepts it.
pub fn route(behaviours: &[Box<dyn Behaviour>], msg: &AclMessage) -> Vec<BehaviourId> {
    let speaking: Vec<_> = behaviours
        .iter()
        .enumerate()
        .filter(|(_, b)| b.protocol().as_ref() == Some(&msg.protocol))
        .collect();

    if let Some((index, _)) = speaking
        .iter()
        .find(|(_, b)| b.owns_conversation(&msg.conversation_id))
    {
        return vec![BehaviourId(*index)];
    }

    speaking
        .into_iter()
        .filter(|(_, b)| b.accepts(msg))
        .map(|(index, _)| BehaviourId(index))
        .collect()
}
