// actor/messages.rs - Messages accepted by agents and the organization

use actix::prelude::*;
use std::time::Duration;

use super::{AgentHandle, AgentSpec};
use crate::acl_message::{AclMessage, Address};
use crate::behaviour::{Behaviour, BehaviourError, Continuation};
use crate::network::TransportError;
use crate::scheduler::TimerHandle;

/// Deliver an inbound ACL message to an agent
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct DeliverMessage {
    pub message: AclMessage,
}

/// Local request offered to the agent's behaviours of the message's protocol
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct Notify {
    pub message: AclMessage,
}

/// Attach a behaviour to a running agent; its `on_start` runs right away
#[derive(Message)]
#[rtype(result = "()")]
pub struct AddBehaviour {
    pub behaviour: Box<dyn Behaviour>,
}

/// Run a callback on the agent's loop after `delay`
#[derive(Message)]
#[rtype(result = "Result<TimerHandle, AgentError>")]
pub struct CallLater {
    pub delay: Duration,
    pub callback: Continuation,
}

/// Stop the agent for good
#[derive(Message, Clone, Copy, Debug)]
#[rtype(result = "()")]
pub struct Deactivate;

/// Snapshot of one agent's runtime state
#[derive(Message)]
#[rtype(result = "AgentStatus")]
pub struct GetStatus;

// =============================================================================
// Organization Messages
// =============================================================================

/// Bind and start an agent from its spec
#[derive(Message)]
#[rtype(result = "Result<AgentHandle, AgentError>")]
pub struct SpawnAgent {
    pub spec: AgentSpec,
}

/// Find a live agent by name
#[derive(Message)]
#[rtype(result = "Option<AgentHandle>")]
pub struct LookupAgent {
    pub name: String,
}

/// Every live agent, sorted by name
#[derive(Message)]
#[rtype(result = "Vec<AgentInfo>")]
pub struct ListAgents;

/// Sent by an agent as it stops
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct AgentStopped {
    pub name: String,
}

/// Stop accepting agents and hand back every live one for deactivation
#[derive(Message)]
#[rtype(result = "Vec<AgentHandle>")]
pub struct Shutdown;

// =============================================================================
// Supporting Types
// =============================================================================

/// Failures surfaced by agent and organization handles
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("Agent already exists: {0}")]
    AlreadyExists(String),

    #[error("Agent {0} is not running")]
    NotRunning(String),

    #[error("Organization is shutting down")]
    ShuttingDown,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Behaviour error: {0}")]
    Behaviour(#[from] BehaviourError),

    #[error("Timeout")]
    Timeout,

    #[error("Actor mailbox error")]
    MailboxError,
}

/// Lifecycle of an agent actor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentRuntimeState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl AgentRuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRuntimeState::Starting => "starting",
            AgentRuntimeState::Running => "running",
            AgentRuntimeState::Stopping => "stopping",
            AgentRuntimeState::Stopped => "stopped",
        }
    }
}

/// One behaviour in a status report
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BehaviourStatus {
    pub name: String,
    pub status: String,
}

/// Answer to `GetStatus`
#[derive(Clone, Debug)]
pub struct AgentStatus {
    pub address: Address,
    pub state: AgentRuntimeState,
    pub listening: bool,
    /// Accepted connections currently being read
    pub inbound_connections: usize,
    /// Peers with a pooled outbound connection
    pub outbound_links: usize,
    pub behaviours: Vec<BehaviourStatus>,
    pub pending_timers: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub delivery_failures: u64,
    pub handler_errors: u64,
    pub uptime_secs: u64,
}

impl<A, M> actix::dev::MessageResponse<A, M> for AgentStatus
where
    A: actix::Actor,
    M: actix::Message<Result = AgentStatus>,
{
    fn handle(self, _ctx: &mut A::Context, tx: Option<actix::dev::OneshotSender<M::Result>>) {
        if let Some(tx) = tx {
            let _ = tx.send(self);
        }
    }
}

/// One row of `ListAgents`
#[derive(Clone, Debug)]
pub struct AgentInfo {
    pub address: Address,
    pub state: AgentRuntimeState,
    pub uptime_secs: u64,
}
