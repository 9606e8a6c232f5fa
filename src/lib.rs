// lib.rs - FIPA Contract-Net Coordination Engine
//
// Agents exchanging FIPA ACL messages over TCP, running the Contract-Net
// and Subscribe interaction protocols on a single event loop.

#![doc = include_str!("../README.md")]

pub mod acl_message;
pub mod actor;
pub mod behaviour;
pub mod config;
pub mod network;
pub mod observability;
pub mod protocol;
pub mod scheduler;

// Re-export commonly used types
pub use acl_message::{AclMessage, Address, ConversationId, MessageError, Performative, ProtocolType};

pub use actor::{
    AgentActor, AgentError, AgentHandle, AgentInfo, AgentRuntimeState, AgentSpec, AgentStatus,
    DeliverMessage, Organization, OrganizationHandle,
};

pub use behaviour::{
    AgentContext, Behaviour, BehaviourError, ContractNetInitiator, ContractNetParticipant,
    Publisher, RoundOutcome, Subscriber, SubscriberView, TimedBehaviour,
};

pub use config::{EngineConfig, InitiatorConfig, OrganizationConfig, ParticipantConfig};

pub use network::{TransportConfig, TransportError, WireFormat};

pub use protocol::{Decision, ProtocolError, ProtocolStateMachine, Role};

pub use observability::{init_metrics, init_tracing, MetricsConfig, MetricsHandle, TracingConfig, TracingFormat};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::acl_message::{AclMessage, Address, ConversationId, Performative, ProtocolType};
    pub use crate::actor::{AgentError, AgentHandle, AgentSpec, AgentStatus, OrganizationHandle};
    pub use crate::behaviour::{
        AgentContext, Behaviour, BehaviourError, ContractNetInitiator, ContractNetParticipant,
        Publisher, RoundOutcome, Subscriber, TimedBehaviour,
    };
    pub use crate::config::{EngineConfig, InitiatorConfig, ParticipantConfig};
    pub use crate::scheduler::TimerHandle;
}
