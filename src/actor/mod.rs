// actor/mod.rs - Actor Module

//! Agent runtime built on Actix.
//!
//! - `AgentActor` - runs one agent: endpoint, behaviours, timers
//! - `Organization` - composition root; spawns agents and tracks the live ones
//! - `AgentHandle` / `OrganizationHandle` - explicit handles passed to
//!   whatever needs to talk to, spawn or stop agents
//!
//! # Example
//!
//! ```ignore
//! use fipa_contract_net::prelude::*;
//!
//! let org = OrganizationHandle::start(&EngineConfig::default());
//!
//! let machine = org.start_single_agent(
//!     AgentSpec::new("machine_1@localhost:20001".parse()?)
//!         .with_behaviour(Subscriber::new(pool, "machine"))
//!         .with_behaviour(ContractNetParticipant::new(ParticipantConfig::default())),
//! ).await?;
//!
//! machine.deactivate().await?;
//! ```

mod agent_actor;
mod handle;
mod messages;
mod organization;

pub use agent_actor::AgentActor;
pub use handle::{AgentHandle, AgentSpec};
pub use messages::*;
pub use organization::{Organization, OrganizationHandle};
