// protocol/mod.rs - FIPA Protocol State Machines

//! Pure protocol logic, independent of actors and sockets.
//!
//! - `SubscribeState` / `SubscriptionRegistry` - FIPA Subscribe
//! - `InitiatorState` / `ParticipantState` / `ProposalRound` - FIPA Contract Net
//! - `ConversationTracker` - per-conversation state with deadlines
//!
//! Behaviours in `crate::behaviour` drive these machines from inbound
//! messages and timers and turn their results into outbound messages.
//!
//! # Example
//!
//! ```ignore
//! use fipa_contract_net::protocol::*;
//!
//! let mut round = ProposalRound::open(&cfp);
//! round.record(&propose_from_a)?;
//! round.record(&propose_from_b)?;
//! if round.is_complete() {
//!     let decision = round.decide()?;
//! }
//! ```

mod contract_net;
mod conversation;
mod state_machine;
mod subscribe;

pub use contract_net::{
    parse_bid, select_winner, Decision, InitiatorEvent, InitiatorState, ParticipantEvent,
    ParticipantState, Proposal, ProposalRound, Recorded,
};
pub use conversation::ConversationTracker;
pub use state_machine::{ProtocolError, ProtocolStateMachine, Role};
pub use subscribe::{SubscribeEvent, SubscribeState, SubscriptionRegistry};
