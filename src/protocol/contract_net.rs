// protocol/contract_net.rs - FIPA Contract Net Protocol

use chrono::{DateTime, Utc};

use super::state_machine::{ProtocolError, ProtocolStateMachine};
use crate::acl_message::{AclMessage, Address, ConversationId, MessageId, Performative};

/// Initiator states, one per round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitiatorState {
    #[default]
    Idle,
    CfpSent,
    Collecting,
    Decided,
}

/// Initiator round events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorEvent {
    CfpSent,
    Response,
    Decide,
    Close,
}

impl ProtocolStateMachine for InitiatorState {
    type Event = InitiatorEvent;

    fn as_str(&self) -> &'static str {
        match self {
            InitiatorState::Idle => "idle",
            InitiatorState::CfpSent => "cfp_sent",
            InitiatorState::Collecting => "collecting",
            InitiatorState::Decided => "decided",
        }
    }

    fn next(self, event: &InitiatorEvent) -> Option<Self> {
        use InitiatorEvent as E;
        use InitiatorState::*;

        match (self, event) {
            (Idle, E::CfpSent) => Some(CfpSent),
            (CfpSent | Collecting, E::Response) => Some(Collecting),
            (CfpSent | Collecting, E::Decide) => Some(Decided),
            (Decided, E::Close) => Some(Idle),
            _ => None,
        }
    }
}

/// Participant states, one per conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParticipantState {
    #[default]
    Idle,
    CfpReceived,
    ProposalSent,
    Accepted,
    Rejected,
}

/// Participant conversation events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantEvent {
    CfpReceived,
    Proposed,
    Refused,
    Accepted,
    Rejected,
    Finished,
}

impl ProtocolStateMachine for ParticipantState {
    type Event = ParticipantEvent;

    fn as_str(&self) -> &'static str {
        match self {
            ParticipantState::Idle => "idle",
            ParticipantState::CfpReceived => "cfp_received",
            ParticipantState::ProposalSent => "proposal_sent",
            ParticipantState::Accepted => "accepted",
            ParticipantState::Rejected => "rejected",
        }
    }

    fn next(self, event: &ParticipantEvent) -> Option<Self> {
        use ParticipantEvent as E;
        use ParticipantState::*;

        match (self, event) {
            (Idle, E::CfpReceived) => Some(CfpReceived),
            (CfpReceived, E::Proposed) => Some(ProposalSent),
            (CfpReceived, E::Refused) => Some(Idle),
            (ProposalSent, E::Accepted) => Some(Accepted),
            (ProposalSent, E::Rejected) => Some(Rejected),
            (Accepted | Rejected | ProposalSent, E::Finished) => Some(Idle),
            _ => None,
        }
    }
}

/// A numeric bid received from a participant
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub bidder: Address,
    pub value: f64,
    pub message_id: MessageId,
    pub received_at: DateTime<Utc>,
}

/// Parse a PROPOSE body as a bid value; NaN counts as malformed
pub fn parse_bid(content: &str) -> Option<f64> {
    content.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Index of the winning proposal: strictly greatest value, earliest on ties
pub fn select_winner(proposals: &[Proposal]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, proposal) in proposals.iter().enumerate() {
        match best {
            Some((_, value)) if proposal.value <= value => {}
            _ => best = Some((index, proposal.value)),
        }
    }
    best.map(|(index, _)| index)
}

/// How a response was taken into a round
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Bid(f64),
    /// Unparseable body; the bidder is excluded and will be rejected
    Malformed,
    Refusal,
}

/// Outcome of closing the call for proposals
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub conversation_id: ConversationId,
    pub winner: Option<Proposal>,
    /// Every other proposer, in arrival order
    pub rejected: Vec<Address>,
}

/// State of one call for proposals, keyed by its conversation id.
///
/// Created when the CFP goes out and dropped once closed. Every sender may
/// answer once; a round is complete when all expected responders have either
/// proposed or refused.
#[derive(Debug, Clone)]
pub struct ProposalRound {
    conversation_id: ConversationId,
    state: InitiatorState,
    task: String,
    expected: Vec<Address>,
    proposals: Vec<Proposal>,
    malformed: Vec<Address>,
    refused: Vec<Address>,
    winner: Option<Address>,
}

impl ProposalRound {
    /// Open a round for a CFP that has just been sent
    pub fn open(cfp: &AclMessage) -> Self {
        Self {
            conversation_id: cfp.conversation_id.clone(),
            state: InitiatorState::CfpSent,
            task: cfp.content.clone(),
            expected: cfp.receivers.clone(),
            proposals: Vec::new(),
            malformed: Vec::new(),
            refused: Vec::new(),
            winner: None,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn expected(&self) -> &[Address] {
        &self.expected
    }

    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    pub fn winner(&self) -> Option<&Address> {
        self.winner.as_ref()
    }

    fn has_answered(&self, sender: &Address) -> bool {
        self.proposals.iter().any(|p| &p.bidder == sender)
            || self.malformed.contains(sender)
            || self.refused.contains(sender)
    }

    /// Take a PROPOSE or REFUSE into the round
    pub fn record(&mut self, msg: &AclMessage) -> Result<Recorded, ProtocolError> {
        let sender = msg.sender.clone().ok_or(ProtocolError::MissingSender)?;

        if !self.state.can_apply(&InitiatorEvent::Response) {
            return Err(ProtocolError::AlreadyDecided(self.conversation_id.to_string()));
        }
        if self.has_answered(&sender) {
            return Err(ProtocolError::DuplicateResponse(sender.to_string()));
        }

        let recorded = match msg.performative {
            Performative::Propose => match parse_bid(&msg.content) {
                Some(value) => {
                    self.proposals.push(Proposal {
                        bidder: sender,
                        value,
                        message_id: msg.message_id.clone(),
                        received_at: Utc::now(),
                    });
                    Recorded::Bid(value)
                }
                None => {
                    self.malformed.push(sender);
                    Recorded::Malformed
                }
            },
            Performative::Refuse => {
                self.refused.push(sender);
                Recorded::Refusal
            }
            other => {
                return Err(ProtocolError::UnexpectedPerformative {
                    state: self.state.as_str(),
                    performative: other,
                })
            }
        };

        self.state.apply(InitiatorEvent::Response)?;
        Ok(recorded)
    }

    /// All expected responders have answered
    pub fn is_complete(&self) -> bool {
        self.expected.iter().all(|a| self.has_answered(a))
    }

    /// Close the call and pick the winner
    pub fn decide(&mut self) -> Result<Decision, ProtocolError> {
        if !self.state.can_apply(&InitiatorEvent::Decide) {
            return Err(ProtocolError::AlreadyDecided(self.conversation_id.to_string()));
        }

        let winner_index = select_winner(&self.proposals);
        let winner = winner_index.map(|i| self.proposals[i].clone());
        let rejected = self
            .proposals
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != winner_index)
            .map(|(_, p)| p.bidder.clone())
            .chain(self.malformed.iter().cloned())
            .collect();

        self.winner = winner.as_ref().map(|p| p.bidder.clone());
        self.state.apply(InitiatorEvent::Decide)?;

        Ok(Decision {
            conversation_id: self.conversation_id.clone(),
            winner,
            rejected,
        })
    }

    /// INFORM from the awarded contractor ends the round
    pub fn complete(&mut self, sender: &Address) -> Result<(), ProtocolError> {
        if self.state != InitiatorState::Decided || self.winner.as_ref() != Some(sender) {
            return Err(ProtocolError::NotContractor {
                sender: sender.to_string(),
                conversation: self.conversation_id.to_string(),
            });
        }
        self.state.apply(InitiatorEvent::Close)?;
        Ok(())
    }

    /// Force the round closed (expiry); only valid once decided
    pub fn expire(&mut self) -> Result<(), ProtocolError> {
        self.state.apply(InitiatorEvent::Close).map(|_| ())
    }
}
