// protocol/state_machine.rs - Generic Protocol State Machine Trait

use std::fmt::Debug;

use crate::acl_message::Performative;

/// Protocol error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: &'static str, event: String },

    #[error("Unexpected {performative} in state {state}")]
    UnexpectedPerformative {
        state: &'static str,
        performative: Performative,
    },

    #[error("Message has no sender")]
    MissingSender,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Conversation already open: {0}")]
    DuplicateConversation(String),

    #[error("{0} already answered this call")]
    DuplicateResponse(String),

    #[error("{sender} is not the awarded contractor of {conversation}")]
    NotContractor { sender: String, conversation: String },

    #[error("Round {0} already decided")]
    AlreadyDecided(String),
}

/// Role in a protocol conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the conversation
    Initiator,
    /// Responding to the initiator
    Participant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Participant => "participant",
        }
    }
}

/// Finite protocol state with a fixed transition table.
///
/// `next` returns `None` for transitions the protocol does not allow; `apply`
/// turns that into a `ProtocolError` and leaves the state unchanged.
pub trait ProtocolStateMachine: Copy + PartialEq + Debug {
    type Event: Debug;

    /// State name for logs and status reports
    fn as_str(&self) -> &'static str;

    fn next(self, event: &Self::Event) -> Option<Self>;

    fn apply(&mut self, event: Self::Event) -> Result<Self, ProtocolError> {
        match self.next(&event) {
            Some(state) => {
                *self = state;
                Ok(state)
            }
            None => Err(ProtocolError::InvalidTransition {
                from: self.as_str(),
                event: format!("{event:?}"),
            }),
        }
    }

    fn can_apply(&self, event: &Self::Event) -> bool {
        self.next(event).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Door {
        Open,
        Closed,
    }

    #[derive(Debug)]
    enum Push {
        Close,
        Open,
    }

    impl ProtocolStateMachine for Door {
        type Event = Push;

        fn as_str(&self) -> &'static str {
            match self {
                Door::Open => "open",
                Door::Closed => "closed",
            }
        }

        fn next(self, event: &Push) -> Option<Self> {
            match (self, event) {
                (Door::Open, Push::Close) => Some(Door::Closed),
                (Door::Closed, Push::Open) => Some(Door::Open),
                _ => None,
            }
        }
    }

    #[test]
    fn test_rejected_transition_keeps_state() {
        let mut door = Door::Open;
        let err = door.apply(Push::Open).unwrap_err();
        assert_eq!(door, Door::Open);
        assert_eq!(
            err,
            ProtocolError::InvalidTransition { from: "open", event: "Open".into() }
        );

        assert_eq!(door.apply(Push::Close), Ok(Door::Closed));
        assert!(door.can_apply(&Push::Open));
    }
}
