// acl_message.rs
// Core FIPA ACL message structures

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Message model errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("Invalid agent address '{0}', expected name@host:port")]
    InvalidAddress(String),

    #[error("Message has no sender")]
    MissingSender,

    #[error("Message has no receivers")]
    NoReceivers,

    #[error("Unknown performative: {0}")]
    UnknownPerformative(String),
}

/// Agent address: routing key and listening identity.
///
/// Rendered as `name@host:port`. Two agents in one process must never share
/// an address since the port doubles as the agent's listening socket.
#[derive(
    Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display("{name}@{host}:{port}")]
pub struct Address {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// Address on `localhost`
    pub fn local(name: impl Into<String>, port: u16) -> Self {
        Self::new(name, "localhost", port)
    }

    /// `host:port` form used for binding and dialing
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MessageError::InvalidAddress(s.to_string());

        let (name, endpoint) = s.split_once('@').ok_or_else(invalid)?;
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
        if name.is_empty() || host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(name, host, port))
    }
}

/// FIPA performatives understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Performative {
    Cfp,
    Propose,
    AcceptProposal,
    RejectProposal,
    Inform,
    Refuse,
    Subscribe,
    Agree,
    Cancel,
}

impl Performative {
    pub fn as_str(&self) -> &'static str {
        match self {
            Performative::Cfp => "CFP",
            Performative::Propose => "PROPOSE",
            Performative::AcceptProposal => "ACCEPT_PROPOSAL",
            Performative::RejectProposal => "REJECT_PROPOSAL",
            Performative::Inform => "INFORM",
            Performative::Refuse => "REFUSE",
            Performative::Subscribe => "SUBSCRIBE",
            Performative::Agree => "AGREE",
            Performative::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for Performative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Performative {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "CFP" => Ok(Performative::Cfp),
            "PROPOSE" => Ok(Performative::Propose),
            "ACCEPT_PROPOSAL" => Ok(Performative::AcceptProposal),
            "REJECT_PROPOSAL" => Ok(Performative::RejectProposal),
            "INFORM" => Ok(Performative::Inform),
            "REFUSE" => Ok(Performative::Refuse),
            "SUBSCRIBE" => Ok(Performative::Subscribe),
            "AGREE" => Ok(Performative::Agree),
            "CANCEL" => Ok(Performative::Cancel),
            _ => Err(MessageError::UnknownPerformative(s.to_string())),
        }
    }
}

/// Interaction protocol tag carried by every message.
///
/// Travels on the wire as its string name so that agents speaking other
/// protocols can still exchange frames with us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProtocolType {
    ContractNet,
    Subscribe,
    Custom(String),
}

impl ProtocolType {
    pub const CONTRACT_NET: &'static str = "fipa-contract-net";
    pub const SUBSCRIBE: &'static str = "fipa-subscribe";

    pub fn as_str(&self) -> &str {
        match self {
            ProtocolType::ContractNet => Self::CONTRACT_NET,
            ProtocolType::Subscribe => Self::SUBSCRIBE,
            ProtocolType::Custom(name) => name,
        }
    }
}

impl From<String> for ProtocolType {
    fn from(value: String) -> Self {
        match value.as_str() {
            Self::CONTRACT_NET => ProtocolType::ContractNet,
            Self::SUBSCRIBE => ProtocolType::Subscribe,
            _ => ProtocolType::Custom(value),
        }
    }
}

impl From<ProtocolType> for String {
    fn from(value: ProtocolType) -> Self {
        match value {
            ProtocolType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation identifier
#[derive(Debug, Display, From, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Message identifier
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// ACL message envelope.
///
/// Composed through the `with_*` builders or the `set_*` mutators, then moved
/// into the runtime by `AgentContext::send`. Ownership moves with it, so a
/// handed-off message can no longer be changed by the behaviour that built it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclMessage {
    pub message_id: MessageId,
    pub performative: Performative,
    pub protocol: ProtocolType,
    /// Stamped by the runtime with the sending agent's address
    pub sender: Option<Address>,
    pub receivers: Vec<Address>,
    pub conversation_id: ConversationId,
    pub in_reply_to: Option<MessageId>,
    /// Subscription topic (SUBSCRIBE registration, publisher broadcast filter)
    pub topic: Option<String>,
    pub content: String,
}

impl AclMessage {
    /// Start a new exchange with a fresh conversation id
    pub fn new(performative: Performative, protocol: ProtocolType) -> Self {
        Self {
            message_id: MessageId::generate(),
            performative,
            protocol,
            sender: None,
            receivers: Vec::new(),
            conversation_id: ConversationId::generate(),
            in_reply_to: None,
            topic: None,
            content: String::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_receiver(mut self, receiver: Address) -> Self {
        self.add_receiver(receiver);
        self
    }

    pub fn with_sender(mut self, sender: Address) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn set_performative(&mut self, performative: Performative) {
        self.performative = performative;
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    /// Add a receiver; receivers behave as a set in insertion order
    pub fn add_receiver(&mut self, receiver: Address) {
        if !self.receivers.contains(&receiver) {
            self.receivers.push(receiver);
        }
    }

    /// Build the reply skeleton for this message.
    ///
    /// The reply goes back to the original sender only, keeps the protocol,
    /// conversation id and topic, and starts with empty content. Its sender is
    /// left unset: the runtime stamps the replying agent's address on send.
    pub fn create_reply(&self) -> AclMessage {
        AclMessage {
            message_id: MessageId::generate(),
            performative: self.performative,
            protocol: self.protocol.clone(),
            sender: None,
            receivers: self.sender.iter().cloned().collect(),
            conversation_id: self.conversation_id.clone(),
            in_reply_to: Some(self.message_id.clone()),
            topic: self.topic.clone(),
            content: String::new(),
        }
    }

    /// A message can go out with one sender and at least one receiver
    pub fn validate_for_send(&self) -> Result<(), MessageError> {
        if self.sender.is_none() {
            return Err(MessageError::MissingSender);
        }
        if self.receivers.is_empty() {
            return Err(MessageError::NoReceivers);
        }
        Ok(())
    }

    /// Sender name for logging
    pub fn sender_name(&self) -> &str {
        self.sender.as_ref().map(|s| s.name.as_str()).unwrap_or("<unknown>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_address_roundtrip_text_form() {
        let addr: Address = "job_pool_agent_20000@localhost:20000".parse().unwrap();
        assert_eq!(addr.name, "job_pool_agent_20000");
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 20000);
        assert_eq!(addr.to_string(), "job_pool_agent_20000@localhost:20000");
        assert_eq!(addr.socket_addr(), "localhost:20000");
    }

    #[test]
    fn test_address_rejects_malformed() {
        assert!("no-at-sign:1234".parse::<Address>().is_err());
        assert!("agent@localhost".parse::<Address>().is_err());
        assert!("agent@localhost:notaport".parse::<Address>().is_err());
        assert!("@localhost:80".parse::<Address>().is_err());
    }

    #[test]
    fn test_message_creation() {
        let msg = AclMessage::new(Performative::Cfp, ProtocolType::ContractNet)
            .with_content("60.0")
            .with_receiver(Address::local("m1", 9001))
            .with_receiver(Address::local("m1", 9001))
            .with_receiver(Address::local("m2", 9002));

        assert_eq!(msg.performative, Performative::Cfp);
        assert_eq!(msg.receivers.len(), 2);
        assert_eq!(msg.validate_for_send(), Err(MessageError::MissingSender));

        let msg = msg.with_sender(Address::local("pool", 9000));
        assert!(msg.validate_for_send().is_ok());
    }

    #[test]
    fn test_reply_swaps_parties() {
        let pool = Address::local("pool", 9000);
        let cfp = AclMessage::new(Performative::Cfp, ProtocolType::ContractNet)
            .with_sender(pool.clone())
            .with_receiver(Address::local("m1", 9001))
            .with_content("60.0");

        let mut reply = cfp.create_reply();
        reply.set_performative(Performative::Propose);
        reply.set_content("250.5");

        assert_eq!(reply.receivers, vec![pool]);
        assert_eq!(reply.protocol, ProtocolType::ContractNet);
        assert_eq!(reply.in_reply_to.as_ref(), Some(&cfp.message_id));
        assert!(reply.sender.is_none());
    }

    #[test]
    fn test_protocol_tag_wire_form() {
        let json = serde_json::to_string(&ProtocolType::ContractNet).unwrap();
        assert_eq!(json, "\"fipa-contract-net\"");

        let custom: ProtocolType = serde_json::from_str("\"fipa-request\"").unwrap();
        assert_eq!(custom, ProtocolType::Custom("fipa-request".into()));
    }

    #[test]
    fn test_performative_parsing() {
        assert_eq!("accept-proposal".parse::<Performative>(), Ok(Performative::AcceptProposal));
        assert_eq!(
            serde_json::to_string(&Performative::RejectProposal).unwrap(),
            "\"REJECT_PROPOSAL\""
        );
        assert!("query-if".parse::<Performative>().is_err());
    }

    proptest! {
        #[test]
        fn reply_keeps_conversation_and_targets_sender(
            name in "[a-z][a-z0-9_]{0,12}",
            port in 1u16..,
            conversation in "[a-f0-9-]{1,36}",
            content in ".*",
        ) {
            let sender = Address::local(name, port);
            let msg = AclMessage::new(Performative::Cfp, ProtocolType::ContractNet)
                .with_sender(sender.clone())
                .with_receiver(Address::local("participant", 1))
                .with_conversation(ConversationId(conversation))
                .with_content(content);

            let reply = msg.create_reply();
            prop_assert_eq!(&reply.conversation_id, &msg.conversation_id);
            prop_assert_eq!(reply.receivers, vec![sender]);
            prop_assert!(reply.content.is_empty());
        }
    }
}
