// behaviour/initiator.rs - FIPA Contract Net, initiator side

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AgentContext, Behaviour, BehaviourError, SubscriberView};
use crate::acl_message::{AclMessage, Address, ConversationId, Performative, ProtocolType};
use crate::config::InitiatorConfig;
use crate::observability;
use crate::protocol::{
    ConversationTracker, Decision, InitiatorState, ProposalRound, ProtocolError,
    ProtocolStateMachine, Recorded, Role,
};

const SWEEP_TOKEN: u64 = 1;

/// Milestones of a round, reported to the outcome listener
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Decided(Decision),
    Closed {
        conversation_id: ConversationId,
        contractor: Option<Address>,
        expired: bool,
    },
}

type OutcomeListener = Box<dyn FnMut(&RoundOutcome) + Send>;

/// Issues calls for proposals and awards each to the highest bid.
///
/// Participants are whoever is subscribed to the configured topic on the
/// sibling `Publisher` at the moment the CFP goes out. A round is decided as
/// soon as every participant has proposed or refused, or when the
/// collection window ends, whichever is first.
pub struct ContractNetInitiator {
    name: String,
    participants: SubscriberView,
    config: InitiatorConfig,
    rounds: ConversationTracker<ProposalRound>,
    listener: Option<OutcomeListener>,
    opened: u64,
    closed: u64,
}

impl ContractNetInitiator {
    pub fn new(participants: SubscriberView, config: InitiatorConfig) -> Self {
        Self {
            name: String::from("contract-net-initiator"),
            participants,
            config,
            rounds: ConversationTracker::new(Role::Initiator),
            listener: None,
            opened: 0,
            closed: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn on_outcome<F>(mut self, listener: F) -> Self
    where
        F: FnMut(&RoundOutcome) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn open_rounds(&self) -> usize {
        self.rounds.len()
    }

    pub fn round(&self, id: &ConversationId) -> Option<&ProposalRound> {
        self.rounds.get(id)
    }

    fn report(&mut self, outcome: RoundOutcome) {
        if let Some(listener) = self.listener.as_mut() {
            listener(&outcome);
        }
    }

    /// Stamp the current participants on `cfp`, send it and open its round
    fn start_round(&mut self, cfp: &AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let participants = self
            .participants
            .get_partial_subscribers(&self.config.participant_topic);
        if participants.is_empty() {
            info!(agent = %ctx.agent_name(), topic = %self.config.participant_topic, "No participants, CFP not sent");
            return Ok(());
        }

        let mut cfp = cfp.clone();
        cfp.protocol = ProtocolType::ContractNet;
        for participant in participants {
            cfp.add_receiver(participant);
        }

        let id = cfp.conversation_id.clone();
        self.rounds.open(
            id.clone(),
            ProposalRound::open(&cfp),
            Some(self.config.collection_window()),
        )?;
        ctx.schedule(self.config.collection_window(), SWEEP_TOKEN);

        info!(
            agent = %ctx.agent_name(),
            conversation = %id,
            participants = cfp.receivers.len(),
            task = %cfp.content,
            "CFP sent"
        );
        ctx.send(cfp);
        self.opened += 1;
        observability::record_round_opened();
        Ok(())
    }

    fn decide(&mut self, id: &ConversationId, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let age = self.rounds.age(id).unwrap_or_default();
        let round = self.rounds.require(id)?;
        let task = round.task().to_string();
        let invited = round.expected().len();
        let decision = round.decide()?;

        if let Some(winner) = &decision.winner {
            let mut accept = AclMessage::new(Performative::AcceptProposal, ProtocolType::ContractNet)
                .with_conversation(id.clone())
                .with_receiver(winner.bidder.clone())
                .with_content("OK");
            accept.in_reply_to = Some(winner.message_id.clone());
            ctx.send(accept);
            info!(agent = %ctx.agent_name(), conversation = %id, task = %task, invited, winner = %winner.bidder, bid = winner.value, "Proposal accepted");
        } else {
            info!(agent = %ctx.agent_name(), conversation = %id, task = %task, invited, "No acceptable proposal");
        }

        if !decision.rejected.is_empty() {
            let mut reject = AclMessage::new(Performative::RejectProposal, ProtocolType::ContractNet)
                .with_conversation(id.clone());
            for loser in &decision.rejected {
                reject.add_receiver(loser.clone());
            }
            info!(agent = %ctx.agent_name(), conversation = %id, rejected = reject.receivers.len(), "Proposals rejected");
            ctx.send(reject);
        }

        let had_winner = decision.winner.is_some();
        observability::record_round_decided(age, had_winner);
        self.report(RoundOutcome::Decided(decision));

        if had_winner {
            self.rounds.set_timeout(id, Some(self.config.completion_timeout()));
            ctx.schedule(self.config.completion_timeout(), SWEEP_TOKEN);
        } else {
            self.close(id, false, "no_winner")?;
        }
        Ok(())
    }

    fn close(&mut self, id: &ConversationId, expired: bool, outcome: &str) -> Result<(), BehaviourError> {
        let round = self.rounds.require(id)?;
        if round.state() == InitiatorState::Decided {
            round.expire()?;
        }
        let contractor = round.winner().cloned();
        self.rounds.close(id);
        self.closed += 1;
        observability::record_round_closed(outcome);
        self.report(RoundOutcome::Closed {
            conversation_id: id.clone(),
            contractor,
            expired,
        });
        Ok(())
    }

    fn reject_late(msg: &AclMessage, ctx: &mut AgentContext) {
        let mut reject = msg.create_reply();
        reject.set_performative(Performative::RejectProposal);
        reject.set_content("round closed");
        debug!(agent = %ctx.agent_name(), from = %msg.sender_name(), conversation = %msg.conversation_id, "Late proposal rejected");
        ctx.send(reject);
    }

    fn on_response(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let id = msg.conversation_id.clone();
        let Some(round) = self.rounds.get_mut(&id) else {
            if msg.performative == Performative::Propose {
                Self::reject_late(&msg, ctx);
            }
            return Ok(());
        };

        match round.record(&msg) {
            Ok(Recorded::Bid(value)) => {
                info!(agent = %ctx.agent_name(), conversation = %id, from = %msg.sender_name(), bid = value, "PROPOSE received");
            }
            Ok(Recorded::Malformed) => {
                warn!(agent = %ctx.agent_name(), conversation = %id, from = %msg.sender_name(), content = %msg.content, "Unparseable bid excluded");
            }
            Ok(Recorded::Refusal) => {
                info!(agent = %ctx.agent_name(), conversation = %id, from = %msg.sender_name(), "REFUSE received");
            }
            Err(ProtocolError::AlreadyDecided(_)) if msg.performative == Performative::Propose => {
                Self::reject_late(&msg, ctx);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if round.is_complete() {
            self.decide(&id, ctx)?;
        }
        Ok(())
    }

    fn on_inform(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let id = msg.conversation_id.clone();
        let sender = msg.sender.clone().ok_or(ProtocolError::MissingSender)?;
        self.rounds.require(&id)?.complete(&sender)?;
        info!(agent = %ctx.agent_name(), conversation = %id, from = %sender, content = %msg.content, "INFORM received, round closed");
        self.close(&id, false, "completed")
    }
}

impl Behaviour for ContractNetInitiator {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Option<ProtocolType> {
        Some(ProtocolType::ContractNet)
    }

    fn status(&self) -> String {
        let mut states: Vec<_> = self.rounds.iter().map(|(_, r)| r.state().as_str()).collect();
        states.sort_unstable();
        format!(
            "{}: {} open rounds {:?}, {} opened, {} closed",
            self.rounds.role().as_str(),
            self.rounds.len(),
            states,
            self.opened,
            self.closed
        )
    }

    fn owns_conversation(&self, id: &ConversationId) -> bool {
        self.rounds.contains(id)
    }

    /// Stray proposals are answered with a rejection
    fn accepts(&self, msg: &AclMessage) -> bool {
        msg.performative == Performative::Propose
    }

    fn handle(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        match msg.performative {
            Performative::Propose | Performative::Refuse => self.on_response(msg, ctx),
            Performative::Inform => self.on_inform(msg, ctx),
            other => Err(ProtocolError::UnexpectedPerformative {
                state: "initiating",
                performative: other,
            }
            .into()),
        }
    }

    fn on_time(&mut self, token: u64, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        if token != SWEEP_TOKEN {
            return Ok(());
        }
        for id in self.rounds.expired(Instant::now()) {
            let state = match self.rounds.get(&id) {
                Some(round) => round.state(),
                None => continue,
            };
            match state {
                InitiatorState::CfpSent | InitiatorState::Collecting => {
                    debug!(agent = %ctx.agent_name(), conversation = %id, "Collection window over");
                    self.decide(&id, ctx)?;
                }
                InitiatorState::Decided => {
                    warn!(agent = %ctx.agent_name(), conversation = %id, "No INFORM from contractor, round expired");
                    self.close(&id, true, "expired")?;
                }
                InitiatorState::Idle => {
                    self.rounds.close(&id);
                }
            }
        }
        Ok(())
    }

    /// A local CFP starts a new round
    fn notify(&mut self, msg: &AclMessage, ctx: &mut AgentContext) -> Result<bool, BehaviourError> {
        if msg.performative != Performative::Cfp {
            return Ok(false);
        }
        self.start_round(msg, ctx)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviour::{BehaviourId, Publisher};
    use crate::scheduler::TimerIds;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool() -> Address {
        Address::local("pool", 20000)
    }

    fn ctx() -> AgentContext {
        AgentContext::new(pool(), TimerIds::default(), Some(BehaviourId(1)))
    }

    /// Publisher with `machines` subscribed on "machine", plus an initiator on it
    fn setup(machines: &[Address]) -> (ContractNetInitiator, Arc<Mutex<Vec<RoundOutcome>>>) {
        let mut publisher = Publisher::new();
        for m in machines {
            let subscribe = AclMessage::new(Performative::Subscribe, ProtocolType::Subscribe)
                .with_sender(m.clone())
                .with_receiver(pool())
                .with_topic("machine");
            publisher.handle(subscribe, &mut ctx()).unwrap();
        }

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let initiator = ContractNetInitiator::new(publisher.subscribers(), InitiatorConfig::default())
            .on_outcome(move |o| sink.lock().push(o.clone()));
        (initiator, outcomes)
    }

    fn start(initiator: &mut ContractNetInitiator) -> AclMessage {
        let mut c = ctx();
        let cfp = AclMessage::new(Performative::Cfp, ProtocolType::ContractNet).with_content("60.0");
        assert!(initiator.notify(&cfp, &mut c).unwrap());
        c.outbox().next().cloned().unwrap()
    }

    fn answer(cfp: &AclMessage, from: &Address, performative: Performative, content: &str) -> AclMessage {
        let mut msg = cfp.create_reply();
        msg.set_performative(performative);
        msg.set_content(content);
        msg.sender = Some(from.clone());
        msg
    }

    #[test]
    fn test_cfp_goes_to_subscribed_machines() {
        let machines = [Address::local("m1", 1), Address::local("m2", 2)];
        let (mut initiator, _) = setup(&machines);
        let cfp = start(&mut initiator);

        assert_eq!(cfp.receivers, machines.to_vec());
        assert_eq!(cfp.content, "60.0");
        assert!(initiator.owns_conversation(&cfp.conversation_id));
        assert_eq!(
            initiator.round(&cfp.conversation_id).map(|r| r.state()),
            Some(InitiatorState::CfpSent)
        );
        let round = initiator.round(&cfp.conversation_id).unwrap();
        assert_eq!(round.task(), "60.0");
        assert_eq!(round.expected(), &machines[..]);
        assert!(initiator.status().starts_with("initiator: 1 open rounds"));
    }

    #[test]
    fn test_no_participants_no_round() {
        let (mut initiator, _) = setup(&[]);
        let mut c = ctx();
        let cfp = AclMessage::new(Performative::Cfp, ProtocolType::ContractNet);
        assert!(initiator.notify(&cfp, &mut c).unwrap());
        assert_eq!(c.outbox().count(), 0);
        assert_eq!(initiator.open_rounds(), 0);
    }

    #[test]
    fn test_highest_bid_wins_first_seen_on_tie() {
        let (a, b, cc) = (Address::local("A", 1), Address::local("B", 2), Address::local("C", 3));
        let (mut initiator, outcomes) = setup(&[a.clone(), b.clone(), cc.clone()]);
        let cfp = start(&mut initiator);

        initiator.handle(answer(&cfp, &a, Performative::Propose, "120"), &mut ctx()).unwrap();
        initiator.handle(answer(&cfp, &b, Performative::Propose, "340"), &mut ctx()).unwrap();

        let mut last = ctx();
        initiator.handle(answer(&cfp, &cc, Performative::Propose, "340"), &mut last).unwrap();
        let sent: Vec<_> = last.outbox().cloned().collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].performative, Performative::AcceptProposal);
        assert_eq!(sent[0].receivers, vec![b.clone()]);
        assert_eq!(sent[0].content, "OK");
        assert_eq!(sent[1].performative, Performative::RejectProposal);
        assert_eq!(sent[1].receivers, vec![a, cc]);
        assert!(sent.iter().all(|m| m.conversation_id == cfp.conversation_id));

        initiator.handle(answer(&cfp, &b, Performative::Inform, "OK"), &mut ctx()).unwrap();
        assert_eq!(initiator.open_rounds(), 0);

        let outcomes = outcomes.lock();
        assert!(matches!(&outcomes[0], RoundOutcome::Decided(d) if d.winner.as_ref().map(|p| &p.bidder) == Some(&b)));
        assert!(matches!(
            &outcomes[1],
            RoundOutcome::Closed { contractor: Some(c), expired: false, .. } if *c == b
        ));
    }

    #[test]
    fn test_rounds_are_independent() {
        let (a, b) = (Address::local("A", 1), Address::local("B", 2));
        let (mut initiator, _) = setup(&[a.clone(), b.clone()]);
        let first = start(&mut initiator);
        let second = start(&mut initiator);
        assert_ne!(first.conversation_id, second.conversation_id);

        initiator.handle(answer(&first, &a, Performative::Propose, "500"), &mut ctx()).unwrap();
        initiator.handle(answer(&second, &a, Performative::Propose, "100"), &mut ctx()).unwrap();

        let mut c = ctx();
        initiator.handle(answer(&second, &b, Performative::Propose, "200"), &mut c).unwrap();
        let accept = c.outbox().next().unwrap();
        assert_eq!(accept.receivers, vec![b.clone()]);
        assert_eq!(accept.conversation_id, second.conversation_id);

        assert_eq!(
            initiator.round(&first.conversation_id).map(|r| r.state()),
            Some(InitiatorState::Collecting)
        );
        assert_eq!(initiator.round(&first.conversation_id).map(|r| r.proposals().len()), Some(1));
    }

    #[test]
    fn test_late_proposal_is_rejected() {
        let a = Address::local("A", 1);
        let (mut initiator, _) = setup(&[a.clone()]);
        let cfp = start(&mut initiator);
        initiator.handle(answer(&cfp, &a, Performative::Refuse, ""), &mut ctx()).unwrap();
        assert_eq!(initiator.open_rounds(), 0);

        let late = answer(&cfp, &a, Performative::Propose, "999");
        assert!(!initiator.owns_conversation(&late.conversation_id));
        assert!(initiator.accepts(&late));
        let mut c = ctx();
        initiator.handle(late, &mut c).unwrap();
        let reply = c.outbox().next().unwrap();
        assert_eq!(reply.performative, Performative::RejectProposal);
        assert_eq!(reply.receivers, vec![a]);
    }

    #[test]
    fn test_inform_from_loser_is_violation() {
        let (a, b) = (Address::local("A", 1), Address::local("B", 2));
        let (mut initiator, _) = setup(&[a.clone(), b.clone()]);
        let cfp = start(&mut initiator);
        initiator.handle(answer(&cfp, &a, Performative::Propose, "1"), &mut ctx()).unwrap();
        initiator.handle(answer(&cfp, &b, Performative::Propose, "2"), &mut ctx()).unwrap();

        assert!(initiator.handle(answer(&cfp, &a, Performative::Inform, "OK"), &mut ctx()).is_err());
        assert_eq!(
            initiator.round(&cfp.conversation_id).map(|r| r.state()),
            Some(InitiatorState::Decided)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_window_decides_with_partial_bids() {
        let (a, b) = (Address::local("A", 1), Address::local("B", 2));
        let (mut initiator, outcomes) = setup(&[a.clone(), b.clone()]);
        let cfp = start(&mut initiator);
        initiator.handle(answer(&cfp, &a, Performative::Propose, "42"), &mut ctx()).unwrap();

        tokio::time::advance(InitiatorConfig::default().collection_window() + Duration::from_millis(1)).await;
        let mut c = ctx();
        initiator.on_time(SWEEP_TOKEN, &mut c).unwrap();
        let accept = c.outbox().next().unwrap();
        assert_eq!(accept.performative, Performative::AcceptProposal);
        assert_eq!(accept.receivers, vec![a]);

        tokio::time::advance(InitiatorConfig::default().completion_timeout() + Duration::from_millis(1)).await;
        initiator.on_time(SWEEP_TOKEN, &mut ctx()).unwrap();
        assert_eq!(initiator.open_rounds(), 0);
        assert!(matches!(
            outcomes.lock().last(),
            Some(RoundOutcome::Closed { expired: true, .. })
        ));
    }
}
