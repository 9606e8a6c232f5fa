// behaviour/participant.rs - FIPA Contract Net, participant side

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AgentContext, Behaviour, BehaviourError};
use crate::acl_message::{AclMessage, ConversationId, Performative, ProtocolType};
use crate::config::ParticipantConfig;
use crate::protocol::{
    ConversationTracker, ParticipantEvent, ParticipantState, ProtocolError, ProtocolStateMachine,
    Role,
};

const SWEEP_TOKEN: u64 = 1;

/// Computes a bid for a CFP; `None` declines with REFUSE
pub type BidStrategy = Box<dyn FnMut(&AclMessage) -> Option<f64> + Send>;

type AwardHook = Box<dyn FnMut(&AclMessage, &mut AgentContext) + Send>;

#[derive(Debug)]
struct Engagement {
    state: ParticipantState,
    cfp: AclMessage,
}

/// Bids on calls for proposals.
///
/// Each CFP is answered after `bid_delay`; state is kept per conversation so
/// overlapping calls do not interfere. An award is confirmed with INFORM
/// "OK"; a rejection ends the conversation silently.
pub struct ContractNetParticipant {
    name: String,
    config: ParticipantConfig,
    strategy: BidStrategy,
    engagements: ConversationTracker<Engagement>,
    on_award: Option<AwardHook>,
    awarded: u64,
    rejected: u64,
}

impl ContractNetParticipant {
    /// Participant bidding uniformly in the configured range
    pub fn new(config: ParticipantConfig) -> Self {
        let strategy = Self::uniform_bids(config.bid_min, config.bid_max);
        Self {
            name: String::from("contract-net-participant"),
            config,
            strategy,
            engagements: ConversationTracker::new(Role::Participant),
            on_award: None,
            awarded: 0,
            rejected: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_strategy<F>(mut self, strategy: F) -> Self
    where
        F: FnMut(&AclMessage) -> Option<f64> + Send + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn on_award<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&AclMessage, &mut AgentContext) + Send + 'static,
    {
        self.on_award = Some(Box::new(hook));
        self
    }

    /// Uniform random bid in `[min, max)`. A degenerate or unsampleable range
    /// always bids `min`, or refuses when `min` is not finite.
    pub fn uniform_bids(min: f64, max: f64) -> BidStrategy {
        let sampled = min.is_finite() && max.is_finite() && (max - min).is_finite() && max > min;
        Box::new(move |_| {
            if sampled {
                Some(rand::rng().random_range(min..max))
            } else if min.is_finite() {
                Some(min)
            } else {
                None
            }
        })
    }

    pub fn state_of(&self, id: &ConversationId) -> Option<ParticipantState> {
        self.engagements.get(id).map(|e| e.state)
    }

    pub fn awarded(&self) -> u64 {
        self.awarded
    }

    fn on_cfp(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let id = msg.conversation_id.clone();
        info!(agent = %ctx.agent_name(), conversation = %id, from = %msg.sender_name(), task = %msg.content, "CFP received");

        let mut state = ParticipantState::Idle;
        state.apply(ParticipantEvent::CfpReceived)?;
        self.engagements
            .open(id, Engagement { state, cfp: msg }, Some(self.config.bid_delay()))?;
        ctx.schedule(self.config.bid_delay(), SWEEP_TOKEN);
        Ok(())
    }

    fn bid(&mut self, id: &ConversationId, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let engagement = self.engagements.require(id)?;
        let mut reply = engagement.cfp.create_reply();

        match (self.strategy)(&engagement.cfp) {
            Some(value) => {
                engagement.state.apply(ParticipantEvent::Proposed)?;
                reply.set_performative(Performative::Propose);
                reply.set_content(value.to_string());
                info!(agent = %ctx.agent_name(), conversation = %id, bid = value, "PROPOSE sent");
                ctx.send(reply);
                self.engagements.set_timeout(id, Some(self.config.award_timeout()));
                ctx.schedule(self.config.award_timeout(), SWEEP_TOKEN);
            }
            None => {
                engagement.state.apply(ParticipantEvent::Refused)?;
                reply.set_performative(Performative::Refuse);
                info!(agent = %ctx.agent_name(), conversation = %id, "REFUSE sent");
                ctx.send(reply);
                self.engagements.close(id);
            }
        }
        Ok(())
    }

    fn on_accept(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let id = msg.conversation_id.clone();
        let engagement = self.engagements.require(&id)?;
        engagement.state.apply(ParticipantEvent::Accepted)?;

        let mut inform = msg.create_reply();
        inform.set_performative(Performative::Inform);
        inform.set_content("OK");
        ctx.send(inform);
        info!(agent = %ctx.agent_name(), conversation = %id, "Proposal accepted, INFORM sent");

        self.awarded += 1;
        if let Some(hook) = self.on_award.as_mut() {
            hook(&msg, ctx);
        }
        self.finish(&id)
    }

    fn on_reject(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        let id = msg.conversation_id.clone();
        self.engagements
            .require(&id)?
            .state
            .apply(ParticipantEvent::Rejected)?;
        info!(agent = %ctx.agent_name(), conversation = %id, "Proposal rejected");
        self.rejected += 1;
        self.finish(&id)
    }

    fn finish(&mut self, id: &ConversationId) -> Result<(), BehaviourError> {
        self.engagements
            .require(id)?
            .state
            .apply(ParticipantEvent::Finished)?;
        self.engagements.close(id);
        Ok(())
    }
}

impl Behaviour for ContractNetParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Option<ProtocolType> {
        Some(ProtocolType::ContractNet)
    }

    fn status(&self) -> String {
        format!(
            "{}: {} open conversations, {} awarded, {} rejected",
            self.engagements.role().as_str(),
            self.engagements.len(),
            self.awarded,
            self.rejected
        )
    }

    fn owns_conversation(&self, id: &ConversationId) -> bool {
        self.engagements.contains(id)
    }

    fn accepts(&self, msg: &AclMessage) -> bool {
        msg.performative == Performative::Cfp
    }

    fn handle(&mut self, msg: AclMessage, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        match msg.performative {
            Performative::Cfp => self.on_cfp(msg, ctx),
            Performative::AcceptProposal => self.on_accept(msg, ctx),
            Performative::RejectProposal => self.on_reject(msg, ctx),
            other => {
                let state = self
                    .engagements
                    .get(&msg.conversation_id)
                    .map_or("idle", |e| e.state.as_str());
                Err(ProtocolError::UnexpectedPerformative {
                    state,
                    performative: other,
                }
                .into())
            }
        }
    }

    fn on_time(&mut self, token: u64, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        if token != SWEEP_TOKEN {
            return Ok(());
        }
        for id in self.engagements.expired(Instant::now()) {
            match self.state_of(&id) {
                Some(ParticipantState::CfpReceived) => self.bid(&id, ctx)?,
                Some(ParticipantState::ProposalSent) => {
                    warn!(agent = %ctx.agent_name(), conversation = %id, "No answer to proposal, giving up");
                    self.finish(&id)?;
                }
                Some(state) => {
                    debug!(agent = %ctx.agent_name(), conversation = %id, state = state.as_str(), "Dropping stale conversation");
                    self.engagements.close(&id);
                }
                None => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl_message::Address;
    use crate::behaviour::{BehaviourId, Effect};
    use crate::scheduler::TimerIds;
    use std::time::Duration;

    fn machine() -> Address {
        Address::local("machine_1", 20001)
    }

    fn ctx() -> AgentContext {
        AgentContext::new(machine(), TimerIds::default(), Some(BehaviourId(1)))
    }

    fn cfp() -> AclMessage {
        AclMessage::new(Performative::Cfp, ProtocolType::ContractNet)
            .with_sender(Address::local("pool", 20000))
            .with_receiver(machine())
            .with_content("60.0")
    }

    fn from_pool(to: &AclMessage, performative: Performative) -> AclMessage {
        let mut msg = AclMessage::new(performative, ProtocolType::ContractNet)
            .with_conversation(to.conversation_id.clone())
            .with_sender(Address::local("pool", 20000))
            .with_receiver(machine());
        msg.set_content("OK");
        msg
    }

    fn fixed(value: f64) -> ContractNetParticipant {
        ContractNetParticipant::new(ParticipantConfig::default()).with_strategy(move |_| Some(value))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cfp_is_answered_after_delay() {
        let mut participant = fixed(250.5);
        let call = cfp();

        let mut c = ctx();
        participant.handle(call.clone(), &mut c).unwrap();
        assert_eq!(c.outbox().count(), 0);
        assert!(c.effects().iter().any(|e| matches!(e, Effect::Arm { .. })));
        assert_eq!(participant.state_of(&call.conversation_id), Some(ParticipantState::CfpReceived));

        // Timer firing early finds nothing due yet
        let mut early = ctx();
        participant.on_time(SWEEP_TOKEN, &mut early).unwrap();
        assert_eq!(early.outbox().count(), 0);

        tokio::time::advance(ParticipantConfig::default().bid_delay()).await;
        let mut c = ctx();
        participant.on_time(SWEEP_TOKEN, &mut c).unwrap();
        let propose = c.outbox().next().unwrap();
        assert_eq!(propose.performative, Performative::Propose);
        assert_eq!(propose.content, "250.5");
        assert_eq!(propose.receivers, vec![Address::local("pool", 20000)]);
        assert_eq!(propose.conversation_id, call.conversation_id);
        assert_eq!(participant.state_of(&call.conversation_id), Some(ParticipantState::ProposalSent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_is_confirmed_with_inform() {
        let mut participant = fixed(100.0);
        let call = cfp();
        participant.handle(call.clone(), &mut ctx()).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        participant.on_time(SWEEP_TOKEN, &mut ctx()).unwrap();

        let mut c = ctx();
        participant.handle(from_pool(&call, Performative::AcceptProposal), &mut c).unwrap();
        let inform = c.outbox().next().unwrap();
        assert_eq!(inform.performative, Performative::Inform);
        assert_eq!(inform.content, "OK");
        assert_eq!(participant.awarded(), 1);
        assert!(!participant.owns_conversation(&call.conversation_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_gets_no_reply() {
        let mut participant = fixed(100.0);
        let call = cfp();
        participant.handle(call.clone(), &mut ctx()).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        participant.on_time(SWEEP_TOKEN, &mut ctx()).unwrap();

        let mut c = ctx();
        participant.handle(from_pool(&call, Performative::RejectProposal), &mut c).unwrap();
        assert_eq!(c.outbox().count(), 0);
        assert_eq!(participant.state_of(&call.conversation_id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_calls_are_tracked_separately() {
        let mut participant = fixed(300.0);
        let (first, second) = (cfp(), cfp());
        participant.handle(first.clone(), &mut ctx()).unwrap();
        participant.handle(second.clone(), &mut ctx()).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut c = ctx();
        participant.on_time(SWEEP_TOKEN, &mut c).unwrap();
        assert_eq!(c.outbox().count(), 2);

        participant.handle(from_pool(&second, Performative::AcceptProposal), &mut ctx()).unwrap();
        assert_eq!(participant.state_of(&first.conversation_id), Some(ParticipantState::ProposalSent));
        assert_eq!(participant.state_of(&second.conversation_id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declining_strategy_sends_refuse() {
        let mut participant =
            ContractNetParticipant::new(ParticipantConfig::default()).with_strategy(|_| None);
        let call = cfp();
        participant.handle(call.clone(), &mut ctx()).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut c = ctx();
        participant.on_time(SWEEP_TOKEN, &mut c).unwrap();
        assert_eq!(c.outbox().next().unwrap().performative, Performative::Refuse);
        assert!(!participant.owns_conversation(&call.conversation_id));
    }

    #[test]
    fn test_accept_without_proposal_is_violation() {
        let mut participant = fixed(1.0);
        let stray = from_pool(&cfp(), Performative::AcceptProposal);
        assert!(participant.handle(stray, &mut ctx()).is_err());
    }

    #[test]
    fn test_uniform_bids_stay_in_range() {
        let mut strategy = ContractNetParticipant::uniform_bids(100.0, 500.0);
        for _ in 0..200 {
            let bid = strategy(&cfp()).unwrap();
            assert!((100.0..500.0).contains(&bid));
        }
        let mut fixed = ContractNetParticipant::uniform_bids(7.0, 7.0);
        assert_eq!(fixed(&cfp()), Some(7.0));
    }

    #[test]
    fn test_uniform_bids_survive_unsampleable_ranges() {
        let mut huge = ContractNetParticipant::uniform_bids(-f64::MAX, f64::MAX);
        assert_eq!(huge(&cfp()), Some(-f64::MAX));
        let mut nan = ContractNetParticipant::uniform_bids(f64::NAN, 500.0);
        assert_eq!(nan(&cfp()), None);
        let mut open = ContractNetParticipant::uniform_bids(100.0, f64::INFINITY);
        assert_eq!(open(&cfp()), Some(100.0));
    }
}
