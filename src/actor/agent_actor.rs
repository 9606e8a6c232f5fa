// actor/agent_actor.rs - Agent runtime

use actix::prelude::*;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::handle::{AgentHandle, AgentSpec};
use crate::acl_message::{AclMessage, Address};
use crate::actor::messages::*;
use crate::behaviour::{
    self, AgentContext, Behaviour, BehaviourError, BehaviourId, BlockingJob, Continuation, Effect,
};
use crate::network::{Dialer, TransportConfig, TransportEndpoint};
use crate::observability::{
    record_agent_spawned, record_agent_stopped, record_behaviour_error, record_delivery_failure,
    record_message_dropped, record_message_sent,
};
use crate::scheduler::{TimerHandle, TimerId, TimerKind, TimerTable, TimerTarget};

/// Actor running one agent.
///
/// Owns the agent's endpoint, dialer, behaviours and timers. Inbound
/// messages, timer firings and blocking-work continuations are all handled
/// on the actor's context, one at a time.
pub struct AgentActor {
    /// Agent address
    address: Address,

    /// Listening side of the transport
    endpoint: TransportEndpoint,

    /// Outbound side of the transport
    dialer: Dialer,

    /// Behaviours in start order; indexed by `BehaviourId`
    behaviours: Vec<Box<dyn Behaviour>>,

    /// Armed timers
    timers: TimerTable,

    /// Callbacks armed when the actor starts
    startup: Vec<(std::time::Duration, Continuation)>,

    /// Told when this agent stops
    organization: Option<Recipient<AgentStopped>>,

    /// Runtime state
    state: AgentRuntimeState,

    /// Statistics
    stats: AgentStats,

    /// Start time
    start_time: Instant,
}

/// Agent statistics
#[derive(Default)]
struct AgentStats {
    messages_received: u64,
    messages_sent: u64,
    delivery_failures: u64,
    handler_errors: u64,
}

impl AgentActor {
    /// Create an agent whose endpoint is already bound
    pub fn new(spec: AgentSpec, endpoint: TransportEndpoint, dialer: Dialer) -> Self {
        Self {
            address: spec.address,
            endpoint,
            dialer,
            behaviours: spec.behaviours,
            timers: TimerTable::new(),
            startup: spec.startup,
            organization: None,
            state: AgentRuntimeState::Starting,
            stats: AgentStats::default(),
            start_time: Instant::now(),
        }
    }

    /// Set the recipient notified when this agent stops
    pub fn with_organization(mut self, organization: Recipient<AgentStopped>) -> Self {
        self.organization = Some(organization);
        self
    }

    /// Bind the agent's port and start it on the current arbiter.
    ///
    /// A port clash is reported here, before any actor exists.
    pub fn launch(
        spec: AgentSpec,
        transport: TransportConfig,
        mailbox_capacity: usize,
        organization: Option<Recipient<AgentStopped>>,
    ) -> Result<AgentHandle, AgentError> {
        let transport = spec.transport.clone().unwrap_or(transport);
        let address = spec.address.clone();

        let mut endpoint = TransportEndpoint::new(address.clone(), transport.clone());
        endpoint.bind()?;
        let dialer = Dialer::new(address.name.clone(), transport);

        let mut actor = AgentActor::new(spec, endpoint, dialer);
        if let Some(organization) = organization {
            actor = actor.with_organization(organization);
        }
        let addr = AgentActor::create(move |ctx| {
            ctx.set_mailbox_capacity(mailbox_capacity);
            actor
        });
        Ok(AgentHandle::new(address, addr))
    }

    fn is_running(&self) -> bool {
        self.state == AgentRuntimeState::Running
    }

    fn context(&self, current: Option<BehaviourId>) -> AgentContext {
        AgentContext::new(self.address.clone(), self.timers.ids(), current)
    }

    /// Run one behaviour callback and collect what it asked for
    fn invoke<F>(&mut self, id: BehaviourId, f: F) -> Vec<Effect>
    where
        F: FnOnce(&mut dyn Behaviour, &mut AgentContext) -> Result<(), BehaviourError>,
    {
        let mut actx = self.context(Some(id));
        let Some(behaviour) = self.behaviours.get_mut(id.0) else {
            warn!(agent = %self.address, behaviour = id.0, "No such behaviour");
            return Vec::new();
        };

        if let Err(e) = f(behaviour.as_mut(), &mut actx) {
            warn!(agent = %self.address, behaviour = behaviour.name(), error = %e, "Behaviour failed");
            record_behaviour_error(behaviour.name());
            self.stats.handler_errors += 1;
        }
        actx.into_effects()
    }

    /// Route an inbound message to its behaviours
    fn dispatch(&mut self, message: AclMessage, ctx: &mut Context<Self>) {
        self.stats.messages_received += 1;

        let targets = behaviour::route(&self.behaviours, &message);
        if targets.is_empty() {
            debug!(
                agent = %self.address,
                performative = %message.performative,
                protocol = %message.protocol,
                conversation = %message.conversation_id,
                "No behaviour for message, dropped"
            );
            record_message_dropped("unroutable");
            return;
        }

        for id in targets {
            let msg = message.clone();
            let effects = self.invoke(id, |b, actx| b.handle(msg, actx));
            self.apply(effects, ctx);
        }
    }

    /// Offer a local request to behaviours of its protocol until one takes it
    fn notify_behaviours(&mut self, message: &AclMessage) -> Vec<Effect> {
        let candidates: Vec<_> = self
            .behaviours
            .iter()
            .enumerate()
            .filter(|(_, b)| b.protocol().as_ref() == Some(&message.protocol))
            .map(|(index, _)| BehaviourId(index))
            .collect();

        let mut effects = Vec::new();
        for id in candidates {
            let mut taken = false;
            effects.extend(self.invoke(id, |b, actx| {
                taken = b.notify(message, actx)?;
                Ok(())
            }));
            if taken {
                return effects;
            }
        }

        debug!(agent = %self.address, performative = %message.performative, "Notification not taken");
        record_message_dropped("unclaimed");
        effects
    }

    fn add_behaviour(&mut self, behaviour: Box<dyn Behaviour>) -> Vec<Effect> {
        let id = BehaviourId(self.behaviours.len());
        info!(agent = %self.address, behaviour = behaviour.name(), "Behaviour added");
        self.behaviours.push(behaviour);
        self.invoke(id, |b, actx| b.on_start(actx))
    }

    /// Apply effects in order; effects they cause run after them
    fn apply(&mut self, effects: Vec<Effect>, ctx: &mut Context<Self>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            if !self.is_running() {
                debug!(agent = %self.address, dropped = queue.len() + 1, "Agent stopping, effects dropped");
                return;
            }
            match effect {
                Effect::Send(message) => self.send(message, ctx),
                Effect::Arm { handle, target } => self.arm(handle, target, ctx),
                Effect::Cancel(id) => {
                    if let Some(spawn) = self.timers.cancel(id) {
                        ctx.cancel_future(spawn);
                    }
                }
                Effect::Notify(message) => queue.extend(self.notify_behaviours(&message)),
                Effect::AddBehaviour(behaviour) => queue.extend(self.add_behaviour(behaviour)),
                Effect::Blocking(job) => self.run_blocking(job, ctx),
                Effect::Deactivate => self.deactivate(ctx),
            }
        }
    }

    /// Stamp the sender and hand one frame per receiver to the dialer
    fn send(&mut self, mut message: AclMessage, ctx: &mut Context<Self>) {
        message.sender = Some(self.address.clone());
        if let Err(e) = message.validate_for_send() {
            warn!(agent = %self.address, performative = %message.performative, error = %e, "Message not sent");
            record_message_dropped("invalid");
            return;
        }

        self.stats.messages_sent += 1;
        record_message_sent(message.performative.as_str(), message.protocol.as_str());
        debug!(
            agent = %self.address,
            performative = %message.performative,
            conversation = %message.conversation_id,
            receivers = message.receivers.len(),
            "Sending"
        );

        for receiver in &message.receivers {
            let delivery = self.dialer.deliver(receiver, &message);
            let peer = receiver.clone();
            let performative = message.performative;
            ctx.spawn(delivery.into_actor(self).map(move |result, act, _ctx| {
                if let Err(e) = result {
                    warn!(agent = %act.address, peer = %peer, performative = %performative, error = %e, "Delivery failed");
                    act.stats.delivery_failures += 1;
                    record_delivery_failure(performative.as_str());
                }
            }));
        }
    }

    fn arm(&mut self, handle: TimerHandle, target: TimerTarget, ctx: &mut Context<Self>) {
        let id = handle.id();
        let spawn = match handle.kind() {
            TimerKind::Once(delay) => ctx.run_later(delay, move |act, ctx| act.fire_timer(id, ctx)),
            TimerKind::Every(period) => {
                ctx.run_interval(period, move |act, ctx| act.fire_timer(id, ctx))
            }
        };
        self.timers.insert(handle, target, spawn);
    }

    fn fire_timer(&mut self, id: TimerId, ctx: &mut Context<Self>) {
        if !self.is_running() {
            return;
        }
        let Some(target) = self.timers.begin_fire(id) else {
            return;
        };

        let effects = match target {
            TimerTarget::Behaviour { behaviour, token } => {
                let effects = self.invoke(behaviour, |b, actx| b.on_time(token, actx));
                self.timers.finish_fire(id, TimerTarget::Behaviour { behaviour, token });
                effects
            }
            TimerTarget::Callback(mut callback) => {
                let mut actx = self.context(None);
                callback(&mut actx);
                self.timers.finish_fire(id, TimerTarget::Callback(callback));
                actx.into_effects()
            }
        };
        self.apply(effects, ctx);
    }

    /// Run `job` on the blocking pool and resume on this actor
    fn run_blocking(&mut self, job: BlockingJob, ctx: &mut Context<Self>) {
        let work = tokio::task::spawn_blocking(job);
        ctx.spawn(actix::fut::wrap_future::<_, Self>(work).map(|result, act, ctx| {
            match result {
                Ok(continuation) if act.is_running() => {
                    let mut actx = act.context(None);
                    continuation(&mut actx);
                    act.apply(actx.into_effects(), ctx);
                }
                Ok(_) => debug!(agent = %act.address, "Blocking work finished after stop"),
                Err(e) => {
                    error!(agent = %act.address, error = %e, "Blocking work failed");
                    act.stats.handler_errors += 1;
                }
            }
        }));
    }

    fn deactivate(&mut self, ctx: &mut Context<Self>) {
        if matches!(self.state, AgentRuntimeState::Starting | AgentRuntimeState::Running) {
            info!(agent = %self.address, "Deactivating");
            self.state = AgentRuntimeState::Stopping;
            ctx.stop();
        }
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            address: self.address.clone(),
            state: self.state,
            listening: self.endpoint.is_listening(),
            inbound_connections: self.endpoint.active_connections(),
            outbound_links: self.dialer.link_count(),
            behaviours: self
                .behaviours
                .iter()
                .map(|b| BehaviourStatus {
                    name: b.name().to_string(),
                    status: b.status(),
                })
                .collect(),
            pending_timers: self.timers.pending(),
            messages_received: self.stats.messages_received,
            messages_sent: self.stats.messages_sent,
            delivery_failures: self.stats.delivery_failures,
            handler_errors: self.stats.handler_errors,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Actor for AgentActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        record_agent_spawned();

        if let Err(e) = self.endpoint.listen(ctx.address().recipient()) {
            error!(agent = %self.address, error = %e, "Endpoint failed to listen");
            self.deactivate(ctx);
            return;
        }
        self.state = AgentRuntimeState::Running;
        info!(agent = %self.address, behaviours = self.behaviours.len(), "Agent started");

        for (delay, callback) in std::mem::take(&mut self.startup) {
            let handle = self.timers.ids().allocate(TimerKind::Once(delay));
            self.arm(handle, TimerTarget::once(callback), ctx);
        }

        for index in 0..self.behaviours.len() {
            let effects = self.invoke(BehaviourId(index), |b, actx| b.on_start(actx));
            self.apply(effects, ctx);
        }
    }

    fn stopping(&mut self, ctx: &mut Self::Context) -> Running {
        self.state = AgentRuntimeState::Stopping;

        for spawn in self.timers.cancel_all() {
            ctx.cancel_future(spawn);
        }
        self.endpoint.stop();
        self.dialer.shutdown();

        if let Some(organization) = &self.organization {
            organization.do_send(AgentStopped {
                name: self.address.name.clone(),
            });
        }
        record_agent_stopped("deactivated");
        Running::Stop
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state = AgentRuntimeState::Stopped;
        info!(agent = %self.address, "Agent stopped");
    }
}

// =============================================================================
// Message Handlers
// =============================================================================

impl Handler<DeliverMessage> for AgentActor {
    type Result = ();

    #[instrument(skip(self, msg, ctx), fields(agent = %self.address))]
    fn handle(&mut self, msg: DeliverMessage, ctx: &mut Self::Context) {
        if self.is_running() {
            self.dispatch(msg.message, ctx);
        }
    }
}

impl Handler<Notify> for AgentActor {
    type Result = ();

    fn handle(&mut self, msg: Notify, ctx: &mut Self::Context) {
        if self.is_running() {
            let effects = self.notify_behaviours(&msg.message);
            self.apply(effects, ctx);
        }
    }
}

impl Handler<AddBehaviour> for AgentActor {
    type Result = ();

    fn handle(&mut self, msg: AddBehaviour, ctx: &mut Self::Context) {
        if self.is_running() {
            let effects = self.add_behaviour(msg.behaviour);
            self.apply(effects, ctx);
        }
    }
}

impl Handler<CallLater> for AgentActor {
    type Result = Result<TimerHandle, AgentError>;

    fn handle(&mut self, msg: CallLater, ctx: &mut Self::Context) -> Self::Result {
        if !self.is_running() {
            return Err(AgentError::NotRunning(self.address.name.clone()));
        }
        let handle = self.timers.ids().allocate(TimerKind::Once(msg.delay));
        self.arm(handle.clone(), TimerTarget::once(msg.callback), ctx);
        Ok(handle)
    }
}

impl Handler<Deactivate> for AgentActor {
    type Result = ();

    fn handle(&mut self, _msg: Deactivate, ctx: &mut Self::Context) {
        self.deactivate(ctx);
    }
}

impl Handler<GetStatus> for AgentActor {
    type Result = AgentStatus;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        self.status()
    }
}
