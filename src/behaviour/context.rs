// behaviour/context.rs - Capability handle passed to behaviours

use std::fmt;
use std::time::Duration;
use tracing::warn;

use super::{Behaviour, BehaviourId};
use crate::acl_message::{AclMessage, Address};
use crate::scheduler::{TimerHandle, TimerId, TimerIds, TimerKind, TimerTarget};

/// Work resumed on the agent's loop
pub type Continuation = Box<dyn FnOnce(&mut AgentContext) + Send>;

/// Blocking work run on the worker pool; yields its continuation
pub type BlockingJob = Box<dyn FnOnce() -> Continuation + Send>;

/// Side effect requested by a behaviour, applied by the agent runtime once
/// the current callback has returned
pub enum Effect {
    Send(AclMessage),
    Arm { handle: TimerHandle, target: TimerTarget },
    Cancel(TimerId),
    Notify(AclMessage),
    AddBehaviour(Box<dyn Behaviour>),
    Blocking(BlockingJob),
    Deactivate,
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Send(msg) => f.debug_tuple("Send").field(&msg.performative).finish(),
            Effect::Arm { handle, target } => f
                .debug_struct("Arm")
                .field("timer", &handle.id())
                .field("target", target)
                .finish(),
            Effect::Cancel(id) => f.debug_tuple("Cancel").field(id).finish(),
            Effect::Notify(msg) => f.debug_tuple("Notify").field(&msg.performative).finish(),
            Effect::AddBehaviour(b) => f.debug_tuple("AddBehaviour").field(&b.name()).finish(),
            Effect::Blocking(_) => f.write_str("Blocking"),
            Effect::Deactivate => f.write_str("Deactivate"),
        }
    }
}

/// What a behaviour may do to its agent.
///
/// Every call only records an `Effect`; nothing leaves the agent until the
/// callback returns, so a behaviour can never observe a half-applied change.
pub struct AgentContext {
    address: Address,
    timers: TimerIds,
    current: Option<BehaviourId>,
    effects: Vec<Effect>,
}

impl AgentContext {
    pub(crate) fn new(address: Address, timers: TimerIds, current: Option<BehaviourId>) -> Self {
        Self {
            address,
            timers,
            current,
            effects: Vec::new(),
        }
    }

    /// Address of the agent running this callback
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn agent_name(&self) -> &str {
        &self.address.name
    }

    /// Hand a message to the transport. The runtime stamps the sender.
    pub fn send(&mut self, msg: AclMessage) {
        self.effects.push(Effect::Send(msg));
    }

    /// One-shot `on_time(token)` for the calling behaviour
    pub fn schedule(&mut self, delay: Duration, token: u64) -> TimerHandle {
        self.arm_behaviour(TimerKind::Once(delay), token)
    }

    /// Periodic `on_time(token)` for the calling behaviour
    pub fn schedule_every(&mut self, period: Duration, token: u64) -> TimerHandle {
        self.arm_behaviour(TimerKind::Every(period), token)
    }

    fn arm_behaviour(&mut self, kind: TimerKind, token: u64) -> TimerHandle {
        let handle = self.timers.allocate(kind);
        match self.current {
            Some(behaviour) => self.effects.push(Effect::Arm {
                handle: handle.clone(),
                target: TimerTarget::Behaviour { behaviour, token },
            }),
            None => {
                warn!(agent = %self.address.name, "Behaviour timer requested outside a behaviour");
                handle.cancel_unarmed();
            }
        }
        handle
    }

    /// Run `callback` on this agent's loop after `delay`
    pub fn call_later<F>(&mut self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut AgentContext) + Send + 'static,
    {
        let handle = self.timers.allocate(TimerKind::Once(delay));
        self.effects.push(Effect::Arm {
            handle: handle.clone(),
            target: TimerTarget::once(callback),
        });
        handle
    }

    pub fn cancel_timer(&mut self, handle: &TimerHandle) {
        self.effects.push(Effect::Cancel(handle.id()));
    }

    /// Offer `msg` to this agent's behaviours of the same protocol
    pub fn notify(&mut self, msg: AclMessage) {
        self.effects.push(Effect::Notify(msg));
    }

    pub fn add_behaviour(&mut self, behaviour: impl Behaviour) {
        self.effects.push(Effect::AddBehaviour(Box::new(behaviour)));
    }

    /// Run `work` on the blocking pool, then `then(result)` back on this agent
    pub fn defer_to_thread<T, W, C>(&mut self, work: W, then: C)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        C: FnOnce(T, &mut AgentContext) + Send + 'static,
    {
        self.effects.push(Effect::Blocking(Box::new(move || {
            let value = work();
            Box::new(move |ctx: &mut AgentContext| then(value, ctx)) as Continuation
        })));
    }

    /// Stop this agent once the callback returns
    pub fn deactivate(&mut self) {
        self.effects.push(Effect::Deactivate);
    }

    /// Effects recorded so far
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Messages recorded for sending so far
    pub fn outbox(&self) -> impl Iterator<Item = &AclMessage> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Send(msg) => Some(msg),
            _ => None,
        })
    }

    pub(crate) fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl_message::{Performative, ProtocolType};

    fn context(current: Option<BehaviourId>) -> AgentContext {
        AgentContext::new(Address::local("agent", 1), TimerIds::default(), current)
    }

    #[test]
    fn test_effects_are_recorded_in_order() {
        let mut ctx = context(Some(BehaviourId(0)));
        ctx.send(AclMessage::new(Performative::Cfp, ProtocolType::ContractNet));
        let timer = ctx.schedule(Duration::from_millis(10), 7);
        ctx.cancel_timer(&timer);
        ctx.deactivate();

        let effects = ctx.into_effects();
        assert!(matches!(effects[0], Effect::Send(_)));
        assert!(matches!(
            effects[1],
            Effect::Arm { target: TimerTarget::Behaviour { token: 7, .. }, .. }
        ));
        assert!(matches!(effects[2], Effect::Cancel(id) if id == timer.id()));
        assert!(matches!(effects[3], Effect::Deactivate));
    }

    #[test]
    fn test_behaviour_timer_without_behaviour_is_never_armed() {
        let mut ctx = context(None);
        let handle = ctx.schedule(Duration::from_millis(10), 1);
        assert!(handle.is_cancelled());
        assert!(ctx.effects().is_empty());
    }

    #[test]
    fn test_defer_to_thread_runs_continuation_with_result() {
        let mut ctx = context(None);
        ctx.defer_to_thread(|| 6 * 7, |answer, ctx| {
            ctx.send(
                AclMessage::new(Performative::Inform, ProtocolType::Subscribe)
                    .with_content(answer.to_string()),
            );
        });

        let Some(Effect::Blocking(job)) = ctx.into_effects().pop() else {
            panic!("expected a blocking job");
        };
        let continuation = job();
        let mut resumed = context(None);
        continuation(&mut resumed);
        assert_eq!(resumed.outbox().next().map(|m| m.content.as_str()), Some("42"));
    }
}
