// behaviour/timed.rs - Fixed-period repeater

use std::time::Duration;
use tracing::trace;

use super::{AgentContext, Behaviour, BehaviourError};

type Tick = Box<dyn FnMut(u64, &mut AgentContext) + Send>;

/// Runs `tick(counter)` every `period` until the agent is deactivated.
///
/// The counter starts at 1 for the first tick.
pub struct TimedBehaviour {
    name: String,
    period: Duration,
    counter: u64,
    tick: Tick,
}

impl TimedBehaviour {
    pub fn new<F>(name: impl Into<String>, period: Duration, tick: F) -> Self
    where
        F: FnMut(u64, &mut AgentContext) + Send + 'static,
    {
        Self {
            name: name.into(),
            period,
            counter: 0,
            tick: Box::new(tick),
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Behaviour for TimedBehaviour {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> String {
        format!("{} ticks every {:?}", self.counter, self.period)
    }

    fn on_start(&mut self, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        ctx.schedule_every(self.period, 0);
        Ok(())
    }

    fn on_time(&mut self, _token: u64, ctx: &mut AgentContext) -> Result<(), BehaviourError> {
        self.counter += 1;
        trace!(agent = %ctx.agent_name(), behaviour = %self.name, counter = self.counter, "Tick");
        (self.tick)(self.counter, ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl_message::{AclMessage, Address, Performative, ProtocolType};
    use crate::behaviour::{BehaviourId, Effect};
    use crate::scheduler::{TimerKind, TimerTarget};
    use crate::scheduler::TimerIds;

    fn ctx() -> AgentContext {
        AgentContext::new(Address::local("ticker", 1), TimerIds::default(), Some(BehaviourId(2)))
    }

    #[test]
    fn test_start_arms_periodic_timer() {
        let mut timed = TimedBehaviour::new("ticker", Duration::from_millis(200), |_, _| {});
        let mut c = ctx();
        timed.on_start(&mut c).unwrap();

        let Some(Effect::Arm { handle, target }) = c.effects().first() else {
            panic!("expected a timer");
        };
        assert_eq!(handle.kind(), TimerKind::Every(Duration::from_millis(200)));
        assert!(matches!(
            target,
            TimerTarget::Behaviour { behaviour: BehaviourId(2), token: 0 }
        ));
    }

    #[test]
    fn test_ticks_count_up() {
        let mut timed = TimedBehaviour::new("ticker", Duration::from_millis(10), |n, ctx| {
            ctx.send(
                AclMessage::new(Performative::Inform, ProtocolType::Subscribe)
                    .with_content(n.to_string()),
            );
        });

        let mut contents = Vec::new();
        for _ in 0..3 {
            let mut c = ctx();
            timed.on_time(0, &mut c).unwrap();
            contents.extend(c.outbox().map(|m| m.content.clone()));
        }
        assert_eq!(timed.counter(), 3);
        assert_eq!(contents, vec!["1", "2", "3"]);
    }
}
