// actor/organization.rs - Composition root for a set of agents

use actix::prelude::*;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::handle::{AgentHandle, AgentSpec};
use crate::actor::messages::*;
use crate::actor::AgentActor;
use crate::config::EngineConfig;
use crate::network::TransportConfig;

/// Actor owning the set of live agents.
///
/// Agents report back with `AgentStopped`, however they were stopped, so
/// the table only ever lists running agents.
pub struct Organization {
    /// Organization name, for logs
    name: String,

    /// Default transport settings for spawned agents
    transport: TransportConfig,

    /// Mailbox capacity of each agent
    mailbox_capacity: usize,

    /// Live agents by name
    agents: HashMap<String, ManagedAgent>,

    /// Set once shutdown starts
    closed: bool,
}

struct ManagedAgent {
    handle: AgentHandle,
    spawned_at: Instant,
}

impl Organization {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            name: config.organization.name.clone(),
            transport: config.transport.clone(),
            mailbox_capacity: config.organization.mailbox_capacity,
            agents: HashMap::new(),
            closed: false,
        }
    }

    fn spawn_agent(&mut self, spec: AgentSpec, ctx: &mut Context<Self>) -> Result<AgentHandle, AgentError> {
        if self.closed {
            return Err(AgentError::ShuttingDown);
        }
        let name = spec.address().name.clone();
        if self.agents.contains_key(&name) {
            return Err(AgentError::AlreadyExists(name));
        }

        let handle = AgentActor::launch(
            spec,
            self.transport.clone(),
            self.mailbox_capacity,
            Some(ctx.address().recipient()),
        )?;

        self.agents.insert(
            name,
            ManagedAgent {
                handle: handle.clone(),
                spawned_at: Instant::now(),
            },
        );
        info!(organization = %self.name, agent = %handle.address(), "Spawned agent");
        Ok(handle)
    }

    fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<_> = self
            .agents
            .values()
            .map(|managed| AgentInfo {
                address: managed.handle.address().clone(),
                state: if managed.handle.is_active() {
                    AgentRuntimeState::Running
                } else {
                    AgentRuntimeState::Stopping
                },
                uptime_secs: managed.spawned_at.elapsed().as_secs(),
            })
            .collect();
        agents.sort_by(|a, b| a.address.name.cmp(&b.address.name));
        agents
    }
}

impl Actor for Organization {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!(organization = %self.name, "Organization started");
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        info!(organization = %self.name, agents = self.agents.len(), "Organization stopping, deactivating all agents");
        for managed in self.agents.values() {
            managed.handle.deactivate_detached();
        }
        Running::Stop
    }
}

// =============================================================================
// Message Handlers
// =============================================================================

impl Handler<SpawnAgent> for Organization {
    type Result = Result<AgentHandle, AgentError>;

    fn handle(&mut self, msg: SpawnAgent, ctx: &mut Self::Context) -> Self::Result {
        let name = msg.spec.address().name.clone();
        self.spawn_agent(msg.spec, ctx).inspect_err(|e| {
            warn!(organization = %self.name, agent = %name, error = %e, "Failed to spawn agent");
        })
    }
}

impl Handler<LookupAgent> for Organization {
    type Result = Option<AgentHandle>;

    fn handle(&mut self, msg: LookupAgent, _ctx: &mut Self::Context) -> Self::Result {
        self.agents.get(&msg.name).map(|managed| managed.handle.clone())
    }
}

impl Handler<ListAgents> for Organization {
    type Result = Vec<AgentInfo>;

    fn handle(&mut self, _msg: ListAgents, _ctx: &mut Self::Context) -> Self::Result {
        self.list_agents()
    }
}

impl Handler<AgentStopped> for Organization {
    type Result = ();

    fn handle(&mut self, msg: AgentStopped, _ctx: &mut Self::Context) {
        if self.agents.remove(&msg.name).is_some() {
            info!(organization = %self.name, agent = %msg.name, remaining = self.agents.len(), "Agent removed");
        } else {
            debug!(organization = %self.name, agent = %msg.name, "Stop report for unknown agent");
        }
    }
}

impl Handler<Shutdown> for Organization {
    type Result = Vec<AgentHandle>;

    fn handle(&mut self, _msg: Shutdown, _ctx: &mut Self::Context) -> Self::Result {
        self.closed = true;
        info!(organization = %self.name, agents = self.agents.len(), "Shutting down");
        self.agents.values().map(|managed| managed.handle.clone()).collect()
    }
}

/// Handle to a running organization.
///
/// Passed explicitly to whatever needs to spawn or stop agents, including
/// behaviours that create agents at run time.
#[derive(Clone)]
pub struct OrganizationHandle {
    addr: Addr<Organization>,
}

impl OrganizationHandle {
    /// Start an organization on the current arbiter
    pub fn start(config: &EngineConfig) -> Self {
        Self {
            addr: Organization::new(config).start(),
        }
    }

    /// Spawn one agent while the system is running
    pub async fn start_single_agent(&self, spec: AgentSpec) -> Result<AgentHandle, AgentError> {
        self.addr
            .send(SpawnAgent { spec })
            .await
            .map_err(|_| AgentError::MailboxError)?
    }

    /// Spawn a batch of agents in order.
    ///
    /// Stops at the first failure; agents spawned before it keep running.
    pub async fn start_loop<I>(&self, specs: I) -> Result<Vec<AgentHandle>, AgentError>
    where
        I: IntoIterator<Item = AgentSpec>,
    {
        let mut handles = Vec::new();
        for spec in specs {
            handles.push(self.start_single_agent(spec).await?);
        }
        Ok(handles)
    }

    /// Spawn from synchronous code, such as a behaviour callback. Failures
    /// are logged by the organization.
    pub fn spawn_detached(&self, spec: AgentSpec) {
        self.addr.do_send(SpawnAgent { spec });
    }

    /// Deactivate an agent by name. Unknown or already stopped agents are
    /// not an error.
    pub async fn deactivate(&self, name: &str) -> Result<(), AgentError> {
        match self.lookup(name).await? {
            Some(handle) => handle.deactivate().await,
            None => Ok(()),
        }
    }

    pub async fn lookup(&self, name: &str) -> Result<Option<AgentHandle>, AgentError> {
        self.addr
            .send(LookupAgent { name: name.to_string() })
            .await
            .map_err(|_| AgentError::MailboxError)
    }

    /// Live agents, sorted by name
    pub async fn agents(&self) -> Result<Vec<AgentInfo>, AgentError> {
        self.addr.send(ListAgents).await.map_err(|_| AgentError::MailboxError)
    }

    /// Deactivate every agent and refuse new ones
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let agents = self
            .addr
            .send(Shutdown)
            .await
            .map_err(|_| AgentError::MailboxError)?;
        for agent in agents {
            agent.deactivate().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl_message::{AclMessage, Address, Performative, ProtocolType};
    use crate::behaviour::{
        ContractNetInitiator, ContractNetParticipant, Publisher, RoundOutcome, Subscriber,
    };
    use crate::config::{InitiatorConfig, ParticipantConfig};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn free_address(name: &str) -> Address {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = spare.local_addr().unwrap().port();
        Address::new(name, "127.0.0.1", port)
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..250 {
            if check() {
                return true;
            }
            actix_rt::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[actix_rt::test]
    async fn test_spawn_list_and_deactivate() {
        let org = OrganizationHandle::start(&EngineConfig::default());
        let a = free_address("a");
        let b = free_address("b");

        org.start_loop([AgentSpec::new(b.clone()), AgentSpec::new(a.clone())])
            .await
            .unwrap();
        let names: Vec<_> = org.agents().await.unwrap().into_iter().map(|i| i.address.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        let duplicate = org.start_single_agent(AgentSpec::new(free_address("a"))).await;
        assert!(matches!(duplicate, Err(AgentError::AlreadyExists(_))));

        org.deactivate("a").await.unwrap();
        org.deactivate("a").await.unwrap();
        org.deactivate("never-existed").await.unwrap();
        let mut remaining = Vec::new();
        for _ in 0..50 {
            remaining = org.agents().await.unwrap();
            if remaining.len() == 1 {
                break;
            }
            actix_rt::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address, b);

        org.shutdown().await.unwrap();
        assert!(matches!(
            org.start_single_agent(AgentSpec::new(free_address("late"))).await,
            Err(AgentError::ShuttingDown)
        ));
    }

    #[actix_rt::test]
    async fn test_contract_net_end_to_end() {
        let config = EngineConfig::default();
        let org = OrganizationHandle::start(&config);
        let pool = free_address("job_pool");

        let publisher = Publisher::new();
        let view = publisher.subscribers();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let initiator = ContractNetInitiator::new(
            publisher.subscribers(),
            InitiatorConfig {
                collection_window_ms: 3_000,
                completion_timeout_ms: 3_000,
                ..InitiatorConfig::default()
            },
        )
        .on_outcome(move |outcome| sink.lock().push(outcome.clone()));

        let pool_handle = org
            .start_single_agent(
                AgentSpec::new(pool.clone())
                    .with_behaviour(publisher)
                    .with_behaviour(initiator),
            )
            .await
            .unwrap();

        let awards = Arc::new(AtomicU32::new(0));
        let mut machines = Vec::new();
        for (name, bid) in [("machine_1", 120.0), ("machine_2", 340.0), ("machine_3", 200.0)] {
            let address = free_address(name);
            let awarded = awards.clone();
            let participant = ContractNetParticipant::new(ParticipantConfig {
                bid_delay_ms: 50,
                ..ParticipantConfig::default()
            })
            .with_strategy(move |_| Some(bid))
            .on_award(move |_, _| {
                awarded.fetch_add(1, Ordering::SeqCst);
            });
            org.start_single_agent(
                AgentSpec::new(address.clone())
                    .with_behaviour(Subscriber::new(pool.clone(), "machine"))
                    .with_behaviour(participant),
            )
            .await
            .unwrap();
            machines.push(address);
        }

        assert!(eventually(|| view.get_partial_subscribers("machine").len() == 3).await);

        pool_handle.notify(
            AclMessage::new(Performative::Cfp, ProtocolType::ContractNet).with_content("60.0"),
        );

        assert!(
            eventually(|| outcomes
                .lock()
                .iter()
                .any(|o| matches!(o, RoundOutcome::Closed { .. })))
            .await
        );

        let outcomes = outcomes.lock().clone();
        let RoundOutcome::Decided(decision) = &outcomes[0] else {
            panic!("expected a decision first, got {outcomes:?}");
        };
        let winner = decision.winner.as_ref().unwrap();
        assert_eq!(winner.bidder, machines[1]);
        assert_eq!(winner.value, 340.0);
        let mut rejected = decision.rejected.clone();
        rejected.sort();
        let mut losers = vec![machines[0].clone(), machines[2].clone()];
        losers.sort();
        assert_eq!(rejected, losers);

        assert!(matches!(
            &outcomes[1],
            RoundOutcome::Closed { contractor: Some(c), expired: false, .. } if *c == machines[1]
        ));
        assert_eq!(awards.load(Ordering::SeqCst), 1);

        org.shutdown().await.unwrap();
        assert!(!pool_handle.is_active());
    }
}
