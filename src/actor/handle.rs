// actor/handle.rs - Agent construction specs and handles

use actix::prelude::*;
use std::fmt;
use std::time::Duration;

use super::messages::*;
use super::AgentActor;
use crate::acl_message::{AclMessage, Address};
use crate::behaviour::{AgentContext, Behaviour, Continuation};
use crate::network::TransportConfig;
use crate::scheduler::TimerHandle;

/// Everything needed to start one agent
pub struct AgentSpec {
    pub(crate) address: Address,
    pub(crate) behaviours: Vec<Box<dyn Behaviour>>,
    pub(crate) startup: Vec<(Duration, Continuation)>,
    pub(crate) transport: Option<TransportConfig>,
}

impl AgentSpec {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            behaviours: Vec::new(),
            startup: Vec::new(),
            transport: None,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Behaviours start in the order they are added
    pub fn with_behaviour(mut self, behaviour: impl Behaviour) -> Self {
        self.behaviours.push(Box::new(behaviour));
        self
    }

    /// Arm a one-shot callback as soon as the agent starts
    pub fn call_later<F>(mut self, delay: Duration, callback: F) -> Self
    where
        F: FnOnce(&mut AgentContext) + Send + 'static,
    {
        self.startup.push((delay, Box::new(callback)));
        self
    }

    /// Override the organization's transport settings for this agent
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl fmt::Debug for AgentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSpec")
            .field("address", &self.address)
            .field(
                "behaviours",
                &self.behaviours.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .field("startup", &self.startup.len())
            .finish()
    }
}

/// Handle to a running agent.
///
/// Cheap to clone. Every method is safe to call after the agent stopped:
/// fire-and-forget requests are dropped, queries report `NotRunning`.
#[derive(Clone)]
pub struct AgentHandle {
    address: Address,
    addr: Addr<AgentActor>,
}

impl AgentHandle {
    pub(crate) fn new(address: Address, addr: Addr<AgentActor>) -> Self {
        Self { address, addr }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.address.name
    }

    /// Offer `message` to the agent's behaviours as a local request
    pub fn notify(&self, message: AclMessage) {
        self.addr.do_send(Notify { message });
    }

    /// Inject `message` as if it had arrived over the network
    pub fn deliver(&self, message: AclMessage) {
        self.addr.do_send(DeliverMessage { message });
    }

    pub fn add_behaviour(&self, behaviour: impl Behaviour) {
        self.addr.do_send(AddBehaviour {
            behaviour: Box::new(behaviour),
        });
    }

    /// Run `callback` on the agent's loop after `delay`
    pub async fn call_later<F>(&self, delay: Duration, callback: F) -> Result<TimerHandle, AgentError>
    where
        F: FnOnce(&mut AgentContext) + Send + 'static,
    {
        self.addr
            .send(CallLater {
                delay,
                callback: Box::new(callback),
            })
            .await
            .map_err(|_| AgentError::NotRunning(self.address.name.clone()))?
    }

    pub async fn status(&self) -> Result<AgentStatus, AgentError> {
        self.addr
            .send(GetStatus)
            .await
            .map_err(|_| AgentError::NotRunning(self.address.name.clone()))
    }

    /// Stop the agent. Resolves once it is gone; calling it again is a no-op.
    pub async fn deactivate(&self) -> Result<(), AgentError> {
        match self.addr.send(Deactivate).await {
            Ok(()) | Err(MailboxError::Closed) => {}
            Err(MailboxError::Timeout) => return Err(AgentError::Timeout),
        }
        while self.addr.connected() {
            actix_rt::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    /// Ask the agent to stop without waiting for it
    pub fn deactivate_detached(&self) {
        self.addr.do_send(Deactivate);
    }

    pub fn is_active(&self) -> bool {
        self.addr.connected()
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("address", &self.address)
            .field("active", &self.is_active())
            .finish()
    }
}
