//! Shared hub state
//!
//! One aggregate owned behind an `Arc`, reachable from every endpoint read
//! loop, the router, the heartbeat, and shutdown handling.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::endpoint::{Endpoint, EndpointClass};
use crate::mcp::McpAdapter;
use crate::pending::PendingResponseTable;
use crate::registry::{
    AgentRegistry, AgentTaskRegistry, ClientRegistry, ServiceRegistry, ServiceTaskRegistry,
};

/// Everything long-lived in the hub.
pub struct SharedState {
    pub config: Config,
    pub agents: AgentRegistry,
    pub clients: ClientRegistry,
    pub services: ServiceRegistry,
    pub agent_tasks: AgentTaskRegistry,
    pub service_tasks: ServiceTaskRegistry,
    pub pending: PendingResponseTable,
    pub mcp: McpAdapter,
    pub agent_endpoint: Arc<Endpoint>,
    pub client_endpoint: Arc<Endpoint>,
    pub service_endpoint: Arc<Endpoint>,
    pub shutdown: CancellationToken,
}

impl SharedState {
    pub fn new(config: Config, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            agents: AgentRegistry::new(config.agents.clone()),
            clients: ClientRegistry::new(),
            services: ServiceRegistry::new(config.services.clone()),
            agent_tasks: AgentTaskRegistry::new(),
            service_tasks: ServiceTaskRegistry::new(),
            pending: PendingResponseTable::new(shutdown.clone()),
            mcp: McpAdapter::new(config.mcp_request_timeout),
            agent_endpoint: Endpoint::new(EndpointClass::Agent, shutdown.clone()),
            client_endpoint: Endpoint::new(EndpointClass::Client, shutdown.clone()),
            service_endpoint: Endpoint::new(EndpointClass::Service, shutdown.clone()),
            shutdown,
            config,
        })
    }

    pub fn endpoint(&self, class: EndpointClass) -> &Arc<Endpoint> {
        match class {
            EndpointClass::Agent => &self.agent_endpoint,
            EndpointClass::Client => &self.client_endpoint,
            EndpointClass::Service => &self.service_endpoint,
        }
    }
}
