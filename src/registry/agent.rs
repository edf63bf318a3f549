//! Agent registry
//!
//! At most one live agent per name: registering a name that is already live
//! demotes the previous occupant to offline before installing the new record.
//! Pre-configured entries (from the config file) are kept in a separate table
//! keyed by name and merged in at registration time.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::ParticipantStatus;
use crate::config::PreconfiguredAgent;

/// A registered agent. Survives disconnects with a cleared binding.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub manifest: Value,
    pub status: ParticipantStatus,
    pub connection_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// The manifest's declared service allow-list, if any.
    pub fn required_services(&self) -> Option<Vec<String>> {
        self.manifest
            .get("requiredServices")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
    }

    /// Wire shape for list responses.
    pub fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "capabilities": self.capabilities,
            "status": self.status.as_str(),
            "registeredAt": self.registered_at,
        })
    }
}

/// Filters for listing agents.
#[derive(Debug, Default, Clone)]
pub struct AgentFilter {
    pub status: Option<ParticipantStatus>,
    pub capabilities: Vec<String>,
    pub name_contains: Option<String>,
}

impl AgentFilter {
    pub fn matches(&self, agent: &Agent) -> bool {
        if let Some(status) = self.status {
            if agent.status != status {
                return false;
            }
        }
        if !self
            .capabilities
            .iter()
            .all(|cap| agent.capabilities.iter().any(|c| c == cap))
        {
            return false;
        }
        if let Some(fragment) = &self.name_contains {
            if !agent
                .name
                .to_lowercase()
                .contains(&fragment.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Outcome of a registration.
pub struct Registered {
    pub agent: Agent,
    /// Id of a previously live same-name agent that was demoted.
    pub demoted_id: Option<String>,
}

/// Authoritative table of agents, keyed by id.
pub struct AgentRegistry {
    inner: RwLock<HashMap<String, Agent>>,
    preconfigured: HashMap<String, PreconfiguredAgent>,
}

impl AgentRegistry {
    pub fn new(preconfigured: Vec<PreconfiguredAgent>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            preconfigured: preconfigured
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        }
    }

    /// Register an agent under `name`, bound to `connection_id`.
    ///
    /// The whole lookup-demote-merge-insert sequence runs under one write
    /// lock. A live agent already holding the name is demoted to offline and
    /// unbound first; a pre-configured entry contributes its id and
    /// capabilities.
    pub async fn register(
        &self,
        name: &str,
        capabilities: Vec<String>,
        manifest: Value,
        connection_id: Uuid,
    ) -> Registered {
        let mut inner = self.inner.write().await;

        let mut demoted_id = None;
        for existing in inner.values_mut() {
            if existing.name == name && existing.status.is_live() {
                info!(agent = %existing.id, name, "demoting previous holder of agent name");
                existing.status = ParticipantStatus::Offline;
                existing.connection_id = None;
                demoted_id = Some(existing.id.clone());
            }
        }

        let preconfig = self.preconfigured.get(name);

        let id = preconfig
            .and_then(|p| p.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut caps: BTreeSet<String> = capabilities.into_iter().collect();
        if let Some(p) = preconfig {
            caps.extend(p.capabilities.iter().cloned());
        }

        let mut manifest = manifest;
        if let Some(p) = preconfig {
            if let (Some(target), Some(extra)) = (manifest.as_object_mut(), p.metadata.as_object())
            {
                for (key, value) in extra {
                    target.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        // Reconnection under a pre-configured id keeps the original
        // registered_at.
        let registered_at = inner
            .get(&id)
            .map(|existing| existing.registered_at)
            .unwrap_or_else(Utc::now);

        let agent = Agent {
            id: id.clone(),
            name: name.to_string(),
            capabilities: caps.into_iter().collect(),
            manifest,
            status: ParticipantStatus::Online,
            connection_id: Some(connection_id),
            registered_at,
        };
        inner.insert(id, agent.clone());

        Registered { agent, demoted_id }
    }

    pub async fn get(&self, id: &str) -> Option<Agent> {
        self.inner.read().await.get(id).cloned()
    }

    /// Live agent holding `name`; falls back to the most recently registered
    /// offline record when nobody live holds it.
    pub async fn get_by_name(&self, name: &str) -> Option<Agent> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<&Agent> = inner.values().filter(|a| a.name == name).collect();
        candidates.sort_by_key(|a| a.registered_at);
        candidates
            .iter()
            .rev()
            .find(|a| a.status.is_live())
            .copied()
            .or_else(|| candidates.last().copied())
            .cloned()
    }

    pub async fn get_by_connection(&self, connection_id: Uuid) -> Option<Agent> {
        self.inner
            .read()
            .await
            .values()
            .find(|a| a.connection_id == Some(connection_id))
            .cloned()
    }

    pub async fn update_status(&self, id: &str, status: ParticipantStatus) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(agent) => {
                debug!(agent = %id, status = status.as_str(), "agent status updated");
                agent.status = status;
                true
            }
            None => false,
        }
    }

    /// Heartbeat write: mark the agent `error` only while it is still bound
    /// to the connection the missed ping went out on. A disconnect or a
    /// reconnect that raced the ping wins, and the write is skipped.
    pub async fn mark_unresponsive(&self, id: &str, connection_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(agent) if agent.connection_id == Some(connection_id) => {
                agent.status = ParticipantStatus::Error;
                true
            }
            _ => false,
        }
    }

    /// Clear the binding of whichever agent holds `connection_id` and demote
    /// it to offline. Returns the affected agent.
    pub async fn mark_disconnected(&self, connection_id: Uuid) -> Option<Agent> {
        let mut inner = self.inner.write().await;
        let agent = inner
            .values_mut()
            .find(|a| a.connection_id == Some(connection_id))?;
        agent.connection_id = None;
        agent.status = ParticipantStatus::Offline;
        Some(agent.clone())
    }

    pub async fn list(&self, filter: &AgentFilter) -> Vec<Agent> {
        let inner = self.inner.read().await;
        let mut agents: Vec<Agent> = inner
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        agents
    }
}
