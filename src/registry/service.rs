//! Service registry
//!
//! Services declare their tool catalog at registration and are authoritative
//! for it. Reconnection under the same id preserves `registered_at`, and
//! keeps the previous tool catalog unless the new registration supplies one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::ParticipantStatus;
use crate::config::PreconfiguredService;

/// A callable entry point declared by a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        rename = "inputSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
    #[serde(
        rename = "outputSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_schema: Option<Value>,
}

/// A registered service.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub tools: Vec<ToolDescriptor>,
    pub status: ParticipantStatus,
    pub connection_id: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
}

impl Service {
    pub fn tool(&self, tool_id: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.id == tool_id || t.name == tool_id)
    }

    /// Wire shape for list responses.
    pub fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "capabilities": self.capabilities,
            "tools": self.tools,
            "status": self.status.as_str(),
            "registeredAt": self.registered_at,
        })
    }
}

/// Outcome of a service registration.
pub struct Registered {
    pub service: Service,
    pub demoted_id: Option<String>,
}

/// Authoritative table of services, keyed by id.
pub struct ServiceRegistry {
    inner: RwLock<HashMap<String, Service>>,
    preconfigured: HashMap<String, PreconfiguredService>,
}

impl ServiceRegistry {
    pub fn new(preconfigured: Vec<PreconfiguredService>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            preconfigured: preconfigured
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        }
    }

    /// Register a service under `name`, bound to `connection_id`.
    ///
    /// Same atomicity rules as agent registration: a live same-name service
    /// is demoted first, the pre-configured table contributes id and
    /// capabilities, and an existing same-id record keeps its
    /// `registered_at` and (absent a new catalog) its tools.
    pub async fn register(
        &self,
        name: &str,
        capabilities: Vec<String>,
        tools: Option<Vec<ToolDescriptor>>,
        connection_id: Uuid,
    ) -> Registered {
        let mut inner = self.inner.write().await;

        let mut demoted_id = None;
        for existing in inner.values_mut() {
            if existing.name == name && existing.status.is_live() {
                info!(service = %existing.id, name, "demoting previous holder of service name");
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

        let previous = inner.get(&id);
        let registered_at = previous.map(|s| s.registered_at).unwrap_or_else(Utc::now);
        let tools = match tools {
            Some(tools) => tools,
            None => previous.map(|s| s.tools.clone()).unwrap_or_default(),
        };

        let service = Service {
            id: id.clone(),
            name: name.to_string(),
            capabilities: caps.into_iter().collect(),
            tools,
            status: ParticipantStatus::Online,
            connection_id: Some(connection_id),
            registered_at,
        };
        inner.insert(id, service.clone());

        Registered {
            service,
            demoted_id,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Service> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Service> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<&Service> = inner.values().filter(|s| s.name == name).collect();
        candidates.sort_by_key(|s| s.registered_at);
        candidates
            .iter()
            .rev()
            .find(|s| s.status.is_live())
            .copied()
            .or_else(|| candidates.last().copied())
            .cloned()
    }

    pub async fn get_by_connection(&self, connection_id: Uuid) -> Option<Service> {
        self.inner
            .read()
            .await
            .values()
            .find(|s| s.connection_id == Some(connection_id))
            .cloned()
    }

    pub async fn update_status(&self, id: &str, status: ParticipantStatus) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(service) => {
                service.status = status;
                true
            }
            None => false,
        }
    }

    /// Heartbeat write: mark the service `error` only while it is still
    /// bound to the connection the missed ping went out on.
    pub async fn mark_unresponsive(&self, id: &str, connection_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(service) if service.connection_id == Some(connection_id) => {
                service.status = ParticipantStatus::Error;
                true
            }
            _ => false,
        }
    }

    pub async fn mark_disconnected(&self, connection_id: Uuid) -> Option<Service> {
        let mut inner = self.inner.write().await;
        let service = inner
            .values_mut()
            .find(|s| s.connection_id == Some(connection_id))?;
        service.connection_id = None;
        service.status = ParticipantStatus::Offline;
        Some(service.clone())
    }

    pub async fn list(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.inner.read().await.values().cloned().collect();
        services.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        services
    }
}
