//! Task registries
//!
//! Lifecycle: pending → running → completed | failed. Terminal states are
//! absorbing; a transition attempted on a terminal task is logged and
//! ignored. Each task gets a monotonically increasing sequence number at
//! registration, which fixes "first parent in insertion order" for the
//! notification walk.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A unit of work assigned to an agent.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub task_id: Uuid,
    pub agent_id: String,
    /// Requesting client, when the task came from the client endpoint.
    pub client_id: Option<String>,
    /// Requesting agent, when this is a child task.
    pub requesting_agent_id: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub task_data: Value,
    pub task_type: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Message id of the originating request, echoed as `requestId` in the
    /// terminal reply.
    pub request_id: Option<Uuid>,
    /// Registration order, for deterministic parent selection.
    pub seq: u64,
}

/// A unit of work assigned to a service tool.
#[derive(Debug, Clone)]
pub struct ServiceTask {
    pub task_id: Uuid,
    pub service_id: String,
    /// Requesting agent: receives the execute response.
    pub agent_id: Option<String>,
    /// Client recorded for completion/notification fan-out.
    pub client_id: Option<String>,
    pub tool_id: String,
    pub params: Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub request_id: Option<Uuid>,
    pub seq: u64,
}

/// Result of an `update_status` call.
#[derive(Debug)]
pub enum UpdateOutcome<T> {
    /// Transition applied; the updated record.
    Updated(T),
    /// The task was already terminal; the unchanged record.
    Ignored(T),
    NotFound,
}

impl<T> UpdateOutcome<T> {
    pub fn updated(self) -> Option<T> {
        match self {
            UpdateOutcome::Updated(task) => Some(task),
            _ => None,
        }
    }
}

/// Authoritative table of agent tasks.
pub struct AgentTaskRegistry {
    inner: RwLock<HashMap<Uuid, AgentTask>>,
    seq: AtomicU64,
}

impl AgentTaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a fresh pending task and return it with its sequence number.
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        task_id: Uuid,
        agent_id: String,
        client_id: Option<String>,
        requesting_agent_id: Option<String>,
        parent_task_id: Option<Uuid>,
        task_type: Option<String>,
        task_data: Value,
        request_id: Option<Uuid>,
    ) -> AgentTask {
        let task = AgentTask {
            task_id,
            agent_id,
            client_id,
            requesting_agent_id,
            parent_task_id,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            task_data,
            task_type,
            result: None,
            error: None,
            request_id,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.inner.write().await.insert(task_id, task.clone());
        debug!(task = %task_id, agent = %task.agent_id, "agent task registered");
        task
    }

    pub async fn get(&self, task_id: Uuid) -> Option<AgentTask> {
        self.inner.read().await.get(&task_id).cloned()
    }

    /// Apply a status transition. Terminal states absorb: once completed or
    /// failed, later transitions are ignored. Result/error payloads are only
    /// stored with the transition that carries them.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> UpdateOutcome<AgentTask> {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.get_mut(&task_id) else {
            return UpdateOutcome::NotFound;
        };
        if task.status.is_terminal() {
            warn!(
                task = %task_id,
                current = task.status.as_str(),
                attempted = status.as_str(),
                "ignoring transition out of terminal state"
            );
            return UpdateOutcome::Ignored(task.clone());
        }
        task.status = status;
        if let Some(result) = result {
            task.result = Some(result);
        }
        if let Some(error) = error {
            task.error = Some(error);
        }
        if status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        UpdateOutcome::Updated(task.clone())
    }

    /// Tasks assigned to `agent_id`, in registration order.
    pub async fn by_agent_id(&self, agent_id: &str) -> Vec<AgentTask> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<AgentTask> = inner
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Tasks requested *by* `agent_id` (this agent is the parent), in
    /// registration order.
    pub async fn by_requesting_agent_id(&self, agent_id: &str) -> Vec<AgentTask> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<AgentTask> = inner
            .values()
            .filter(|t| t.requesting_agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Non-terminal tasks assigned to `agent_id`, in registration order.
    pub async fn open_tasks_for_agent(&self, agent_id: &str) -> Vec<AgentTask> {
        self.by_agent_id(agent_id)
            .await
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect()
    }
}

impl Default for AgentTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Authoritative table of service tasks.
pub struct ServiceTaskRegistry {
    inner: RwLock<HashMap<Uuid, ServiceTask>>,
    seq: AtomicU64,
}

impl ServiceTaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        task_id: Uuid,
        service_id: String,
        agent_id: Option<String>,
        client_id: Option<String>,
        tool_id: String,
        params: Value,
        request_id: Option<Uuid>,
    ) -> ServiceTask {
        let task = ServiceTask {
            task_id,
            service_id,
            agent_id,
            client_id,
            tool_id,
            params,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            request_id,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.inner.write().await.insert(task_id, task.clone());
        debug!(task = %task_id, service = %task.service_id, "service task registered");
        task
    }

    pub async fn get(&self, task_id: Uuid) -> Option<ServiceTask> {
        self.inner.read().await.get(&task_id).cloned()
    }

    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> UpdateOutcome<ServiceTask> {
        let mut inner = self.inner.write().await;
        let Some(task) = inner.get_mut(&task_id) else {
            return UpdateOutcome::NotFound;
        };
        if task.status.is_terminal() {
            warn!(
                task = %task_id,
                current = task.status.as_str(),
                attempted = status.as_str(),
                "ignoring transition out of terminal state"
            );
            return UpdateOutcome::Ignored(task.clone());
        }
        task.status = status;
        if let Some(result) = result {
            task.result = Some(result);
        }
        if let Some(error) = error {
            task.error = Some(error);
        }
        if status.is_terminal() {
            task.completed_at = Some(Utc::now());
        }
        UpdateOutcome::Updated(task.clone())
    }

    /// Non-terminal tasks assigned to `service_id`, in registration order.
    pub async fn open_tasks_for_service(&self, service_id: &str) -> Vec<ServiceTask> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<ServiceTask> = inner
            .values()
            .filter(|t| t.service_id == service_id && !t.status.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }
}

impl Default for ServiceTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
