//! Task coordination: creation, dispatch, results, and the ancestor walk
//!
//! All task flows live here: client→agent, agent→agent delegation,
//! agent→service tool execution, terminal handling, and the propagation of
//! in-flight notifications to the ultimate client ancestor.

use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Router;
use crate::error::{HubError, HubResult};
use crate::message::{types, Message};
use crate::registry::{Agent, AgentTask, Client, Service, TaskStatus, UpdateOutcome};

impl Router {
    /// Client→Agent task creation.
    ///
    /// Registers the task, dispatches `task.execute`, and answers the client
    /// with a synthesized create response carrying the task id.
    pub(super) async fn create_client_task(
        &self,
        client: &Client,
        msg: &Message,
    ) -> HubResult<()> {
        let agent = self.resolve_agent(msg).await?;
        let task_type = msg.str_field("taskType").map(str::to_string);
        let task_data = msg
            .content
            .get("taskData")
            .or_else(|| msg.content.get("data"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        let task = self
            .state
            .agent_tasks
            .register(
                Uuid::new_v4(),
                agent.id.clone(),
                Some(client.id.clone()),
                None,
                None,
                task_type.clone(),
                task_data.clone(),
                msg.id,
            )
            .await;

        self.dispatch_task(&agent, &task, task_type.as_deref(), task_data)
            .await?;

        let response = Message::reply(
            types::CLIENT_AGENT_TASK_CREATE_RESPONSE,
            json!({
                "taskId": task.task_id,
                "agentId": agent.id,
                "agentName": agent.name,
                "status": TaskStatus::Running.as_str(),
            }),
            msg.id,
        );
        self.send_to_client_id(&client.id, response).await;
        Ok(())
    }

    /// Agent→Agent delegation: a child task on the requesting agent's chain.
    pub(super) async fn create_child_task(&self, requester: &Agent, msg: &Message) -> HubResult<()> {
        let target = self.resolve_agent(msg).await?;
        let parent_task_id = msg.uuid_field("parentTaskId");
        let task_type = msg.str_field("taskType").map(str::to_string);
        let task_data = msg
            .content
            .get("taskData")
            .or_else(|| msg.content.get("data"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        let task = self
            .state
            .agent_tasks
            .register(
                Uuid::new_v4(),
                target.id.clone(),
                None,
                Some(requester.id.clone()),
                parent_task_id,
                task_type.clone(),
                task_data.clone(),
                msg.id,
            )
            .await;

        self.dispatch_task(&target, &task, task_type.as_deref(), task_data)
            .await?;

        let accepted = Message::reply(
            types::CHILDAGENT_REQUEST_ACCEPTED,
            json!({
                "childTaskId": task.task_id,
                "targetAgentId": target.id,
                "targetAgentName": target.name,
                "status": "accepted",
            }),
            msg.id,
        );
        self.send_to_agent_id(&requester.id, accepted).await;

        // Keep the ultimate client informed of the growing task tree.
        let mut base = json!({ "taskType": task_type });
        if let Some(parent) = parent_task_id {
            base["parentTaskId"] = json!(parent);
        }
        self.propagate_to_client_chain(&task, types::TASK_CHILDTASK_CREATED, base)
            .await;
        Ok(())
    }

    /// Agent→Service tool execution.
    pub(super) async fn create_service_task(&self, agent: &Agent, msg: &Message) -> HubResult<()> {
        let service = self.resolve_service(msg).await?;
        self.check_service_allowed(agent, &service)?;

        let tool_id = msg
            .str_field("toolId")
            .or_else(|| msg.str_field("toolName"))
            .ok_or_else(|| HubError::missing_field("toolId"))?
            .to_string();
        if service.tool(&tool_id).is_none() {
            return Err(HubError::NotFound(format!(
                "service '{}' has no tool '{}'",
                service.name, tool_id
            )));
        }
        let params = msg
            .content
            .get("params")
            .or_else(|| msg.content.get("parameters"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let client_id = msg.str_field("clientId").map(str::to_string);

        let task = self
            .state
            .service_tasks
            .register(
                Uuid::new_v4(),
                service.id.clone(),
                Some(agent.id.clone()),
                client_id.clone(),
                tool_id.clone(),
                params.clone(),
                msg.id,
            )
            .await;

        let Some(connection_id) = service.connection_id else {
            self.state
                .service_tasks
                .update_status(
                    task.task_id,
                    TaskStatus::Failed,
                    None,
                    Some(format!("Service '{}' is unreachable", service.name)),
                )
                .await;
            return Err(HubError::Unreachable(format!(
                "service '{}' has no live connection",
                service.name
            )));
        };

        let execute = Message::new(
            types::SERVICE_TASK_EXECUTE,
            json!({
                "taskId": task.task_id,
                "toolId": tool_id,
                "params": params,
                "agentId": agent.id,
            }),
        );
        self.state.service_endpoint.send(connection_id, execute);
        self.state
            .service_tasks
            .update_status(task.task_id, TaskStatus::Running, None, None)
            .await;

        if let Some(client_id) = &client_id {
            let started = Message::new(
                types::SERVICE_STARTED,
                json!({
                    "taskId": task.task_id,
                    "serviceId": service.id,
                    "serviceName": service.name,
                    "toolId": tool_id,
                }),
            );
            self.send_to_client_id(client_id, started).await;
        }
        Ok(())
    }

    /// Shared dispatch step: require a live connection, send `task.execute`,
    /// move the task to running. A missing connection fails the task
    /// synchronously.
    async fn dispatch_task(
        &self,
        agent: &Agent,
        task: &AgentTask,
        task_type: Option<&str>,
        task_data: Value,
    ) -> HubResult<()> {
        let Some(connection_id) = agent.connection_id else {
            self.state
                .agent_tasks
                .update_status(
                    task.task_id,
                    TaskStatus::Failed,
                    None,
                    Some(format!("Agent '{}' is unreachable", agent.name)),
                )
                .await;
            return Err(HubError::Unreachable(format!(
                "agent '{}' has no live connection",
                agent.name
            )));
        };

        let execute = Message::new(
            types::TASK_EXECUTE,
            json!({
                "taskId": task.task_id,
                "taskType": task_type,
                "data": task_data,
            }),
        );
        self.state.agent_endpoint.send(connection_id, execute);
        self.state
            .agent_tasks
            .update_status(task.task_id, TaskStatus::Running, None, None)
            .await;
        Ok(())
    }

    /// Inbound `task.result`: complete the task and fan the result out to
    /// whoever asked for it.
    pub(super) async fn handle_task_result(&self, msg: &Message) -> HubResult<()> {
        let task_id = msg
            .uuid_field("taskId")
            .ok_or_else(|| HubError::missing_field("taskId"))?;
        let result = msg.content.get("result").cloned().unwrap_or(Value::Null);

        let task = match self
            .state
            .agent_tasks
            .update_status(task_id, TaskStatus::Completed, Some(result.clone()), None)
            .await
        {
            UpdateOutcome::Updated(task) => task,
            UpdateOutcome::Ignored(task) => {
                debug!(task = %task_id, status = task.status.as_str(), "late result ignored");
                return Ok(());
            }
            UpdateOutcome::NotFound => {
                warn!(task = %task_id, "result for unknown task ignored");
                return Ok(());
            }
        };

        info!(task = %task_id, agent = %task.agent_id, "task completed");
        self.send_terminal_messages(&task, TaskStatus::Completed, Some(result), None)
            .await;
        Ok(())
    }

    /// Inbound `task.error`: fail the task and fan the error out.
    pub(super) async fn handle_task_error(&self, msg: &Message) -> HubResult<()> {
        let task_id = msg
            .uuid_field("taskId")
            .ok_or_else(|| HubError::missing_field("taskId"))?;
        let error = error_text(&msg.content);

        let task = match self
            .state
            .agent_tasks
            .update_status(task_id, TaskStatus::Failed, None, Some(error.clone()))
            .await
        {
            UpdateOutcome::Updated(task) => task,
            UpdateOutcome::Ignored(task) => {
                debug!(task = %task_id, status = task.status.as_str(), "late error ignored");
                return Ok(());
            }
            UpdateOutcome::NotFound => {
                warn!(task = %task_id, "error for unknown task ignored");
                return Ok(());
            }
        };

        info!(task = %task_id, agent = %task.agent_id, error = %error, "task failed");
        self.send_terminal_messages(&task, TaskStatus::Failed, None, Some(error))
            .await;
        Ok(())
    }

    /// Deliver the one terminal message per interested party: the client's
    /// result/error, the requesting agent's childagent response, and a
    /// child-status update for the wider chain.
    async fn send_terminal_messages(
        &self,
        task: &AgentTask,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        if let Some(client_id) = &task.client_id {
            let outbound = match status {
                TaskStatus::Completed => Message::reply(
                    types::CLIENT_AGENT_TASK_RESULT,
                    json!({
                        "taskId": task.task_id,
                        "agentId": task.agent_id,
                        "status": status.as_str(),
                        "result": result,
                    }),
                    task.request_id,
                ),
                _ => Message::reply(
                    types::TASK_ERROR,
                    json!({
                        "taskId": task.task_id,
                        "agentId": task.agent_id,
                        "error": error,
                    }),
                    task.request_id,
                ),
            };
            self.send_to_client_id(client_id, outbound).await;
        }

        if let Some(requesting_agent_id) = &task.requesting_agent_id {
            let mut content = json!({
                "childTaskId": task.task_id,
                "agentId": task.agent_id,
                "status": status.as_str(),
            });
            match status {
                TaskStatus::Completed => content["result"] = result.unwrap_or(Value::Null),
                _ => content["error"] = json!(error),
            }
            let response = Message::reply(types::CHILDAGENT_RESPONSE, content, task.request_id);
            self.send_to_agent_id(requesting_agent_id, response).await;

            // The chain's client hears about the child reaching a terminal
            // state, separately from its own terminal message.
            self.propagate_to_client_chain(
                task,
                types::TASK_CHILDTASK_STATUS,
                json!({ "status": status.as_str() }),
            )
            .await;
        }
    }

    /// Inbound `task.notification` / `task.message` from an executing agent.
    ///
    /// `outbound_kind` distinguishes progress (`task.notification`) from a
    /// request for user input (`task.requestmessage`).
    pub(super) async fn handle_agent_notification(
        &self,
        msg: &Message,
        outbound_kind: &str,
    ) -> HubResult<()> {
        let task_id = msg
            .uuid_field("taskId")
            .ok_or_else(|| HubError::missing_field("taskId"))?;
        let Some(task) = self.state.agent_tasks.get(task_id).await else {
            warn!(task = %task_id, "notification for unknown task ignored");
            return Ok(());
        };

        let delivered = self
            .propagate_to_client_chain(&task, outbound_kind, msg.content.clone())
            .await;
        if delivered == 0 {
            debug!(task = %task_id, kind = outbound_kind, "notification dropped, no client ancestor");
        }

        if msg.kind_str() == types::TASK_MESSAGE {
            let ack = Message::reply(
                types::TASK_MESSAGE_RECEIVED,
                json!({ "taskId": task_id, "delivered": delivered > 0 }),
                msg.id,
            );
            self.send_to_agent_id(&task.agent_id, ack).await;
        }
        Ok(())
    }

    /// Walk from `origin` to the ultimate client ancestor and deliver
    /// `kind` messages built from `base`.
    ///
    /// Delivery rules: the originating task's own client first; then a
    /// single chain upward through requesting agents, taking the explicit
    /// parent link when present and otherwise the requesting agent's first
    /// task in registration order. Each client gets at most one copy; the
    /// walk stops at the first client on the chain. Returns the number of
    /// clients reached.
    pub(super) async fn propagate_to_client_chain(
        &self,
        origin: &AgentTask,
        kind: &str,
        base: Value,
    ) -> usize {
        let mut delivered: HashSet<String> = HashSet::new();
        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(origin.task_id);

        if let Some(client_id) = &origin.client_id {
            let msg = build_chain_message(kind, &base, origin, origin);
            if self.send_to_client_id(client_id, msg).await {
                delivered.insert(client_id.clone());
            }
        }

        let mut current = origin.clone();
        while let Some(requesting_agent_id) = current.requesting_agent_id.clone() {
            let parent = match current.parent_task_id {
                Some(parent_id) => self.state.agent_tasks.get(parent_id).await,
                None => self
                    .state
                    .agent_tasks
                    .by_agent_id(&requesting_agent_id)
                    .await
                    .into_iter()
                    .find(|t| !visited.contains(&t.task_id)),
            };
            let Some(parent) = parent else {
                break;
            };
            if !visited.insert(parent.task_id) {
                break;
            }
            if let Some(client_id) = parent.client_id.clone() {
                if !delivered.contains(&client_id) {
                    let msg = build_chain_message(kind, &base, origin, &parent);
                    if self.send_to_client_id(&client_id, msg).await {
                        delivered.insert(client_id);
                    }
                }
                // First client on the chain terminates the walk.
                break;
            }
            current = parent;
        }

        delivered.len()
    }

    /// Fail every open task of a disconnected agent and notify the
    /// interested parties. Terminal absorption makes this idempotent against
    /// racing results.
    pub(super) async fn fail_tasks_for_agent(&self, agent: &Agent, reason: &str) {
        let open = self.state.agent_tasks.open_tasks_for_agent(&agent.id).await;
        if open.is_empty() {
            return;
        }
        info!(agent = %agent.id, count = open.len(), "failing open tasks for disconnected agent");
        for task in open {
            if let UpdateOutcome::Updated(task) = self
                .state
                .agent_tasks
                .update_status(task.task_id, TaskStatus::Failed, None, Some(reason.to_string()))
                .await
            {
                self.send_terminal_messages(&task, TaskStatus::Failed, None, Some(reason.to_string()))
                    .await;
            }
        }
    }

    /// Same for a disconnected service.
    pub(super) async fn fail_tasks_for_service(&self, service: &Service, reason: &str) {
        let open = self
            .state
            .service_tasks
            .open_tasks_for_service(&service.id)
            .await;
        if open.is_empty() {
            return;
        }
        info!(service = %service.id, count = open.len(), "failing open tasks for disconnected service");
        for task in open {
            if let UpdateOutcome::Updated(task) = self
                .state
                .service_tasks
                .update_status(task.task_id, TaskStatus::Failed, None, Some(reason.to_string()))
                .await
            {
                self.send_service_terminal_messages(&task, TaskStatus::Failed, None, Some(reason.to_string()))
                    .await;
            }
        }
    }

    /// Inbound `service.task.result`.
    pub(super) async fn handle_service_task_result(&self, msg: &Message) -> HubResult<()> {
        let task_id = msg
            .uuid_field("taskId")
            .ok_or_else(|| HubError::missing_field("taskId"))?;
        let result = msg.content.get("result").cloned().unwrap_or(Value::Null);

        let task = match self
            .state
            .service_tasks
            .update_status(task_id, TaskStatus::Completed, Some(result.clone()), None)
            .await
        {
            UpdateOutcome::Updated(task) => task,
            UpdateOutcome::Ignored(task) => {
                debug!(task = %task_id, status = task.status.as_str(), "late service result ignored");
                return Ok(());
            }
            UpdateOutcome::NotFound => {
                warn!(task = %task_id, "service result for unknown task ignored");
                return Ok(());
            }
        };

        info!(task = %task_id, service = %task.service_id, "service task completed");
        self.send_service_terminal_messages(&task, TaskStatus::Completed, Some(result), None)
            .await;
        Ok(())
    }

    /// Inbound `service.task.error`.
    pub(super) async fn handle_service_task_error(&self, msg: &Message) -> HubResult<()> {
        let task_id = msg
            .uuid_field("taskId")
            .ok_or_else(|| HubError::missing_field("taskId"))?;
        let error = error_text(&msg.content);

        let task = match self
            .state
            .service_tasks
            .update_status(task_id, TaskStatus::Failed, None, Some(error.clone()))
            .await
        {
            UpdateOutcome::Updated(task) => task,
            UpdateOutcome::Ignored(_) | UpdateOutcome::NotFound => {
                debug!(task = %task_id, "service error ignored");
                return Ok(());
            }
        };

        self.send_service_terminal_messages(&task, TaskStatus::Failed, None, Some(error))
            .await;
        Ok(())
    }

    async fn send_service_terminal_messages(
        &self,
        task: &crate::registry::ServiceTask,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        if let Some(agent_id) = &task.agent_id {
            let mut content = json!({
                "taskId": task.task_id,
                "serviceId": task.service_id,
                "toolId": task.tool_id,
                "status": match status {
                    TaskStatus::Completed => "success",
                    _ => "error",
                },
            });
            match status {
                TaskStatus::Completed => content["result"] = result.clone().unwrap_or(Value::Null),
                _ => content["error"] = json!(error),
            }
            let response =
                Message::reply(types::SERVICE_TASK_EXECUTE_RESPONSE, content, task.request_id);
            self.send_to_agent_id(agent_id, response).await;
        }

        if let Some(client_id) = &task.client_id {
            let mut content = json!({
                "taskId": task.task_id,
                "serviceId": task.service_id,
                "status": match status {
                    TaskStatus::Completed => "completed",
                    _ => "error",
                },
            });
            match status {
                TaskStatus::Completed => content["result"] = result.unwrap_or(Value::Null),
                _ => content["error"] = json!(error),
            }
            let completed = Message::new(types::SERVICE_COMPLETED, content);
            self.send_to_client_id(client_id, completed).await;
        }
    }

    /// Inbound `service.task.notification`: advisory, forwarded to the
    /// requesting agent and the recorded client.
    pub(super) async fn handle_service_task_notification(&self, msg: &Message) -> HubResult<()> {
        let task_id = msg
            .uuid_field("taskId")
            .ok_or_else(|| HubError::missing_field("taskId"))?;
        let Some(task) = self.state.service_tasks.get(task_id).await else {
            warn!(task = %task_id, "service notification for unknown task ignored");
            return Ok(());
        };

        let mut content = msg.content.clone();
        content["taskId"] = json!(task.task_id);
        content["serviceId"] = json!(task.service_id);
        let notification = Message::new(types::SERVICE_NOTIFICATION, content);

        if let Some(agent_id) = &task.agent_id {
            self.send_to_agent_id(agent_id, notification.clone()).await;
        }
        if let Some(client_id) = &task.client_id {
            self.send_to_client_id(client_id, notification).await;
        }
        Ok(())
    }

    /// Inbound `task.message` from a client, forwarded to the executing
    /// agent as `task.messageresponse`.
    pub(super) async fn handle_client_task_message(
        &self,
        client: &Client,
        msg: &Message,
    ) -> HubResult<()> {
        let task_id = msg
            .uuid_field("taskId")
            .ok_or_else(|| HubError::missing_field("taskId"))?;
        let task = self
            .state
            .agent_tasks
            .get(task_id)
            .await
            .ok_or_else(|| HubError::NotFound(format!("unknown task '{task_id}'")))?;

        let mut content = msg.content.clone();
        content["taskId"] = json!(task.task_id);
        content["clientId"] = json!(client.id);
        let forward = Message::reply(types::TASK_MESSAGERESPONSE, content, msg.id);
        if !self.send_to_agent_id(&task.agent_id, forward).await {
            return Err(HubError::Unreachable(format!(
                "agent for task '{task_id}' has no live connection"
            )));
        }
        Ok(())
    }

    /// Resolve the agent referenced by `agentId` / `agentName` (and their
    /// target-prefixed forms used in delegation requests).
    async fn resolve_agent(&self, msg: &Message) -> HubResult<Agent> {
        if let Some(id) = msg
            .str_field("agentId")
            .or_else(|| msg.str_field("targetAgentId"))
        {
            return self
                .state
                .agents
                .get(id)
                .await
                .ok_or_else(|| HubError::NotFound(format!("agent not found: {id}")));
        }
        if let Some(name) = msg
            .str_field("agentName")
            .or_else(|| msg.str_field("targetAgentName"))
        {
            return self
                .state
                .agents
                .get_by_name(name)
                .await
                .ok_or_else(|| HubError::NotFound(format!("agent not found: {name}")));
        }
        Err(HubError::missing_field("agentId or agentName"))
    }

    pub(super) async fn resolve_service(&self, msg: &Message) -> HubResult<Service> {
        if let Some(id) = msg.str_field("serviceId") {
            if let Some(service) = self.state.services.get(id).await {
                return Ok(service);
            }
            // Agents commonly address services by name in the id slot.
            return self
                .state
                .services
                .get_by_name(id)
                .await
                .ok_or_else(|| HubError::NotFound(format!("service not found: {id}")));
        }
        if let Some(name) = msg.str_field("serviceName") {
            return self
                .state
                .services
                .get_by_name(name)
                .await
                .ok_or_else(|| HubError::NotFound(format!("service not found: {name}")));
        }
        Err(HubError::missing_field("serviceId or serviceName"))
    }

    /// Enforce the manifest-declared service allow-list. A manifest that
    /// never declares `requiredServices` leaves the agent unrestricted.
    fn check_service_allowed(&self, agent: &Agent, service: &Service) -> HubResult<()> {
        let Some(allowed) = agent.required_services() else {
            return Ok(());
        };
        if allowed.iter().any(|s| s == &service.name || s == &service.id) {
            Ok(())
        } else {
            Err(HubError::Unauthorized(format!(
                "agent '{}' is not authorized to use service '{}'",
                agent.name, service.name
            )))
        }
    }
}

/// Error text from a `task.error`-shaped content object.
fn error_text(content: &Value) -> String {
    match content.get("error") {
        Some(Value::String(text)) => text.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => "task failed".to_string(),
    }
}

/// Message delivered along the client chain: the original content with the
/// recipient's task id, the originating agent, and (when the recipient's
/// task is not the originating one) the child task marker.
fn build_chain_message(
    kind: &str,
    base: &Value,
    origin: &AgentTask,
    recipient_task: &AgentTask,
) -> Message {
    let mut content = base.clone();
    if !content.is_object() {
        content = json!({});
    }
    content["taskId"] = json!(recipient_task.task_id);
    content["agentId"] = json!(origin.agent_id);
    let is_child = recipient_task.task_id != origin.task_id;
    content["isChildAgentMessage"] = json!(is_child);
    if is_child {
        content["childTaskId"] = json!(origin.task_id);
    }
    Message::new(kind, content)
}
