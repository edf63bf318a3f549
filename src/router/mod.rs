//! Message router
//!
//! Single owner of the reaction to every inbound frame. Endpoints call in
//! with (endpoint class, connection, message); the router validates the
//! sender, dispatches on the message type, mutates registries, and produces
//! outbound sends. Per-connection ordering comes from the read loops
//! awaiting each call; cross-connection handling is concurrent over the
//! shared state.

mod agent;
mod client;
mod coordinator;
mod service;

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::endpoint::EndpointClass;
use crate::error::{HubError, HubResult};
use crate::message::{types, Message};
use crate::state::SharedState;

pub struct Router {
    pub state: Arc<SharedState>,
}

impl Router {
    pub fn new(state: Arc<SharedState>) -> Arc<Self> {
        Arc::new(Self { state })
    }

    /// A connection was accepted: bind what needs binding and greet.
    pub async fn on_connect(&self, class: EndpointClass, connection_id: Uuid) {
        match class {
            EndpointClass::Agent => {
                let welcome = Message::new(
                    types::ORCHESTRATOR_WELCOME,
                    json!({
                        "connectionId": connection_id,
                        "endpoint": class.as_str(),
                    }),
                );
                self.state.agent_endpoint.send(connection_id, welcome);
            }
            EndpointClass::Client => {
                // Clients are auto-registered; the welcome carries their id.
                let client = self.state.clients.register(connection_id).await;
                info!(client = %client.id, "client auto-registered");
                let welcome = Message::new(
                    types::ORCHESTRATOR_CLIENT_WELCOME,
                    json!({
                        "clientId": client.id,
                        "connectionId": connection_id,
                    }),
                );
                self.state.client_endpoint.send(connection_id, welcome);
            }
            EndpointClass::Service => {
                let welcome = Message::new(
                    types::ORCHESTRATOR_WELCOME,
                    json!({
                        "connectionId": connection_id,
                        "endpoint": class.as_str(),
                    }),
                );
                self.state.service_endpoint.send(connection_id, welcome);
            }
        }
    }

    /// One inbound frame, handled to completion.
    pub async fn on_message(&self, class: EndpointClass, connection_id: Uuid, msg: Message) {
        // Resolve any waiter first: awaited replies must never be lost to
        // dispatch, and a reply may be nothing but a correlation.
        self.state.pending.resolve(&msg);

        let Some(kind) = msg.kind.clone() else {
            self.state.endpoint(class).send_error(
                connection_id,
                "message has no type",
                "VALIDATION",
                msg.id,
                None,
            );
            return;
        };
        debug!(
            class = class.as_str(),
            connection = %connection_id,
            kind = %kind,
            "handling message"
        );

        let outcome = match class {
            EndpointClass::Agent => self.handle_agent_message(connection_id, &kind, &msg).await,
            EndpointClass::Client => self.handle_client_message(connection_id, &kind, &msg).await,
            EndpointClass::Service => self.handle_service_message(connection_id, &kind, &msg).await,
        };

        if let Err(err) = outcome {
            match &err {
                HubError::Internal(cause) => {
                    error!(kind = %kind, error = ?cause, "internal error handling message");
                }
                other => {
                    debug!(kind = %kind, code = other.code(), error = %other, "message rejected");
                }
            }
            self.state.endpoint(class).send_error(
                connection_id,
                &err.wire_message(),
                err.code(),
                msg.id,
                None,
            );
        }
    }

    /// A connection closed: demote the participant and fail its open tasks.
    pub async fn on_disconnect(&self, class: EndpointClass, connection_id: Uuid) {
        match class {
            EndpointClass::Agent => {
                if let Some(agent) = self.state.agents.mark_disconnected(connection_id).await {
                    warn!(agent = %agent.id, name = %agent.name, "agent disconnected");
                    self.fail_tasks_for_agent(&agent, "Agent disconnected before task completion")
                        .await;
                }
            }
            EndpointClass::Client => {
                if let Some(client) = self.state.clients.mark_disconnected(connection_id).await {
                    info!(client = %client.id, "client disconnected");
                }
            }
            EndpointClass::Service => {
                if let Some(service) = self.state.services.mark_disconnected(connection_id).await {
                    warn!(service = %service.id, name = %service.name, "service disconnected");
                    self.fail_tasks_for_service(
                        &service,
                        "Service disconnected before task completion",
                    )
                    .await;
                }
            }
        }
    }

    /// Route a message to an agent's live connection, if any.
    pub(crate) async fn send_to_agent_id(&self, agent_id: &str, msg: Message) -> bool {
        match self
            .state
            .agents
            .get(agent_id)
            .await
            .and_then(|a| a.connection_id)
        {
            Some(connection_id) => self.state.agent_endpoint.send(connection_id, msg),
            None => {
                debug!(agent = %agent_id, kind = msg.kind_str(), "dropping message for unbound agent");
                false
            }
        }
    }

    /// Route a message to a client's live connection, if any.
    pub(crate) async fn send_to_client_id(&self, client_id: &str, msg: Message) -> bool {
        match self
            .state
            .clients
            .get(client_id)
            .await
            .and_then(|c| c.connection_id)
        {
            Some(connection_id) => self.state.client_endpoint.send(connection_id, msg),
            None => {
                debug!(client = %client_id, kind = msg.kind_str(), "dropping message for unbound client");
                false
            }
        }
    }

    /// Run one MCP tool call and shape the result message.
    ///
    /// Unknown server/tool surfaces as a NOT_FOUND error reply; an execution
    /// failure comes back as the result kind with `status: "error"` so the
    /// caller can correlate it with the request.
    pub(crate) async fn execute_mcp_tool(
        &self,
        msg: &Message,
        reply_kind: &str,
    ) -> HubResult<Message> {
        let server_key = msg
            .str_field("serverId")
            .ok_or_else(|| HubError::missing_field("serverId"))?;
        let tool_name = msg
            .str_field("toolName")
            .ok_or_else(|| HubError::missing_field("toolName"))?;
        let params = msg
            .content
            .get("parameters")
            .or_else(|| msg.content.get("params"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        match self
            .state
            .mcp
            .execute_tool(server_key, tool_name, params)
            .await
        {
            Ok((server_id, result)) => Ok(Message::reply(
                reply_kind,
                json!({
                    "serverId": server_id,
                    "toolName": tool_name,
                    "result": result,
                    "status": "success",
                }),
                msg.id,
            )),
            Err(err @ HubError::NotFound(_)) => Err(err),
            Err(err) => Ok(Message::reply(
                reply_kind,
                json!({
                    "serverId": server_key,
                    "toolName": tool_name,
                    "status": "error",
                    "error": err.to_string(),
                }),
                msg.id,
            )),
        }
    }
}
