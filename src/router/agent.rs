//! Agent endpoint handlers

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::Router;
use crate::error::{HubError, HubResult};
use crate::message::{types, Message};
use crate::registry::ParticipantStatus;

impl Router {
    pub(super) async fn handle_agent_message(
        &self,
        connection_id: Uuid,
        kind: &str,
        msg: &Message,
    ) -> HubResult<()> {
        // Registration is the only message an unbound connection may send.
        if kind == types::AGENT_REGISTER {
            return self.agent_register(connection_id, msg).await;
        }
        let agent = self
            .state
            .agents
            .get_by_connection(connection_id)
            .await
            .ok_or_else(|| {
                HubError::NotFound("connection is not bound to a registered agent".to_string())
            })?;

        match kind {
            types::AGENT_STATUS_UPDATE => {
                let status = msg
                    .str_field("status")
                    .ok_or_else(|| HubError::missing_field("status"))?;
                let status = ParticipantStatus::parse(status)
                    .ok_or_else(|| HubError::Validation(format!("unknown status '{status}'")))?;
                self.state.agents.update_status(&agent.id, status).await;
                Ok(())
            }
            types::TASK_RESULT => self.handle_task_result(msg).await,
            types::TASK_ERROR => self.handle_task_error(msg).await,
            types::TASK_NOTIFICATION => {
                self.handle_agent_notification(msg, types::TASK_NOTIFICATION)
                    .await
            }
            types::TASK_MESSAGE => {
                self.handle_agent_notification(msg, types::TASK_REQUESTMESSAGE)
                    .await
            }
            types::AGENT_TASK_REQUEST => self.create_child_task(&agent, msg).await,
            types::AGENT_SERVICE_LIST_REQUEST => {
                let services = self.state.services.list().await;
                let summaries: Vec<_> = services.iter().map(|s| s.summary()).collect();
                let response = Message::reply(
                    types::AGENT_SERVICE_LIST_RESPONSE,
                    json!({ "services": summaries }),
                    msg.id,
                );
                self.state.agent_endpoint.send(connection_id, response);
                Ok(())
            }
            types::SERVICE_TASK_EXECUTE => self.create_service_task(&agent, msg).await,
            types::SERVICE_TOOLS_LIST => {
                let service = self.resolve_service(msg).await?;
                let response = Message::reply(
                    types::SERVICE_TOOLS_LIST_RESPONSE,
                    json!({
                        "serviceId": service.id,
                        "serviceName": service.name,
                        "tools": service.tools,
                    }),
                    msg.id,
                );
                self.state.agent_endpoint.send(connection_id, response);
                Ok(())
            }
            types::AGENT_MCP_SERVERS_LIST => {
                let servers: Vec<_> = self
                    .state
                    .mcp
                    .list(None)
                    .await
                    .iter()
                    .map(|s| s.summary())
                    .collect();
                let response = Message::reply(
                    types::AGENT_MCP_SERVERS_LIST_RESULT,
                    json!({ "servers": servers }),
                    msg.id,
                );
                self.state.agent_endpoint.send(connection_id, response);
                Ok(())
            }
            types::MCP_TOOLS_LIST => {
                let server_key = msg
                    .str_field("serverId")
                    .ok_or_else(|| HubError::missing_field("serverId"))?;
                let (server_id, tools) = self.state.mcp.list_tools(server_key).await?;
                let response = Message::reply(
                    types::MCP_TOOLS_LIST_RESULT,
                    json!({ "serverId": server_id, "tools": tools }),
                    msg.id,
                );
                self.state.agent_endpoint.send(connection_id, response);
                Ok(())
            }
            types::MCP_TOOL_EXECUTE => {
                let response = self
                    .execute_mcp_tool(msg, types::MCP_TOOL_EXECUTE_RESULT)
                    .await?;
                self.state.agent_endpoint.send(connection_id, response);
                Ok(())
            }
            types::PONG => {
                // A pong also clears a missed-heartbeat error mark.
                if agent.status == ParticipantStatus::Error {
                    self.state
                        .agents
                        .update_status(&agent.id, ParticipantStatus::Online)
                        .await;
                }
                Ok(())
            }
            types::ERROR => {
                debug!(
                    agent = %agent.id,
                    error = msg.str_field("error").unwrap_or_default(),
                    "error reported by agent"
                );
                Ok(())
            }
            other => Err(HubError::Unsupported(other.to_string())),
        }
    }

    async fn agent_register(&self, connection_id: Uuid, msg: &Message) -> HubResult<()> {
        let name = msg
            .str_field("agentName")
            .or_else(|| msg.str_field("name"))
            .ok_or_else(|| HubError::missing_field("agentName"))?;
        let capabilities = msg.str_list_field("capabilities");
        let manifest = msg.object_field("manifest");

        let registration = self
            .state
            .agents
            .register(name, capabilities, manifest, connection_id)
            .await;
        let agent = &registration.agent;
        info!(agent = %agent.id, name = %agent.name, "agent registered");

        let response = Message::reply(
            types::AGENT_REGISTERED,
            json!({
                "agentId": agent.id,
                "name": agent.name,
                "capabilities": agent.capabilities,
                "status": agent.status.as_str(),
            }),
            msg.id,
        );
        self.state.agent_endpoint.send(connection_id, response);

        // Announce the arrival to every connected client.
        let announcement = Message::new(
            types::AGENT_REGISTERED,
            json!({
                "agentId": agent.id,
                "name": agent.name,
                "capabilities": agent.capabilities,
            }),
        );
        self.state.client_endpoint.broadcast(announcement);
        Ok(())
    }
}
