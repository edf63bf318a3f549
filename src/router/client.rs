//! Client endpoint handlers

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::Router;
use crate::error::{HubError, HubResult};
use crate::message::{types, Message};
use crate::registry::{AgentFilter, ParticipantStatus};

impl Router {
    pub(super) async fn handle_client_message(
        &self,
        connection_id: Uuid,
        kind: &str,
        msg: &Message,
    ) -> HubResult<()> {
        let client = self
            .state
            .clients
            .get_by_connection(connection_id)
            .await
            .ok_or_else(|| {
                HubError::NotFound("connection is not bound to a registered client".to_string())
            })?;
        self.state.clients.touch(&client.id).await;

        match kind {
            types::CLIENT_REGISTER => {
                let name = msg.str_field("name").map(str::to_string);
                self.state.clients.update_identity(&client.id, name).await;
                Ok(())
            }
            types::CLIENT_AGENT_LIST_REQUEST => {
                let filter = agent_filter_from(msg)?;
                let agents = self.state.agents.list(&filter).await;
                let summaries: Vec<_> = agents.iter().map(|a| a.summary()).collect();
                let response = Message::reply(
                    types::CLIENT_AGENT_LIST_RESPONSE,
                    json!({ "agents": summaries }),
                    msg.id,
                );
                self.state.client_endpoint.send(connection_id, response);
                Ok(())
            }
            types::CLIENT_AGENT_TASK_CREATE_REQUEST => self.create_client_task(&client, msg).await,
            types::CLIENT_AGENT_TASK_STATUS_REQUEST => {
                let task_id = msg
                    .uuid_field("taskId")
                    .ok_or_else(|| HubError::missing_field("taskId"))?;
                let task = self
                    .state
                    .agent_tasks
                    .get(task_id)
                    .await
                    .ok_or_else(|| HubError::NotFound(format!("unknown task '{task_id}'")))?;
                let response = Message::reply(
                    types::CLIENT_AGENT_TASK_STATUS_RESPONSE,
                    json!({
                        "taskId": task.task_id,
                        "agentId": task.agent_id,
                        "status": task.status.as_str(),
                        "result": task.result,
                        "error": task.error,
                        "createdAt": task.created_at,
                        "completedAt": task.completed_at,
                    }),
                    msg.id,
                );
                self.state.client_endpoint.send(connection_id, response);
                Ok(())
            }
            types::TASK_MESSAGE => self.handle_client_task_message(&client, msg).await,
            types::CLIENT_MCP_SERVER_LIST_REQUEST => {
                let servers: Vec<_> = self
                    .state
                    .mcp
                    .list(None)
                    .await
                    .iter()
                    .map(|s| s.summary())
                    .collect();
                let response = Message::reply(
                    types::CLIENT_MCP_SERVER_LIST_RESPONSE,
                    json!({ "servers": servers }),
                    msg.id,
                );
                self.state.client_endpoint.send(connection_id, response);
                Ok(())
            }
            types::MCP_SERVER_TOOLS => {
                let server_key = msg
                    .str_field("serverId")
                    .ok_or_else(|| HubError::missing_field("serverId"))?;
                let (server_id, tools) = self.state.mcp.list_tools(server_key).await?;
                let response = Message::reply(
                    types::MCP_SERVER_TOOLS,
                    json!({ "serverId": server_id, "tools": tools }),
                    msg.id,
                );
                self.state.client_endpoint.send(connection_id, response);
                Ok(())
            }
            types::MCP_TOOL_EXECUTE => {
                let response = self
                    .execute_mcp_tool(msg, types::MCP_TOOL_EXECUTION_RESULT)
                    .await?;
                self.state.client_endpoint.send(connection_id, response);
                Ok(())
            }
            types::ERROR => {
                debug!(
                    client = %client.id,
                    error = msg.str_field("error").unwrap_or_default(),
                    "error reported by client"
                );
                Ok(())
            }
            other => Err(HubError::Unsupported(other.to_string())),
        }
    }
}

/// Build an [`AgentFilter`] from a list request's content.
fn agent_filter_from(msg: &Message) -> HubResult<AgentFilter> {
    let status = match msg
        .str_field("status")
        .or_else(|| msg.content.get("filters").and_then(|f| f.get("status")).and_then(|s| s.as_str()))
    {
        Some(status) => Some(
            ParticipantStatus::parse(status)
                .ok_or_else(|| HubError::Validation(format!("unknown status '{status}'")))?,
        ),
        None => None,
    };
    let capabilities = {
        let direct = msg.str_list_field("capabilities");
        if direct.is_empty() {
            msg.content
                .get("filters")
                .and_then(|f| f.get("capabilities"))
                .and_then(|c| c.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        } else {
            direct
        }
    };
    let name_contains = msg
        .str_field("name")
        .or_else(|| {
            msg.content
                .get("filters")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
        })
        .map(str::to_string);

    Ok(AgentFilter {
        status,
        capabilities,
        name_contains,
    })
}
