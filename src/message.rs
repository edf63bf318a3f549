//! Wire messages: the framed-JSON envelope shared by all three endpoints
//!
//! Every frame on the wire is one JSON object of the shape
//! `{ id, type, timestamp?, content, requestId? }`. `requestId` is set iff
//! the message replies to an earlier message, and equals that message's `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single protocol message.
///
/// `id` and `kind` are optional on the inbound side so that malformed frames
/// can still be answered with an `error` referencing whatever id they carried.
/// Outbound messages constructed through [`Message::new`] and friends always
/// have both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<Uuid>,
}

impl Message {
    /// Build a fresh outbound message with a new id and timestamp.
    pub fn new(kind: &str, content: Value) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            kind: Some(kind.to_string()),
            timestamp: Some(Utc::now()),
            content,
            request_id: None,
        }
    }

    /// Build a reply correlated to `request_id`.
    pub fn reply(kind: &str, content: Value, request_id: Option<Uuid>) -> Self {
        Self {
            request_id,
            ..Self::new(kind, content)
        }
    }

    /// Build an `error` reply.
    ///
    /// `code` is one of the wire error codes (see [`crate::error::HubError`]).
    pub fn error(
        text: impl Into<String>,
        code: &str,
        request_id: Option<Uuid>,
        details: Option<Value>,
    ) -> Self {
        let text: String = text.into();
        let mut content = serde_json::json!({
            "error": text,
            "code": code,
        });
        if let Some(details) = details {
            content["details"] = details;
        }
        Self::reply(types::ERROR, content, request_id)
    }

    /// Type string, or "" when the frame had none.
    pub fn kind_str(&self) -> &str {
        self.kind.as_deref().unwrap_or_default()
    }

    /// String field of `content`.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    /// UUID field of `content`.
    pub fn uuid_field(&self, key: &str) -> Option<Uuid> {
        self.str_field(key).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Object field of `content`, cloned; `{}` when absent.
    pub fn object_field(&self, key: &str) -> Value {
        match self.content.get(key) {
            Some(v) if !v.is_null() => v.clone(),
            _ => Value::Object(Default::default()),
        }
    }

    /// String-array field of `content`; empty when absent.
    pub fn str_list_field(&self, key: &str) -> Vec<String> {
        self.content
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The normative message `type` strings.
///
/// These are the external contract; the constants exist so that handler
/// dispatch and tests cannot drift from the wire.
pub mod types {
    // Shared by all endpoint classes
    pub const ERROR: &str = "error";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    // Welcome (sent on accept)
    pub const ORCHESTRATOR_WELCOME: &str = "orchestrator.welcome";
    pub const ORCHESTRATOR_CLIENT_WELCOME: &str = "orchestrator.client.welcome";

    // Agent registration and status
    pub const AGENT_REGISTER: &str = "agent.register";
    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_STATUS_UPDATE: &str = "agent.status.update";

    // Task lifecycle (agent side)
    pub const TASK_EXECUTE: &str = "task.execute";
    pub const TASK_RESULT: &str = "task.result";
    pub const TASK_ERROR: &str = "task.error";
    pub const TASK_NOTIFICATION: &str = "task.notification";
    pub const TASK_MESSAGE: &str = "task.message";
    pub const TASK_MESSAGERESPONSE: &str = "task.messageresponse";
    pub const TASK_MESSAGE_RECEIVED: &str = "task.message.received";
    pub const TASK_REQUESTMESSAGE: &str = "task.requestmessage";
    pub const TASK_CHILDTASK_CREATED: &str = "task.childtask.created";
    pub const TASK_CHILDTASK_STATUS: &str = "task.childtask.status";

    // Agent-to-agent delegation
    pub const AGENT_TASK_REQUEST: &str = "agent.task.request";
    pub const CHILDAGENT_REQUEST_ACCEPTED: &str = "childagent.request.accepted";
    pub const CHILDAGENT_RESPONSE: &str = "childagent.response";

    // Client surface
    pub const CLIENT_REGISTER: &str = "client.register";
    pub const CLIENT_AGENT_LIST_REQUEST: &str = "client.agent.list.request";
    pub const CLIENT_AGENT_LIST_RESPONSE: &str = "client.agent.list.response";
    pub const CLIENT_AGENT_TASK_CREATE_REQUEST: &str = "client.agent.task.create.request";
    pub const CLIENT_AGENT_TASK_CREATE_RESPONSE: &str = "client.agent.task.create.response";
    pub const CLIENT_AGENT_TASK_STATUS_REQUEST: &str = "client.agent.task.status.request";
    pub const CLIENT_AGENT_TASK_STATUS_RESPONSE: &str = "client.agent.task.status.response";
    pub const CLIENT_AGENT_TASK_RESULT: &str = "client.agent.task.result";

    // Services
    pub const SERVICE_REGISTER: &str = "service.register";
    pub const SERVICE_REGISTERED: &str = "service.registered";
    pub const SERVICE_STATUS: &str = "service.status";
    pub const SERVICE_STATUS_UPDATED: &str = "service.status.updated";
    pub const SERVICE_TASK_EXECUTE: &str = "service.task.execute";
    pub const SERVICE_TASK_RESULT: &str = "service.task.result";
    pub const SERVICE_TASK_ERROR: &str = "service.task.error";
    pub const SERVICE_TASK_NOTIFICATION: &str = "service.task.notification";
    pub const SERVICE_TASK_EXECUTE_RESPONSE: &str = "service.task.execute.response";
    pub const SERVICE_TOOLS_LIST: &str = "service.tools.list";
    pub const SERVICE_TOOLS_LIST_RESPONSE: &str = "service.tools.list.response";
    pub const SERVICE_NOTIFICATION: &str = "service.notification";
    pub const SERVICE_STARTED: &str = "service.started";
    pub const SERVICE_COMPLETED: &str = "service.completed";
    pub const AGENT_SERVICE_LIST_REQUEST: &str = "agent.service.list.request";
    pub const AGENT_SERVICE_LIST_RESPONSE: &str = "agent.service.list.response";

    // MCP surface
    pub const AGENT_MCP_SERVERS_LIST: &str = "agent.mcp.servers.list";
    pub const AGENT_MCP_SERVERS_LIST_RESULT: &str = "agent.mcp.servers.list.result";
    pub const MCP_TOOLS_LIST: &str = "mcp.tools.list";
    pub const MCP_TOOLS_LIST_RESULT: &str = "mcp.tools.list.result";
    pub const MCP_TOOL_EXECUTE: &str = "mcp.tool.execute";
    pub const MCP_TOOL_EXECUTE_RESULT: &str = "mcp.tool.execute.result";
    pub const MCP_TOOL_EXECUTION_RESULT: &str = "mcp.tool.execution.result";
    pub const CLIENT_MCP_SERVER_LIST_REQUEST: &str = "client.mcp.server.list.request";
    pub const CLIENT_MCP_SERVER_LIST_RESPONSE: &str = "client.mcp.server.list.response";
    pub const MCP_SERVER_TOOLS: &str = "mcp.server.tools";
}
