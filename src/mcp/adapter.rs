//! MCP adapter: the registry of tool server subprocesses
//!
//! Owns every subprocess. The control plane (register, connect, disconnect,
//! list) mutates the registry; the data plane (list tools, execute tool)
//! goes through the per-server handle. Stopping the hub must leave no child
//! processes behind.

use anyhow::anyhow;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::protocol::McpTool;
use super::server::McpServerHandle;
use crate::config::McpServerConfig;
use crate::error::{HubError, HubResult};

/// Lifecycle of a declared server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpServerStatus {
    Registered,
    Connecting,
    Online,
    Offline,
    Error,
}

impl McpServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpServerStatus::Registered => "registered",
            McpServerStatus::Connecting => "connecting",
            McpServerStatus::Online => "online",
            McpServerStatus::Offline => "offline",
            McpServerStatus::Error => "error",
        }
    }
}

struct ManagedServer {
    config: McpServerConfig,
    status: McpServerStatus,
    handle: Option<Arc<McpServerHandle>>,
    tools: Vec<McpTool>,
    last_error: Option<String>,
}

/// Snapshot of a server for API responses.
#[derive(Debug, Clone)]
pub struct McpServerInfo {
    pub server_id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: McpServerStatus,
    pub tool_count: usize,
    pub last_error: Option<String>,
}

impl McpServerInfo {
    /// Wire shape for list results.
    pub fn summary(&self) -> Value {
        json!({
            "serverId": self.server_id,
            "name": self.name,
            "capabilities": self.capabilities,
            "status": self.status.as_str(),
            "toolCount": self.tool_count,
        })
    }
}

/// Registry and owner of MCP tool server subprocesses.
pub struct McpAdapter {
    servers: RwLock<HashMap<String, ManagedServer>>,
    request_timeout: Duration,
}

impl McpAdapter {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            request_timeout,
        }
    }

    /// Record a server. Does not launch it.
    ///
    /// The server id is the configured id, the name when no id is given, or
    /// a fresh UUID when both are absent.
    pub async fn register_server(&self, mut config: McpServerConfig) -> McpServerInfo {
        let server_id = config
            .id
            .take()
            .or_else(|| {
                if config.name.is_empty() {
                    None
                } else {
                    Some(config.name.clone())
                }
            })
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        config.id = Some(server_id.clone());

        let server = ManagedServer {
            config,
            status: McpServerStatus::Registered,
            handle: None,
            tools: Vec::new(),
            last_error: None,
        };
        info!(server = %server_id, "MCP server registered");
        let snapshot = Self::snapshot(&server_id, &server);
        self.servers.write().await.insert(server_id, server);
        snapshot
    }

    /// Launch the subprocess, run the handshake, cache the tool catalog.
    #[instrument(skip(self), fields(mcp.server = %server_id))]
    pub async fn connect(&self, server_id: &str) -> HubResult<McpServerInfo> {
        let config = {
            let mut servers = self.servers.write().await;
            let server = self.resolve_mut(&mut servers, server_id)?;
            if server.status == McpServerStatus::Online {
                return Ok(Self::snapshot(server.config.id.as_ref().unwrap(), server));
            }
            server.status = McpServerStatus::Connecting;
            server.config.clone()
        };
        let server_id = config.id.clone().unwrap();

        info!("launching MCP server subprocess");
        let outcome = async {
            let handle = McpServerHandle::spawn(&config)?;
            handle.initialize(self.request_timeout).await?;
            let tools = handle.list_tools(self.request_timeout).await?;
            Ok::<_, anyhow::Error>((Arc::new(handle), tools))
        }
        .await;

        let mut servers = self.servers.write().await;
        let server = self.resolve_mut(&mut servers, &server_id)?;
        match outcome {
            Ok((handle, tools)) => {
                info!(tool_count = tools.len(), "MCP server online");
                server.status = McpServerStatus::Online;
                server.handle = Some(handle);
                server.tools = tools;
                server.last_error = None;
                Ok(Self::snapshot(&server_id, server))
            }
            Err(e) => {
                warn!(error = %e, "MCP server connect failed");
                server.status = McpServerStatus::Error;
                server.handle = None;
                server.last_error = Some(e.to_string());
                Err(HubError::Unreachable(format!(
                    "MCP server '{server_id}' failed to connect: {e}"
                )))
            }
        }
    }

    /// Register everything declared in config and connect the auto-connect
    /// ones. Connect failures are logged, not fatal.
    pub async fn startup(&self, configs: &[McpServerConfig]) {
        for config in configs {
            let info = self.register_server(config.clone()).await;
            if config.auto_connect {
                if let Err(e) = self.connect(&info.server_id).await {
                    warn!(server = %info.server_id, error = %e, "MCP auto-connect failed");
                }
            }
        }
    }

    /// Server snapshots, optionally filtered by status.
    pub async fn list(&self, status: Option<McpServerStatus>) -> Vec<McpServerInfo> {
        let servers = self.servers.read().await;
        let mut infos: Vec<McpServerInfo> = servers
            .iter()
            .filter(|(_, s)| status.is_none_or(|wanted| s.status == wanted))
            .map(|(id, s)| Self::snapshot(id, s))
            .collect();
        infos.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        infos
    }

    /// The cached tool catalog of an online server.
    pub async fn list_tools(&self, server_id: &str) -> HubResult<(String, Vec<McpTool>)> {
        let servers = self.servers.read().await;
        let (id, server) = self.resolve(&servers, server_id)?;
        if server.status != McpServerStatus::Online {
            return Err(HubError::NotFound(format!(
                "MCP server '{server_id}' is not connected"
            )));
        }
        Ok((id, server.tools.clone()))
    }

    /// Execute one tool call. Failures mark the server `error`; the next
    /// connect attempt resets it.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        params: Value,
    ) -> HubResult<(String, Value)> {
        let (id, handle) = {
            let servers = self.servers.read().await;
            let (id, server) = self.resolve(&servers, server_id)?;
            let handle = server.handle.clone().ok_or_else(|| {
                HubError::NotFound(format!("MCP server '{server_id}' is not connected"))
            })?;
            (id, handle)
        };

        match handle
            .call_tool(tool_name, params, self.request_timeout)
            .await
        {
            Ok(result) => Ok((id, result)),
            Err(e) => {
                warn!(server = %id, tool = tool_name, error = %e, "MCP tool call failed");
                let mut servers = self.servers.write().await;
                if let Some(server) = servers.get_mut(&id) {
                    // A timeout or protocol error leaves the process up; only
                    // a dead writer means the subprocess is gone.
                    if e.to_string().contains("exited") || e.to_string().contains("writer is gone")
                    {
                        server.status = McpServerStatus::Error;
                        server.handle = None;
                    }
                    server.last_error = Some(e.to_string());
                }
                Err(HubError::Internal(anyhow!(
                    "MCP tool '{tool_name}' on '{id}' failed: {e}"
                )))
            }
        }
    }

    /// Terminate the subprocess and mark the server offline.
    pub async fn disconnect(&self, server_id: &str) -> HubResult<McpServerInfo> {
        let (id, handle) = {
            let mut servers = self.servers.write().await;
            let server = self.resolve_mut(&mut servers, server_id)?;
            let id = server.config.id.clone().unwrap();
            let handle = server.handle.take();
            server.status = McpServerStatus::Offline;
            server.tools.clear();
            (id, handle)
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        info!(server = %id, "MCP server disconnected");
        let servers = self.servers.read().await;
        let (id, server) = self.resolve(&servers, &id)?;
        Ok(Self::snapshot(&id, server))
    }

    /// Kill every subprocess. Called once during hub shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(String, Arc<McpServerHandle>)> = {
            let mut servers = self.servers.write().await;
            servers
                .iter_mut()
                .filter_map(|(id, server)| {
                    server.status = McpServerStatus::Offline;
                    server.handle.take().map(|h| (id.clone(), h))
                })
                .collect()
        };
        for (id, handle) in handles {
            info!(server = %id, "terminating MCP server");
            handle.shutdown().await;
        }
    }

    fn snapshot(server_id: &str, server: &ManagedServer) -> McpServerInfo {
        McpServerInfo {
            server_id: server_id.to_string(),
            name: server.config.name.clone(),
            capabilities: server.config.capabilities.clone(),
            status: server.status,
            tool_count: server.tools.len(),
            last_error: server.last_error.clone(),
        }
    }

    /// Resolve by id, falling back to name.
    fn resolve<'a>(
        &self,
        servers: &'a HashMap<String, ManagedServer>,
        server_id: &str,
    ) -> HubResult<(String, &'a ManagedServer)> {
        if let Some(server) = servers.get(server_id) {
            return Ok((server_id.to_string(), server));
        }
        servers
            .iter()
            .find(|(_, s)| s.config.name == server_id)
            .map(|(id, s)| (id.clone(), s))
            .ok_or_else(|| HubError::NotFound(format!("unknown MCP server '{server_id}'")))
    }

    fn resolve_mut<'a>(
        &self,
        servers: &'a mut HashMap<String, ManagedServer>,
        server_id: &str,
    ) -> HubResult<&'a mut ManagedServer> {
        let id = if servers.contains_key(server_id) {
            server_id.to_string()
        } else {
            servers
                .iter()
                .find(|(_, s)| s.config.name == server_id)
                .map(|(id, _)| id.clone())
                .ok_or_else(|| HubError::NotFound(format!("unknown MCP server '{server_id}'")))?
        };
        Ok(servers.get_mut(&id).unwrap())
    }
}
