//! One MCP tool server subprocess
//!
//! The subprocess speaks line-delimited JSON-RPC on its stdio. Writes are
//! serialized through a single FIFO channel into a dedicated stdin writer
//! task; a dedicated stdout reader task matches responses to callers by
//! adapter-assigned id. Subprocess exit fails every outstanding request.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::protocol::{
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, McpTool,
};
use crate::config::McpServerConfig;

/// Sender half of a caller waiting on one request id.
type PendingSender = oneshot::Sender<Result<Value>>;

enum Outgoing {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

/// A running subprocess with its I/O tasks.
pub struct McpServerHandle {
    child: Mutex<Child>,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<Mutex<HashMap<i64, PendingSender>>>,
    id_counter: AtomicI64,
}

impl McpServerHandle {
    /// Spawn the configured command and wire up the reader/writer tasks.
    /// The MCP handshake is a separate step ([`initialize`](Self::initialize)).
    pub fn spawn(config: &McpServerConfig) -> Result<Self> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn MCP server command {:?}", config.command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture MCP server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture MCP server stdout"))?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        let pending: Arc<Mutex<HashMap<i64, PendingSender>>> = Arc::new(Mutex::new(HashMap::new()));

        // Writer task: the only owner of stdin. The channel is the FIFO that
        // serializes concurrent callers.
        let server_name = config.name.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(outgoing) = outgoing_rx.recv().await {
                let line = match &outgoing {
                    Outgoing::Request(request) => serde_json::to_string(request),
                    Outgoing::Notification(notification) => serde_json::to_string(notification),
                };
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(server = %server_name, error = %e, "failed to serialize JSON-RPC frame");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                {
                    debug!(server = %server_name, "MCP server stdin closed");
                    break;
                }
            }
        });

        // Reader task: matches responses by id; failing the whole pending
        // map when the subprocess exits.
        let server_name = config.name.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<JsonRpcMessage>(&line) {
                    Ok(JsonRpcMessage::Response(resp)) => {
                        let waiter = reader_pending.lock().await.remove(&resp.id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(Ok(resp.result));
                            }
                            None => warn!(
                                server = %server_name,
                                id = resp.id,
                                "response with no pending request"
                            ),
                        }
                    }
                    Ok(JsonRpcMessage::Error(err)) => {
                        let waiter = reader_pending.lock().await.remove(&err.id);
                        if let Some(tx) = waiter {
                            let _ = tx.send(Err(anyhow!(
                                "MCP server error {}: {}",
                                err.error.code,
                                err.error.message
                            )));
                        }
                    }
                    Ok(JsonRpcMessage::Notification(notification)) => {
                        debug!(
                            server = %server_name,
                            method = %notification.method,
                            "MCP notification"
                        );
                    }
                    Ok(JsonRpcMessage::Request(request)) => {
                        debug!(
                            server = %server_name,
                            method = %request.method,
                            "ignoring server-initiated request"
                        );
                    }
                    Err(e) => {
                        warn!(server = %server_name, error = %e, line = %line, "undecodable MCP frame");
                    }
                }
            }

            // Subprocess is gone: every outstanding caller gets an error.
            let mut pending = reader_pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(anyhow!("MCP server exited with requests in flight")));
            }
            info!(server = %server_name, "MCP server stdout closed");
        });

        Ok(Self {
            child: Mutex::new(child),
            outgoing_tx,
            pending,
            id_counter: AtomicI64::new(1),
        })
    }

    /// Send one request and await its response, bounded by `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        // Register before sending so an instant reply cannot be lost.
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        if self.outgoing_tx.send(Outgoing::Request(request)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(anyhow!("MCP server writer is gone"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(anyhow!("MCP server dropped the request")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(anyhow!("MCP request `{method}` timed out"))
            }
        }
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.outgoing_tx
            .send(Outgoing::Notification(JsonRpcNotification::new(
                method, params,
            )))
            .map_err(|_| anyhow!("MCP server writer is gone"))
    }

    /// The MCP handshake: `initialize` request followed by the
    /// `notifications/initialized` notification.
    pub async fn initialize(&self, timeout: Duration) -> Result<Value> {
        let result = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": "2024-11-05",
                    "clientInfo": {
                        "name": "swarmhub",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {},
                })),
                timeout,
            )
            .await
            .context("MCP initialize failed")?;
        self.notify("notifications/initialized", None)?;
        Ok(result)
    }

    /// `tools/list`.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpTool>> {
        let result = self.request("tools/list", None, timeout).await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![]));
        serde_json::from_value(tools).context("malformed tools/list response")
    }

    /// `tools/call`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.request(
            "tools/call",
            Some(json!({"name": name, "arguments": arguments})),
            timeout,
        )
        .await
    }

    /// Terminate the subprocess. Outstanding requests fail through the
    /// reader task observing EOF.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "MCP server already gone at shutdown");
        }
        let _ = child.wait().await;
    }
}
