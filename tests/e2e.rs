//! End-to-end integration tests for swarmhub
//!
//! Boots the hub on ephemeral ports and drives real TCP connections with
//! scripted framed-JSON participants. The MCP path runs against the
//! `mcp-echo` helper binary as a genuine subprocess peer.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use swarmhub::config::{Config, McpServerConfig};
use swarmhub::message::{types, Message};
use swarmhub::router::Router;
use swarmhub::state::SharedState;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Hub
// ============================================================================

struct Hub {
    state: Arc<SharedState>,
    shutdown: CancellationToken,
    agent_addr: SocketAddr,
    client_addr: SocketAddr,
    service_addr: SocketAddr,
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Boot a hub on ephemeral ports with the heartbeat disabled.
async fn start_hub() -> Result<Hub> {
    let config = Config {
        heartbeat_interval: Duration::ZERO,
        ..Config::default()
    };
    start_hub_with(config).await
}

async fn start_hub_with(config: Config) -> Result<Hub> {
    let shutdown = CancellationToken::new();
    let state = SharedState::new(config.clone(), shutdown.clone());
    state.mcp.startup(&config.mcp_servers).await;
    let router = Router::new(state.clone());

    let agent_listener = TcpListener::bind("127.0.0.1:0").await?;
    let client_listener = TcpListener::bind("127.0.0.1:0").await?;
    let service_listener = TcpListener::bind("127.0.0.1:0").await?;
    let agent_addr = agent_listener.local_addr()?;
    let client_addr = client_listener.local_addr()?;
    let service_addr = service_listener.local_addr()?;

    state.agent_endpoint.start(agent_listener, router.clone());
    state.client_endpoint.start(client_listener, router.clone());
    state.service_endpoint.start(service_listener, router);
    swarmhub::heartbeat::spawn(state.clone());

    Ok(Hub {
        state,
        shutdown,
        agent_addr,
        client_addr,
        service_addr,
    })
}

// ============================================================================
// Scripted Participant
// ============================================================================

struct Participant {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Participant {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        let line = serde_json::to_string(msg)?;
        self.write.write_all(line.as_bytes()).await?;
        self.write.write_all(b"\n").await?;
        Ok(())
    }

    async fn send_raw(&mut self, raw: &str) -> Result<()> {
        self.write.write_all(raw.as_bytes()).await?;
        self.write.write_all(b"\n").await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message> {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .context("timed out waiting for a frame")??
            .ok_or_else(|| anyhow!("connection closed"))?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Receive frames until one of the given kind arrives, skipping
    /// broadcasts and pings.
    async fn recv_kind(&mut self, kind: &str) -> Result<Message> {
        for _ in 0..32 {
            let msg = self.recv().await?;
            if msg.kind_str() == kind {
                return Ok(msg);
            }
        }
        Err(anyhow!("no `{kind}` frame within 32 messages"))
    }

    /// Assert silence: no frame of `kind` arrives within `window`.
    async fn expect_no_frame_of_kind(&mut self, kind: &str, window: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match tokio::time::timeout(remaining, self.lines.next_line()).await {
                Err(_) => return Ok(()),
                Ok(line) => {
                    let Some(line) = line? else {
                        return Ok(());
                    };
                    let msg: Message = serde_json::from_str(&line)?;
                    if msg.kind_str() == kind {
                        return Err(anyhow!("unexpected `{kind}` frame: {:?}", msg.content));
                    }
                }
            }
        }
    }
}

/// Connect to the agent endpoint and register.
async fn connect_agent(hub: &Hub, name: &str, manifest: Value) -> Result<(Participant, String)> {
    let mut agent = Participant::connect(hub.agent_addr).await?;
    agent.recv_kind(types::ORCHESTRATOR_WELCOME).await?;
    agent
        .send(&Message::new(
            types::AGENT_REGISTER,
            json!({"agentName": name, "capabilities": ["test"], "manifest": manifest}),
        ))
        .await?;
    let registered = agent.recv_kind(types::AGENT_REGISTERED).await?;
    let agent_id = registered
        .str_field("agentId")
        .ok_or_else(|| anyhow!("agent.registered without agentId"))?
        .to_string();
    Ok((agent, agent_id))
}

/// Connect to the client endpoint; the welcome carries the assigned id.
async fn connect_client(hub: &Hub) -> Result<(Participant, String)> {
    let mut client = Participant::connect(hub.client_addr).await?;
    let welcome = client.recv_kind(types::ORCHESTRATOR_CLIENT_WELCOME).await?;
    let client_id = welcome
        .str_field("clientId")
        .ok_or_else(|| anyhow!("welcome without clientId"))?
        .to_string();
    Ok((client, client_id))
}

/// Connect to the service endpoint and register with a tool catalog.
async fn connect_service(hub: &Hub, name: &str, tools: Value) -> Result<(Participant, String)> {
    let mut service = Participant::connect(hub.service_addr).await?;
    service.recv_kind(types::ORCHESTRATOR_WELCOME).await?;
    service
        .send(&Message::new(
            types::SERVICE_REGISTER,
            json!({"name": name, "capabilities": ["tools"], "tools": tools}),
        ))
        .await?;
    let registered = service.recv_kind(types::SERVICE_REGISTERED).await?;
    let service_id = registered
        .str_field("serviceId")
        .ok_or_else(|| anyhow!("service.registered without serviceId"))?
        .to_string();
    Ok((service, service_id))
}

// ============================================================================
// Client → Agent
// ============================================================================

#[tokio::test]
async fn test_happy_path_client_to_agent() -> Result<()> {
    let hub = start_hub().await?;
    let (mut client, _) = connect_client(&hub).await?;
    let (mut agent, agent_id) =
        connect_agent(&hub, "Text Processing Agent", json!({})).await?;

    // Agent shows up in a filtered list; "active" folds into online.
    client
        .send(&Message::new(
            types::CLIENT_AGENT_LIST_REQUEST,
            json!({"status": "active"}),
        ))
        .await?;
    let list = client.recv_kind(types::CLIENT_AGENT_LIST_RESPONSE).await?;
    let agents = list.content["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["name"], "Text Processing Agent");
    assert_eq!(agents[0]["id"], agent_id.as_str());

    // Create a task by agent name.
    let create = Message::new(
        types::CLIENT_AGENT_TASK_CREATE_REQUEST,
        json!({
            "agentName": "Text Processing Agent",
            "taskType": "process",
            "taskData": {"text": "hi", "op": "upper"},
        }),
    );
    let create_id = create.id;
    client.send(&create).await?;

    let response = client
        .recv_kind(types::CLIENT_AGENT_TASK_CREATE_RESPONSE)
        .await?;
    assert_eq!(response.request_id, create_id);
    let task_id = response.str_field("taskId").unwrap().to_string();

    // The agent receives task.execute with the same task id and data.
    let execute = agent.recv_kind(types::TASK_EXECUTE).await?;
    assert_eq!(execute.str_field("taskId"), Some(task_id.as_str()));
    assert_eq!(execute.content["data"]["text"], "hi");

    // Agent completes; client gets exactly one terminal result.
    agent
        .send(&Message::new(
            types::TASK_RESULT,
            json!({"taskId": task_id, "result": {"processedText": "HI"}}),
        ))
        .await?;
    let result = client.recv_kind(types::CLIENT_AGENT_TASK_RESULT).await?;
    assert_eq!(result.request_id, create_id);
    assert_eq!(result.str_field("status"), Some("completed"));
    assert_eq!(result.content["result"]["processedText"], "HI");

    // R2: the status query agrees with the delivered result.
    let status_req = Message::new(
        types::CLIENT_AGENT_TASK_STATUS_REQUEST,
        json!({"taskId": task_id}),
    );
    client.send(&status_req).await?;
    let status = client
        .recv_kind(types::CLIENT_AGENT_TASK_STATUS_RESPONSE)
        .await?;
    assert_eq!(status.str_field("status"), Some("completed"));
    assert_eq!(status.content["result"]["processedText"], "HI");
    Ok(())
}

#[tokio::test]
async fn test_task_create_for_unknown_agent() -> Result<()> {
    let hub = start_hub().await?;
    let (mut client, _) = connect_client(&hub).await?;

    let create = Message::new(
        types::CLIENT_AGENT_TASK_CREATE_REQUEST,
        json!({"agentName": "Nobody", "taskData": {}}),
    );
    let create_id = create.id;
    client.send(&create).await?;

    let error = client.recv_kind(types::ERROR).await?;
    assert_eq!(error.request_id, create_id);
    assert_eq!(error.str_field("code"), Some("NOT_FOUND"));
    Ok(())
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() -> Result<()> {
    let hub = start_hub().await?;
    let (mut client, _) = connect_client(&hub).await?;

    client.send_raw("this is not json").await?;
    let error = client.recv_kind(types::ERROR).await?;
    assert_eq!(error.str_field("code"), Some("VALIDATION"));

    // Frame without a type is answered referencing its id.
    let id = Uuid::new_v4();
    client
        .send_raw(&format!("{{\"id\":\"{id}\",\"content\":{{}}}}"))
        .await?;
    let error = client.recv_kind(types::ERROR).await?;
    assert_eq!(error.request_id, Some(id));

    // The connection survived both.
    client
        .send(&Message::new(types::CLIENT_AGENT_LIST_REQUEST, json!({})))
        .await?;
    client.recv_kind(types::CLIENT_AGENT_LIST_RESPONSE).await?;
    Ok(())
}

#[tokio::test]
async fn test_unsupported_type() -> Result<()> {
    let hub = start_hub().await?;
    let (mut agent, _) = connect_agent(&hub, "Worker", json!({})).await?;

    let bogus = Message::new("bogus.type", json!({}));
    let bogus_id = bogus.id;
    agent.send(&bogus).await?;

    let error = agent.recv_kind(types::ERROR).await?;
    assert_eq!(error.request_id, bogus_id);
    assert_eq!(error.str_field("code"), Some("UNSUPPORTED"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_task_result_is_ignored() -> Result<()> {
    let hub = start_hub().await?;
    let (mut agent, _) = connect_agent(&hub, "Worker", json!({})).await?;

    agent
        .send(&Message::new(
            types::TASK_RESULT,
            json!({"taskId": Uuid::new_v4(), "result": {}}),
        ))
        .await?;
    // Logged and ignored: no error, no result frame.
    agent
        .expect_no_frame_of_kind(types::ERROR, Duration::from_millis(300))
        .await?;
    Ok(())
}

// ============================================================================
// Agent → Agent delegation
// ============================================================================

#[tokio::test]
async fn test_agent_to_agent_delegation() -> Result<()> {
    let hub = start_hub().await?;
    let (mut requester, requester_id) = connect_agent(&hub, "Agent A", json!({})).await?;
    let (mut target, _) = connect_agent(&hub, "Data Analysis Agent", json!({})).await?;

    let request = Message::new(
        types::AGENT_TASK_REQUEST,
        json!({
            "targetAgentName": "Data Analysis Agent",
            "taskType": "analyze",
            "taskData": {"rows": 3},
        }),
    );
    let request_id = request.id;
    requester.send(&request).await?;

    let accepted = requester
        .recv_kind(types::CHILDAGENT_REQUEST_ACCEPTED)
        .await?;
    assert_eq!(accepted.request_id, request_id);
    let child_task_id = accepted.str_field("childTaskId").unwrap().to_string();

    let execute = target.recv_kind(types::TASK_EXECUTE).await?;
    assert_eq!(execute.str_field("taskId"), Some(child_task_id.as_str()));
    assert_eq!(execute.content["data"]["rows"], 3);

    target
        .send(&Message::new(
            types::TASK_RESULT,
            json!({"taskId": child_task_id, "result": {"mean": 2.0}}),
        ))
        .await?;

    let response = requester.recv_kind(types::CHILDAGENT_RESPONSE).await?;
    assert_eq!(response.request_id, request_id);
    assert_eq!(
        response.str_field("childTaskId"),
        Some(child_task_id.as_str())
    );
    assert_eq!(response.str_field("status"), Some("completed"));
    assert_eq!(response.content["result"]["mean"], 2.0);

    let tasks = hub.state.agent_tasks.by_requesting_agent_id(&requester_id).await;
    assert_eq!(tasks.len(), 1);
    Ok(())
}

// ============================================================================
// Notification propagation
// ============================================================================

/// Client C tasks agent A; A delegates to B; B emits a notification on the
/// child task. C gets exactly one copy, marked as a child-agent message.
#[tokio::test]
async fn test_notification_reaches_root_client_once() -> Result<()> {
    let hub = start_hub().await?;
    let (mut client, _) = connect_client(&hub).await?;
    let (mut agent_a, _) = connect_agent(&hub, "Agent A", json!({})).await?;
    let (mut agent_b, agent_b_id) = connect_agent(&hub, "Agent B", json!({})).await?;

    // C → A
    client
        .send(&Message::new(
            types::CLIENT_AGENT_TASK_CREATE_REQUEST,
            json!({"agentName": "Agent A", "taskData": {}}),
        ))
        .await?;
    let created = client
        .recv_kind(types::CLIENT_AGENT_TASK_CREATE_RESPONSE)
        .await?;
    let root_task_id = created.str_field("taskId").unwrap().to_string();
    agent_a.recv_kind(types::TASK_EXECUTE).await?;

    // A → B, as a child of the root task
    agent_a
        .send(&Message::new(
            types::AGENT_TASK_REQUEST,
            json!({
                "targetAgentName": "Agent B",
                "taskType": "analyze",
                "taskData": {},
                "parentTaskId": root_task_id,
            }),
        ))
        .await?;
    let accepted = agent_a.recv_kind(types::CHILDAGENT_REQUEST_ACCEPTED).await?;
    let child_task_id = accepted.str_field("childTaskId").unwrap().to_string();
    agent_b.recv_kind(types::TASK_EXECUTE).await?;

    // The client hears about the child task being created.
    let child_created = client.recv_kind(types::TASK_CHILDTASK_CREATED).await?;
    assert_eq!(
        child_created.str_field("childTaskId"),
        Some(child_task_id.as_str())
    );
    assert_eq!(child_created.str_field("taskId"), Some(root_task_id.as_str()));

    // B emits progress on the child task.
    agent_b
        .send(&Message::new(
            types::TASK_NOTIFICATION,
            json!({"taskId": child_task_id, "message": "halfway"}),
        ))
        .await?;

    let notification = client.recv_kind(types::TASK_NOTIFICATION).await?;
    assert_eq!(notification.str_field("message"), Some("halfway"));
    assert_eq!(notification.str_field("taskId"), Some(root_task_id.as_str()));
    assert_eq!(
        notification.str_field("childTaskId"),
        Some(child_task_id.as_str())
    );
    assert_eq!(notification.str_field("agentId"), Some(agent_b_id.as_str()));
    assert_eq!(notification.content["isChildAgentMessage"], true);

    // Exactly one copy for the client, none relayed through A.
    client
        .expect_no_frame_of_kind(types::TASK_NOTIFICATION, Duration::from_millis(300))
        .await?;
    agent_a
        .expect_no_frame_of_kind(types::TASK_NOTIFICATION, Duration::from_millis(300))
        .await?;
    Ok(())
}

/// A grandchild's notification still lands exactly once, at the root client.
#[tokio::test]
async fn test_grandchild_notification_single_delivery() -> Result<()> {
    let hub = start_hub().await?;
    let (mut client, _) = connect_client(&hub).await?;
    let (mut agent_a, _) = connect_agent(&hub, "Agent A", json!({})).await?;
    let (mut agent_b, _) = connect_agent(&hub, "Agent B", json!({})).await?;
    let (mut agent_c, _) = connect_agent(&hub, "Agent C", json!({})).await?;

    client
        .send(&Message::new(
            types::CLIENT_AGENT_TASK_CREATE_REQUEST,
            json!({"agentName": "Agent A", "taskData": {}}),
        ))
        .await?;
    let created = client
        .recv_kind(types::CLIENT_AGENT_TASK_CREATE_RESPONSE)
        .await?;
    let root_task_id = created.str_field("taskId").unwrap().to_string();
    agent_a.recv_kind(types::TASK_EXECUTE).await?;

    agent_a
        .send(&Message::new(
            types::AGENT_TASK_REQUEST,
            json!({
                "targetAgentName": "Agent B",
                "taskData": {},
                "parentTaskId": root_task_id,
            }),
        ))
        .await?;
    let accepted = agent_a.recv_kind(types::CHILDAGENT_REQUEST_ACCEPTED).await?;
    let child_id = accepted.str_field("childTaskId").unwrap().to_string();
    agent_b.recv_kind(types::TASK_EXECUTE).await?;

    agent_b
        .send(&Message::new(
            types::AGENT_TASK_REQUEST,
            json!({
                "targetAgentName": "Agent C",
                "taskData": {},
                "parentTaskId": child_id,
            }),
        ))
        .await?;
    let accepted = agent_b.recv_kind(types::CHILDAGENT_REQUEST_ACCEPTED).await?;
    let grandchild_id = accepted.str_field("childTaskId").unwrap().to_string();
    agent_c.recv_kind(types::TASK_EXECUTE).await?;

    agent_c
        .send(&Message::new(
            types::TASK_NOTIFICATION,
            json!({"taskId": grandchild_id, "message": "deep progress"}),
        ))
        .await?;

    let notification = client.recv_kind(types::TASK_NOTIFICATION).await?;
    assert_eq!(notification.str_field("message"), Some("deep progress"));
    assert_eq!(
        notification.str_field("childTaskId"),
        Some(grandchild_id.as_str())
    );
    client
        .expect_no_frame_of_kind(types::TASK_NOTIFICATION, Duration::from_millis(300))
        .await?;
    Ok(())
}

/// `task.message` travels the same chain as `task.requestmessage` and the
/// emitting agent gets an ack; the client's answer comes back as
/// `task.messageresponse`.
#[tokio::test]
async fn test_task_message_round_trip() -> Result<()> {
    let hub = start_hub().await?;
    let (mut client, client_id) = connect_client(&hub).await?;
    let (mut agent, _) = connect_agent(&hub, "Agent A", json!({})).await?;

    client
        .send(&Message::new(
            types::CLIENT_AGENT_TASK_CREATE_REQUEST,
            json!({"agentName": "Agent A", "taskData": {}}),
        ))
        .await?;
    let created = client
        .recv_kind(types::CLIENT_AGENT_TASK_CREATE_RESPONSE)
        .await?;
    let task_id = created.str_field("taskId").unwrap().to_string();
    agent.recv_kind(types::TASK_EXECUTE).await?;

    let question = Message::new(
        types::TASK_MESSAGE,
        json!({"taskId": task_id, "message": "which encoding?"}),
    );
    let question_id = question.id;
    agent.send(&question).await?;

    let request = client.recv_kind(types::TASK_REQUESTMESSAGE).await?;
    assert_eq!(request.str_field("message"), Some("which encoding?"));
    let ack = agent.recv_kind(types::TASK_MESSAGE_RECEIVED).await?;
    assert_eq!(ack.request_id, question_id);

    client
        .send(&Message::new(
            types::TASK_MESSAGE,
            json!({"taskId": task_id, "message": "utf-8"}),
        ))
        .await?;
    let answer = agent.recv_kind(types::TASK_MESSAGERESPONSE).await?;
    assert_eq!(answer.str_field("message"), Some("utf-8"));
    assert_eq!(answer.str_field("clientId"), Some(client_id.as_str()));
    Ok(())
}

// ============================================================================
// Disconnects
// ============================================================================

#[tokio::test]
async fn test_agent_disconnect_fails_running_task() -> Result<()> {
    let hub = start_hub().await?;
    let (mut client, _) = connect_client(&hub).await?;
    let (mut agent, _) = connect_agent(&hub, "Flaky Agent", json!({})).await?;

    let create = Message::new(
        types::CLIENT_AGENT_TASK_CREATE_REQUEST,
        json!({"agentName": "Flaky Agent", "taskData": {}}),
    );
    let create_id = create.id;
    client.send(&create).await?;
    let created = client
        .recv_kind(types::CLIENT_AGENT_TASK_CREATE_RESPONSE)
        .await?;
    let task_id = created.str_field("taskId").unwrap().to_string();
    agent.recv_kind(types::TASK_EXECUTE).await?;

    // The agent dies before replying.
    drop(agent);

    let error = client.recv_kind(types::TASK_ERROR).await?;
    assert_eq!(error.request_id, create_id);
    assert_eq!(error.str_field("taskId"), Some(task_id.as_str()));
    assert!(error.str_field("error").unwrap().contains("disconnected"));

    // The task record is failed; no result ever arrives.
    client
        .send(&Message::new(
            types::CLIENT_AGENT_TASK_STATUS_REQUEST,
            json!({"taskId": task_id}),
        ))
        .await?;
    let status = client
        .recv_kind(types::CLIENT_AGENT_TASK_STATUS_RESPONSE)
        .await?;
    assert_eq!(status.str_field("status"), Some("failed"));
    client
        .expect_no_frame_of_kind(types::CLIENT_AGENT_TASK_RESULT, Duration::from_millis(300))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_duplicate_name_demotes_first_agent() -> Result<()> {
    let hub = start_hub().await?;
    let (mut first, first_id) = connect_agent(&hub, "Worker", json!({})).await?;
    let (_second, second_id) = connect_agent(&hub, "Worker", json!({})).await?;
    assert_ne!(first_id, second_id);

    // Lookups by name now resolve to the newcomer.
    let (mut client, _) = connect_client(&hub).await?;
    client
        .send(&Message::new(
            types::CLIENT_AGENT_LIST_REQUEST,
            json!({"status": "online", "name": "Worker"}),
        ))
        .await?;
    let list = client.recv_kind(types::CLIENT_AGENT_LIST_RESPONSE).await?;
    let agents = list.content["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["id"], second_id.as_str());

    // The demoted agent's connection is unbound: its next message bounces.
    first
        .send(&Message::new(
            types::TASK_RESULT,
            json!({"taskId": Uuid::new_v4(), "result": {}}),
        ))
        .await?;
    let error = first.recv_kind(types::ERROR).await?;
    assert_eq!(error.str_field("code"), Some("NOT_FOUND"));
    Ok(())
}

// ============================================================================
// Services
// ============================================================================

#[tokio::test]
async fn test_service_task_execution_fan_out() -> Result<()> {
    let hub = start_hub().await?;
    let (mut service, service_id) = connect_service(
        &hub,
        "fs",
        json!([{"id": "read_file", "name": "read_file", "description": "Read a file"}]),
    )
    .await?;
    let (mut client, client_id) = connect_client(&hub).await?;
    let (mut agent, _) = connect_agent(&hub, "Agent A", json!({})).await?;

    let execute = Message::new(
        types::SERVICE_TASK_EXECUTE,
        json!({
            "serviceName": "fs",
            "toolId": "read_file",
            "params": {"path": "/x"},
            "clientId": client_id,
        }),
    );
    let execute_id = execute.id;
    agent.send(&execute).await?;

    // The service receives the dispatch; the client sees it start.
    let dispatched = service.recv_kind(types::SERVICE_TASK_EXECUTE).await?;
    let task_id = dispatched.str_field("taskId").unwrap().to_string();
    assert_eq!(dispatched.str_field("toolId"), Some("read_file"));
    assert_eq!(dispatched.content["params"]["path"], "/x");
    let started = client.recv_kind(types::SERVICE_STARTED).await?;
    assert_eq!(started.str_field("taskId"), Some(task_id.as_str()));

    service
        .send(&Message::new(
            types::SERVICE_TASK_RESULT,
            json!({"taskId": task_id, "result": {"contents": "data"}}),
        ))
        .await?;

    // Fan-out: the agent's correlated response and the client's completion.
    let response = agent.recv_kind(types::SERVICE_TASK_EXECUTE_RESPONSE).await?;
    assert_eq!(response.request_id, execute_id);
    assert_eq!(response.str_field("status"), Some("success"));
    assert_eq!(response.content["result"]["contents"], "data");
    assert_eq!(response.str_field("serviceId"), Some(service_id.as_str()));

    let completed = client.recv_kind(types::SERVICE_COMPLETED).await?;
    assert_eq!(completed.str_field("taskId"), Some(task_id.as_str()));
    assert_eq!(completed.content["result"]["contents"], "data");
    Ok(())
}

#[tokio::test]
async fn test_service_allow_list() -> Result<()> {
    let hub = start_hub().await?;
    let (_service, _) = connect_service(&hub, "fs", json!([{"id": "read_file", "name": "read_file"}])).await?;
    let (mut agent, _) = connect_agent(
        &hub,
        "Restricted Agent",
        json!({"requiredServices": ["search"]}),
    )
    .await?;

    let execute = Message::new(
        types::SERVICE_TASK_EXECUTE,
        json!({"serviceName": "fs", "toolId": "read_file", "params": {}}),
    );
    let execute_id = execute.id;
    agent.send(&execute).await?;

    let error = agent.recv_kind(types::ERROR).await?;
    assert_eq!(error.request_id, execute_id);
    assert_eq!(error.str_field("code"), Some("UNAUTHORIZED"));
    Ok(())
}

#[tokio::test]
async fn test_agent_service_listing_and_tools() -> Result<()> {
    let hub = start_hub().await?;
    let (_service, service_id) = connect_service(
        &hub,
        "fs",
        json!([{"id": "read_file", "name": "read_file", "inputSchema": {"type": "object"}}]),
    )
    .await?;
    let (mut agent, _) = connect_agent(&hub, "Agent A", json!({})).await?;

    agent
        .send(&Message::new(types::AGENT_SERVICE_LIST_REQUEST, json!({})))
        .await?;
    let list = agent.recv_kind(types::AGENT_SERVICE_LIST_RESPONSE).await?;
    let services = list.content["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["name"], "fs");

    agent
        .send(&Message::new(
            types::SERVICE_TOOLS_LIST,
            json!({"serviceName": "fs"}),
        ))
        .await?;
    let tools = agent.recv_kind(types::SERVICE_TOOLS_LIST_RESPONSE).await?;
    assert_eq!(tools.str_field("serviceId"), Some(service_id.as_str()));
    assert_eq!(tools.content["tools"][0]["id"], "read_file");
    assert!(tools.content["tools"][0].get("inputSchema").is_some());
    Ok(())
}

// ============================================================================
// MCP
// ============================================================================

fn echo_server_config() -> McpServerConfig {
    McpServerConfig {
        name: "echo-server".to_string(),
        id: None,
        command: env!("CARGO_BIN_EXE_mcp-echo").to_string(),
        args: vec![],
        env: HashMap::new(),
        capabilities: vec!["tools".to_string()],
        auto_connect: true,
    }
}

#[tokio::test]
async fn test_mcp_tool_execution_via_agent() -> Result<()> {
    let config = Config {
        heartbeat_interval: Duration::ZERO,
        mcp_servers: vec![echo_server_config()],
        ..Config::default()
    };
    let hub = start_hub_with(config).await?;
    let (mut agent, _) = connect_agent(&hub, "Agent A", json!({})).await?;

    // The declared server is up and lists its tools.
    agent
        .send(&Message::new(types::AGENT_MCP_SERVERS_LIST, json!({})))
        .await?;
    let servers = agent.recv_kind(types::AGENT_MCP_SERVERS_LIST_RESULT).await?;
    assert_eq!(servers.content["servers"][0]["serverId"], "echo-server");
    assert_eq!(servers.content["servers"][0]["status"], "online");

    agent
        .send(&Message::new(
            types::MCP_TOOLS_LIST,
            json!({"serverId": "echo-server"}),
        ))
        .await?;
    let tools = agent.recv_kind(types::MCP_TOOLS_LIST_RESULT).await?;
    let names: Vec<&str> = tools.content["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"echo"));
    assert!(names.contains(&"add"));

    // Execute a tool through the subprocess and correlate the reply.
    let execute = Message::new(
        types::MCP_TOOL_EXECUTE,
        json!({"serverId": "echo-server", "toolName": "echo", "parameters": {"message": "hi"}}),
    );
    let execute_id = execute.id;
    agent.send(&execute).await?;

    let result = agent.recv_kind(types::MCP_TOOL_EXECUTE_RESULT).await?;
    assert_eq!(result.request_id, execute_id);
    assert_eq!(result.str_field("status"), Some("success"));
    assert_eq!(result.str_field("serverId"), Some("echo-server"));
    assert_eq!(result.content["result"]["content"][0]["text"], "echo: hi");
    Ok(())
}

#[tokio::test]
async fn test_mcp_via_client_endpoint() -> Result<()> {
    let config = Config {
        heartbeat_interval: Duration::ZERO,
        mcp_servers: vec![echo_server_config()],
        ..Config::default()
    };
    let hub = start_hub_with(config).await?;
    let (mut client, _) = connect_client(&hub).await?;

    client
        .send(&Message::new(types::CLIENT_MCP_SERVER_LIST_REQUEST, json!({})))
        .await?;
    let servers = client
        .recv_kind(types::CLIENT_MCP_SERVER_LIST_RESPONSE)
        .await?;
    assert_eq!(servers.content["servers"][0]["status"], "online");

    client
        .send(&Message::new(
            types::MCP_SERVER_TOOLS,
            json!({"serverId": "echo-server"}),
        ))
        .await?;
    let tools = client.recv_kind(types::MCP_SERVER_TOOLS).await?;
    assert!(!tools.content["tools"].as_array().unwrap().is_empty());

    client
        .send(&Message::new(
            types::MCP_TOOL_EXECUTE,
            json!({"serverId": "echo-server", "toolName": "add", "parameters": {"a": 100, "b": 23}}),
        ))
        .await?;
    let result = client.recv_kind(types::MCP_TOOL_EXECUTION_RESULT).await?;
    assert_eq!(result.str_field("status"), Some("success"));
    assert_eq!(result.content["result"]["content"][0]["text"], "123");
    Ok(())
}

#[tokio::test]
async fn test_mcp_unknown_server() -> Result<()> {
    let hub = start_hub().await?;
    let (mut agent, _) = connect_agent(&hub, "Agent A", json!({})).await?;

    let execute = Message::new(
        types::MCP_TOOL_EXECUTE,
        json!({"serverId": "ghost", "toolName": "echo", "parameters": {}}),
    );
    let execute_id = execute.id;
    agent.send(&execute).await?;

    let error = agent.recv_kind(types::ERROR).await?;
    assert_eq!(error.request_id, execute_id);
    assert_eq!(error.str_field("code"), Some("NOT_FOUND"));
    Ok(())
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test]
async fn test_disconnect_during_heartbeat_round_stays_offline() -> Result<()> {
    let config = Config {
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(400),
        ..Config::default()
    };
    let hub = start_hub_with(config).await?;
    let (mut agent, agent_id) = connect_agent(&hub, "Vanishing Agent", json!({})).await?;

    // Wait for a ping to be in flight, then drop the connection without
    // answering it.
    agent.recv_kind(types::PING).await?;
    drop(agent);

    // The disconnect lands before the ping deadline; when the heartbeat
    // times out, its error mark must lose against the offline state.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let record = hub.state.agents.get(&agent_id).await.unwrap();
    assert_eq!(record.status.as_str(), "offline");
    assert!(record.connection_id.is_none());
    Ok(())
}

#[tokio::test]
async fn test_missed_heartbeat_marks_agent_error() -> Result<()> {
    let config = Config {
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(100),
        ..Config::default()
    };
    let hub = start_hub_with(config).await?;
    let (_agent, agent_id) = connect_agent(&hub, "Silent Agent", json!({})).await?;

    // The agent never answers pings; within a few rounds it is marked error.
    let mut status = String::new();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let agent = hub.state.agents.get(&agent_id).await.unwrap();
        status = agent.status.as_str().to_string();
        if status == "error" {
            break;
        }
    }
    assert_eq!(status, "error");
    Ok(())
}
