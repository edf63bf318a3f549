//! swarmhub - orchestrator hub for agents, clients, and tool services
//!
//! Binds the three endpoints, wires the router over the shared state,
//! launches declared MCP servers, and runs until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use swarmhub::config::{Cli, Config};
use swarmhub::heartbeat;
use swarmhub::router::Router;
use swarmhub::state::SharedState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(
        agent_port = config.agent_port,
        client_port = config.client_port,
        service_port = config.service_port,
        "starting swarmhub"
    );

    let shutdown = CancellationToken::new();
    let state = SharedState::new(config.clone(), shutdown.clone());

    // Launch declared MCP servers before opening the doors.
    if !config.mcp_servers.is_empty() {
        info!("starting {} declared MCP servers", config.mcp_servers.len());
        state.mcp.startup(&config.mcp_servers).await;
    }

    let router = Router::new(state.clone());

    let agent_listener = TcpListener::bind(("0.0.0.0", config.agent_port))
        .await
        .with_context(|| format!("failed to bind agent endpoint on port {}", config.agent_port))?;
    let client_listener = TcpListener::bind(("0.0.0.0", config.client_port))
        .await
        .with_context(|| {
            format!("failed to bind client endpoint on port {}", config.client_port)
        })?;
    let service_listener = TcpListener::bind(("0.0.0.0", config.service_port))
        .await
        .with_context(|| {
            format!("failed to bind service endpoint on port {}", config.service_port)
        })?;

    state.agent_endpoint.start(agent_listener, router.clone());
    state.client_endpoint.start(client_listener, router.clone());
    state.service_endpoint.start(service_listener, router.clone());

    heartbeat::spawn(state.clone());
    info!("swarmhub ready");

    wait_for_shutdown_signal().await?;

    info!("shutting down");
    // Cancels accept loops, read loops, the heartbeat, and rejects every
    // pending response waiter.
    shutdown.cancel();
    shutdown_connections(&state);
    state.mcp.shutdown_all().await;
    info!("goodbye");
    Ok(())
}

fn shutdown_connections(state: &Arc<SharedState>) {
    state.agent_endpoint.close_all();
    state.client_endpoint.close_all();
    state.service_endpoint.close_all();
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            outcome = tokio::signal::ctrl_c() => outcome.context("failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    }
    Ok(())
}
