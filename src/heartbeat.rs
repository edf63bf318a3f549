//! Heartbeat: periodic pings to agents and services
//!
//! Each round pings every bound agent and service connection and awaits the
//! pong through the pending-response table. A missed pong marks the
//! participant `error`, but only while it is still bound to the pinged
//! connection; a disconnect or reconnect that races the round wins. The
//! next pong (or any status update) restores an `error` mark.

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{types, Message};
use crate::state::SharedState;

/// Spawn the heartbeat loop. Returns None when disabled by config.
pub fn spawn(state: Arc<SharedState>) -> Option<JoinHandle<()>> {
    let interval = state.config.heartbeat_interval;
    if interval.is_zero() {
        info!("heartbeat disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so freshly started hubs
        // don't ping before anyone registered.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            run_round(&state).await;
        }
        debug!("heartbeat stopped");
    }))
}

/// One ping round over every bound agent and service. The round completes
/// when every check resolved or timed out, which is bounded by the
/// heartbeat timeout.
async fn run_round(state: &Arc<SharedState>) {
    let mut checks: Vec<BoxFuture<'static, ()>> = Vec::new();

    for agent in state.agents.list(&Default::default()).await {
        let Some(connection_id) = agent.connection_id else {
            continue;
        };
        let state = state.clone();
        checks.push(
            async move {
                let ping = Message::new(types::PING, json!({}));
                let ping_id = ping.id.unwrap();
                let waiter = state
                    .pending
                    .register_matching(ping_id, |msg| msg.kind_str() == types::PONG);
                state.agent_endpoint.send(connection_id, ping);
                if waiter.wait(state.config.heartbeat_timeout).await.is_err()
                    && state
                        .agents
                        .mark_unresponsive(&agent.id, connection_id)
                        .await
                {
                    warn!(agent = %agent.id, "missed heartbeat");
                }
            }
            .boxed(),
        );
    }

    for service in state.services.list().await {
        let Some(connection_id) = service.connection_id else {
            continue;
        };
        let state = state.clone();
        checks.push(
            async move {
                let ping = Message::new(types::PING, json!({}));
                let ping_id = ping.id.unwrap();
                let waiter = state
                    .pending
                    .register_matching(ping_id, |msg| msg.kind_str() == types::PONG);
                state.service_endpoint.send(connection_id, ping);
                if waiter.wait(state.config.heartbeat_timeout).await.is_err()
                    && state
                        .services
                        .mark_unresponsive(&service.id, connection_id)
                        .await
                {
                    warn!(service = %service.id, "missed heartbeat");
                }
            }
            .boxed(),
        );
    }

    join_all(checks).await;
}
