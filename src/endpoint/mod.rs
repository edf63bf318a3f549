//! Connection endpoints
//!
//! One listener per participant class (agent, client, service). Each accepted
//! connection gets a fresh `connectionId`, a writer task, and a read loop
//! that feeds parsed frames to the router in arrival order. Slow peers only
//! stall themselves: sends go through an unbounded per-connection channel
//! and never block the caller.

mod connection;

pub use connection::ConnectionHandle;

use dashmap::DashMap;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::Message;
use crate::router::Router;

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Agent,
    Client,
    Service,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Agent => "agent",
            EndpointClass::Client => "client",
            EndpointClass::Service => "service",
        }
    }
}

/// A listener plus its live connections.
pub struct Endpoint {
    class: EndpointClass,
    connections: DashMap<Uuid, ConnectionHandle>,
    shutdown: CancellationToken,
}

impl Endpoint {
    pub fn new(class: EndpointClass, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            class,
            connections: DashMap::new(),
            shutdown,
        })
    }

    /// Begin accepting on an already-bound listener.
    ///
    /// The caller binds (so tests can use ephemeral ports); startup failures
    /// surface there. The accept loop runs until shutdown.
    pub fn start(self: &Arc<Self>, listener: TcpListener, router: Arc<Router>) {
        let endpoint = self.clone();
        tokio::spawn(async move {
            info!(
                class = endpoint.class.as_str(),
                addr = ?listener.local_addr().ok(),
                "endpoint listening"
            );
            loop {
                tokio::select! {
                    _ = endpoint.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            endpoint.clone().spawn_connection(stream, addr, router.clone());
                        }
                        Err(e) => {
                            warn!(class = endpoint.class.as_str(), error = %e, "accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            info!(class = endpoint.class.as_str(), "endpoint stopped accepting");
        });
    }

    fn spawn_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, router: Arc<Router>) {
        let connection_id = Uuid::new_v4();
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.connections.insert(
            connection_id,
            ConnectionHandle::new(connection_id, addr, outbound_tx),
        );
        tokio::spawn(connection::writer_loop(
            self.class,
            connection_id,
            write_half,
            outbound_rx,
        ));

        let endpoint = self;
        tokio::spawn(async move {
            info!(
                class = endpoint.class.as_str(),
                connection = %connection_id,
                peer = %addr,
                "connection accepted"
            );
            router.on_connect(endpoint.class, connection_id).await;

            let mut lines = tokio::io::BufReader::new(read_half).lines();
            loop {
                tokio::select! {
                    _ = endpoint.shutdown.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Message>(&line) {
                                Ok(msg) => router.on_message(endpoint.class, connection_id, msg).await,
                                Err(e) => {
                                    debug!(
                                        connection = %connection_id,
                                        error = %e,
                                        "malformed frame"
                                    );
                                    endpoint.send_error(
                                        connection_id,
                                        "malformed JSON frame",
                                        "VALIDATION",
                                        None,
                                        None,
                                    );
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(connection = %connection_id, error = %e, "read failed");
                            break;
                        }
                    }
                }
            }

            endpoint.connections.remove(&connection_id);
            router.on_disconnect(endpoint.class, connection_id).await;
            info!(
                class = endpoint.class.as_str(),
                connection = %connection_id,
                "connection closed"
            );
        });
    }

    /// Queue a message for a connection. Unknown or dead connections are a
    /// soft error: the message is dropped and logged.
    pub fn send(&self, connection_id: Uuid, msg: Message) -> bool {
        let Some(conn) = self.connections.get(&connection_id) else {
            debug!(
                class = self.class.as_str(),
                connection = %connection_id,
                kind = msg.kind_str(),
                "dropping message for unknown connection"
            );
            return false;
        };
        if conn.send(msg) {
            return true;
        }
        drop(conn);
        // Writer is gone; the read loop will run the disconnect path, this
        // just keeps the map from accumulating dead handles.
        self.connections.remove(&connection_id);
        false
    }

    /// Queue an `error` reply.
    pub fn send_error(
        &self,
        connection_id: Uuid,
        text: &str,
        code: &str,
        request_id: Option<Uuid>,
        details: Option<Value>,
    ) -> bool {
        self.send(connection_id, Message::error(text, code, request_id, details))
    }

    /// Deliver to every live connection on this endpoint.
    pub fn broadcast(&self, msg: Message) -> usize {
        let mut delivered = 0;
        let targets: Vec<Uuid> = self.connections.iter().map(|c| *c.key()).collect();
        for connection_id in targets {
            if self.send(connection_id, msg.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop every live connection. Writer tasks end when their channel
    /// closes, which closes the sockets.
    pub fn close_all(&self) {
        self.connections.clear();
    }
}
