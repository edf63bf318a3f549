//! Per-connection plumbing: the outbound handle and writer task

use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::EndpointClass;
use crate::message::Message;

/// Handle to a live connection: identity plus the send channel feeding its
/// writer task.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn new(id: Uuid, peer_addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            peer_addr,
            outbound,
        }
    }

    /// Queue a message. False means the writer task is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.outbound.send(msg).is_ok()
    }
}

/// Drains the outbound channel onto the socket, one JSON object per line.
///
/// Ends when the channel closes (connection dropped from the map) or a write
/// fails; either way the socket half is dropped, which closes it.
pub(super) async fn writer_loop(
    class: EndpointClass,
    connection_id: Uuid,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = outbound.recv().await {
        let line = match serde_json::to_string(&msg) {
            Ok(line) => line,
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "failed to serialize frame");
                continue;
            }
        };
        trace!(
            class = class.as_str(),
            connection = %connection_id,
            kind = msg.kind_str(),
            "sending frame"
        );
        if write_half.write_all(line.as_bytes()).await.is_err()
            || write_half.write_all(b"\n").await.is_err()
        {
            debug!(
                class = class.as_str(),
                connection = %connection_id,
                "write failed, closing connection"
            );
            break;
        }
    }
}
