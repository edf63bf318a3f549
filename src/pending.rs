//! Pending responses: one-shot correlators for awaited replies
//!
//! A caller that needs the reply to an outbound message registers the
//! message id here *before* sending, then awaits. An inbound message whose
//! `requestId` matches resolves the waiter; otherwise the deadline or hub
//! shutdown rejects it. Never silently discards a waiter.

use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::{HubError, HubResult};
use crate::message::Message;

type Filter = Box<dyn Fn(&Message) -> bool + Send + Sync>;

struct Waiter {
    tx: oneshot::Sender<Message>,
    filter: Option<Filter>,
}

/// An armed waiter. The table entry exists from the moment this is created,
/// so the reply to a message sent right after registration cannot be lost.
pub struct ResponseWaiter<'a> {
    table: &'a PendingResponseTable,
    message_id: Uuid,
    rx: oneshot::Receiver<Message>,
}

impl ResponseWaiter<'_> {
    /// Await the reply, bounded by `timeout` and by hub shutdown.
    pub async fn wait(self, timeout: Duration) -> HubResult<Message> {
        let ResponseWaiter {
            table,
            message_id,
            rx,
        } = self;
        let outcome = tokio::select! {
            received = rx => received.map_err(|_| HubError::Shutdown),
            _ = tokio::time::sleep(timeout) => Err(HubError::Timeout),
            _ = table.shutdown.cancelled() => Err(HubError::Shutdown),
        };
        if outcome.is_err() {
            table.waiters.remove(&message_id);
        }
        outcome
    }
}

/// Table of in-flight waiters keyed by outbound message id.
pub struct PendingResponseTable {
    waiters: DashMap<Uuid, Waiter>,
    shutdown: CancellationToken,
}

impl PendingResponseTable {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            waiters: DashMap::new(),
            shutdown,
        }
    }

    /// Arm a waiter for the reply to `message_id`.
    ///
    /// At most one waiter per message id: a second registration replaces the
    /// first, which then observes a closed channel.
    pub fn register(&self, message_id: Uuid) -> ResponseWaiter<'_> {
        self.register_inner(message_id, None)
    }

    /// Arm a waiter that only accepts replies passing `filter`; others leave
    /// it in place.
    pub fn register_matching(
        &self,
        message_id: Uuid,
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> ResponseWaiter<'_> {
        self.register_inner(message_id, Some(Box::new(filter)))
    }

    fn register_inner(&self, message_id: Uuid, filter: Option<Filter>) -> ResponseWaiter<'_> {
        let (tx, rx) = oneshot::channel();
        if self
            .waiters
            .insert(message_id, Waiter { tx, filter })
            .is_some()
        {
            warn!(message = %message_id, "replacing existing response waiter");
        }
        ResponseWaiter {
            table: self,
            message_id,
            rx,
        }
    }

    /// Register-and-wait in one step, for callers that sent the request
    /// through a path that cannot race the reply.
    pub async fn await_response(&self, message_id: Uuid, timeout: Duration) -> HubResult<Message> {
        self.register(message_id).wait(timeout).await
    }

    /// Offer an inbound message to the table.
    ///
    /// Returns true when a waiter consumed it. A message without `requestId`,
    /// or one rejected by the waiter's filter, resolves nothing.
    pub fn resolve(&self, msg: &Message) -> bool {
        let Some(request_id) = msg.request_id else {
            return false;
        };
        let Some((_, waiter)) = self.waiters.remove_if(&request_id, |_, waiter| {
            waiter.filter.as_ref().is_none_or(|accept| accept(msg))
        }) else {
            return false;
        };
        waiter.tx.send(msg.clone()).is_ok()
    }

    /// Number of in-flight waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
