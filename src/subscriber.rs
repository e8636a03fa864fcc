//! Subscriber handles: the transport's capability to reach one consumer.
//!
//! A handle is cheap to clone. Every clone shares the same outbound channel,
//! so a queue can hold one while the transport keeps the receiving side.
//! Dropping the receiver is how a connection ends.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::model::Outbound;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl SubscriberId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

impl Serialize for SubscriberId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A connected consumer as seen by a queue.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: SubscriberId,
    capacity: Option<u32>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SubscriberHandle {
    pub fn new(id: SubscriberId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            capacity: None,
            tx,
        }
    }

    /// Create a handle with a fresh id together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(SubscriberId::next(), tx), rx)
    }

    /// Same connection, declaring its own delivery credit. Zero means
    /// "use the queue default".
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = (capacity > 0).then_some(capacity);
        self
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }

    /// Deliver one message. Fails only when the connection is gone.
    pub fn push(&self, message: Outbound) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::SubscriberGone(self.id))
    }

    /// Resolves once the connection has ended, whether cleanly or not.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
