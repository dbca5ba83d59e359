//! Publish/subscribe fanout of parsed packet records.
//!
//! The ingress path publishes each TCP/UDP record to every current
//! subscriber. Two subscription styles are supported:
//!
//! - push: a [`PacketConsumer`] callback invoked synchronously in the
//!   ingress path; a panicking consumer is logged and suppressed
//! - pull: a [`PacketStream`] backed by a private unbounded FIFO, ended
//!   when the hub closes
//!
//! All publishes happen from the single ingress task, so every subscriber
//! observes records in the same order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::warn;

use crate::demux::PacketRecord;

/// Push-style packet subscriber.
pub trait PacketConsumer: Send + Sync {
    /// Called once per parsed TCP/UDP datagram, in arrival order.
    fn on_packet(&self, record: &PacketRecord);
}

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct HubInner {
    consumers: Vec<(u64, Arc<dyn PacketConsumer>)>,
    next_id: u64,
    closed: bool,
}

/// Fanout hub owned by a tunnel session. Clones share the subscriber
/// list.
#[derive(Clone)]
pub struct PacketHub {
    inner: Arc<Mutex<HubInner>>,
}

impl Default for PacketHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                consumers: Vec::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    /// Register a push consumer. Inert if the hub is already closed.
    pub fn subscribe(&self, consumer: Arc<dyn PacketConsumer>) -> SubscriptionId {
        let mut inner = self.inner.lock().expect("hub lock");
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.consumers.push((id, consumer));
        }
        SubscriptionId(id)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().expect("hub lock");
        let before = inner.consumers.len();
        inner.consumers.retain(|(cid, _)| *cid != id.0);
        inner.consumers.len() != before
    }

    /// Create a pull-style stream of packet records.
    ///
    /// The stream's queue is unbounded; a slow consumer grows memory. The
    /// stream terminates when the hub closes or the stream is dropped.
    pub fn packet_stream(&self) -> PacketStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(Arc::new(StreamConsumer { tx }));
        PacketStream {
            rx,
            hub: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver a record to every current subscriber.
    pub fn publish(&self, record: &PacketRecord) {
        // Snapshot under the lock, call outside it: a consumer may
        // subscribe or unsubscribe from its own callback.
        let consumers: Vec<Arc<dyn PacketConsumer>> = {
            let inner = self.inner.lock().expect("hub lock");
            if inner.closed {
                return;
            }
            inner.consumers.iter().map(|(_, c)| Arc::clone(c)).collect()
        };

        for consumer in consumers {
            let result = catch_unwind(AssertUnwindSafe(|| consumer.on_packet(record)));
            if result.is_err() {
                warn!("packet consumer panicked; suppressed");
            }
        }
    }

    /// Drop all subscribers and refuse further deliveries.
    ///
    /// Dropping the internal stream senders ends every [`PacketStream`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("hub lock");
        inner.closed = true;
        inner.consumers.clear();
    }

    /// Number of live subscriptions.
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().expect("hub lock").consumers.len()
    }
}

/// Internal consumer bridging publishes into a stream queue.
struct StreamConsumer {
    tx: mpsc::UnboundedSender<PacketRecord>,
}

impl PacketConsumer for StreamConsumer {
    fn on_packet(&self, record: &PacketRecord) {
        // A dropped stream is unsubscribed lazily; ignore send failures.
        let _ = self.tx.send(record.clone());
    }
}

/// Pull-style asynchronous sequence of packet records.
pub struct PacketStream {
    rx: mpsc::UnboundedReceiver<PacketRecord>,
    hub: Weak<Mutex<HubInner>>,
    id: SubscriptionId,
}

impl PacketStream {
    /// Next record in arrival order; `None` once the hub has closed.
    pub async fn next(&mut self) -> Option<PacketRecord> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<PacketRecord> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PacketStream {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            let mut inner = inner.lock().expect("hub lock");
            inner.consumers.retain(|(cid, _)| *cid != self.id.0);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
