use crate::attributes::Constraint;
use crate::ident::PeerId;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Exchange identifies the routing discipline a message is published with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exchange {
    /// Direct; the routing key is the destination peer ID.
    Unicast,
    /// Direct; one per-namespace queue shared by every listening peer.
    Balanced,
    /// Fanout keyed on namespace; a copy reaches every bound peer.
    Multicast,
    /// Direct; the routing key is the caller's private response queue.
    Response,
    /// Direct; the routing key is the target session's peer.
    NotifyUnicast,
    /// Fanout keyed on namespace over the notification bindings.
    NotifyMulticast,
}

/// Queue identifies a consumable message source.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Queue {
    /// A peer's private command request queue. Receives unicast requests and
    /// multicast copies for every namespace the peer is bound to.
    Request(PeerId),
    /// The per-namespace queue shared by all peers listening on a namespace.
    Balanced(String),
    /// A peer's private response queue.
    Response(PeerId),
    /// A peer's private notification queue.
    Notification(PeerId),
}

/// Outcome distinguishes the three kinds of command response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success,
    /// An application-defined failure; the payload travels in the message
    /// body as for a success.
    Failure { failure_type: String, message: String },
    /// A server-side error, opaque to the caller.
    Error { message: String },
}

/// Message is the broker-agnostic wire unit: routing metadata plus an opaque
/// payload.
#[derive(Clone, Debug, Default)]
pub struct Message {
    /// Textual MessageId. Doubles as the correlation ID for responses.
    pub id: String,
    /// Command name or notification type. Empty on responses.
    pub kind: String,
    /// Namespace header. Set on unicast requests, whose routing key
    /// addresses the peer instead of the namespace.
    pub namespace: Option<String>,
    /// The caller's response queue; present exactly when a response is
    /// required.
    pub reply_to: Option<String>,
    /// Trace ID propagated across the call chain.
    pub trace_id: Option<String>,
    /// Time-to-live measured from publish.
    pub expiration: Option<Duration>,
    /// Target session for unicast notifications.
    pub target: Option<String>,
    /// Constraint header for multicast notifications.
    pub constraint: Option<Constraint>,
    /// Response outcome; None on requests and notifications.
    pub outcome: Option<Outcome>,
    /// Self-identification of the producing application.
    pub app_id: Option<String>,
    pub payload: Bytes,
}

/// ConsumerTag identifies one consumer so it can be cancelled.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConsumerTag(pub(crate) u64);

/// Consumer is one subscription to a queue.
///
/// Dropping the consumer without cancelling it is treated as a lost
/// subscriber: undelivered messages stay in the queue and unacknowledged
/// deliveries are requeued.
pub struct Consumer {
    pub(crate) deliveries: mpsc::UnboundedReceiver<Delivery>,
    pub(crate) tag: ConsumerTag,
}

impl Consumer {
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    pub fn tag(&self) -> ConsumerTag {
        self.tag
    }
}

/// Delivery is one message handed to a consumer. It must be settled with
/// [`Delivery::ack`] or [`Delivery::reject`]; a delivery dropped undecided is
/// requeued, which is what a real broker does when a consumer dies.
pub struct Delivery {
    pub exchange: Exchange,
    pub routing_key: String,
    pub message: Message,
    /// Absolute deadline stamped by the broker from the message expiration.
    pub deadline: Option<Instant>,
    pub(crate) acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.settle(Settle::Ack);
        }
    }

    pub fn reject(mut self, requeue: bool) {
        if let Some(acker) = self.acker.take() {
            acker.settle(if requeue { Settle::Requeue } else { Settle::Drop });
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if d <= Instant::now())
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.settle(Settle::Requeue);
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Settle {
    Ack,
    Requeue,
    Drop,
}

pub(crate) trait Acker: Send + Sync {
    fn settle(self: Box<Self>, settle: Settle);
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("peer {0} is not registered with the broker")]
    NotRegistered(PeerId),
    #[error("unknown consumer")]
    UnknownConsumer,
}

/// Transport is the broker the bus runs over.
///
/// The crate ships [`super::MemoryBroker`] for in-process use and tests; a
/// production deployment implements this trait over a real broker with the
/// same exchange topology.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declares a peer's private queues. Must be called before the peer
    /// publishes or consumes.
    async fn register_peer(&self, peer: PeerId) -> Result<(), TransportError>;

    /// Removes a peer's private queues and notification/multicast bindings.
    async fn deregister_peer(&self, peer: PeerId) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: Exchange,
        routing_key: &str,
        message: Message,
    ) -> Result<(), TransportError>;

    /// Opens a consumer with the given pre-fetch. Pre-fetch bounds the
    /// number of unacknowledged deliveries outstanding on this consumer;
    /// zero means unbounded. The bound is per-consumer.
    async fn consume(&self, queue: Queue, pre_fetch: usize) -> Result<Consumer, TransportError>;

    /// Stops delivering to the given consumer. Deliveries already buffered
    /// remain to be drained and settled by the consumer's owner.
    async fn cancel(&self, tag: ConsumerTag) -> Result<(), TransportError>;

    /// Binds the peer's request queue to a namespace on the multicast
    /// exchange.
    async fn bind_multicast(&self, peer: PeerId, ns: &str) -> Result<(), TransportError>;

    async fn unbind_multicast(&self, peer: PeerId, ns: &str) -> Result<(), TransportError>;

    /// Binds the peer's notification queue to a namespace on the
    /// notification multicast exchange.
    async fn bind_notifications(&self, peer: PeerId, ns: &str) -> Result<(), TransportError>;

    async fn unbind_notifications(&self, peer: PeerId, ns: &str) -> Result<(), TransportError>;
}
