use crate::ident::PeerId;
use crate::transport::broker::{
    Acker, Consumer, ConsumerTag, Delivery, Exchange, Message, Queue, Settle, Transport, TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// MemoryBroker is a complete in-process implementation of [`Transport`].
///
/// It exists so that a single-process deployment and the test suite need no
/// broker daemon, while still exercising the full delivery semantics: FIFO
/// queues, per-consumer pre-fetch, balanced sharing, multicast bindings, and
/// requeue of unacknowledged deliveries.
///
/// Each queue runs as its own event-loop task; acknowledgements are events
/// sent back to the owning queue, never callbacks into shared state.
pub struct MemoryBroker {
    logger: slog::Logger,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_tag: u64,
    queues: HashMap<Queue, QueueHandle>,
    registered: HashSet<PeerId>,
    multicast_bindings: HashMap<String, HashSet<PeerId>>,
    notification_bindings: HashMap<String, HashSet<PeerId>>,
    // tag -> the queue task that owns the consumer
    consumers: HashMap<ConsumerTag, mpsc::UnboundedSender<QueueEvent>>,
}

#[derive(Clone)]
struct QueueHandle {
    events: mpsc::UnboundedSender<QueueEvent>,
}

struct Envelope {
    exchange: Exchange,
    routing_key: String,
    message: Message,
    deadline: Option<Instant>,
}

enum QueueEvent {
    Publish(Envelope),
    Subscribe(ConsumerSlot),
    Cancel(ConsumerTag),
    /// A delivery was settled. `requeue` carries the envelope back when the
    /// consumer rejected it with requeue (or dropped it undecided).
    Settled { requeue: Option<Envelope> },
    Shutdown,
}

struct ConsumerSlot {
    tag: ConsumerTag,
    tx: mpsc::UnboundedSender<Delivery>,
    // None means unbounded pre-fetch
    permits: Option<Arc<Semaphore>>,
}

impl MemoryBroker {
    pub fn new(logger: slog::Logger) -> Arc<Self> {
        Arc::new(MemoryBroker {
            logger,
            state: Mutex::new(State::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory broker state mutex poison")
    }

    /// Returns the handle for queue, spawning its task if it does not exist.
    fn ensure_queue(&self, state: &mut State, queue: Queue) -> QueueHandle {
        if let Some(handle) = state.queues.get(&queue) {
            return handle.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = QueueHandle { events: tx.clone() };
        state.queues.insert(queue.clone(), handle.clone());

        let task = QueueTask {
            logger: self.logger.clone(),
            events_tx: tx,
            backlog: VecDeque::new(),
            consumers: Vec::new(),
            rr_next: 0,
        };
        tokio::spawn(task.run(rx));

        handle
    }

    fn peer_queues(peer: PeerId) -> [Queue; 3] {
        [Queue::Request(peer), Queue::Response(peer), Queue::Notification(peer)]
    }

    /// Resolves the queues a publish lands on. Private queues of unknown
    /// peers are unroutable; the message is dropped, as a broker drops
    /// messages with no bound queue.
    fn route(&self, state: &mut State, exchange: Exchange, routing_key: &str) -> Vec<QueueHandle> {
        match exchange {
            Exchange::Unicast => Self::private_queue(state, routing_key, Queue::Request),
            Exchange::Response => Self::private_queue(state, routing_key, Queue::Response),
            Exchange::NotifyUnicast => Self::private_queue(state, routing_key, Queue::Notification),
            Exchange::Balanced => {
                vec![self.ensure_queue(state, Queue::Balanced(routing_key.to_string()))]
            }
            Exchange::Multicast => {
                let peers = state.multicast_bindings.get(routing_key).cloned().unwrap_or_default();
                peers
                    .into_iter()
                    .filter_map(|peer| state.queues.get(&Queue::Request(peer)).cloned())
                    .collect()
            }
            Exchange::NotifyMulticast => {
                let peers = state.notification_bindings.get(routing_key).cloned().unwrap_or_default();
                peers
                    .into_iter()
                    .filter_map(|peer| state.queues.get(&Queue::Notification(peer)).cloned())
                    .collect()
            }
        }
    }

    fn private_queue(state: &State, routing_key: &str, make: fn(PeerId) -> Queue) -> Vec<QueueHandle> {
        match routing_key.parse::<PeerId>() {
            Ok(peer) if state.registered.contains(&peer) => {
                state.queues.get(&make(peer)).cloned().into_iter().collect()
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn register_peer(&self, peer: PeerId) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.registered.insert(peer);
        for queue in Self::peer_queues(peer) {
            self.ensure_queue(&mut state, queue);
        }
        Ok(())
    }

    async fn deregister_peer(&self, peer: PeerId) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.registered.remove(&peer);

        for queue in Self::peer_queues(peer) {
            if let Some(handle) = state.queues.remove(&queue) {
                let _ = handle.events.send(QueueEvent::Shutdown);
            }
        }

        for peers in state.multicast_bindings.values_mut() {
            peers.remove(&peer);
        }
        for peers in state.notification_bindings.values_mut() {
            peers.remove(&peer);
        }

        Ok(())
    }

    async fn publish(&self, exchange: Exchange, routing_key: &str, message: Message) -> Result<(), TransportError> {
        let deadline = message.expiration.map(|ttl| Instant::now() + ttl);

        let targets = {
            let mut state = self.lock();
            self.route(&mut state, exchange, routing_key)
        };

        if targets.is_empty() {
            slog::debug!(
                self.logger,
                "message {} via {:?} exchange is unroutable, dropped",
                message.id,
                exchange
            );
            return Ok(());
        }

        for target in targets {
            let _ = target.events.send(QueueEvent::Publish(Envelope {
                exchange,
                routing_key: routing_key.to_string(),
                message: message.clone(),
                deadline,
            }));
        }

        Ok(())
    }

    async fn consume(&self, queue: Queue, pre_fetch: usize) -> Result<Consumer, TransportError> {
        let mut state = self.lock();

        if let Queue::Request(peer) | Queue::Response(peer) | Queue::Notification(peer) = &queue {
            if !state.registered.contains(peer) {
                return Err(TransportError::NotRegistered(*peer));
            }
        }

        let handle = self.ensure_queue(&mut state, queue);

        state.next_tag += 1;
        let tag = ConsumerTag(state.next_tag);
        state.consumers.insert(tag, handle.events.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let permits = match pre_fetch {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        let _ = handle.events.send(QueueEvent::Subscribe(ConsumerSlot { tag, tx, permits }));

        Ok(Consumer { deliveries: rx, tag })
    }

    async fn cancel(&self, tag: ConsumerTag) -> Result<(), TransportError> {
        let events = {
            let mut state = self.lock();
            state.consumers.remove(&tag)
        };

        match events {
            Some(events) => {
                let _ = events.send(QueueEvent::Cancel(tag));
                Ok(())
            }
            None => Err(TransportError::UnknownConsumer),
        }
    }

    async fn bind_multicast(&self, peer: PeerId, ns: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.registered.contains(&peer) {
            return Err(TransportError::NotRegistered(peer));
        }
        state.multicast_bindings.entry(ns.to_string()).or_default().insert(peer);
        Ok(())
    }

    async fn unbind_multicast(&self, peer: PeerId, ns: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if let Some(peers) = state.multicast_bindings.get_mut(ns) {
            peers.remove(&peer);
        }
        Ok(())
    }

    async fn bind_notifications(&self, peer: PeerId, ns: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.registered.contains(&peer) {
            return Err(TransportError::NotRegistered(peer));
        }
        state.notification_bindings.entry(ns.to_string()).or_default().insert(peer);
        Ok(())
    }

    async fn unbind_notifications(&self, peer: PeerId, ns: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if let Some(peers) = state.notification_bindings.get_mut(ns) {
            peers.remove(&peer);
        }
        Ok(())
    }
}

/// QueueTask owns one queue's backlog and consumers.
struct QueueTask {
    logger: slog::Logger,
    events_tx: mpsc::UnboundedSender<QueueEvent>,
    backlog: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    rr_next: usize,
}

impl QueueTask {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<QueueEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                QueueEvent::Publish(envelope) => self.backlog.push_back(envelope),
                QueueEvent::Subscribe(slot) => self.consumers.push(slot),
                QueueEvent::Cancel(tag) => self.consumers.retain(|slot| slot.tag != tag),
                QueueEvent::Settled { requeue } => {
                    if let Some(envelope) = requeue {
                        self.backlog.push_front(envelope);
                    }
                }
                QueueEvent::Shutdown => return,
            }

            self.pump();
        }
    }

    /// Hands backlogged messages to consumers with spare pre-fetch capacity.
    fn pump(&mut self) {
        while !self.backlog.is_empty() {
            // Messages whose TTL elapsed while queued are dropped, as a
            // broker expires them.
            if matches!(self.backlog.front(), Some(e) if expired(e)) {
                if let Some(envelope) = self.backlog.pop_front() {
                    slog::debug!(self.logger, "message {} expired in queue, dropped", envelope.message.id);
                }
                continue;
            }

            let chosen = self.choose_consumer();
            let (index, permit) = match chosen {
                Some(c) => c,
                None => return,
            };
            self.rr_next = (index + 1) % self.consumers.len();

            let envelope = match self.backlog.pop_front() {
                Some(envelope) => envelope,
                None => return,
            };

            let delivery = Delivery {
                exchange: envelope.exchange,
                routing_key: envelope.routing_key.clone(),
                message: envelope.message.clone(),
                deadline: envelope.deadline,
                acker: Some(Box::new(MemoryAcker {
                    events: self.events_tx.clone(),
                    envelope: Some(envelope),
                    permit,
                })),
            };

            if self.consumers[index].tx.send(delivery).is_err() {
                // The consumer was dropped without cancelling. The failed
                // delivery's drop settles it back to us as a requeue; forget
                // the consumer and keep pumping.
                self.consumers.remove(index);
            }
        }
    }

    fn choose_consumer(&self) -> Option<(usize, Option<OwnedSemaphorePermit>)> {
        let count = self.consumers.len();
        if count == 0 {
            return None;
        }
        for offset in 0..count {
            let index = (self.rr_next + offset) % count;
            match &self.consumers[index].permits {
                None => return Some((index, None)),
                Some(semaphore) => {
                    if let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() {
                        return Some((index, Some(permit)));
                    }
                }
            }
        }
        None
    }
}

fn expired(envelope: &Envelope) -> bool {
    matches!(envelope.deadline, Some(d) if d <= Instant::now())
}

struct MemoryAcker {
    events: mpsc::UnboundedSender<QueueEvent>,
    envelope: Option<Envelope>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Acker for MemoryAcker {
    fn settle(mut self: Box<Self>, settle: Settle) {
        drop(self.permit.take());

        let requeue = match settle {
            Settle::Requeue => self.envelope.take(),
            Settle::Ack | Settle::Drop => None,
        };

        let _ = self.events.send(QueueEvent::Settled { requeue });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn broker() -> Arc<MemoryBroker> {
        MemoryBroker::new(slog::Logger::root(slog::Discard, slog::o!()))
    }

    fn message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            kind: "test".to_string(),
            payload: Bytes::from_static(b"payload"),
            ..Message::default()
        }
    }

    async fn recv(consumer: &mut Consumer) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), consumer.next())
            .await
            .expect("timed out waiting for delivery")
            .expect("consumer channel closed")
    }

    async fn assert_no_delivery(consumer: &mut Consumer) {
        let result = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(result.is_err(), "expected no delivery");
    }

    #[tokio::test]
    async fn unicast_reaches_the_addressed_peer_only() {
        let broker = broker();
        let p1 = PeerId::new(1, 1);
        let p2 = PeerId::new(1, 2);
        broker.register_peer(p1).await.unwrap();
        broker.register_peer(p2).await.unwrap();

        let mut c1 = broker.consume(Queue::Request(p1), 0).await.unwrap();
        let mut c2 = broker.consume(Queue::Request(p2), 0).await.unwrap();

        broker
            .publish(Exchange::Unicast, &p1.to_string(), message("m1"))
            .await
            .unwrap();

        let delivery = recv(&mut c1).await;
        assert_eq!(delivery.message.id, "m1");
        delivery.ack();

        assert_no_delivery(&mut c2).await;
    }

    #[tokio::test]
    async fn pre_fetch_bounds_outstanding_deliveries_per_consumer() {
        let broker = broker();
        let peer = PeerId::new(1, 1);
        broker.register_peer(peer).await.unwrap();

        let mut consumer = broker.consume(Queue::Request(peer), 1).await.unwrap();

        for id in ["m1", "m2"] {
            broker
                .publish(Exchange::Unicast, &peer.to_string(), message(id))
                .await
                .unwrap();
        }

        let first = recv(&mut consumer).await;
        assert_eq!(first.message.id, "m1");

        // The second delivery must wait for the first to be settled.
        assert_no_delivery(&mut consumer).await;

        first.ack();
        let second = recv(&mut consumer).await;
        assert_eq!(second.message.id, "m2");
        second.ack();
    }

    #[tokio::test]
    async fn reject_with_requeue_redelivers() {
        let broker = broker();
        let peer = PeerId::new(1, 1);
        broker.register_peer(peer).await.unwrap();

        let mut consumer = broker.consume(Queue::Request(peer), 1).await.unwrap();
        broker
            .publish(Exchange::Unicast, &peer.to_string(), message("m1"))
            .await
            .unwrap();

        recv(&mut consumer).await.reject(true);

        let redelivered = recv(&mut consumer).await;
        assert_eq!(redelivered.message.id, "m1");
        redelivered.reject(false);

        assert_no_delivery(&mut consumer).await;
    }

    #[tokio::test]
    async fn dropping_a_delivery_undecided_requeues_it() {
        let broker = broker();
        let peer = PeerId::new(1, 1);
        broker.register_peer(peer).await.unwrap();

        let mut consumer = broker.consume(Queue::Request(peer), 1).await.unwrap();
        broker
            .publish(Exchange::Unicast, &peer.to_string(), message("m1"))
            .await
            .unwrap();

        let delivery = recv(&mut consumer).await;
        drop(delivery);

        let redelivered = recv(&mut consumer).await;
        assert_eq!(redelivered.message.id, "m1");
        redelivered.ack();
    }

    #[tokio::test]
    async fn balanced_delivery_moves_to_remaining_consumer_after_cancel() {
        let broker = broker();
        let p1 = PeerId::new(1, 1);
        let p2 = PeerId::new(1, 2);
        broker.register_peer(p1).await.unwrap();
        broker.register_peer(p2).await.unwrap();

        let mut c1 = broker.consume(Queue::Balanced("ns".to_string()), 1).await.unwrap();
        broker.publish(Exchange::Balanced, "ns", message("m1")).await.unwrap();

        // c1 holds the only copy, pre-fetched but unsettled.
        let held = recv(&mut c1).await;

        let mut c2 = broker.consume(Queue::Balanced("ns".to_string()), 1).await.unwrap();
        broker.cancel(c1.tag()).await.unwrap();

        // c1 rejects as a no-longer-listening peer would; c2 must receive it.
        held.reject(true);

        let delivery = recv(&mut c2).await;
        assert_eq!(delivery.message.id, "m1");
        delivery.ack();
    }

    #[tokio::test]
    async fn multicast_reaches_every_bound_peer() {
        let broker = broker();
        let p1 = PeerId::new(1, 1);
        let p2 = PeerId::new(1, 2);
        let p3 = PeerId::new(1, 3);
        for p in [p1, p2, p3] {
            broker.register_peer(p).await.unwrap();
        }
        broker.bind_multicast(p1, "ns").await.unwrap();
        broker.bind_multicast(p2, "ns").await.unwrap();

        let mut c1 = broker.consume(Queue::Request(p1), 0).await.unwrap();
        let mut c2 = broker.consume(Queue::Request(p2), 0).await.unwrap();
        let mut c3 = broker.consume(Queue::Request(p3), 0).await.unwrap();

        broker.publish(Exchange::Multicast, "ns", message("m1")).await.unwrap();

        recv(&mut c1).await.ack();
        recv(&mut c2).await.ack();
        assert_no_delivery(&mut c3).await;
    }

    #[tokio::test]
    async fn expired_messages_are_not_delivered() {
        let broker = broker();
        let peer = PeerId::new(1, 1);
        broker.register_peer(peer).await.unwrap();

        let mut expiring = message("m1");
        expiring.expiration = Some(Duration::from_millis(20));
        broker
            .publish(Exchange::Unicast, &peer.to_string(), expiring)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut consumer = broker.consume(Queue::Request(peer), 0).await.unwrap();
        broker
            .publish(Exchange::Unicast, &peer.to_string(), message("m2"))
            .await
            .unwrap();

        // m1 expired while queued; m2 arrives first and only.
        let delivery = recv(&mut consumer).await;
        assert_eq!(delivery.message.id, "m2");
        delivery.ack();
        assert_no_delivery(&mut consumer).await;
    }
}
