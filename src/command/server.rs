use crate::api::{Context, Error};
use crate::catalog::RevisionStore;
use crate::command::request::{CommandHandler, Request};
use crate::command::response::Responder;
use crate::ident::{MessageId, PeerId};
use crate::peer::shutdown::{Stop, TaskGauge};
use crate::transport::{Consumer, ConsumerTag, Delivery, Exchange, Message, Outcome, Queue, Transport, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Server is the dispatch side of the command RPC runtime.
///
/// One server per peer owns three kinds of inbound consumer: the peer's
/// private request queue (unicast requests and multicast copies), and one
/// balanced queue consumer per namespace the peer is listening to. Pre-fetch
/// applies per-consumer, so a slow namespace can not starve the others.
pub struct Server {
    peer_id: PeerId,
    transport: Arc<dyn Transport>,
    revisions: Arc<dyn RevisionStore>,
    logger: slog::Logger,
    pre_fetch: usize,
    product: Option<String>,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    balanced: Mutex<HashMap<String, ConsumerTag>>,
    request_tag: ConsumerTag,
    // Serializes listen/unlisten so binding and consuming stay consistent.
    setup: tokio::sync::Mutex<()>,
    gauge: TaskGauge,
    stop: Stop,
    faults: mpsc::UnboundedSender<Error>,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        peer_id: PeerId,
        transport: Arc<dyn Transport>,
        revisions: Arc<dyn RevisionStore>,
        pre_fetch: usize,
        product: Option<String>,
        stop: Stop,
        faults: mpsc::UnboundedSender<Error>,
        logger: slog::Logger,
    ) -> Result<Arc<Server>, TransportError> {
        let consumer = transport.consume(Queue::Request(peer_id), pre_fetch).await?;

        let server = Arc::new(Server {
            peer_id,
            transport,
            revisions,
            logger,
            pre_fetch,
            product,
            handlers: RwLock::new(HashMap::new()),
            balanced: Mutex::new(HashMap::new()),
            request_tag: consumer.tag(),
            setup: tokio::sync::Mutex::new(()),
            gauge: TaskGauge::new(),
            stop,
            faults,
        });

        tokio::spawn(Arc::clone(&server).dispatch_each(consumer));

        slog::debug!(
            server.logger,
            "{} command server started with pre-fetch of {} message(s)",
            peer_id.short_string(),
            pre_fetch
        );

        Ok(server)
    }

    /// Installs or replaces the handler for ns. When newly installed, binds
    /// the peer's request queue to ns on the multicast exchange and joins
    /// the per-namespace balanced queue. Returns true if this was the first
    /// listener for the namespace.
    pub async fn listen(self: &Arc<Self>, ns: &str, handler: Arc<dyn CommandHandler>) -> Result<bool, TransportError> {
        let _setup = self.setup.lock().await;

        {
            let mut handlers = self.lock_handlers_write();
            if let Some(existing) = handlers.get_mut(ns) {
                *existing = handler;
                return Ok(false);
            }
        }

        self.transport.bind_multicast(self.peer_id, ns).await?;
        let consumer = self.transport.consume(Queue::Balanced(ns.to_string()), self.pre_fetch).await?;

        self.lock_balanced().insert(ns.to_string(), consumer.tag());
        self.lock_handlers_write().insert(ns.to_string(), handler);

        tokio::spawn(Arc::clone(self).dispatch_each(consumer));

        Ok(true)
    }

    /// Removes the handler for ns, unbinds from the multicast exchange and
    /// cancels the balanced consumer. Deliveries already pre-fetched are
    /// drained through dispatch, which requeues them now that the handler
    /// is gone. Returns false if the peer was not listening.
    pub async fn unlisten(&self, ns: &str) -> Result<bool, TransportError> {
        let _setup = self.setup.lock().await;

        if self.lock_handlers_write().remove(ns).is_none() {
            return Ok(false);
        }

        self.transport.unbind_multicast(self.peer_id, ns).await?;

        let tag = self.lock_balanced().remove(ns);
        if let Some(tag) = tag {
            self.transport.cancel(tag).await?;
        }

        Ok(true)
    }

    /// Cancels every inbound consumer. In-flight dispatches continue.
    pub async fn stop_consuming(&self) {
        slog::debug!(self.logger, "{} command server is stopping", self.peer_id.short_string());

        let _ = self.transport.cancel(self.request_tag).await;

        let tags: Vec<ConsumerTag> = self.lock_balanced().drain().map(|(_, tag)| tag).collect();
        for tag in tags {
            let _ = self.transport.cancel(tag).await;
        }
    }

    /// Waits for in-flight dispatches to settle.
    pub async fn drain(&self) {
        self.gauge.wait_idle().await
    }

    async fn dispatch_each(self: Arc<Self>, mut consumer: Consumer) {
        while let Some(delivery) = consumer.next().await {
            tokio::spawn(Arc::clone(&self).dispatch(delivery));
        }
    }

    /// The per-delivery state machine. Reject-with-requeue happens in
    /// exactly two places: a balanced/multicast request with no handler, and
    /// a balanced request whose handler returned without responding.
    async fn dispatch(self: Arc<Self>, delivery: Delivery) {
        let _guard = self.gauge.enter();

        // Settling methods consume the delivery, so work on a copy of the
        // message. Payload bytes are reference counted.
        let message = delivery.message.clone();

        let msg_id: MessageId = match message.id.parse() {
            Ok(id) => id,
            Err(_) => {
                slog::warn!(
                    self.logger,
                    "{} command server ignored message, '{}' is not a valid message ID",
                    self.peer_id.short_string(),
                    message.id
                );
                delivery.reject(false);
                return;
            }
        };

        let namespace = match delivery.exchange {
            Exchange::Balanced | Exchange::Multicast => delivery.routing_key.clone(),
            Exchange::Unicast => match &message.namespace {
                Some(ns) => ns.clone(),
                None => {
                    slog::warn!(
                        self.logger,
                        "{} command server ignored message {}, namespace header is missing",
                        self.peer_id.short_string(),
                        msg_id.short_string()
                    );
                    delivery.reject(false);
                    return;
                }
            },
            other => {
                slog::warn!(
                    self.logger,
                    "{} command server ignored message {}, delivery via {:?} exchange is not expected",
                    self.peer_id.short_string(),
                    msg_id.short_string(),
                    other
                );
                delivery.reject(false);
                return;
            }
        };

        let handler = self.lock_handlers_read().get(&namespace).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => {
                if matches!(delivery.exchange, Exchange::Balanced | Exchange::Multicast) {
                    // The request was pre-fetched before unlisten; another
                    // peer may still be subscribed.
                    slog::debug!(
                        self.logger,
                        "{} is no longer listening to '{}' namespace, request {} has been re-queued",
                        self.peer_id.short_string(),
                        namespace,
                        msg_id.short_string()
                    );
                    delivery.reject(true);
                } else {
                    slog::debug!(
                        self.logger,
                        "{} is not listening to '{}' namespace, request {} has been abandoned",
                        self.peer_id.short_string(),
                        namespace,
                        msg_id.short_string()
                    );
                    delivery.reject(false);
                }
                return;
            }
        };

        if delivery.is_expired() {
            slog::debug!(
                self.logger,
                "{} command server ignored request {}, its deadline has already passed",
                self.peer_id.short_string(),
                msg_id.short_string()
            );
            delivery.reject(false);
            return;
        }

        let source = match self.revisions.get_revision(msg_id.session()).await {
            Ok(source) => source,
            Err(err) => {
                slog::debug!(
                    self.logger,
                    "{} command server ignored request {}, {}",
                    self.peer_id.short_string(),
                    msg_id.short_string(),
                    err
                );
                delivery.reject(false);
                return;
            }
        };

        let mut ctx = Context::background()
            .with_trace_id(message.trace_id.clone().unwrap_or_else(|| message.id.clone()));
        if let Some(deadline) = delivery.deadline {
            ctx = ctx.with_deadline(deadline);
        }

        let request = Request {
            source,
            namespace: namespace.clone(),
            command: message.kind.clone(),
            payload: message.payload.clone(),
            is_multicast: delivery.exchange == Exchange::Multicast,
        };

        let closed = Arc::new(AtomicBool::new(false));
        let responder = Responder::new(
            Arc::clone(&self.transport),
            self.logger.clone(),
            message.reply_to.clone(),
            message.id.clone(),
            namespace.clone(),
            message.kind.clone(),
            message.trace_id.clone(),
            self.product.clone(),
            Arc::clone(&closed),
            self.faults.clone(),
        );

        slog::debug!(
            self.logger,
            "{} began '{}::{}' command request {} ({}/i)",
            self.peer_id.short_string(),
            namespace,
            message.kind,
            msg_id.short_string(),
            message.payload.len()
        );

        let handler_ctx = ctx.clone();
        let mut handler_task = tokio::spawn(async move { handler.handle(handler_ctx, request, responder).await });

        tokio::select! {
            joined = &mut handler_task => {
                if let Err(join_err) = joined {
                    if join_err.is_panic() {
                        slog::error!(
                            self.logger,
                            "{} handler for '{}::{}' command request {} panicked",
                            self.peer_id.short_string(),
                            namespace,
                            message.kind,
                            msg_id.short_string()
                        );
                        if !closed.load(Ordering::Acquire) {
                            self.respond_with_error(&message).await;
                            closed.store(true, Ordering::Release);
                        }
                    }
                }
            }
            _ = self.stop.wait() => {
                // Immediate shutdown: abandon the handler. Dropping the
                // delivery undecided sends it back to the queue.
                handler_task.abort();
                return;
            }
        }

        if closed.load(Ordering::Acquire) {
            slog::debug!(
                self.logger,
                "{} completed '{}::{}' command request {}",
                self.peer_id.short_string(),
                namespace,
                message.kind,
                msg_id.short_string()
            );
            delivery.ack();
        } else if delivery.exchange == Exchange::Balanced {
            slog::debug!(
                self.logger,
                "{} did not write a response for '{}::{}' command request, request {} has been re-queued",
                self.peer_id.short_string(),
                namespace,
                message.kind,
                msg_id.short_string()
            );
            delivery.reject(true);
        } else {
            // A handler that returns without responding on a non-balanced
            // delivery is a programming error; the request is abandoned.
            slog::error!(
                self.logger,
                "{} did not write a response for '{}::{}' command request {}, request has been abandoned",
                self.peer_id.short_string(),
                namespace,
                message.kind,
                msg_id.short_string()
            );
            delivery.reject(false);
        }
    }

    async fn respond_with_error(&self, request: &Message) {
        let reply_to = match &request.reply_to {
            Some(reply_to) => reply_to.clone(),
            None => return,
        };

        let response = Message {
            id: request.id.clone(),
            kind: request.kind.clone(),
            namespace: request.namespace.clone(),
            trace_id: request.trace_id.clone(),
            app_id: self.product.clone(),
            outcome: Some(Outcome::Error {
                message: "internal server error".to_string(),
            }),
            ..Message::default()
        };

        if let Err(err) = self.transport.publish(Exchange::Response, &reply_to, response).await {
            let _ = self.faults.send(Error::Transport(err));
        }
    }

    fn lock_handlers_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn CommandHandler>>> {
        self.handlers.read().expect("server handler lock poison")
    }

    fn lock_handlers_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn CommandHandler>>> {
        self.handlers.write().expect("server handler lock poison")
    }

    fn lock_balanced(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConsumerTag>> {
        self.balanced.lock().expect("server balanced lock poison")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ClosedRevision, SessionRevision};
    use crate::ident::SessionRef;
    use crate::transport::MemoryBroker;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    struct StubRevisions;

    #[async_trait]
    impl RevisionStore for StubRevisions {
        async fn get_revision(&self, session: SessionRef) -> Result<Box<dyn SessionRevision>, Error> {
            Ok(Box::new(ClosedRevision(session)))
        }
    }

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    async fn start_server(broker: &Arc<MemoryBroker>, peer_id: PeerId) -> Arc<Server> {
        broker.register_peer(peer_id).await.unwrap();
        let (faults, _faults_rx) = mpsc::unbounded_channel();
        Server::start(
            peer_id,
            Arc::clone(broker) as Arc<dyn Transport>,
            Arc::new(StubRevisions),
            4,
            None,
            Stop::new(),
            faults,
            discard(),
        )
        .await
        .unwrap()
    }

    fn caller() -> (PeerId, MessageId) {
        let caller = PeerId::new(9, 9);
        (caller, caller.session(1).at(0).message(1))
    }

    fn request(msg_id: &MessageId, reply_to: Option<PeerId>, cmd: &str, payload: &'static [u8]) -> Message {
        Message {
            id: msg_id.to_string(),
            kind: cmd.to_string(),
            reply_to: reply_to.map(|p| p.to_string()),
            payload: Bytes::from_static(payload),
            ..Message::default()
        }
    }

    async fn recv_response(consumer: &mut Consumer) -> Message {
        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer.next())
            .await
            .expect("timed out waiting for response")
            .expect("response consumer closed");
        let message = delivery.message.clone();
        delivery.ack();
        message
    }

    #[tokio::test]
    async fn balanced_request_is_handled_and_answered() {
        let broker = MemoryBroker::new(discard());
        let server_peer = PeerId::new(1, 1);
        let server = start_server(&broker, server_peer).await;

        server
            .listen(
                "math",
                Arc::new(|_ctx: Context, request: Request, response: Responder| async move {
                    let sum: i64 = std::str::from_utf8(&request.payload)
                        .unwrap_or("")
                        .split(',')
                        .filter_map(|part| part.parse::<i64>().ok())
                        .sum();
                    response.done(Bytes::from(sum.to_string())).await;
                }),
            )
            .await
            .unwrap();

        let (caller_peer, msg_id) = caller();
        broker.register_peer(caller_peer).await.unwrap();
        let mut responses = broker.consume(Queue::Response(caller_peer), 0).await.unwrap();

        broker
            .publish(Exchange::Balanced, "math", request(&msg_id, Some(caller_peer), "add", b"1,2"))
            .await
            .unwrap();

        let response = recv_response(&mut responses).await;
        assert_eq!(response.id, msg_id.to_string());
        assert_eq!(response.outcome, Some(Outcome::Success));
        assert_eq!(response.payload, Bytes::from_static(b"3"));
    }

    #[tokio::test]
    async fn listen_twice_swaps_the_handler() {
        let broker = MemoryBroker::new(discard());
        let server = start_server(&broker, PeerId::new(1, 2)).await;

        let noop = |_ctx: Context, _request: Request, response: Responder| async move {
            response.close().await;
        };

        assert!(server.listen("ns", Arc::new(noop)).await.unwrap());
        assert!(!server.listen("ns", Arc::new(noop)).await.unwrap());
        assert!(server.unlisten("ns").await.unwrap());
        assert!(!server.unlisten("ns").await.unwrap());
    }

    #[tokio::test]
    async fn buffered_balanced_request_requeues_to_another_peer_after_unlisten() {
        let broker = MemoryBroker::new(discard());

        // q1 stands in for a peer that pre-fetched a request and then
        // unlistened: its server has no handler for the namespace, and its
        // balanced consumer is already cancelled when dispatch runs.
        let q1 = PeerId::new(1, 3);
        let q2 = PeerId::new(1, 4);
        let server1 = start_server(&broker, q1).await;
        let server2 = start_server(&broker, q2).await;

        let mut staging = broker.consume(Queue::Balanced("jobs".to_string()), 1).await.unwrap();

        let (caller_peer, msg_id) = caller();
        broker.register_peer(caller_peer).await.unwrap();
        let mut responses = broker.consume(Queue::Response(caller_peer), 0).await.unwrap();

        broker
            .publish(Exchange::Balanced, "jobs", request(&msg_id, Some(caller_peer), "run", b""))
            .await
            .unwrap();

        let held = tokio::time::timeout(Duration::from_secs(1), staging.next())
            .await
            .unwrap()
            .unwrap();
        broker.cancel(staging.tag()).await.unwrap();

        server2
            .listen(
                "jobs",
                Arc::new(|_ctx: Context, _request: Request, response: Responder| async move {
                    response.done(Bytes::from_static(b"handled")).await;
                }),
            )
            .await
            .unwrap();

        // q1 dispatches the stale pre-fetched delivery: no handler plus a
        // balanced exchange must requeue it, and q2 must pick it up.
        Arc::clone(&server1).dispatch(held).await;

        let response = recv_response(&mut responses).await;
        assert_eq!(response.id, msg_id.to_string());
        assert_eq!(response.payload, Bytes::from_static(b"handled"));

        // Exactly one response reaches the caller.
        let extra = tokio::time::timeout(Duration::from_millis(100), responses.next()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn unresponsive_handler_abandons_unicast_requests() {
        let broker = MemoryBroker::new(discard());
        let server_peer = PeerId::new(1, 5);
        let server = start_server(&broker, server_peer).await;

        server
            .listen(
                "ns",
                Arc::new(|_ctx: Context, _request: Request, _response: Responder| async move {
                    // Returns without settling the response.
                }),
            )
            .await
            .unwrap();

        let (caller_peer, msg_id) = caller();
        broker.register_peer(caller_peer).await.unwrap();
        let mut responses = broker.consume(Queue::Response(caller_peer), 0).await.unwrap();

        let mut message = request(&msg_id, Some(caller_peer), "cmd", b"");
        message.namespace = Some("ns".to_string());
        broker
            .publish(Exchange::Unicast, &server_peer.to_string(), message)
            .await
            .unwrap();

        // No response, and no redelivery loop: the request is abandoned.
        let result = tokio::time::timeout(Duration::from_millis(200), responses.next()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn panicking_handler_reports_a_command_error() {
        let broker = MemoryBroker::new(discard());
        let server_peer = PeerId::new(1, 6);
        let server = start_server(&broker, server_peer).await;

        server
            .listen(
                "ns",
                Arc::new(|_ctx: Context, _request: Request, _response: Responder| async move {
                    panic!("handler bug");
                }),
            )
            .await
            .unwrap();

        let (caller_peer, msg_id) = caller();
        broker.register_peer(caller_peer).await.unwrap();
        let mut responses = broker.consume(Queue::Response(caller_peer), 0).await.unwrap();

        broker
            .publish(Exchange::Balanced, "ns", request(&msg_id, Some(caller_peer), "cmd", b""))
            .await
            .unwrap();

        let response = recv_response(&mut responses).await;
        assert!(matches!(response.outcome, Some(Outcome::Error { .. })));
    }

    #[tokio::test]
    async fn expired_requests_are_not_dispatched() {
        let broker = MemoryBroker::new(discard());
        let server_peer = PeerId::new(1, 7);
        let server = start_server(&broker, server_peer).await;

        let handled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&handled);
        server
            .listen(
                "ns",
                Arc::new(move |_ctx: Context, _request: Request, response: Responder| {
                    let flag = Arc::clone(&flag);
                    async move {
                        flag.store(true, Ordering::Release);
                        response.close().await;
                    }
                }),
            )
            .await
            .unwrap();

        let (caller_peer, msg_id) = caller();
        broker.register_peer(caller_peer).await.unwrap();

        // Hand the server a delivery whose deadline has already passed.
        let delivery = Delivery {
            exchange: Exchange::Balanced,
            routing_key: "ns".to_string(),
            message: request(&msg_id, Some(caller_peer), "cmd", b""),
            deadline: Some(tokio::time::Instant::now() - Duration::from_millis(10)),
            acker: None,
        };
        Arc::clone(&server).dispatch(delivery).await;

        assert!(!handled.load(Ordering::Acquire));
    }
}
