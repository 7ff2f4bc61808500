use crate::api::{Context, Error};
use crate::catalog::SessionRegistry;
use crate::command::request::AsyncHandler;
use crate::ident::{MessageId, PeerId, SessionId};
use crate::peer::shutdown::{Stop, TaskGauge};
use crate::transport::{Consumer, ConsumerTag, Exchange, Message, Outcome, Queue, Transport};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Semaphore};

/// Invoker is the client side of the command RPC runtime.
///
/// "Call" is an invocation that expects a response; "execute" is one where
/// no response is required. Responses arrive on the peer's private response
/// queue and are correlated back to the waiting caller by message ID.
pub struct Invoker {
    peer_id: PeerId,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    product: Option<String>,
    logger: slog::Logger,
    // Synchronous calls waiting for their response.
    pending: Mutex<HashMap<MessageId, oneshot::Sender<Result<Bytes, Error>>>>,
    // Asynchronous calls; the response goes to the session's handler.
    pending_async: Mutex<HashMap<MessageId, SessionId>>,
    async_handlers: Mutex<HashMap<SessionId, Arc<dyn AsyncHandler>>>,
    workers: Arc<Semaphore>,
    gauge: TaskGauge,
    call_gauge: TaskGauge,
    stop: Stop,
    response_tag: ConsumerTag,
}

impl Invoker {
    pub async fn start(
        peer_id: PeerId,
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        product: Option<String>,
        session_workers: usize,
        stop: Stop,
        logger: slog::Logger,
    ) -> Result<Arc<Invoker>, crate::transport::TransportError> {
        let consumer = transport.consume(Queue::Response(peer_id), 0).await?;

        let invoker = Arc::new(Invoker {
            peer_id,
            transport,
            registry,
            product,
            logger,
            pending: Mutex::new(HashMap::new()),
            pending_async: Mutex::new(HashMap::new()),
            async_handlers: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(session_workers)),
            gauge: TaskGauge::new(),
            call_gauge: TaskGauge::new(),
            stop,
            response_tag: consumer.tag(),
        });

        tokio::spawn(Arc::clone(&invoker).run_responses(consumer));

        Ok(invoker)
    }

    /// Sends a command request to a specific peer and blocks until a
    /// response arrives, the context deadline passes, or the peer stops.
    pub async fn call_unicast(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        target: PeerId,
        ns: &str,
        cmd: &str,
        payload: Bytes,
    ) -> Result<Bytes, Error> {
        self.call(ctx, msg_id, Exchange::Unicast, target.to_string(), ns, cmd, payload)
            .await
    }

    /// Sends a command request to the first available peer listening on ns
    /// and blocks until a response arrives.
    pub async fn call_balanced(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        ns: &str,
        cmd: &str,
        payload: Bytes,
    ) -> Result<Bytes, Error> {
        self.call(ctx, msg_id, Exchange::Balanced, ns.to_string(), ns, cmd, payload)
            .await
    }

    /// Sends a load-balanced command request that expects a response, but
    /// does not wait: the response is eventually delivered to the calling
    /// session's async handler.
    pub async fn call_balanced_async(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        ns: &str,
        cmd: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        if self.stop.is_signalled() {
            return Err(Error::PeerStopped);
        }

        self.lock_pending_async().insert(msg_id, msg_id.session().id());

        let message = self.request_message(ctx, msg_id, ns, cmd, payload, true);
        if let Err(err) = self.transport.publish(Exchange::Balanced, ns, message).await {
            self.lock_pending_async().remove(&msg_id);
            return Err(err.into());
        }

        Ok(())
    }

    /// Sends a load-balanced command request with no response.
    pub async fn execute_balanced(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        ns: &str,
        cmd: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        if self.stop.is_signalled() {
            return Err(Error::PeerStopped);
        }

        let message = self.request_message(ctx, msg_id, ns, cmd, payload, false);
        self.transport.publish(Exchange::Balanced, ns, message).await?;
        Ok(())
    }

    /// Sends a command request to every peer listening on ns, with no
    /// response.
    pub async fn execute_multicast(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        ns: &str,
        cmd: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        if self.stop.is_signalled() {
            return Err(Error::PeerStopped);
        }

        let message = self.request_message(ctx, msg_id, ns, cmd, payload, false);
        self.transport.publish(Exchange::Multicast, ns, message).await?;
        Ok(())
    }

    /// Sets or clears the async response handler for a session.
    pub fn set_async_handler(&self, session: SessionId, handler: Option<Arc<dyn AsyncHandler>>) {
        let mut handlers = self.lock_async_handlers();
        match handler {
            Some(handler) => {
                handlers.insert(session, handler);
            }
            None => {
                handlers.remove(&session);
            }
        }
    }

    /// Stops consuming responses and forgets pending calls. Callers waiting
    /// on a response observe the stop signal and return `PeerStopped`.
    pub async fn stop_consuming(&self) {
        let _ = self.transport.cancel(self.response_tag).await;
        self.lock_pending().clear();
        self.lock_pending_async().clear();
    }

    /// Waits for in-flight async handlers to return.
    pub async fn drain(&self) {
        self.gauge.wait_idle().await
    }

    /// Waits for outstanding synchronous calls to resolve.
    pub async fn drain_calls(&self) {
        self.call_gauge.wait_idle().await
    }

    async fn call(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        exchange: Exchange,
        routing_key: String,
        ns: &str,
        cmd: &str,
        payload: Bytes,
    ) -> Result<Bytes, Error> {
        if self.stop.is_signalled() {
            return Err(Error::PeerStopped);
        }

        let _guard = self.call_gauge.enter();

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(msg_id, tx);

        let message = self.request_message(ctx, msg_id, ns, cmd, payload, true);
        if let Err(err) = self.transport.publish(exchange, &routing_key, message).await {
            self.lock_pending().remove(&msg_id);
            return Err(err.into());
        }

        tokio::select! {
            response = rx => match response {
                Ok(result) => result,
                Err(_) => Err(Error::PeerStopped),
            },
            _ = ctx.done() => {
                self.lock_pending().remove(&msg_id);
                Err(Error::DeadlineExceeded)
            }
            _ = self.stop.wait() => {
                self.lock_pending().remove(&msg_id);
                Err(Error::PeerStopped)
            }
        }
    }

    async fn run_responses(self: Arc<Self>, mut consumer: Consumer) {
        while let Some(delivery) = consumer.next().await {
            self.handle_response(&delivery).await;
            delivery.ack();
        }
    }

    async fn handle_response(&self, delivery: &crate::transport::Delivery) {
        let message = &delivery.message;

        let msg_id: MessageId = match message.id.parse() {
            Ok(id) => id,
            Err(_) => {
                slog::debug!(
                    self.logger,
                    "{} ignored response, '{}' is not a valid message ID",
                    self.peer_id.short_string(),
                    message.id
                );
                return;
            }
        };

        let result = decode_result(message);

        // The pending entry is removed before the caller is woken, so a
        // duplicate response for the same message ID finds nothing and is
        // dropped.
        if let Some(tx) = self.lock_pending().remove(&msg_id) {
            let _ = tx.send(result);
            return;
        }

        let session = self.lock_pending_async().remove(&msg_id);
        match session {
            Some(session) => self.dispatch_async(session, msg_id, message, result).await,
            None => {
                slog::debug!(
                    self.logger,
                    "{} ignored response for unknown call {}",
                    self.peer_id.short_string(),
                    msg_id.short_string()
                );
            }
        }
    }

    async fn dispatch_async(
        &self,
        session_id: SessionId,
        msg_id: MessageId,
        message: &Message,
        result: Result<Bytes, Error>,
    ) {
        let handler = self.lock_async_handlers().get(&session_id).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => {
                slog::debug!(
                    self.logger,
                    "{} dropped response for {}, session has no async handler",
                    self.peer_id.short_string(),
                    msg_id.short_string()
                );
                return;
            }
        };

        let session = match self.registry.get_session(session_id) {
            Some(session) => session,
            None => {
                slog::debug!(
                    self.logger,
                    "{} dropped response for {}, session has been destroyed",
                    self.peer_id.short_string(),
                    msg_id.short_string()
                );
                return;
            }
        };

        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let ctx = Context::background()
            .with_trace_id(message.trace_id.clone().unwrap_or_else(|| message.id.clone()));
        let ns = message.namespace.clone().unwrap_or_default();
        let cmd = message.kind.clone();
        let guard = self.gauge.enter();

        tokio::spawn(async move {
            handler.handle(ctx, session, msg_id, &ns, &cmd, result).await;
            drop(guard);
            drop(permit);
        });
    }

    fn request_message(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        ns: &str,
        cmd: &str,
        payload: Bytes,
        response_required: bool,
    ) -> Message {
        Message {
            id: msg_id.to_string(),
            kind: cmd.to_string(),
            namespace: Some(ns.to_string()),
            reply_to: response_required.then(|| self.peer_id.to_string()),
            trace_id: ctx.trace_id().map(str::to_string),
            expiration: ctx.remaining(),
            app_id: self.product.clone(),
            payload,
            ..Message::default()
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<MessageId, oneshot::Sender<Result<Bytes, Error>>>> {
        self.pending.lock().expect("invoker pending lock poison")
    }

    fn lock_pending_async(&self) -> MutexGuard<'_, HashMap<MessageId, SessionId>> {
        self.pending_async.lock().expect("invoker pending-async lock poison")
    }

    fn lock_async_handlers(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<dyn AsyncHandler>>> {
        self.async_handlers.lock().expect("invoker async-handler lock poison")
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }
}

fn decode_result(message: &Message) -> Result<Bytes, Error> {
    match &message.outcome {
        Some(Outcome::Success) => Ok(message.payload.clone()),
        Some(Outcome::Failure { failure_type, message: text }) => {
            Err(Error::failure(failure_type, text, message.payload.clone()))
        }
        Some(Outcome::Error { message }) => Err(Error::CommandError(message.clone())),
        None => Err(Error::CommandError("response carries no outcome".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use std::time::Duration;

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    async fn start_invoker(broker: &Arc<MemoryBroker>, peer_id: PeerId) -> Arc<Invoker> {
        broker.register_peer(peer_id).await.unwrap();
        Invoker::start(
            peer_id,
            Arc::clone(broker) as Arc<dyn Transport>,
            SessionRegistry::new(),
            None,
            4,
            Stop::new(),
            discard(),
        )
        .await
        .unwrap()
    }

    fn msg_id(peer_id: PeerId, seq: u32) -> MessageId {
        peer_id.session(1).at(0).message(seq)
    }

    fn response(correlation: &MessageId, payload: &'static [u8]) -> Message {
        Message {
            id: correlation.to_string(),
            outcome: Some(Outcome::Success),
            payload: Bytes::from_static(payload),
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn call_round_trip_and_duplicate_response_dropped() {
        let broker = MemoryBroker::new(discard());
        let peer_id = PeerId::new(1, 1);
        let invoker = start_invoker(&broker, peer_id).await;

        // Stand in for a remote server on the balanced queue.
        let mut requests = broker.consume(Queue::Balanced("ns".to_string()), 0).await.unwrap();

        let id = msg_id(peer_id, 1);
        let ctx = Context::background().with_timeout(Duration::from_secs(1));

        let call = {
            let invoker = Arc::clone(&invoker);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                invoker
                    .call_balanced(&ctx, id, "ns", "cmd", Bytes::from_static(b"in"))
                    .await
            })
        };

        let delivery = requests.next().await.unwrap();
        assert_eq!(delivery.message.kind, "cmd");
        let reply_to = delivery.message.reply_to.clone().unwrap();
        delivery.ack();

        // Two responses with the same correlation ID; only the first may
        // reach the caller.
        broker
            .publish(Exchange::Response, &reply_to, response(&id, b"first"))
            .await
            .unwrap();
        broker
            .publish(Exchange::Response, &reply_to, response(&id, b"second"))
            .await
            .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, Bytes::from_static(b"first"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(invoker.pending_len(), 0);
    }

    #[tokio::test]
    async fn call_times_out_and_releases_the_pending_slot() {
        let broker = MemoryBroker::new(discard());
        let peer_id = PeerId::new(1, 2);
        let invoker = start_invoker(&broker, peer_id).await;

        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let err = invoker
            .call_balanced(&ctx, msg_id(peer_id, 1), "nobody-listens", "cmd", Bytes::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(invoker.pending_len(), 0);
    }

    #[tokio::test]
    async fn executes_require_no_response() {
        let broker = MemoryBroker::new(discard());
        let peer_id = PeerId::new(1, 4);
        let invoker = start_invoker(&broker, peer_id).await;
        let ctx = Context::background();

        let mut balanced = broker.consume(Queue::Balanced("jobs".to_string()), 0).await.unwrap();
        invoker
            .execute_balanced(&ctx, msg_id(peer_id, 1), "jobs", "run", Bytes::new())
            .await
            .unwrap();

        let delivery = balanced.next().await.unwrap();
        assert!(delivery.message.reply_to.is_none());
        delivery.ack();

        // Multicast copies reach every bound peer.
        let other = PeerId::new(1, 5);
        broker.register_peer(other).await.unwrap();
        broker.bind_multicast(peer_id, "jobs").await.unwrap();
        broker.bind_multicast(other, "jobs").await.unwrap();

        let mut mine = broker.consume(Queue::Request(peer_id), 0).await.unwrap();
        let mut theirs = broker.consume(Queue::Request(other), 0).await.unwrap();

        invoker
            .execute_multicast(&ctx, msg_id(peer_id, 2), "jobs", "run", Bytes::new())
            .await
            .unwrap();

        mine.next().await.unwrap().ack();
        theirs.next().await.unwrap().ack();

        assert_eq!(invoker.pending_len(), 0);
    }

    #[tokio::test]
    async fn stop_cancels_waiting_calls() {
        let broker = MemoryBroker::new(discard());
        let peer_id = PeerId::new(1, 3);
        broker.register_peer(peer_id).await.unwrap();

        let stop = Stop::new();
        let invoker = Invoker::start(
            peer_id,
            Arc::clone(&broker) as Arc<dyn Transport>,
            SessionRegistry::new(),
            None,
            4,
            stop.clone(),
            discard(),
        )
        .await
        .unwrap();

        let call = {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move {
                let ctx = Context::background().with_timeout(Duration::from_secs(30));
                invoker.call_balanced(&ctx, msg_id(peer_id, 1), "ns", "cmd", Bytes::new()).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.signal();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PeerStopped));
    }
}
