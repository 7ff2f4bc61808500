use crate::api::Context;
use crate::attributes::{Constraint, Table};
use crate::catalog::{RevisionStore, SessionRegistry};
use crate::ident::{MessageId, PeerId, SessionId};
use crate::notify::notification::{Notification, NotificationHandler};
use crate::peer::shutdown::TaskGauge;
use crate::transport::{Consumer, ConsumerTag, Delivery, Exchange, Queue, Transport, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Semaphore;

/// Listener consumes the peer's notification queue and fans notifications
/// out to the local sessions listening for them.
///
/// Unicast notifications go to their target session; multicast
/// notifications go to every listening session whose attributes in the
/// notification's namespace match the constraint.
pub struct Listener {
    peer_id: PeerId,
    transport: Arc<dyn Transport>,
    revisions: Arc<dyn RevisionStore>,
    registry: Arc<SessionRegistry>,
    logger: slog::Logger,
    handlers: RwLock<HashMap<(SessionId, String), Arc<dyn NotificationHandler>>>,
    // ns -> number of listening sessions; the peer's notification queue is
    // bound to a namespace while the count is non-zero.
    bindings: Mutex<HashMap<String, usize>>,
    setup: tokio::sync::Mutex<()>,
    workers: Arc<Semaphore>,
    gauge: TaskGauge,
    tag: ConsumerTag,
}

impl Listener {
    pub(crate) async fn start(
        peer_id: PeerId,
        transport: Arc<dyn Transport>,
        revisions: Arc<dyn RevisionStore>,
        registry: Arc<SessionRegistry>,
        session_workers: usize,
        logger: slog::Logger,
    ) -> Result<Arc<Listener>, TransportError> {
        let consumer = transport.consume(Queue::Notification(peer_id), session_workers).await?;

        let listener = Arc::new(Listener {
            peer_id,
            transport,
            revisions,
            registry,
            logger,
            handlers: RwLock::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            setup: tokio::sync::Mutex::new(()),
            workers: Arc::new(Semaphore::new(session_workers)),
            gauge: TaskGauge::new(),
            tag: consumer.tag(),
        });

        tokio::spawn(Arc::clone(&listener).run(consumer));

        Ok(listener)
    }

    /// Starts delivering ns notifications to the session. Returns false if
    /// the session was already listening (the handler is swapped).
    pub async fn listen(
        &self,
        session: SessionId,
        ns: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<bool, TransportError> {
        let _setup = self.setup.lock().await;

        let changed = self
            .lock_handlers_write()
            .insert((session, ns.to_string()), handler)
            .is_none();

        if changed {
            let first = {
                let mut bindings = self.lock_bindings();
                let count = bindings.entry(ns.to_string()).or_insert(0);
                *count += 1;
                *count == 1
            };

            if first {
                self.transport.bind_notifications(self.peer_id, ns).await?;
            }
        }

        Ok(changed)
    }

    /// Stops delivering ns notifications to the session.
    pub async fn unlisten(&self, session: SessionId, ns: &str) -> Result<bool, TransportError> {
        let _setup = self.setup.lock().await;
        self.unlisten_locked(session, ns).await
    }

    /// Removes every registration the session holds. Used on session
    /// destroy.
    pub async fn unlisten_all(&self, session: SessionId) -> Result<(), TransportError> {
        let _setup = self.setup.lock().await;

        let namespaces: Vec<String> = self
            .lock_handlers_read()
            .keys()
            .filter(|(id, _)| *id == session)
            .map(|(_, ns)| ns.clone())
            .collect();

        for ns in namespaces {
            self.unlisten_locked(session, &ns).await?;
        }

        Ok(())
    }

    pub async fn stop_consuming(&self) {
        let _ = self.transport.cancel(self.tag).await;
    }

    pub async fn drain(&self) {
        self.gauge.wait_idle().await
    }

    async fn unlisten_locked(&self, session: SessionId, ns: &str) -> Result<bool, TransportError> {
        if self
            .lock_handlers_write()
            .remove(&(session, ns.to_string()))
            .is_none()
        {
            return Ok(false);
        }

        let last = {
            let mut bindings = self.lock_bindings();
            match bindings.get_mut(ns) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        bindings.remove(ns);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            self.transport.unbind_notifications(self.peer_id, ns).await?;
        }

        Ok(true)
    }

    async fn run(self: Arc<Self>, mut consumer: Consumer) {
        while let Some(delivery) = consumer.next().await {
            self.handle(&delivery).await;
            delivery.ack();
        }
    }

    async fn handle(&self, delivery: &Delivery) {
        let message = &delivery.message;

        let msg_id: MessageId = match message.id.parse() {
            Ok(id) => id,
            Err(_) => {
                slog::debug!(
                    self.logger,
                    "{} ignored notification, '{}' is not a valid message ID",
                    self.peer_id.short_string(),
                    message.id
                );
                return;
            }
        };

        let ns = match &message.namespace {
            Some(ns) => ns.clone(),
            None => {
                slog::debug!(
                    self.logger,
                    "{} ignored notification {}, namespace header is missing",
                    self.peer_id.short_string(),
                    msg_id.short_string()
                );
                return;
            }
        };

        match delivery.exchange {
            Exchange::NotifyUnicast => {
                let target: SessionId = match message.target.as_deref().unwrap_or("").parse() {
                    Ok(target) => target,
                    Err(_) => {
                        slog::debug!(
                            self.logger,
                            "{} ignored notification {}, target session is malformed",
                            self.peer_id.short_string(),
                            msg_id.short_string()
                        );
                        return;
                    }
                };

                let handler = self.lock_handlers_read().get(&(target, ns.clone())).cloned();
                if let Some(handler) = handler {
                    self.dispatch(target, handler, delivery, msg_id, ns, None).await;
                }
            }
            Exchange::NotifyMulticast => {
                let constraint = message.constraint.clone().unwrap_or_default();

                let listening: Vec<(SessionId, Arc<dyn NotificationHandler>)> = self
                    .lock_handlers_read()
                    .iter()
                    .filter(|((_, handler_ns), _)| *handler_ns == ns)
                    .map(|((id, _), handler)| (*id, Arc::clone(handler)))
                    .collect();

                for (session_id, handler) in listening {
                    let matches = match self.registry.get_catalog(session_id) {
                        Some(catalog) => {
                            let (_, table) = catalog.attrs_in(&ns);
                            table.unwrap_or_else(|| Arc::new(Table::new())).matches(&constraint)
                        }
                        None => false,
                    };

                    if matches {
                        self.dispatch(session_id, handler, delivery, msg_id, ns.clone(), Some(constraint.clone()))
                            .await;
                    }
                }
            }
            other => {
                slog::debug!(
                    self.logger,
                    "{} ignored notification {}, delivery via {:?} exchange is not expected",
                    self.peer_id.short_string(),
                    msg_id.short_string(),
                    other
                );
            }
        }
    }

    async fn dispatch(
        &self,
        session_id: SessionId,
        handler: Arc<dyn NotificationHandler>,
        delivery: &Delivery,
        msg_id: MessageId,
        ns: String,
        constraint: Option<Constraint>,
    ) {
        let (session, catalog) = match self.registry.get(session_id) {
            Some(entry) => entry,
            None => return,
        };

        if catalog.is_closed() {
            return;
        }

        let source = match self.revisions.get_revision(msg_id.session()).await {
            Ok(source) => source,
            Err(err) => {
                slog::debug!(
                    self.logger,
                    "{} dropped notification {}, {}",
                    self.peer_id.short_string(),
                    msg_id.short_string(),
                    err
                );
                return;
            }
        };

        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let message = &delivery.message;
        let mut ctx = Context::background()
            .with_trace_id(message.trace_id.clone().unwrap_or_else(|| message.id.clone()));
        if let Some(deadline) = delivery.deadline {
            ctx = ctx.with_deadline(deadline);
        }

        let notification = Notification {
            id: msg_id,
            source,
            namespace: ns.clone(),
            kind: message.kind.clone(),
            payload: message.payload.clone(),
            is_multicast: delivery.exchange == Exchange::NotifyMulticast,
            constraint,
        };

        slog::debug!(
            self.logger,
            "{} received '{}::{}' notification from {} ({}/i)",
            catalog.session_ref().short_string(),
            ns,
            message.kind,
            msg_id.session().short_string(),
            message.payload.len()
        );

        let guard = self.gauge.enter();
        tokio::spawn(async move {
            handler.handle(ctx, session, notification).await;
            drop(guard);
            drop(permit);
        });
    }

    fn lock_handlers_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<(SessionId, String), Arc<dyn NotificationHandler>>> {
        self.handlers.read().expect("listener handler lock poison")
    }

    fn lock_handlers_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(SessionId, String), Arc<dyn NotificationHandler>>> {
        self.handlers.write().expect("listener handler lock poison")
    }

    fn lock_bindings(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.bindings.lock().expect("listener bindings lock poison")
    }
}
