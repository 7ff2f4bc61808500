use crate::api::{validate_namespace, Context, Error};
use crate::attributes::Constraint;
use crate::catalog::{Catalog, SessionRegistry, SessionRevision};
use crate::command::{AsyncHandler, Invoker};
use crate::ident::{MessageId, SessionId};
use crate::notify::{Listener, NotificationHandler, Notifier};
use crate::peer::shutdown::Stop;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Session is a versioned context for making requests and holding
/// attributes, owned by exactly one peer.
///
/// A session holds the invoker and notifier handles and its own catalog,
/// never the peer itself; the peer owns those collaborators and closes them
/// on teardown.
pub struct Session {
    id: SessionId,
    catalog: Arc<Catalog>,
    invoker: Arc<Invoker>,
    notifier: Arc<Notifier>,
    listener: Arc<Listener>,
    logger: slog::Logger,
    default_timeout: Duration,
    closed: Stop,
}

impl Session {
    /// Creates a session, registers it with the peer's registry, and spawns
    /// the watcher that cleans up when the catalog closes, whichever path
    /// closed it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        id: SessionId,
        invoker: Arc<Invoker>,
        notifier: Arc<Notifier>,
        listener: Arc<Listener>,
        registry: Arc<SessionRegistry>,
        default_timeout: Duration,
        logger: slog::Logger,
    ) -> Arc<Session> {
        let catalog = Catalog::new(id, logger.clone());

        let session = Arc::new(Session {
            id,
            catalog: Arc::clone(&catalog),
            invoker,
            notifier,
            listener,
            logger,
            default_timeout,
            closed: Stop::new(),
        });

        registry.insert(Arc::clone(&session), catalog);

        slog::debug!(session.logger, "{} session created", session.catalog.session_ref().short_string());

        tokio::spawn({
            let session = Arc::clone(&session);
            async move {
                session.catalog.done().await;
                registry.remove(session.id);
                session.invoker.set_async_handler(session.id, None);
                let _ = session.listener.unlisten_all(session.id).await;
                session.closed.signal();
            }
        });

        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// A revision handle at the session's current revision.
    pub fn current_revision(&self) -> Result<Box<dyn SessionRevision>, Error> {
        self.ensure_open()?;
        Ok(Box::new(self.catalog.head()))
    }

    /// Sends a load-balanced command request and waits for the response.
    pub async fn call(&self, ctx: &Context, ns: &str, cmd: &str, payload: Bytes) -> Result<Bytes, Error> {
        validate_namespace(ns)?;
        self.ensure_open()?;

        let (msg_id, _attrs) = self.catalog.next_message_id();
        let ctx = self.call_context(ctx, msg_id);

        let started = Instant::now();
        let result = self.invoker.call_balanced(&ctx, msg_id, ns, cmd, payload.clone()).await;
        let elapsed = started.elapsed().as_millis();

        match &result {
            Ok(response) => slog::debug!(
                self.logger,
                "{} called '{}::{}' command ({}/o {}/i {}ms) [{}]",
                msg_id.short_string(),
                ns,
                cmd,
                payload.len(),
                response.len(),
                elapsed,
                ctx.trace_id().unwrap_or("")
            ),
            Err(Error::Failure { failure_type, .. }) => slog::debug!(
                self.logger,
                "{} called '{}::{}' command, failed with '{}' ({}/o {}ms) [{}]",
                msg_id.short_string(),
                ns,
                cmd,
                failure_type,
                payload.len(),
                elapsed,
                ctx.trace_id().unwrap_or("")
            ),
            Err(err) => slog::debug!(
                self.logger,
                "{} called '{}::{}' command, error: {} ({}/o {}ms) [{}]",
                msg_id.short_string(),
                ns,
                cmd,
                err,
                payload.len(),
                elapsed,
                ctx.trace_id().unwrap_or("")
            ),
        }

        result
    }

    /// Sends a load-balanced command request without waiting; the response
    /// is delivered to the session's async handler.
    pub async fn call_async(&self, ctx: &Context, ns: &str, cmd: &str, payload: Bytes) -> Result<MessageId, Error> {
        validate_namespace(ns)?;
        self.ensure_open()?;

        let (msg_id, _attrs) = self.catalog.next_message_id();
        let ctx = self.call_context(ctx, msg_id);

        self.invoker
            .call_balanced_async(&ctx, msg_id, ns, cmd, payload.clone())
            .await?;

        slog::debug!(
            self.logger,
            "{} called '{}::{}' command asynchronously ({}/o) [{}]",
            msg_id.short_string(),
            ns,
            cmd,
            payload.len(),
            ctx.trace_id().unwrap_or("")
        );

        Ok(msg_id)
    }

    /// Sets the handler invoked for each response to a `call_async` request.
    /// Passing None removes it.
    pub fn set_async_handler(&self, handler: Option<Arc<dyn AsyncHandler>>) -> Result<(), Error> {
        self.ensure_open()?;

        let wrapped = handler.map(|inner| {
            Arc::new(LoggingAsyncHandler {
                inner,
                logger: self.logger.clone(),
            }) as Arc<dyn AsyncHandler>
        });

        self.invoker.set_async_handler(self.id, wrapped);
        Ok(())
    }

    /// Sends a load-balanced command request for which no response is
    /// expected.
    pub async fn execute(&self, ctx: &Context, ns: &str, cmd: &str, payload: Bytes) -> Result<(), Error> {
        validate_namespace(ns)?;
        self.ensure_open()?;

        let (msg_id, _attrs) = self.catalog.next_message_id();
        let ctx = self.call_context(ctx, msg_id);

        self.invoker
            .execute_balanced(&ctx, msg_id, ns, cmd, payload.clone())
            .await?;

        slog::debug!(
            self.logger,
            "{} executed '{}::{}' command ({}/o) [{}]",
            msg_id.short_string(),
            ns,
            cmd,
            payload.len(),
            ctx.trace_id().unwrap_or("")
        );

        Ok(())
    }

    /// Sends a notification to a specific session.
    pub async fn notify(
        &self,
        ctx: &Context,
        ns: &str,
        kind: &str,
        target: SessionId,
        payload: Bytes,
    ) -> Result<(), Error> {
        if target.validate().is_err() || target.seq() == 0 {
            return Err(Error::InvalidTarget(target));
        }
        validate_namespace(ns)?;
        self.ensure_open()?;

        let (msg_id, _attrs) = self.catalog.next_message_id();
        let ctx = self.call_context(ctx, msg_id);

        self.notifier
            .notify_unicast(&ctx, msg_id, target, ns, kind, payload.clone())
            .await?;

        slog::debug!(
            self.logger,
            "{} sent '{}::{}' notification to {} ({}/o) [{}]",
            msg_id.short_string(),
            ns,
            kind,
            target.short_string(),
            payload.len(),
            ctx.trace_id().unwrap_or("")
        );

        Ok(())
    }

    /// Sends a notification to every session listening on ns whose
    /// attributes match the constraint.
    pub async fn notify_many(
        &self,
        ctx: &Context,
        ns: &str,
        kind: &str,
        constraint: Constraint,
        payload: Bytes,
    ) -> Result<(), Error> {
        validate_namespace(ns)?;
        self.ensure_open()?;

        let (msg_id, _attrs) = self.catalog.next_message_id();
        let ctx = self.call_context(ctx, msg_id);

        self.notifier
            .notify_multicast(&ctx, msg_id, constraint.clone(), ns, kind, payload.clone())
            .await?;

        slog::debug!(
            self.logger,
            "{} sent '{}::{}' notification to sessions matching {} ({}/o) [{}]",
            msg_id.short_string(),
            ns,
            kind,
            constraint,
            payload.len(),
            ctx.trace_id().unwrap_or("")
        );

        Ok(())
    }

    /// Starts delivering ns notifications to the given handler.
    pub async fn listen(&self, ns: &str, handler: Arc<dyn NotificationHandler>) -> Result<(), Error> {
        validate_namespace(ns)?;
        self.ensure_open()?;

        let changed = self.listener.listen(self.id, ns, handler).await?;
        if changed {
            slog::debug!(
                self.logger,
                "{} started listening for notifications in '{}' namespace",
                self.catalog.session_ref().short_string(),
                ns
            );
        }

        Ok(())
    }

    /// Stops delivering ns notifications.
    pub async fn unlisten(&self, ns: &str) -> Result<(), Error> {
        validate_namespace(ns)?;
        self.ensure_open()?;

        let changed = self.listener.unlisten(self.id, ns).await?;
        if changed {
            slog::debug!(
                self.logger,
                "{} stopped listening for notifications in '{}' namespace",
                self.catalog.session_ref().short_string(),
                ns
            );
        }

        Ok(())
    }

    /// Destroys the session. Idempotent; cleanup runs exactly once via the
    /// catalog's done signal.
    pub fn destroy(&self) {
        self.catalog.close();
    }

    /// Resolves when the session has been destroyed by any path.
    pub async fn done(&self) {
        self.closed.wait().await
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.is_signalled() || self.catalog.is_closed() {
            return Err(Error::NotFound(self.id));
        }
        Ok(())
    }

    /// Applies the default timeout when the context has no deadline, and
    /// tags the call chain with a trace ID when it has none.
    fn call_context(&self, ctx: &Context, msg_id: MessageId) -> Context {
        let ctx = ctx.clone().or_timeout(self.default_timeout);
        if ctx.trace_id().is_none() {
            ctx.with_trace_id(msg_id.to_string())
        } else {
            ctx
        }
    }
}

/// Wraps the application's async handler to log each response before
/// delegating.
struct LoggingAsyncHandler {
    inner: Arc<dyn AsyncHandler>,
    logger: slog::Logger,
}

#[async_trait::async_trait]
impl AsyncHandler for LoggingAsyncHandler {
    async fn handle(
        &self,
        ctx: Context,
        session: Arc<Session>,
        msg_id: MessageId,
        ns: &str,
        cmd: &str,
        result: Result<Bytes, Error>,
    ) {
        match &result {
            Ok(payload) => slog::debug!(
                self.logger,
                "{} received response for '{}::{}' command ({}/i) [{}]",
                msg_id.short_string(),
                ns,
                cmd,
                payload.len(),
                ctx.trace_id().unwrap_or("")
            ),
            Err(err) => slog::debug!(
                self.logger,
                "{} received response for '{}::{}' command, {} [{}]",
                msg_id.short_string(),
                ns,
                cmd,
                err,
                ctx.trace_id().unwrap_or("")
            ),
        }

        self.inner.handle(ctx, session, msg_id, ns, cmd, result).await
    }
}
