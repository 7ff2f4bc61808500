use crate::api::Context;
use crate::attributes::Constraint;
use crate::catalog::SessionRevision;
use crate::ident::MessageId;
use crate::peer::Session;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Notification is an inbound notification as presented to a handler.
pub struct Notification {
    pub id: MessageId,
    /// The revision of the sending session as the sender observed it.
    pub source: Box<dyn SessionRevision>,
    pub namespace: String,
    /// The application-defined notification type.
    pub kind: String,
    pub payload: Bytes,
    pub is_multicast: bool,
    /// The constraint the receiving session matched; multicast only.
    pub constraint: Option<Constraint>,
}

/// NotificationHandler receives notifications for one session in one
/// namespace. Each invocation runs on its own task, bounded by the session
/// worker count.
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: Context, session: Arc<Session>, notification: Notification);
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Context, Arc<Session>, Notification) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: Context, session: Arc<Session>, notification: Notification) {
        self(ctx, session, notification).await
    }
}
