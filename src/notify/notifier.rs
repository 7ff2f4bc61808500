use crate::api::{Context, Error};
use crate::attributes::Constraint;
use crate::ident::{MessageId, SessionId};
use crate::transport::{Exchange, Message, Transport};
use bytes::Bytes;
use std::sync::Arc;

/// Notifier publishes notifications on behalf of local sessions.
pub struct Notifier {
    transport: Arc<dyn Transport>,
    product: Option<String>,
}

impl Notifier {
    pub(crate) fn new(transport: Arc<dyn Transport>, product: Option<String>) -> Arc<Notifier> {
        Arc::new(Notifier { transport, product })
    }

    /// Sends a notification to one specific session.
    pub async fn notify_unicast(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        target: SessionId,
        ns: &str,
        kind: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        let mut message = self.message(ctx, msg_id, ns, kind, payload);
        message.target = Some(target.to_string());

        self.transport
            .publish(Exchange::NotifyUnicast, &target.peer().to_string(), message)
            .await?;

        Ok(())
    }

    /// Sends a notification to every session listening on ns whose
    /// attributes match the constraint.
    pub async fn notify_multicast(
        &self,
        ctx: &Context,
        msg_id: MessageId,
        constraint: Constraint,
        ns: &str,
        kind: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        let mut message = self.message(ctx, msg_id, ns, kind, payload);
        message.constraint = Some(constraint);

        self.transport.publish(Exchange::NotifyMulticast, ns, message).await?;

        Ok(())
    }

    fn message(&self, ctx: &Context, msg_id: MessageId, ns: &str, kind: &str, payload: Bytes) -> Message {
        Message {
            id: msg_id.to_string(),
            kind: kind.to_string(),
            namespace: Some(ns.to_string()),
            trace_id: ctx.trace_id().map(str::to_string),
            expiration: ctx.remaining(),
            app_id: self.product.clone(),
            payload,
            ..Message::default()
        }
    }
}
