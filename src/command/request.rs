use crate::api::{Context, Error};
use crate::catalog::SessionRevision;
use crate::command::response::Responder;
use crate::ident::MessageId;
use crate::peer::Session;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;

/// Request is an incoming command request as presented to a handler.
pub struct Request {
    /// The revision of the calling session, as the caller observed it when
    /// the request was composed. Local if this peer owns the session, a
    /// remote catalog handle otherwise.
    pub source: Box<dyn SessionRevision>,
    pub namespace: String,
    pub command: String,
    pub payload: Bytes,
    /// True when the request arrived via the multicast exchange, meaning
    /// every listening peer received a copy.
    pub is_multicast: bool,
}

/// CommandHandler processes command requests received in a namespace the
/// peer is listening to. Each invocation runs on its own task.
///
/// The handler must settle the response before returning; a handler that
/// does not is a programming error, and the request is requeued (balanced)
/// or abandoned (unicast/multicast).
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: Context, request: Request, response: Responder);
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Context, Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: Context, request: Request, response: Responder) {
        self(ctx, request, response).await
    }
}

/// AsyncHandler receives the response to a command request made with
/// `Session::call_async`.
#[async_trait]
pub trait AsyncHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: Context,
        session: Arc<Session>,
        msg_id: MessageId,
        ns: &str,
        cmd: &str,
        result: Result<Bytes, Error>,
    );
}
