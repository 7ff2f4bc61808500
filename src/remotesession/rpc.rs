use crate::api::{Context, Error};
use crate::attributes::{Attr, AttrMeta};
use crate::command::Invoker;
use crate::ident::{PeerId, Revision, SessionId, SessionRef};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Namespace of the session sync service every peer hosts.
pub(crate) const SESSION_NAMESPACE: &str = "_sess";

pub(crate) const FETCH_COMMAND: &str = "fetch";
pub(crate) const UPDATE_COMMAND: &str = "update";
pub(crate) const CLOSE_COMMAND: &str = "close";

pub(crate) const NOT_FOUND_FAILURE: &str = "not-found";
pub(crate) const STALE_UPDATE_FAILURE: &str = "stale";
pub(crate) const FROZEN_ATTRIBUTES_FAILURE: &str = "frozen";

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct FetchRequest {
    pub seq: u32,
    pub ns: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct FetchResponse {
    pub rev: Revision,
    pub attrs: Vec<AttrMeta>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct UpdateRequest {
    pub seq: u32,
    pub rev: Revision,
    pub ns: String,
    pub attrs: Vec<Attr>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct UpdateResponse {
    pub rev: Revision,
    /// The created-at revision of each attribute sent in the request, in
    /// request order, so the client can merge exact metadata.
    pub created_revs: Vec<Revision>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct CloseRequest {
    pub seq: u32,
    pub rev: Revision,
}

/// SessionRpc is the remote catalog's view of the owning peer's sync
/// service. It is a seam so the cache logic is testable without a broker.
#[async_trait]
pub(crate) trait SessionRpc: Send + Sync + 'static {
    /// Fetches the current revision, and the metadata of the given keys.
    /// An empty key list fetches the revision alone.
    async fn fetch(
        &self,
        ctx: &Context,
        id: SessionId,
        ns: &str,
        keys: Vec<String>,
    ) -> Result<(Revision, Vec<AttrMeta>), Error>;

    /// Applies an optimistic update and returns the new revision plus the
    /// resulting metadata of the attributes that were sent.
    async fn update(
        &self,
        ctx: &Context,
        session: SessionRef,
        ns: &str,
        attrs: Vec<Attr>,
    ) -> Result<(Revision, Vec<AttrMeta>), Error>;

    /// Destroys the session if the ref is current.
    async fn close(&self, ctx: &Context, session: SessionRef) -> Result<(), Error>;
}

/// InvokerRpc routes session sync commands through the command runtime to
/// the peer that owns the session.
pub(crate) struct InvokerRpc {
    peer_id: PeerId,
    invoker: Arc<Invoker>,
    // Internal requests are sent on behalf of the peer itself, using the
    // reserved session seq 0.
    seq: AtomicU32,
}

impl InvokerRpc {
    pub(crate) fn new(peer_id: PeerId, invoker: Arc<Invoker>) -> Arc<InvokerRpc> {
        Arc::new(InvokerRpc {
            peer_id,
            invoker,
            seq: AtomicU32::new(0),
        })
    }

    fn next_message_id(&self) -> crate::ident::MessageId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.peer_id.session(0).at(0).message(seq)
    }

    async fn call(&self, ctx: &Context, target: PeerId, cmd: &str, payload: Bytes) -> Result<Bytes, Error> {
        self.invoker
            .call_unicast(ctx, self.next_message_id(), target, SESSION_NAMESPACE, cmd, payload)
            .await
    }
}

fn encode<T: Serialize>(request: &T) -> Result<Bytes, Error> {
    serde_json::to_vec(request)
        .map(Bytes::from)
        .map_err(|err| Error::CommandError(err.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(payload).map_err(|err| Error::CommandError(err.to_string()))
}

#[async_trait]
impl SessionRpc for InvokerRpc {
    async fn fetch(
        &self,
        ctx: &Context,
        id: SessionId,
        ns: &str,
        keys: Vec<String>,
    ) -> Result<(Revision, Vec<AttrMeta>), Error> {
        let payload = encode(&FetchRequest {
            seq: id.seq(),
            ns: ns.to_string(),
            keys,
        })?;

        let result = self.call(ctx, id.peer(), FETCH_COMMAND, payload).await;
        let response: FetchResponse = match result {
            Ok(payload) => decode(&payload)?,
            Err(err) if err.is_failure_type(NOT_FOUND_FAILURE) => return Err(Error::NotFound(id)),
            Err(err) => return Err(err),
        };

        Ok((response.rev, response.attrs))
    }

    async fn update(
        &self,
        ctx: &Context,
        session: SessionRef,
        ns: &str,
        attrs: Vec<Attr>,
    ) -> Result<(Revision, Vec<AttrMeta>), Error> {
        let payload = encode(&UpdateRequest {
            seq: session.id().seq(),
            rev: session.rev(),
            ns: ns.to_string(),
            attrs: attrs.clone(),
        })?;

        let result = self.call(ctx, session.id().peer(), UPDATE_COMMAND, payload).await;
        let response: UpdateResponse = match result {
            Ok(payload) => decode(&payload)?,
            Err(err) if err.is_failure_type(NOT_FOUND_FAILURE) => return Err(Error::NotFound(session.id())),
            Err(err) if err.is_failure_type(STALE_UPDATE_FAILURE) => return Err(Error::StaleUpdate(session)),
            Err(err) if err.is_failure_type(FROZEN_ATTRIBUTES_FAILURE) => {
                return Err(Error::FrozenAttributes(session))
            }
            Err(err) => return Err(err),
        };

        let metas = attrs
            .into_iter()
            .enumerate()
            .map(|(index, attr)| AttrMeta {
                attr,
                created_at: response.created_revs.get(index).copied().unwrap_or(0),
                updated_at: response.rev,
            })
            .collect();

        Ok((response.rev, metas))
    }

    async fn close(&self, ctx: &Context, session: SessionRef) -> Result<(), Error> {
        let payload = encode(&CloseRequest {
            seq: session.id().seq(),
            rev: session.rev(),
        })?;

        let result = self.call(ctx, session.id().peer(), CLOSE_COMMAND, payload).await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.is_failure_type(NOT_FOUND_FAILURE) => Err(Error::NotFound(session.id())),
            Err(err) if err.is_failure_type(STALE_UPDATE_FAILURE) => Err(Error::StaleUpdate(session)),
            Err(err) => Err(err),
        }
    }
}
