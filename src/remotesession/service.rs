use crate::api::{Context, Error};
use crate::catalog::{SessionRegistry, SessionRevision};
use crate::command::{CommandHandler, Request, Responder};
use crate::ident::PeerId;
use crate::remotesession::rpc::{
    CloseRequest, FetchRequest, FetchResponse, UpdateRequest, UpdateResponse, CLOSE_COMMAND, FETCH_COMMAND,
    FROZEN_ATTRIBUTES_FAILURE, NOT_FOUND_FAILURE, STALE_UPDATE_FAILURE, UPDATE_COMMAND,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// SessionService answers the session sync commands other peers send about
/// sessions this peer owns. It is installed on the reserved `_sess`
/// namespace at peer start.
pub(crate) struct SessionService {
    peer_id: PeerId,
    registry: Arc<SessionRegistry>,
    logger: slog::Logger,
}

impl SessionService {
    pub(crate) fn new(peer_id: PeerId, registry: Arc<SessionRegistry>, logger: slog::Logger) -> Arc<SessionService> {
        Arc::new(SessionService {
            peer_id,
            registry,
            logger,
        })
    }

    async fn fetch(&self, request: Request, response: Responder) {
        let args: FetchRequest = match decode(&request.payload) {
            Ok(args) => args,
            Err(message) => return response.error(&message).await,
        };

        let catalog = match self.registry.get_catalog(self.peer_id.session(args.seq)) {
            Some(catalog) => catalog,
            None => {
                response.fail(NOT_FOUND_FAILURE, "", Bytes::new()).await;
                return;
            }
        };

        let (session, attrs) = catalog.attrs();
        let mut reply = FetchResponse {
            rev: session.rev(),
            attrs: Vec::with_capacity(args.keys.len()),
        };

        if !args.keys.is_empty() {
            if let Some(table) = attrs.namespace(&args.ns) {
                for key in &args.keys {
                    if let Some(meta) = table.get(key) {
                        reply.attrs.push(meta.clone());
                    }
                }
            }
        }

        match encode(&reply) {
            Ok(payload) => response.done(payload).await,
            Err(message) => response.error(&message).await,
        }
    }

    async fn update(&self, request: Request, response: Responder) {
        let args: UpdateRequest = match decode(&request.payload) {
            Ok(args) => args,
            Err(message) => return response.error(&message).await,
        };

        let id = self.peer_id.session(args.seq);
        let catalog = match self.registry.get_catalog(id) {
            Some(catalog) => catalog,
            None => {
                response.fail(NOT_FOUND_FAILURE, "", Bytes::new()).await;
                return;
            }
        };

        let mut diff = String::new();
        let updated = catalog.try_update(id.at(args.rev), &args.ns, args.attrs.clone(), Some(&mut diff));
        let updated = match updated {
            Ok(updated) => updated,
            Err(err) => {
                match err {
                    Error::NotFound(_) => {
                        response.fail(NOT_FOUND_FAILURE, "", Bytes::new()).await;
                    }
                    Error::StaleUpdate(_) => {
                        response.fail(STALE_UPDATE_FAILURE, "", Bytes::new()).await;
                    }
                    Error::FrozenAttributes(_) => {
                        response.fail(FROZEN_ATTRIBUTES_FAILURE, "", Bytes::new()).await;
                    }
                    other => response.error(&other.to_string()).await,
                }
                return;
            }
        };

        slog::debug!(
            self.logger,
            "{} session updated by {} {{{}::{}}}",
            updated.session_ref().short_string(),
            request.source.session_ref().id().peer().short_string(),
            args.ns,
            diff
        );

        let (_, attrs) = catalog.attrs();
        let table = attrs.namespace(&args.ns);

        let reply = UpdateResponse {
            rev: updated.session_ref().rev(),
            created_revs: args
                .attrs
                .iter()
                .map(|attr| {
                    table
                        .and_then(|t| t.get(&attr.key))
                        .map(|meta| meta.created_at)
                        .unwrap_or(0)
                })
                .collect(),
        };

        match encode(&reply) {
            Ok(payload) => response.done(payload).await,
            Err(message) => response.error(&message).await,
        }
    }

    async fn close(&self, request: Request, response: Responder) {
        let args: CloseRequest = match decode(&request.payload) {
            Ok(args) => args,
            Err(message) => return response.error(&message).await,
        };

        let id = self.peer_id.session(args.seq);
        let catalog = match self.registry.get_catalog(id) {
            Some(catalog) => catalog,
            None => {
                response.fail(NOT_FOUND_FAILURE, "", Bytes::new()).await;
                return;
            }
        };

        match catalog.try_destroy(id.at(args.rev)) {
            Ok(()) => {
                slog::debug!(
                    self.logger,
                    "{} session destroyed by {}",
                    id.at(args.rev).short_string(),
                    request.source.session_ref().id().peer().short_string()
                );
                response.close().await;
            }
            Err(Error::StaleUpdate(_)) => {
                response.fail(STALE_UPDATE_FAILURE, "", Bytes::new()).await;
            }
            Err(other) => response.error(&other.to_string()).await,
        }
    }
}

#[async_trait]
impl CommandHandler for SessionService {
    async fn handle(&self, _ctx: Context, request: Request, response: Responder) {
        match request.command.as_str() {
            FETCH_COMMAND => self.fetch(request, response).await,
            UPDATE_COMMAND => self.update(request, response).await,
            CLOSE_COMMAND => self.close(request, response).await,
            _ => response.error("unknown command").await,
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &Bytes) -> Result<T, String> {
    serde_json::from_slice(payload).map_err(|err| err.to_string())
}

fn encode<T: Serialize>(reply: &T) -> Result<Bytes, String> {
    serde_json::to_vec(reply).map(Bytes::from).map_err(|err| err.to_string())
}
