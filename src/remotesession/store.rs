use crate::api::Error;
use crate::catalog::{ClosedRevision, RevisionStore, SessionRegistry, SessionRevision};
use crate::ident::{PeerId, SessionId, SessionRef};
use crate::remotesession::catalog::RemoteCatalog;
use crate::remotesession::rpc::SessionRpc;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// RemoteStore caches one [`RemoteCatalog`] per remote session this peer has
/// looked at.
///
/// Entries are garbage collected with a mark-and-sweep: each prune pass
/// drops the entries that have not been touched since the previous pass.
pub struct RemoteStore {
    rpc: Arc<dyn SessionRpc>,
    logger: slog::Logger,
    entries: Mutex<HashMap<SessionId, Entry>>,
}

struct Entry {
    catalog: Arc<RemoteCatalog>,
    marked: bool,
}

impl RemoteStore {
    pub(crate) fn new(rpc: Arc<dyn SessionRpc>, logger: slog::Logger) -> Arc<RemoteStore> {
        Arc::new(RemoteStore {
            rpc,
            logger,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// The catalog for id, created on first use.
    pub fn get(&self, id: SessionId) -> Arc<RemoteCatalog> {
        let mut entries = self.lock();

        let entry = entries.entry(id).or_insert_with(|| Entry {
            catalog: RemoteCatalog::new(id, Arc::clone(&self.rpc)),
            marked: false,
        });
        entry.marked = false;

        Arc::clone(&entry.catalog)
    }

    /// One GC pass: drops entries untouched since the previous pass and
    /// marks the survivors.
    pub fn prune(&self) {
        let mut entries = self.lock();
        let before = entries.len();

        entries.retain(|_, entry| !entry.marked);
        for entry in entries.values_mut() {
            entry.marked = true;
        }

        let dropped = before - entries.len();
        if dropped > 0 {
            slog::debug!(self.logger, "pruned {} remote session(s) from the cache", dropped);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.entries.lock().expect("remote store lock poison")
    }
}

/// RevisionResolver resolves revision handles for any session: against the
/// local registry for sessions this peer owns, and against the remote store
/// otherwise.
pub struct RevisionResolver {
    peer_id: PeerId,
    registry: Arc<SessionRegistry>,
    remotes: Arc<RemoteStore>,
}

impl RevisionResolver {
    pub(crate) fn new(
        peer_id: PeerId,
        registry: Arc<SessionRegistry>,
        remotes: Arc<RemoteStore>,
    ) -> Arc<RevisionResolver> {
        Arc::new(RevisionResolver {
            peer_id,
            registry,
            remotes,
        })
    }
}

#[async_trait]
impl RevisionStore for RevisionResolver {
    async fn get_revision(&self, session: SessionRef) -> Result<Box<dyn SessionRevision>, Error> {
        if session.id().peer() == self.peer_id {
            return match self.registry.get_catalog(session.id()) {
                Some(catalog) => Ok(Box::new(catalog.at(session.rev())?)),
                // Never existed, already destroyed, or the peer's own
                // internal session; all read as closed.
                None => Ok(Box::new(ClosedRevision(session))),
            };
        }

        Ok(self.remotes.get(session.id()).at(session.rev()))
    }
}
