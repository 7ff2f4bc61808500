use crate::api::{validate_namespace, Context, Error};
use crate::attributes::{Attr, AttrMeta};
use crate::catalog::{ClosedRevision, SessionRevision};
use crate::ident::{Revision, SessionId, SessionRef};
use crate::remotesession::rpc::SessionRpc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// RemoteCatalog is a cached view of a session owned by another peer.
///
/// The cache answers three kinds of read without a round-trip: frozen
/// attributes (valid forever), attributes created after the requested
/// revision (known empty), and attributes last observed at or after the
/// requested revision. It also detects requests about the past: if the
/// cache proves an attribute changed after the requested revision the fetch
/// is stale, no matter what the remote would answer.
///
/// Lock discipline is classify under the read lock, RPC with no lock held,
/// then merge under the write lock.
pub struct RemoteCatalog {
    id: SessionId,
    rpc: Arc<dyn SessionRpc>,
    state: RwLock<State>,
}

struct State {
    highest_rev: Revision,
    cache: HashMap<String, HashMap<String, CacheEntry>>,
    closed: bool,
}

#[derive(Clone)]
struct CacheEntry {
    meta: AttrMeta,
    /// The revision at which this peer observed exactly this metadata.
    fetched_at: Revision,
}

impl RemoteCatalog {
    pub(crate) fn new(id: SessionId, rpc: Arc<dyn SessionRpc>) -> Arc<RemoteCatalog> {
        Arc::new(RemoteCatalog {
            id,
            rpc,
            state: RwLock::new(State {
                highest_rev: 0,
                cache: HashMap::new(),
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Fetches the session's current revision from the owning peer and
    /// returns a handle at it.
    pub async fn head(self: &Arc<Self>, ctx: &Context) -> Result<RemoteRevision, Error> {
        {
            let state = self.read();
            if state.closed {
                return Err(Error::NotFound(self.id));
            }
        }

        let result = self.rpc.fetch(ctx, self.id, "", Vec::new()).await;

        let mut state = self.write();
        self.update_state(&mut state, result)?;

        Ok(RemoteRevision {
            session: self.id.at(state.highest_rev),
            catalog: Arc::clone(self),
        })
    }

    /// Returns a handle at rev without a round-trip. A caller that can name
    /// this revision has observed it elsewhere, so the highest known
    /// revision is promoted.
    pub fn at(self: &Arc<Self>, rev: Revision) -> Box<dyn SessionRevision> {
        let mut state = self.write();

        if state.closed {
            return Box::new(ClosedRevision(self.id.at(rev)));
        }

        if rev > state.highest_rev {
            state.highest_rev = rev;
        }

        Box::new(RemoteRevision {
            session: self.id.at(rev),
            catalog: Arc::clone(self),
        })
    }

    /// Reads the given keys as they were at rev, from cache where sound and
    /// from the owning peer otherwise. Attributes that did not exist at rev
    /// are omitted from the result.
    pub async fn fetch(&self, ctx: &Context, rev: Revision, ns: &str, keys: &[String]) -> Result<Vec<Attr>, Error> {
        let (mut solved, unsolved) = self.fetch_local(rev, ns, keys)?;
        if unsolved.is_empty() {
            return Ok(solved);
        }

        let result = self.rpc.fetch(ctx, self.id, ns, unsolved).await;

        let mut state = self.write();
        let (fetched_rev, fetched) = self.update_state(&mut state, result)?;

        if fetched.is_empty() {
            return Ok(solved);
        }

        let cache = state.cache.entry(ns.to_string()).or_default();
        let mut is_stale = false;

        for meta in fetched {
            let known = cache.get(&meta.attr.key).map(|e| e.fetched_at).unwrap_or(0);
            if fetched_rev > known {
                cache.insert(
                    meta.attr.key.clone(),
                    CacheEntry {
                        meta: meta.clone(),
                        fetched_at: fetched_rev,
                    },
                );
            }

            if is_stale {
                continue;
            }

            // Not yet created at rev: known empty, nothing to return.
            if meta.created_at > rev {
                continue;
            }

            // Changed after rev: the requested revision is in the past. Keep
            // merging so future queries benefit from the cache.
            if meta.updated_at > rev {
                is_stale = true;
                continue;
            }

            solved.push(meta.attr);
        }

        if is_stale {
            return Err(Error::StaleFetch(self.id.at(rev)));
        }

        Ok(solved)
    }

    /// Applies an optimistic update at rev, filtering out writes the cache
    /// can prove are no-ops and rejecting writes it can prove will fail.
    pub async fn try_update(
        self: &Arc<Self>,
        ctx: &Context,
        rev: Revision,
        ns: &str,
        attrs: Vec<Attr>,
    ) -> Result<RemoteRevision, Error> {
        let session = self.id.at(rev);

        let filtered = {
            let state = self.read();

            if state.closed {
                return Err(Error::NotFound(self.id));
            }

            if state.highest_rev > rev {
                return Err(Error::StaleUpdate(session));
            }

            let cache = state.cache.get(ns);
            let mut filtered = Vec::with_capacity(attrs.len());

            for attr in attrs {
                if let Some(entry) = cache.and_then(|c| c.get(&attr.key)) {
                    if entry.meta.attr.is_frozen {
                        if attr == entry.meta.attr {
                            continue;
                        }
                        return Err(Error::FrozenAttributes(session));
                    }

                    // The server will agree this is a no-op.
                    if entry.fetched_at == rev && attr == entry.meta.attr {
                        continue;
                    }
                }

                filtered.push(attr);
            }

            filtered
        };

        let result = self.rpc.update(ctx, session, ns, filtered).await;

        let mut state = self.write();
        let (updated_rev, metas) = self.update_state(&mut state, result)?;

        let cache = state.cache.entry(ns.to_string()).or_default();
        for meta in metas {
            let known = cache.get(&meta.attr.key).map(|e| e.fetched_at).unwrap_or(0);
            if updated_rev > known {
                cache.insert(
                    meta.attr.key.clone(),
                    CacheEntry {
                        meta,
                        fetched_at: updated_rev,
                    },
                );
            }
        }

        Ok(RemoteRevision {
            session: self.id.at(state.highest_rev),
            catalog: Arc::clone(self),
        })
    }

    /// Destroys the session on the owning peer if rev is current.
    pub async fn try_destroy(&self, ctx: &Context, rev: Revision) -> Result<(), Error> {
        {
            let state = self.read();

            if state.closed {
                return Err(Error::NotFound(self.id));
            }

            if state.highest_rev > rev {
                return Err(Error::StaleUpdate(self.id.at(rev)));
            }
        }

        self.rpc.close(ctx, self.id.at(rev)).await?;

        self.write().closed = true;

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Classifies keys against the cache. Returns the attributes solved
    /// locally and the keys that need a round-trip.
    fn fetch_local(&self, rev: Revision, ns: &str, keys: &[String]) -> Result<(Vec<Attr>, Vec<String>), Error> {
        let state = self.read();

        let mut solved = Vec::with_capacity(keys.len());
        let mut unsolved = Vec::with_capacity(keys.len());
        let cache = state.cache.get(ns);

        for key in keys {
            if let Some(entry) = cache.and_then(|c| c.get(key)) {
                // Not yet created at rev: known empty.
                if entry.meta.created_at > rev {
                    continue;
                }

                // Changed after rev: positively stale, no round-trip can fix
                // it.
                if entry.meta.updated_at > rev {
                    return Err(Error::StaleFetch(self.id.at(rev)));
                }

                // Frozen never changes; an observation at or after rev is
                // still valid.
                if entry.meta.attr.is_frozen || rev <= entry.fetched_at {
                    solved.push(entry.meta.attr.clone());
                    continue;
                }
            }

            unsolved.push(key.clone());
        }

        if !unsolved.is_empty() && state.closed {
            return Err(Error::NotFound(self.id));
        }

        Ok((solved, unsolved))
    }

    /// Records what an RPC outcome teaches us: a not-found error means the
    /// session is gone, a success promotes the highest known revision.
    fn update_state<T>(
        &self,
        state: &mut RwLockWriteGuard<'_, State>,
        result: Result<(Revision, T), Error>,
    ) -> Result<(Revision, T), Error> {
        match result {
            Ok((rev, value)) => {
                if rev > state.highest_rev {
                    state.highest_rev = rev;
                }
                Ok((rev, value))
            }
            Err(err) => {
                if err.is_not_found() {
                    state.closed = true;
                }
                Err(err)
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().expect("remote catalog lock poison")
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().expect("remote catalog lock poison")
    }
}

/// RemoteRevision is a revision handle for a session owned by another peer.
pub struct RemoteRevision {
    session: SessionRef,
    catalog: Arc<RemoteCatalog>,
}

impl std::fmt::Debug for RemoteRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRevision").field("session", &self.session).finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl SessionRevision for RemoteRevision {
    fn session_ref(&self) -> SessionRef {
        self.session
    }

    async fn refresh(&self, ctx: &Context) -> Result<Box<dyn SessionRevision>, Error> {
        Ok(Box::new(self.catalog.head(ctx).await?))
    }

    async fn get(&self, ctx: &Context, ns: &str, key: &str) -> Result<Attr, Error> {
        validate_namespace(ns)?;

        let keys = vec![key.to_string()];
        let attrs = self.catalog.fetch(ctx, self.session.rev(), ns, &keys).await?;

        Ok(attrs.into_iter().next().unwrap_or_else(|| Attr {
            key: key.to_string(),
            ..Attr::default()
        }))
    }

    async fn get_many(&self, ctx: &Context, ns: &str, keys: &[String]) -> Result<Vec<Attr>, Error> {
        validate_namespace(ns)?;

        let fetched = self.catalog.fetch(ctx, self.session.rev(), ns, keys).await?;
        let mut by_key: HashMap<String, Attr> =
            fetched.into_iter().map(|attr| (attr.key.clone(), attr)).collect();

        Ok(keys
            .iter()
            .map(|key| {
                by_key.remove(key).unwrap_or_else(|| Attr {
                    key: key.clone(),
                    ..Attr::default()
                })
            })
            .collect())
    }

    async fn update(&self, ctx: &Context, ns: &str, attrs: Vec<Attr>) -> Result<Box<dyn SessionRevision>, Error> {
        validate_namespace(ns)?;

        let next = self.catalog.try_update(ctx, self.session.rev(), ns, attrs).await?;
        Ok(Box::new(next))
    }

    async fn destroy(&self, ctx: &Context) -> Result<(), Error> {
        self.catalog.try_destroy(ctx, self.session.rev()).await
    }
}
