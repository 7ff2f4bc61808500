use crate::api::{validate_namespace, Context, Error};
use crate::attributes::{Attr, NamespacedTable};
use crate::catalog::local::Catalog;
use crate::ident::SessionRef;
use async_trait::async_trait;
use std::sync::Arc;

/// SessionRevision is a read handle onto a session at a specific revision.
///
/// For sessions owned by the local peer it reads catalog snapshots directly;
/// for remote sessions it reads through the remote catalog cache. The handle
/// is also the optimistic-concurrency token: `update` and `destroy` carry
/// the handle's ref and fail if the session has moved past it.
#[async_trait]
pub trait SessionRevision: Send + Sync {
    fn session_ref(&self) -> SessionRef;

    /// Returns a handle at the session's current revision.
    async fn refresh(&self, ctx: &Context) -> Result<Box<dyn SessionRevision>, Error>;

    /// Reads one attribute as it was at this revision. Attributes that did
    /// not exist yet read as empty.
    async fn get(&self, ctx: &Context, ns: &str, key: &str) -> Result<Attr, Error>;

    /// Reads several attributes as they were at this revision.
    async fn get_many(&self, ctx: &Context, ns: &str, keys: &[String]) -> Result<Vec<Attr>, Error>;

    async fn update(
        &self,
        ctx: &Context,
        ns: &str,
        attrs: Vec<Attr>,
    ) -> Result<Box<dyn SessionRevision>, Error>;

    async fn destroy(&self, ctx: &Context) -> Result<(), Error>;
}

/// RevisionStore resolves revision handles for any session, local or remote.
#[async_trait]
pub trait RevisionStore: Send + Sync {
    async fn get_revision(&self, session: SessionRef) -> Result<Box<dyn SessionRevision>, Error>;
}

/// LocalRevision is a revision of a session owned by this peer. It closes
/// over the attribute snapshot taken when the handle was created, so reads
/// never block mutators.
pub struct LocalRevision {
    pub(crate) session: SessionRef,
    pub(crate) attrs: Arc<NamespacedTable>,
    pub(crate) catalog: Arc<Catalog>,
}

impl std::fmt::Debug for LocalRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRevision").field("session", &self.session).finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionRevision for LocalRevision {
    fn session_ref(&self) -> SessionRef {
        self.session
    }

    async fn refresh(&self, _ctx: &Context) -> Result<Box<dyn SessionRevision>, Error> {
        Ok(Box::new(self.catalog.head()))
    }

    async fn get(&self, _ctx: &Context, ns: &str, key: &str) -> Result<Attr, Error> {
        validate_namespace(ns)?;

        self.get_at(ns, key)
    }

    async fn get_many(&self, _ctx: &Context, ns: &str, keys: &[String]) -> Result<Vec<Attr>, Error> {
        validate_namespace(ns)?;

        let mut attrs = Vec::with_capacity(keys.len());
        for key in keys {
            attrs.push(self.get_at(ns, key)?);
        }

        Ok(attrs)
    }

    async fn update(
        &self,
        _ctx: &Context,
        ns: &str,
        attrs: Vec<Attr>,
    ) -> Result<Box<dyn SessionRevision>, Error> {
        validate_namespace(ns)?;

        let next = self.catalog.try_update(self.session, ns, attrs, None)?;
        Ok(Box::new(next))
    }

    async fn destroy(&self, _ctx: &Context) -> Result<(), Error> {
        self.catalog.try_destroy(self.session)
    }
}

impl LocalRevision {
    fn get_at(&self, ns: &str, key: &str) -> Result<Attr, Error> {
        let empty = || Attr {
            key: key.to_string(),
            ..Attr::default()
        };

        let meta = match self.attrs.namespace(ns).and_then(|table| table.get(key)) {
            Some(meta) => meta,
            None => return Ok(empty()),
        };

        // The snapshot may be newer than this handle's revision; read it as
        // the session looked back then.
        if meta.created_at > self.session.rev() {
            return Ok(empty());
        }
        if meta.updated_at > self.session.rev() {
            return Err(Error::StaleFetch(self.session));
        }

        Ok(meta.attr.clone())
    }
}

/// ClosedRevision stands in for any revision of a session that is known to
/// be destroyed.
pub struct ClosedRevision(pub SessionRef);

#[async_trait]
impl SessionRevision for ClosedRevision {
    fn session_ref(&self) -> SessionRef {
        self.0
    }

    async fn refresh(&self, _ctx: &Context) -> Result<Box<dyn SessionRevision>, Error> {
        Err(Error::NotFound(self.0.id()))
    }

    async fn get(&self, _ctx: &Context, _ns: &str, _key: &str) -> Result<Attr, Error> {
        Err(Error::NotFound(self.0.id()))
    }

    async fn get_many(&self, _ctx: &Context, _ns: &str, _keys: &[String]) -> Result<Vec<Attr>, Error> {
        Err(Error::NotFound(self.0.id()))
    }

    async fn update(
        &self,
        _ctx: &Context,
        _ns: &str,
        _attrs: Vec<Attr>,
    ) -> Result<Box<dyn SessionRevision>, Error> {
        Err(Error::NotFound(self.0.id()))
    }

    /// Destroying an already-destroyed session is not an error.
    async fn destroy(&self, _ctx: &Context) -> Result<(), Error> {
        Ok(())
    }
}
