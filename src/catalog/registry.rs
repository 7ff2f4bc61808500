use crate::catalog::local::Catalog;
use crate::ident::SessionId;
use crate::peer::Session;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// SessionRegistry tracks the sessions owned by one peer.
///
/// The command server resolves request sources against it, and the session
/// sync service uses it to find the catalogs of sessions queried by remote
/// peers. Entries are removed when the session's catalog closes.
pub struct SessionRegistry {
    entries: RwLock<HashMap<SessionId, Entry>>,
}

struct Entry {
    session: Arc<Session>,
    catalog: Arc<Catalog>,
}

impl SessionRegistry {
    pub fn new() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry {
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn insert(&self, session: Arc<Session>, catalog: Arc<Catalog>) {
        let id = session.id();
        self.lock_write().insert(id, Entry { session, catalog });
    }

    pub fn get(&self, id: SessionId) -> Option<(Arc<Session>, Arc<Catalog>)> {
        self.lock_read()
            .get(&id)
            .map(|entry| (Arc::clone(&entry.session), Arc::clone(&entry.catalog)))
    }

    pub fn get_catalog(&self, id: SessionId) -> Option<Arc<Catalog>> {
        self.lock_read().get(&id).map(|entry| Arc::clone(&entry.catalog))
    }

    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock_read().get(&id).map(|entry| Arc::clone(&entry.session))
    }

    pub fn remove(&self, id: SessionId) {
        self.lock_write().remove(&id);
    }

    /// Snapshot of every live catalog; used at peer teardown.
    pub fn catalogs(&self) -> Vec<Arc<Catalog>> {
        self.lock_read().values().map(|entry| Arc::clone(&entry.catalog)).collect()
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Entry>> {
        self.entries.read().expect("session registry lock poison")
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Entry>> {
        self.entries.write().expect("session registry lock poison")
    }
}
