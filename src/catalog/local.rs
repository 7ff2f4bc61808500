use crate::api::Error;
use crate::attributes::{write_diff, Attr, AttrMeta, NamespacedTable, Table};
use crate::catalog::revision::LocalRevision;
use crate::ident::{MessageId, Revision, SessionId, SessionRef};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// Catalog is the authoritative attribute table for one session, held by the
/// peer that owns the session. There is a one-to-one relationship between
/// sessions and catalogs.
///
/// The revision number is the single source of truth for the session's
/// "now". Mutations are optimistic: they carry the ref the mutator last
/// observed and fail with [`Error::StaleUpdate`] if the catalog has moved on.
pub struct Catalog {
    logger: slog::Logger,
    state: RwLock<State>,
    // Closed exactly once on any destroy path.
    done: watch::Sender<bool>,
}

struct State {
    session: SessionRef,
    attrs: Arc<NamespacedTable>,
    // Message counter for the current revision; reset by every update.
    seq: u32,
    closed: bool,
}

impl Catalog {
    pub fn new(id: SessionId, logger: slog::Logger) -> Arc<Catalog> {
        let (done, _) = watch::channel(false);

        Arc::new(Catalog {
            logger,
            state: RwLock::new(State {
                session: id.at(0),
                attrs: Arc::new(NamespacedTable::new()),
                seq: 0,
                closed: false,
            }),
            done,
        })
    }

    /// The most recent session ref. Its revision increments each time a call
    /// to [`Catalog::try_update`] succeeds.
    pub fn session_ref(&self) -> SessionRef {
        self.read().session
    }

    /// Allocates the next message ID, and returns it with the attribute
    /// snapshot the sender observed, so callers can attach attributes to the
    /// outgoing message without re-reading under lock.
    pub fn next_message_id(&self) -> (MessageId, Arc<NamespacedTable>) {
        let mut state = self.write();

        state.seq += 1;
        (state.session.message(state.seq), Arc::clone(&state.attrs))
    }

    /// A read handle at the most recent revision.
    pub fn head(self: &Arc<Self>) -> LocalRevision {
        let state = self.read();

        LocalRevision {
            session: state.session,
            attrs: Arc::clone(&state.attrs),
            catalog: Arc::clone(self),
        }
    }

    /// A read handle at a past revision. The revision can not be newer than
    /// the current session ref.
    pub fn at(self: &Arc<Self>, rev: Revision) -> Result<LocalRevision, Error> {
        let state = self.read();

        if state.session.rev() < rev {
            return Err(Error::FutureRevision(state.session.id().at(rev)));
        }

        Ok(LocalRevision {
            session: state.session.id().at(rev),
            attrs: Arc::clone(&state.attrs),
            catalog: Arc::clone(self),
        })
    }

    /// All attributes at the most recent revision.
    pub fn attrs(&self) -> (SessionRef, Arc<NamespacedTable>) {
        let state = self.read();
        (state.session, Arc::clone(&state.attrs))
    }

    /// The ns sub-table at the most recent revision.
    pub fn attrs_in(&self, ns: &str) -> (SessionRef, Option<Arc<Table>>) {
        let state = self.read();
        (state.session, state.attrs.namespace(ns).cloned())
    }

    /// Adds or updates attributes in the ns namespace and returns the new
    /// head revision.
    ///
    /// The revision always increments and the message counter always resets,
    /// even when no attribute changed; a no-op update is the sanctioned way
    /// to fence messages against the new revision. The namespace sub-table
    /// is only replaced when something actually changed.
    ///
    /// A human-readable representation of the changes is appended to diff,
    /// if it is provided.
    pub fn try_update(
        self: &Arc<Self>,
        session: SessionRef,
        ns: &str,
        attrs: Vec<Attr>,
        mut diff: Option<&mut String>,
    ) -> Result<LocalRevision, Error> {
        let mut state = self.write();

        if state.closed {
            return Err(Error::NotFound(state.session.id()));
        }

        if session != state.session {
            return Err(Error::StaleUpdate(session));
        }

        let next_rev = session.rev() + 1;
        let mut changed = String::new();
        let mut next_table = match state.attrs.namespace(ns) {
            Some(table) => (**table).clone(),
            None => Table::new(),
        };

        for attr in attrs {
            let existing = next_table.get(&attr.key);

            match existing {
                Some(existing) => {
                    if existing.attr == attr {
                        continue;
                    }

                    if existing.attr.is_frozen {
                        return Err(Error::FrozenAttributes(session));
                    }
                }
                None => {
                    // Clearing an attribute that never existed is a no-op.
                    if attr.value.is_empty() && !attr.is_frozen {
                        continue;
                    }
                }
            }

            let meta = AttrMeta {
                created_at: existing.map(|e| e.created_at).unwrap_or(next_rev),
                updated_at: next_rev,
                attr,
            };

            if !changed.is_empty() {
                changed.push_str(", ");
            }
            write_diff(&mut changed, &meta);

            next_table.insert(meta);
        }

        state.session = session.id().at(next_rev);
        state.seq = 0;

        if !changed.is_empty() {
            state.attrs = Arc::new(state.attrs.with_namespace(ns, next_table));

            slog::debug!(
                self.logger,
                "{} session updated {{{}::{}}}",
                state.session.short_string(),
                ns,
                changed
            );
        }

        if let Some(diff) = diff.take() {
            diff.push_str(&changed);
        }

        Ok(LocalRevision {
            session: state.session,
            attrs: Arc::clone(&state.attrs),
            catalog: Arc::clone(self),
        })
    }

    /// Closes the catalog if session is the current ref. Closing an
    /// already-closed catalog is not an error.
    pub fn try_destroy(&self, session: SessionRef) -> Result<(), Error> {
        let mut state = self.write();

        if session != state.session {
            return Err(Error::StaleUpdate(session));
        }

        self.close_locked(&mut state);

        Ok(())
    }

    /// Forcefully closes the catalog. Used during peer teardown.
    pub fn close(&self) {
        let mut state = self.write();
        self.close_locked(&mut state);
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Resolves when the catalog is closed.
    pub async fn done(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|closed| *closed).await;
    }

    fn close_locked(&self, state: &mut RwLockWriteGuard<'_, State>) {
        if state.closed {
            return;
        }

        state.closed = true;
        self.done.send_replace(true);

        slog::debug!(
            self.logger,
            "{} session destroyed {{{}}}",
            state.session.short_string(),
            state.attrs
        );
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().expect("catalog lock poison")
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().expect("catalog lock poison")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Context;
    use crate::attributes::attr;
    use crate::catalog::revision::SessionRevision;
    use crate::ident::PeerId;

    fn catalog() -> Arc<Catalog> {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        Catalog::new(PeerId::new(1, 2).session(1), logger)
    }

    #[test]
    fn starts_at_revision_zero() {
        let catalog = catalog();
        assert_eq!(catalog.session_ref().rev(), 0);
    }

    #[test]
    fn try_update_returns_a_strictly_greater_revision() {
        let catalog = catalog();
        let mut session = catalog.session_ref();

        for _ in 0..10 {
            let rev = catalog
                .try_update(session, "ns", vec![attr::set("k", "v")], None)
                .unwrap();
            assert!(rev.session_ref().rev() > session.rev());
            session = rev.session_ref();
        }
    }

    #[test]
    fn try_update_with_stale_ref_fails() {
        let catalog = catalog();
        let stale = catalog.session_ref();

        catalog.try_update(stale, "ns", vec![attr::set("x", "1")], None).unwrap();

        let err = catalog
            .try_update(stale, "ns", vec![attr::set("x", "2")], None)
            .unwrap_err();
        assert!(matches!(err, Error::StaleUpdate(r) if r == stale));

        // The losing update must not have touched the table.
        let (_, attrs) = catalog.attrs();
        let meta = attrs.namespace("ns").unwrap().get("x").unwrap();
        assert_eq!(meta.attr.value, "1");
    }

    #[test]
    fn no_op_update_still_bumps_the_revision() {
        let catalog = catalog();
        let before = catalog.session_ref();

        let rev = catalog.try_update(before, "ns", vec![], None).unwrap();
        assert_eq!(rev.session_ref().rev(), before.rev() + 1);

        // No namespace table should have been created.
        let (_, attrs) = catalog.attrs();
        assert!(attrs.namespace("ns").is_none());
    }

    #[test]
    fn unchanged_attributes_are_skipped() {
        let catalog = catalog();
        let first = catalog
            .try_update(catalog.session_ref(), "ns", vec![attr::set("k", "v")], None)
            .unwrap();

        catalog
            .try_update(first.session_ref(), "ns", vec![attr::set("k", "v")], None)
            .unwrap();

        let (session, attrs) = catalog.attrs();
        let meta = attrs.namespace("ns").unwrap().get("k").unwrap();
        assert_eq!(session.rev(), 2);
        assert_eq!(meta.updated_at, 1);
        assert_eq!(meta.created_at, 1);
    }

    #[test]
    fn frozen_attributes_can_not_change() {
        let catalog = catalog();
        let frozen_at = catalog
            .try_update(catalog.session_ref(), "ns", vec![attr::freeze("k", "v1")], None)
            .unwrap()
            .session_ref();

        let err = catalog
            .try_update(frozen_at, "ns", vec![attr::set("k", "v2")], None)
            .unwrap_err();
        assert!(matches!(err, Error::FrozenAttributes(r) if r == frozen_at));

        // Re-freezing with the identical value is a no-op, not an error.
        catalog
            .try_update(frozen_at, "ns", vec![attr::freeze("k", "v1")], None)
            .unwrap();
    }

    #[test]
    fn message_ids_fence_on_updates() {
        let catalog = catalog();

        let (first, _) = catalog.next_message_id();
        let (second, _) = catalog.next_message_id();
        assert_eq!(first.session(), second.session());
        assert!(second.seq() > first.seq());

        catalog.try_update(catalog.session_ref(), "ns", vec![], None).unwrap();

        let (after, _) = catalog.next_message_id();
        assert_eq!(after.seq(), 1);
        assert!(after.session().rev() > second.session().rev());
    }

    #[test]
    fn diff_buffer_describes_the_changes() {
        let catalog = catalog();
        let mut diff = String::new();

        let rev = catalog
            .try_update(
                catalog.session_ref(),
                "ns",
                vec![attr::set("a", "1"), attr::freeze("b", "2")],
                Some(&mut diff),
            )
            .unwrap();

        assert_eq!(diff, "+a=1, +b@2");

        diff.clear();
        catalog
            .try_update(rev.session_ref(), "ns", vec![attr::set("a", "3")], Some(&mut diff))
            .unwrap();
        assert_eq!(diff, "a=3");
    }

    #[test]
    fn at_rejects_future_revisions() {
        let catalog = catalog();
        assert!(catalog.at(0).is_ok());
        assert!(matches!(catalog.at(1), Err(Error::FutureRevision(_))));
    }

    #[tokio::test]
    async fn revision_handles_read_as_of_their_revision() {
        let ctx = Context::background();
        let catalog = catalog();

        let v1 = catalog
            .try_update(catalog.session_ref(), "ns", vec![attr::set("k", "v1")], None)
            .unwrap();
        catalog
            .try_update(v1.session_ref(), "ns", vec![attr::set("k", "v2"), attr::set("new", "x")], None)
            .unwrap();

        // A fresh handle at rev 1 sees the rev 2 snapshot, but must answer
        // as of rev 1.
        let at_v1 = catalog.at(1).unwrap();
        assert!(matches!(at_v1.get(&ctx, "ns", "k").await, Err(Error::StaleFetch(_))));

        let new_attr = at_v1.get(&ctx, "ns", "new").await.unwrap();
        assert_eq!(new_attr.value, "");

        let head = catalog.head();
        assert_eq!(head.get(&ctx, "ns", "k").await.unwrap().value, "v2");
    }

    #[tokio::test]
    async fn destroy_paths_close_done_exactly_once() {
        let catalog = catalog();

        let err = catalog.try_destroy(catalog.session_ref().id().at(7)).unwrap_err();
        assert!(matches!(err, Error::StaleUpdate(_)));
        assert!(!catalog.is_closed());

        catalog.try_destroy(catalog.session_ref()).unwrap();
        assert!(catalog.is_closed());
        catalog.done().await;

        // Idempotent on every path.
        catalog.try_destroy(catalog.session_ref()).unwrap();
        catalog.close();
        catalog.done().await;
    }

    #[test]
    fn updates_after_close_fail_with_not_found() {
        let catalog = catalog();
        let session = catalog.session_ref();
        catalog.close();

        let err = catalog.try_update(session, "ns", vec![attr::set("k", "v")], None).unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == session.id()));
    }

    #[tokio::test]
    async fn concurrent_updates_with_the_same_ref_race_to_one_winner() {
        let catalog = catalog();
        let session = catalog.session_ref();

        let mut tasks = Vec::new();
        for i in 0..2 {
            let catalog = Arc::clone(&catalog);
            tasks.push(tokio::task::spawn_blocking(move || {
                catalog
                    .try_update(session, "u", vec![attr::set("x", i.to_string())], None)
                    .map(|rev| rev.session_ref())
            }));
        }

        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(new_ref) => {
                    wins += 1;
                    assert_eq!(new_ref.rev(), session.rev() + 1);
                }
                Err(err) => assert!(matches!(err, Error::StaleUpdate(r) if r == session)),
            }
        }

        assert_eq!(wins, 1);
    }
}
