use crate::api::{validate_namespace, Error};
use crate::catalog::SessionRegistry;
use crate::command::{CommandHandler, Invoker, Server};
use crate::ident::PeerId;
use crate::notify::{Listener, Notifier};
use crate::peer::session::Session;
use crate::peer::shutdown::Stop;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Peer is one participant in the bus.
///
/// A peer acts as a server by listening for command requests, and as a
/// client through the sessions it creates. Stopping the peer tears down
/// sessions, consumers and pending calls in a fixed order; `done` resolves
/// when the teardown has finished and `err` tells why, if anything went
/// wrong.
pub struct Peer {
    pub(crate) id: PeerId,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) invoker: Arc<Invoker>,
    pub(crate) server: Arc<Server>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) listener: Arc<Listener>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) logger: slog::Logger,
    pub(crate) default_timeout: Duration,
    pub(crate) session_seq: AtomicU32,
    // Fired to cancel in-flight work on immediate stop.
    pub(crate) stop: Stop,
    pub(crate) stopping: AtomicBool,
    pub(crate) done: Stop,
    pub(crate) err: Mutex<Option<Error>>,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Returns a new session owned by this peer. Creating a session
    /// performs no network IO. Sessions created after the peer has been
    /// stopped are unusable; every operation on them fails immediately.
    pub fn session(&self) -> Arc<Session> {
        let seq = self.session_seq.fetch_add(1, Ordering::Relaxed) + 1;

        let session = Session::open(
            self.id.session(seq),
            Arc::clone(&self.invoker),
            Arc::clone(&self.notifier),
            Arc::clone(&self.listener),
            Arc::clone(&self.registry),
            self.default_timeout,
            self.logger.clone(),
        );

        if self.stopping.load(Ordering::Acquire) {
            session.destroy();
        }

        session
    }

    /// Starts listening for command requests in ns. Repeated calls with the
    /// same namespace swap the handler.
    pub async fn listen(&self, ns: &str, handler: Arc<dyn CommandHandler>) -> Result<(), Error> {
        validate_namespace(ns)?;

        if self.stopping.load(Ordering::Acquire) {
            return Err(Error::PeerStopped);
        }

        let first = self.server.listen(ns, handler).await?;
        if first {
            slog::debug!(
                self.logger,
                "{} started listening for commands in '{}' namespace",
                self.id.short_string(),
                ns
            );
        }

        Ok(())
    }

    /// Stops listening for command requests in ns. Not an error if the peer
    /// was not listening.
    pub async fn unlisten(&self, ns: &str) -> Result<(), Error> {
        validate_namespace(ns)?;

        let stopped = self.server.unlisten(ns).await?;
        if stopped {
            slog::debug!(
                self.logger,
                "{} stopped listening for commands in '{}' namespace",
                self.id.short_string(),
                ns
            );
        }

        Ok(())
    }

    /// Resolves when the peer has stopped. `err` is readable afterwards.
    pub async fn done(&self) {
        self.done.wait().await
    }

    /// The error that caused the peer to stop; None after a requested stop.
    pub fn err(&self) -> Option<Error> {
        self.err.lock().expect("peer error lock poison").clone()
    }

    /// Disconnects immediately: in-flight handlers are cancelled, their
    /// deliveries return to the broker. Does not block; await `done` to
    /// observe completion.
    pub fn stop(self: &Arc<Self>) {
        self.shutdown(false, None);
    }

    /// Disconnects once in-flight calls and handlers have completed. Does
    /// not block; await `done` to observe completion.
    pub fn graceful_stop(self: &Arc<Self>) {
        self.shutdown(true, None);
    }

    /// Stops the peer because of a transport fault.
    pub(crate) fn fail(self: &Arc<Self>, err: Error) {
        self.shutdown(false, Some(err));
    }

    fn shutdown(self: &Arc<Self>, graceful: bool, err: Option<Error>) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(err) = err {
            *self.err.lock().expect("peer error lock poison") = Some(err);
        }

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            if graceful {
                slog::debug!(peer.logger, "{} peer is stopping gracefully", peer.id.short_string());
            } else {
                slog::debug!(peer.logger, "{} peer is stopping", peer.id.short_string());
            }

            // Stop taking new work from the broker.
            peer.server.stop_consuming().await;
            peer.listener.stop_consuming().await;

            if graceful {
                // Let handlers and outstanding calls finish on their own.
                peer.server.drain().await;
                peer.listener.drain().await;
                peer.invoker.drain_calls().await;
                peer.invoker.drain().await;
            } else {
                // Cancel them; unsettled deliveries return to the broker.
                peer.stop.signal();
            }

            for catalog in peer.registry.catalogs() {
                catalog.close();
            }

            // Cancel whatever calls remain, then stop correlating responses.
            peer.stop.signal();
            peer.invoker.stop_consuming().await;

            let _ = peer.transport.deregister_peer(peer.id).await;

            match peer.err() {
                Some(err) => slog::info!(peer.logger, "{} peer stopped with error: {}", peer.id.short_string(), err),
                None => slog::info!(peer.logger, "{} peer stopped", peer.id.short_string()),
            }

            peer.done.signal();
        });
    }
}
