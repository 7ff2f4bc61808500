use crate::api::{Config, ConfigError, Error, Options};
use crate::catalog::{RevisionStore, SessionRegistry};
use crate::command::{Invoker, Server};
use crate::ident::PeerId;
use crate::notify::{Listener, Notifier};
use crate::peer::peer::Peer;
use crate::peer::shutdown::Stop;
use crate::remotesession::{
    InvokerRpc, RemoteStore, RevisionResolver, SessionRpc, SessionService, SESSION_NAMESPACE,
};
use crate::transport::{Transport, TransportError};
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// PeerConfig is everything needed to start a peer: the broker it talks
/// through and its options.
pub struct PeerConfig {
    pub transport: Arc<dyn Transport>,
    pub options: Options,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerStartError {
    #[error("illegal options for configuring peer: {0}")]
    IllegalOptions(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Connects a new peer to the bus: registers its queues, starts the
/// invoker, command server, notification listener and session sync service,
/// and begins the remote cache GC.
pub async fn try_start_peer(config: PeerConfig) -> Result<Arc<Peer>, PeerStartError> {
    let resolved = Config::try_from(config.options)?;
    let transport = config.transport;

    let peer_id = PeerId::random();
    let logger = resolved.logger.clone();
    let product = if resolved.product.is_empty() {
        None
    } else {
        Some(resolved.product.clone())
    };

    transport.register_peer(peer_id).await?;

    let stop = Stop::new();
    let registry = SessionRegistry::new();
    let (faults_tx, mut faults_rx) = mpsc::unbounded_channel::<Error>();

    let invoker = Invoker::start(
        peer_id,
        Arc::clone(&transport),
        Arc::clone(&registry),
        product.clone(),
        resolved.session_workers,
        stop.clone(),
        logger.clone(),
    )
    .await?;

    let rpc = InvokerRpc::new(peer_id, Arc::clone(&invoker)) as Arc<dyn SessionRpc>;
    let remotes = RemoteStore::new(rpc, logger.clone());
    let revisions =
        RevisionResolver::new(peer_id, Arc::clone(&registry), Arc::clone(&remotes)) as Arc<dyn RevisionStore>;

    let server = Server::start(
        peer_id,
        Arc::clone(&transport),
        Arc::clone(&revisions),
        resolved.command_workers,
        product.clone(),
        stop.clone(),
        faults_tx,
        logger.clone(),
    )
    .await?;

    let listener = Listener::start(
        peer_id,
        Arc::clone(&transport),
        Arc::clone(&revisions),
        Arc::clone(&registry),
        resolved.session_workers,
        logger.clone(),
    )
    .await?;

    let notifier = Notifier::new(Arc::clone(&transport), product);

    let service = SessionService::new(peer_id, Arc::clone(&registry), logger.clone());
    server.listen(SESSION_NAMESPACE, service).await?;

    // Remote cache GC; stops with the peer.
    tokio::spawn({
        let remotes = Arc::clone(&remotes);
        let stop = stop.clone();
        let mut ticker = tokio::time::interval(resolved.prune_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        async move {
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = stop.wait() => return,
                    _ = ticker.tick() => remotes.prune(),
                }
            }
        }
    });

    let peer = Arc::new(Peer {
        id: peer_id,
        transport,
        invoker,
        server,
        notifier,
        listener,
        registry,
        logger: logger.clone(),
        default_timeout: resolved.default_timeout,
        session_seq: AtomicU32::new(0),
        stop,
        stopping: AtomicBool::new(false),
        done: Stop::new(),
        err: Mutex::new(None),
    });

    // Transport faults reported by background publishers stop the peer.
    tokio::spawn({
        let peer = Arc::downgrade(&peer);
        async move {
            while let Some(err) = faults_rx.recv().await {
                match Weak::upgrade(&peer) {
                    Some(peer) => peer.fail(err),
                    None => return,
                }
            }
        }
    });

    slog::info!(logger, "{} peer started", peer_id.short_string());

    Ok(peer)
}
