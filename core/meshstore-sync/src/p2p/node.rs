//! Membership: the listener, outbound targets, and the session table.

use super::connection::{ConnectionConfig, HandshakeOutcome, SyncConnection};
use super::lock;
use crate::error::{SyncError, SyncResult};
use futures::future::join_all;
use meshstore_storage::Store;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Node tuning.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub connection: ConnectionConfig,
    /// Sleep between push passes that found nothing to send.
    pub poll_interval: Duration,
    /// Delay between attempts to dial unconnected targets.
    pub reconnect_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            poll_interval: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

struct Session {
    conn: Arc<SyncConnection<TcpStream>>,
    /// Name of the node that dialed this connection.
    initiator: String,
}

/// A replicating node: accepts peers, dials targets, and pushes to every
/// established session.
///
/// Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct SyncNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    store: Arc<Store>,
    config: NodeConfig,
    session_id: Uuid,
    /// Established sessions keyed by the peer's node name.
    sessions: Mutex<HashMap<String, Session>>,
    targets: Mutex<BTreeSet<String>>,
    /// Targets with a dial or session in flight.
    dialing: Mutex<HashSet<String>>,
    /// Peer name last seen behind each target.
    target_names: Mutex<HashMap<String, String>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncNode")
            .field("name", &self.inner.store.node_name())
            .field("session_id", &self.inner.session_id)
            .field("peers", &self.connected_peers())
            .finish()
    }
}

impl SyncNode {
    pub fn new(store: Arc<Store>, config: NodeConfig) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                store,
                config,
                session_id: Uuid::new_v4(),
                sessions: Mutex::new(HashMap::new()),
                targets: Mutex::new(BTreeSet::new()),
                dialing: Mutex::new(HashSet::new()),
                target_names: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Random id of this process, for telling restarts apart in logs.
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn name(&self) -> &str {
        self.inner.store.node_name()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Names of peers with an established session, sorted.
    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock(&self.inner.sessions).keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Binds the listener and accepts connections until shutdown.
    /// Returns the bound address.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> SyncResult<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Network(format!("bind failed: {e}")))?;
        let local = listener.local_addr()?;
        info!(
            "Node {} (session {}) listening on {}",
            self.name(),
            self.inner.session_id,
            local
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!("Accepted connection from {}", remote);
                            tokio::spawn(Arc::clone(&inner).run_session(stream, None));
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    },
                }
            }
            debug!("Listener on {} stopped", local);
        });
        Ok(local)
    }

    /// Adds an address to keep connected. Dialed by the reconnect loop.
    pub fn add_peer(&self, addr: impl Into<String>) {
        lock(&self.inner.targets).insert(addr.into());
    }

    /// Dials `addr` once and runs the session in the background.
    pub async fn connect(&self, addr: &str) -> SyncResult<()> {
        Arc::clone(&self.inner).dial(addr.to_string()).await
    }

    /// Starts the reconnect and push loops.
    pub fn start(&self) {
        tokio::spawn(Arc::clone(&self.inner).reconnect_loop());
        tokio::spawn(Arc::clone(&self.inner).push_loop());
    }

    /// Pushes one batch to every established session. Returns the total
    /// number of frames sent.
    pub async fn push_all(&self) -> usize {
        self.inner.push_all().await
    }

    /// Stops the listener and loops and closes every session.
    pub async fn shutdown(&self) {
        info!("Node {} shutting down", self.name());
        self.inner.cancel.cancel();
        let conns: Vec<_> = lock(&self.inner.sessions)
            .drain()
            .map(|(_, session)| session.conn)
            .collect();
        for conn in conns {
            conn.close().await;
        }
    }
}

impl NodeInner {
    async fn dial(self: Arc<Self>, target: String) -> SyncResult<()> {
        if !lock(&self.dialing).insert(target.clone()) {
            return Ok(());
        }
        let connect = timeout(
            self.config.connection.handshake_timeout,
            TcpStream::connect(target.as_str()),
        );
        match connect.await {
            Ok(Ok(stream)) => {
                debug!("Connected to {}", target);
                tokio::spawn(self.run_session(stream, Some(target)));
                Ok(())
            }
            Ok(Err(e)) => {
                lock(&self.dialing).remove(&target);
                Err(SyncError::Network(format!("connect to {target} failed: {e}")))
            }
            Err(_) => {
                lock(&self.dialing).remove(&target);
                Err(SyncError::Network(format!("connect to {target} timed out")))
            }
        }
    }

    async fn run_session(self: Arc<Self>, stream: TcpStream, target: Option<String>) {
        let remote = stream
            .peer_addr()
            .map_or_else(|_| "?".to_string(), |a| a.to_string());
        let conn = Arc::new(SyncConnection::new(
            stream,
            Arc::clone(&self.store),
            self.config.connection.clone(),
        ));

        let peer = tokio::select! {
            outcome = conn.handshake() => match outcome {
                HandshakeOutcome::Established(peer) => Some(peer),
                HandshakeOutcome::TimedOut => {
                    warn!("Handshake with {} timed out", remote);
                    None
                }
                HandshakeOutcome::ProtocolError(e) => {
                    warn!("Handshake with {} failed: {}", remote, e);
                    None
                }
            },
            () = self.cancel.cancelled() => None,
        };

        if let Some(peer) = peer {
            if let Some(target) = &target {
                lock(&self.target_names).insert(target.clone(), peer.name.clone());
            }
            let initiator = if target.is_some() {
                self.store.node_name().to_string()
            } else {
                peer.name.clone()
            };
            if self.register(&peer.name, &conn, initiator).await {
                let result = tokio::select! {
                    result = conn.process_inbound() => result,
                    () = self.cancel.cancelled() => Ok(()),
                };
                match result {
                    Ok(()) => info!("Session with {} ended", peer.name),
                    Err(e) => warn!("Session with {} failed: {}", peer.name, e),
                }
                self.unregister(&peer.name, &conn);
            } else {
                info!("Dropping duplicate session with {}", peer.name);
            }
        }

        conn.close().await;
        if let Some(target) = target {
            lock(&self.dialing).remove(&target);
        }
    }

    /// Adds a session unless one for the same peer already exists.
    ///
    /// Both ends must keep the same connection when they dial each other at
    /// once, so the connection dialed by the lower node name wins.
    async fn register(&self, name: &str, conn: &Arc<SyncConnection<TcpStream>>, initiator: String) -> bool {
        let preferred = self.store.node_name().min(name).to_string();
        let replaced = {
            let mut sessions = lock(&self.sessions);
            match sessions.get(name) {
                Some(existing) if existing.initiator == preferred || initiator != preferred => {
                    return false;
                }
                _ => sessions.insert(
                    name.to_string(),
                    Session {
                        conn: Arc::clone(conn),
                        initiator,
                    },
                ),
            }
        };
        if let Some(old) = replaced {
            debug!("Replacing session with {}", name);
            old.conn.close().await;
        }
        true
    }

    fn unregister(&self, name: &str, conn: &Arc<SyncConnection<TcpStream>>) {
        let mut sessions = lock(&self.sessions);
        if sessions
            .get(name)
            .is_some_and(|session| Arc::ptr_eq(&session.conn, conn))
        {
            sessions.remove(name);
        }
    }

    fn is_target_connected(&self, target: &str) -> bool {
        if lock(&self.dialing).contains(target) {
            return true;
        }
        let name = lock(&self.target_names).get(target).cloned();
        name.is_some_and(|name| lock(&self.sessions).contains_key(&name))
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let targets: Vec<String> = lock(&self.targets)
                .iter()
                .filter(|target| !self.is_target_connected(target))
                .cloned()
                .collect();
            let dials = targets
                .into_iter()
                .map(|target| Arc::clone(&self).dial(target));
            for result in join_all(dials).await {
                if let Err(e) = result {
                    debug!("{}", e);
                }
            }
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn push_all(&self) -> usize {
        let conns: Vec<_> = lock(&self.sessions)
            .values()
            .map(|session| Arc::clone(&session.conn))
            .collect();
        let results = join_all(conns.iter().map(|conn| async move {
            match conn.push().await {
                Ok(sent) => sent,
                Err(e) => {
                    warn!(
                        "Push to {} failed: {}",
                        conn.peer().map_or("?", |p| p.name.as_str()),
                        e
                    );
                    conn.close().await;
                    0
                }
            }
        }))
        .await;
        results.into_iter().sum()
    }

    async fn push_loop(self: Arc<Self>) {
        loop {
            let sent = self.push_all().await;
            let pause = if sent == 0 {
                self.config.poll_interval
            } else {
                Duration::ZERO
            };
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }
    }
}
