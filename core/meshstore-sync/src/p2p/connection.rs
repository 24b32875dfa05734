//! One replication session with one peer.

use super::codec::SyncCodec;
use super::{lock, with_store};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Checkpoint, Hello, Setup, SyncMessage, Update, WireMessage, MAX_BATCH_SIZE};
use bytes::BytesMut;
use meshstore_storage::{StorageError, Store, TransactionMode};
use meshstore_types::is_local_key;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Budget for the whole handshake.
    pub handshake_timeout: Duration,
    /// Budget for one batch write; a peer that cannot absorb a batch in
    /// time is dropped.
    pub write_timeout: Duration,
    /// Maximum log rows scanned per push.
    pub batch_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            batch_limit: MAX_BATCH_SIZE,
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, nothing exchanged.
    Connected,
    /// Hello/Setup exchange in progress.
    Handshaking,
    /// Replicating.
    Established,
    /// Shut down; terminal.
    Closed,
}

/// What the peer reported during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's stable node name.
    pub name: String,
    /// The peer's log high-water mark.
    pub last_serial_in_db: i64,
    /// How far the peer had read our log.
    pub last_serial_received: i64,
}

/// Result of [`SyncConnection::handshake`].
#[derive(Debug)]
pub enum HandshakeOutcome {
    Established(PeerInfo),
    TimedOut,
    ProtocolError(SyncError),
}

struct Reader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    /// Reads more bytes into the buffer. Returns `Closed` on a clean EOF
    /// between frames.
    async fn fill(&mut self) -> SyncResult<()> {
        self.buf.reserve(READ_CHUNK);
        if self.io.read_buf(&mut self.buf).await? == 0 {
            if self.buf.is_empty() {
                return Err(SyncError::Closed);
            }
            return Err(SyncError::Protocol(format!(
                "connection ended inside a frame ({} bytes buffered)",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

/// A replication session over any bidirectional byte stream.
///
/// The read side is driven by [`process_inbound`](Self::process_inbound);
/// the write side by [`push`](Self::push). Both may run concurrently.
pub struct SyncConnection<S> {
    store: Arc<Store>,
    local_name: String,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    reader: tokio::sync::Mutex<Reader<ReadHalf<S>>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    peer: OnceLock<PeerInfo>,
    /// Serials written by applying this peer's updates; never pushed back.
    echo: Arc<Mutex<HashSet<i64>>>,
    /// Our log position already pushed to the peer.
    last_sent: AtomicI64,
    /// Peer's log position we have received and applied.
    watermark: AtomicI64,
    closing: AtomicBool,
    cancel: CancellationToken,
}

impl<S> std::fmt::Debug for SyncConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConnection")
            .field("local_name", &self.local_name)
            .field("peer", &self.peer.get().map(|p| p.name.as_str()))
            .field("state", &*lock(&self.state))
            .field("last_sent", &self.last_sent.load(Ordering::SeqCst))
            .field("watermark", &self.watermark.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S> SyncConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps a freshly opened stream.
    pub fn new(stream: S, store: Arc<Store>, config: ConnectionConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            local_name: store.node_name().to_string(),
            store,
            config,
            state: Mutex::new(ConnectionState::Connected),
            reader: tokio::sync::Mutex::new(Reader {
                io: read_half,
                buf: BytesMut::new(),
            }),
            writer: tokio::sync::Mutex::new(write_half),
            peer: OnceLock::new(),
            echo: Arc::new(Mutex::new(HashSet::new())),
            last_sent: AtomicI64::new(0),
            watermark: AtomicI64::new(0),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// The peer's handshake report, once established.
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.get()
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Highest serial of our log pushed to the peer.
    pub fn last_sent(&self) -> i64 {
        self.last_sent.load(Ordering::SeqCst)
    }

    /// Highest serial of the peer's log received and applied.
    pub fn watermark(&self) -> i64 {
        self.watermark.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn peer_name(&self) -> &str {
        self.peer.get().map_or("?", |p| p.name.as_str())
    }

    // ── Handshake ────────────────────────────────────────────────

    /// Exchanges Hello and Setup with the peer.
    ///
    /// The whole exchange shares one deadline. Any outcome other than
    /// `Established` leaves the connection closed.
    pub async fn handshake(&self) -> HandshakeOutcome {
        if self.state() != ConnectionState::Connected {
            return HandshakeOutcome::ProtocolError(SyncError::Protocol(
                "handshake already attempted".into(),
            ));
        }
        self.set_state(ConnectionState::Handshaking);
        let deadline = Instant::now() + self.config.handshake_timeout;

        match self.run_handshake(deadline).await {
            Ok(peer) => {
                info!(
                    "Sync established with {} (their log at {}, resuming push from {})",
                    peer.name,
                    peer.last_serial_in_db,
                    self.last_sent()
                );
                let _ = self.peer.set(peer.clone());
                self.set_state(ConnectionState::Established);
                HandshakeOutcome::Established(peer)
            }
            Err(SyncError::Timeout) => {
                warn!("Handshake timed out");
                self.close().await;
                HandshakeOutcome::TimedOut
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                self.close().await;
                HandshakeOutcome::ProtocolError(e)
            }
        }
    }

    async fn run_handshake(&self, deadline: Instant) -> SyncResult<PeerInfo> {
        self.send_before(
            &Hello {
                name: self.local_name.clone(),
            },
            deadline,
        )
        .await?;
        let hello = match self.read_message_before(deadline).await? {
            SyncMessage::Hello(hello) => hello,
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected Hello, got {:?}",
                    other.message_type()
                )));
            }
        };
        if hello.name == self.local_name {
            return Err(SyncError::Protocol("connected to self".into()));
        }

        let name = hello.name.clone();
        let (last_serial, mut watermark) = with_store(&self.store, move |store| {
            Ok((store.last_serial()?, store.sync_state(&name)?))
        })
        .await?;

        self.send_before(
            &Setup {
                last_serial_in_db: last_serial,
                last_serial_received: watermark,
            },
            deadline,
        )
        .await?;
        let setup = match self.read_message_before(deadline).await? {
            SyncMessage::Setup(setup) => setup,
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected Setup, got {:?}",
                    other.message_type()
                )));
            }
        };

        let last_sent = if setup.last_serial_received > last_serial {
            info!(
                "{} has read our log up to {} but it ends at {}; pushing from 0",
                hello.name, setup.last_serial_received, last_serial
            );
            0
        } else {
            setup.last_serial_received
        };
        if setup.last_serial_in_db < watermark {
            info!(
                "Log of {} ends at {}, below our watermark {}; resetting",
                hello.name, setup.last_serial_in_db, watermark
            );
            watermark = 0;
            let name = hello.name.clone();
            with_store(&self.store, move |store| store.set_sync_state(&name, 0)).await?;
        }
        self.last_sent.store(last_sent, Ordering::SeqCst);
        self.watermark.store(watermark, Ordering::SeqCst);

        Ok(PeerInfo {
            name: hello.name,
            last_serial_in_db: setup.last_serial_in_db,
            last_serial_received: setup.last_serial_received,
        })
    }

    async fn send_before<M: WireMessage>(&self, message: &M, deadline: Instant) -> SyncResult<()> {
        let mut buf = BytesMut::new();
        SyncCodec.encode_message(message, &mut buf)?;
        let mut writer = self.writer.lock().await;
        timeout_at(deadline, async {
            writer.write_all(&buf).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| SyncError::Timeout)??;
        Ok(())
    }

    async fn read_message_before(&self, deadline: Instant) -> SyncResult<SyncMessage> {
        let mut reader = self.reader.lock().await;
        loop {
            if let Some(message) = SyncCodec.decode(&mut reader.buf)? {
                return Ok(message);
            }
            timeout_at(deadline, reader.fill())
                .await
                .map_err(|_| SyncError::Timeout)??;
        }
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Reads and applies the peer's messages until the peer disconnects or
    /// the connection is closed locally.
    ///
    /// Updates decoded from one read are applied in one transaction.
    pub async fn process_inbound(&self) -> SyncResult<()> {
        if self.state() != ConnectionState::Established {
            return Err(SyncError::Closed);
        }
        let mut reader = self.reader.lock().await;
        let mut pending: Vec<Update> = Vec::new();
        loop {
            while let Some(message) = SyncCodec.decode(&mut reader.buf)? {
                match message {
                    SyncMessage::Update(update) => pending.push(update),
                    SyncMessage::Checkpoint(checkpoint) => {
                        self.apply_updates(std::mem::take(&mut pending)).await?;
                        self.advance_watermark(checkpoint.serial).await?;
                    }
                    other => {
                        return Err(SyncError::Protocol(format!(
                            "unexpected {:?} after handshake",
                            other.message_type()
                        )));
                    }
                }
            }
            self.apply_updates(std::mem::take(&mut pending)).await?;

            tokio::select! {
                result = reader.fill() => match result {
                    Ok(()) => {}
                    Err(SyncError::Closed) => {
                        debug!("{} disconnected", self.peer_name());
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
                () = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn apply_updates(&self, updates: Vec<Update>) -> SyncResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let received = updates.len();
        let echo = Arc::clone(&self.echo);
        let applied = with_store(&self.store, move |store| {
            store.transaction(TransactionMode::Immediate, |tx| {
                let mut serials = Vec::new();
                for update in &updates {
                    if is_local_key(&update.key) {
                        continue;
                    }
                    if !update.timestamp.is_finite() {
                        warn!("Skipping {}/{} with non-finite timestamp", update.object_id, update.key);
                        continue;
                    }
                    let values = update.timed_values();
                    if let Some(serial) = tx.update_attr(update.object_id.as_str(), &update.key, &values)? {
                        serials.push(serial);
                    }
                }
                // Recorded before commit so a concurrent push cannot see
                // these rows without also seeing them in the echo set.
                lock(&echo).extend(serials.iter().copied());
                Ok::<_, StorageError>(serials.len())
            })
        })
        .await?;
        debug!(
            "Applied {}/{} updates from {}",
            applied,
            received,
            self.peer_name()
        );
        Ok(applied)
    }

    async fn advance_watermark(&self, serial: i64) -> SyncResult<()> {
        let previous = self.watermark.fetch_max(serial, Ordering::SeqCst);
        if serial <= previous {
            return Ok(());
        }
        let name = self.peer_name().to_string();
        with_store(&self.store, move |store| store.set_sync_state(&name, serial)).await
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Pushes the next batch of our log to the peer.
    ///
    /// Returns the number of frames written: zero when there was nothing to
    /// send, otherwise the updates plus the trailing checkpoint.
    pub async fn push(&self) -> SyncResult<usize> {
        if self.state() != ConnectionState::Established {
            return Err(SyncError::Closed);
        }
        let after = self.last_sent();
        let limit = self.config.batch_limit;
        let mappings =
            with_store(&self.store, move |store| store.get_public_mappings_after(after, limit)).await?;
        let Some(last) = mappings.last().map(|m| m.serial) else {
            return Ok(0);
        };

        let updates: Vec<Update> = {
            let mut echo = lock(&self.echo);
            let updates: Vec<Update> = mappings
                .into_iter()
                .filter(|m| !echo.remove(&m.serial))
                .map(Update::from)
                .collect();
            // Anything at or below `last` not seen in this scan was
            // overwritten locally and will never be scanned.
            echo.retain(|serial| *serial > last);
            updates
        };

        let mut buf = BytesMut::new();
        let mut frames = SyncCodec.encode_batch(&updates, &mut buf)?;
        SyncCodec.encode_message(&Checkpoint { serial: last }, &mut buf)?;
        frames += 1;

        let mut writer = self.writer.lock().await;
        let written = timeout(self.config.write_timeout, async {
            writer.write_all(&buf).await?;
            writer.flush().await
        })
        .await;
        drop(writer);
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.close().await;
                return Err(e.into());
            }
            Err(_) => {
                warn!("Peer {} too slow, closing connection", self.peer_name());
                self.close().await;
                return Err(SyncError::Timeout);
            }
        }

        self.last_sent.store(last, Ordering::SeqCst);
        debug!(
            "Pushed {} updates to {} (through serial {})",
            updates.len(),
            self.peer_name(),
            last
        );
        Ok(frames)
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Half-closes the stream and marks the connection closed. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of connection to {} failed: {}", self.peer_name(), e);
        }
        drop(writer);
        self.set_state(ConnectionState::Closed);
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}
