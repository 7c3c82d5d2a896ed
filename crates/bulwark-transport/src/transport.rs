//! TCP front end: listener, dialer and the per-peer send path.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bulwark_core::crypto::Signer;
use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::actor::{Actor, Command, Inbound, SessionStatus};
use crate::config::{InvalidTransportConfig, TransportConfig};
use crate::directory::PeerDirectory;
use crate::error::TransportError;
use crate::frame::{ClusterId, ServiceId, TickRef};
use crate::handshake::{self, LocalIdentity};
use crate::session::Session;
use crate::table::{SessionHandle, SessionKey, SessionSummary, SessionTable};
use crate::wire::{self, Envelope};

type Reader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Supplies the `tick_ref` stamped on outgoing frames.
pub trait TickSource: Send + Sync {
    /// The current tick reference.
    fn current(&self) -> TickRef;
}

/// A local monotonic counter, encoded little-endian in the first eight
/// bytes of the tick reference.
#[derive(Debug, Default)]
pub struct LogicalTicks {
    tick: AtomicU64,
}

impl LogicalTicks {
    /// Starts at tick zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves to the next tick and returns it.
    pub fn advance(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The current tick.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }
}

impl TickSource for LogicalTicks {
    fn current(&self) -> TickRef {
        let mut tick = [0u8; 32];
        tick[..8].copy_from_slice(&self.tick().to_le_bytes());
        TickRef(tick)
    }
}

/// Sessions to peer clusters over TCP.
///
/// Cloning is cheap; clones share the same sessions. Payloads received on
/// any session are delivered to the receiver returned by [`Transport::new`].
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    local: ClusterId,
    signer: Arc<Signer>,
    config: Arc<TransportConfig>,
    directory: Arc<dyn PeerDirectory>,
    ticks: Arc<dyn TickSource>,
    sessions: SessionTable,
    inbound: mpsc::Sender<Inbound>,
    dial_lock: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local", &self.inner.local)
            .field("service", &self.inner.config.service)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Creates a transport for `local`, signing with `signer`.
    ///
    /// # Errors
    ///
    /// [`InvalidTransportConfig`] if `config` fails validation.
    pub fn new(
        local: ClusterId,
        signer: Arc<Signer>,
        config: TransportConfig,
        directory: Arc<dyn PeerDirectory>,
        ticks: Arc<dyn TickSource>,
    ) -> Result<(Self, mpsc::Receiver<Inbound>), InvalidTransportConfig> {
        config.validate()?;
        let (inbound, received) = mpsc::channel(config.inbound_capacity);
        let inner = Inner {
            local,
            signer,
            config: Arc::new(config),
            directory,
            ticks,
            sessions: SessionTable::new(),
            inbound,
            dial_lock: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            received,
        ))
    }

    /// Our cluster.
    #[must_use]
    pub fn local(&self) -> ClusterId {
        self.inner.local
    }

    /// The service this transport speaks.
    #[must_use]
    pub fn service(&self) -> ServiceId {
        self.inner.config.service
    }

    /// Accepts connections on `addr` until [`Transport::shutdown`].
    ///
    /// Returns the bound address, which differs from `addr` when binding
    /// port 0.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if the address cannot be bound.
    #[instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(
            accept_loop(inner, listener).instrument(info_span!("listener", addr = %bound)),
        );
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        info!(addr = %bound, svc = %self.inner.config.service, "listening");
        Ok(bound)
    }

    /// Ensures a live session to `peer`, dialing and handshaking if needed.
    ///
    /// # Errors
    ///
    /// - [`TransportError::UnknownPeer`] if `peer` is not in the directory
    /// - [`TransportError::Handshake`] if the peer has no address or the
    ///   handshake fails
    /// - [`TransportError::Timeout`] if dial plus handshake exceed
    ///   `handshake_timeout`
    #[instrument(skip(self), fields(local = %self.inner.local))]
    pub async fn connect(&self, peer: ClusterId) -> Result<(), TransportError> {
        self.inner.connect(peer).await.map(|_| ())
    }

    /// Sends `payload` to `dst` on this transport's service.
    ///
    /// Waits while the session queue is full. Returns once the frame has
    /// been written. A session that expired or failed is replaced by a new
    /// handshake and the send is retried once.
    ///
    /// # Errors
    ///
    /// - [`TransportError::PayloadTooLarge`] if `payload` cannot fit in an
    ///   envelope of the configured `max_envelope_len`
    /// - any [`Transport::connect`] error
    /// - the session's error if the retry also fails
    #[instrument(skip(self, payload), fields(local = %self.inner.local, len = payload.len()))]
    pub async fn send(&self, dst: ClusterId, payload: &[u8]) -> Result<(), TransportError> {
        let max = self.inner.config.max_payload_len();
        if payload.len() > max {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        let key = self.inner.key(dst);
        let mut retried = false;
        loop {
            let (commands, id) = match self.inner.sessions.sender(&key) {
                Some(found) => found,
                None => self.inner.connect(dst).await?,
            };
            match enqueue(&commands, payload.to_vec()).await {
                Ok(()) => return Ok(()),
                Err(err) if !retried && err.is_reconnectable() => {
                    debug!(peer = %dst, error = %err, "send failed, re-handshaking");
                    self.inner.sessions.evict_if(&key, id);
                    retried = true;
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Whether a live session to `peer` exists.
    #[must_use]
    pub fn is_connected(&self, peer: ClusterId) -> bool {
        self.inner.sessions.is_live(&self.inner.key(peer))
    }

    /// Closes the session to `peer`, if any.
    pub fn close(&self, peer: ClusterId) -> bool {
        self.inner.sessions.evict(&self.inner.key(peer))
    }

    /// Status of every session in the table, ordered by peer.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.inner.sessions.snapshot()
    }

    /// Stops listening and closes every session.
    pub async fn shutdown(&self) {
        let listeners: Vec<_> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for listener in listeners {
            listener.abort();
        }
        for task in self.inner.sessions.drain() {
            let _ = task.await;
        }
        info!(local = %self.inner.local, "transport shut down");
    }
}

async fn enqueue(commands: &mpsc::Sender<Command>, payload: Vec<u8>) -> Result<(), TransportError> {
    let (done, result) = oneshot::channel();
    commands
        .send(Command::Send { payload, done })
        .await
        .map_err(|_| TransportError::Closed)?;
    result.await.map_err(|_| TransportError::Closed)?
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(err) = inner.accept(stream).await {
                        warn!(remote = %remote, error = %err, "inbound handshake failed");
                    }
                });
            },
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }
}

impl Inner {
    fn key(&self, peer: ClusterId) -> SessionKey {
        SessionKey {
            peer,
            svc: self.config.service,
        }
    }

    fn identity(&self) -> LocalIdentity<'_> {
        LocalIdentity {
            cluster: self.local,
            signer: &self.signer,
        }
    }

    fn framed(&self, stream: TcpStream) -> Result<(Reader, Writer), TransportError> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok((
            FramedRead::new(read_half, wire::codec(self.config.max_envelope_len)),
            FramedWrite::new(write_half, wire::codec(self.config.max_envelope_len)),
        ))
    }

    async fn accept(&self, stream: TcpStream) -> Result<(), TransportError> {
        let (mut reader, mut writer) = self.framed(stream)?;
        let limit = self.config.handshake_timeout;
        let session = tokio::time::timeout(
            limit,
            handshake::respond(
                &mut reader,
                &mut writer,
                self.identity(),
                self.config.service,
                self.directory.as_ref(),
                self.config.limits,
            ),
        )
        .await
        .map_err(|_| TransportError::timed_out("handshake", limit))??;

        let key = self.key(session.peer());
        // Simultaneous dials: both nodes keep the session initiated by the
        // lower cluster id.
        if self.sessions.is_live(&key) && key.peer > self.local {
            debug!(peer = %key.peer, "keeping existing session, refusing duplicate");
            writer.send(Envelope::Goodbye.encode()?).await?;
            return Ok(());
        }
        let handle = self.spawn_session(session, reader, writer);
        if self.sessions.rotate(key, handle) {
            debug!(peer = %key.peer, "inbound session replaced a live one");
        }
        info!(peer = %key.peer, svc = %key.svc, "session accepted");
        Ok(())
    }

    async fn connect(&self, peer: ClusterId) -> Result<(mpsc::Sender<Command>, u64), TransportError> {
        let key = self.key(peer);
        let _dialing = self.dial_lock.lock().await;
        if let Some(found) = self.sessions.sender(&key) {
            return Ok(found);
        }
        self.sessions.prune();

        let info = self
            .directory
            .lookup(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let addr = info.address.ok_or_else(|| TransportError::Handshake {
            reason: format!("no address known for {peer}"),
        })?;

        let limit = self.config.handshake_timeout;
        let (reader, writer, session) = tokio::time::timeout(limit, async {
            let stream = TcpStream::connect(addr).await?;
            let (mut reader, mut writer) = self.framed(stream)?;
            let session = handshake::initiate(
                &mut reader,
                &mut writer,
                self.identity(),
                peer,
                self.config.service,
                self.directory.as_ref(),
                self.config.limits,
            )
            .await?;
            Ok::<_, TransportError>((reader, writer, session))
        })
        .await
        .map_err(|_| TransportError::timed_out("handshake", limit))??;

        let handle = self.spawn_session(session, reader, writer);
        let found = (handle.commands.clone(), handle.id);
        match self.sessions.create(key, handle) {
            Ok(()) => {
                info!(peer = %peer, addr = %addr, "session established");
                Ok(found)
            },
            Err(exists) => {
                debug!(%exists, "inbound session won the race");
                drop(found);
                self.sessions.sender(&key).ok_or(TransportError::Closed)
            },
        }
    }

    fn spawn_session(&self, session: Session, reader: Reader, writer: Writer) -> SessionHandle {
        let (commands, queue) = mpsc::channel(self.config.queue_capacity);
        let status = Arc::new(Mutex::new(SessionStatus::fresh(&session)));
        let span = info_span!("session", peer = %session.peer(), svc = %session.svc());
        let actor = Actor {
            session,
            reader,
            writer,
            commands: queue,
            inbound: self.inbound.clone(),
            signer: Arc::clone(&self.signer),
            ticks: Arc::clone(&self.ticks),
            config: Arc::clone(&self.config),
            status: Arc::clone(&status),
        };
        SessionHandle {
            id: self.sessions.allocate_id(),
            commands,
            status,
            task: tokio::spawn(actor.run().instrument(span)),
        }
    }
}
