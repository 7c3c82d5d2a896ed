//! The per-session task.
//!
//! One task owns one [`Session`] and both halves of its connection. It
//! serializes everything that touches the session: outgoing frames from the
//! bounded command queue, incoming envelopes from the socket, and periodic
//! expiry checks. Distinct sessions run as distinct tasks.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bulwark_core::crypto::Signer;
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::frame::{ClusterId, ServiceId, TickRef};
use crate::session::{Session, SessionStats};
use crate::transport::TickSource;
use crate::wire::Envelope;

/// A payload delivered by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Sending cluster.
    pub src: ClusterId,
    /// Service it arrived on.
    pub svc: ServiceId,
    /// The sender's tick reference.
    pub tick_ref: TickRef,
    /// Decrypted payload.
    pub payload: Vec<u8>,
}

/// Why a session task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed locally.
    Closed,
    /// The peer said goodbye or hung up.
    PeerClosed,
    /// Idle timeout or missed rotation.
    Expired,
    /// Too many rejected frames.
    Misbehaving,
    /// Read or write failure.
    Io,
}

/// Published view of a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Counters from the session.
    pub stats: SessionStats,
    /// Frames rejected so far.
    pub rejected: u32,
    /// Send and receive ratchet epochs.
    pub epochs: (u64, u64),
    /// Set once the task has exited.
    pub ended: Option<SessionEnd>,
}

impl SessionStatus {
    pub(crate) const fn fresh(session: &Session) -> Self {
        Self {
            stats: session.stats(),
            rejected: 0,
            epochs: session.epochs(),
            ended: None,
        }
    }

    /// Whether the session task is still running.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.ended.is_none()
    }
}

pub(crate) enum Command {
    Send {
        payload: Vec<u8>,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
}

pub(crate) struct Actor<R, W> {
    pub(crate) session: Session,
    pub(crate) reader: R,
    pub(crate) writer: W,
    pub(crate) commands: mpsc::Receiver<Command>,
    pub(crate) inbound: mpsc::Sender<Inbound>,
    pub(crate) signer: Arc<Signer>,
    pub(crate) ticks: Arc<dyn TickSource>,
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) status: Arc<Mutex<SessionStatus>>,
}

enum Step {
    Continue,
    Stop(SessionEnd),
}

impl<R, W> Actor<R, W>
where
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    pub(crate) async fn run(mut self) -> SessionEnd {
        let peer = self.session.peer();
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rejected = 0u32;

        let end = loop {
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send { payload, done }) => {
                        let result = self.send(&payload).await;
                        let step = match &result {
                            Err(TransportError::SessionExpired { .. }) => Step::Stop(SessionEnd::Expired),
                            Err(TransportError::Io(_) | TransportError::Timeout { .. }) => Step::Stop(SessionEnd::Io),
                            _ => Step::Continue,
                        };
                        let _ = done.send(result);
                        step
                    },
                    None => {
                        let _ = self.write(Envelope::Goodbye).await;
                        Step::Stop(SessionEnd::Closed)
                    },
                },
                message = self.reader.next() => match message {
                    Some(Ok(bytes)) => self.receive(&bytes, &mut rejected).await,
                    Some(Err(err)) => {
                        debug!(peer = %peer, error = %err, "session read failed");
                        Step::Stop(SessionEnd::Io)
                    },
                    None => Step::Stop(SessionEnd::PeerClosed),
                },
                _ = ticker.tick() => match self.session.check_expiry(Instant::now()) {
                    Ok(()) => Step::Continue,
                    Err(_) => {
                        let _ = self.write(Envelope::Goodbye).await;
                        Step::Stop(SessionEnd::Expired)
                    },
                },
            };
            self.publish(rejected, None);
            if let Step::Stop(end) = step {
                break end;
            }
        };

        self.publish(rejected, Some(end));
        info!(
            peer = %peer,
            svc = %self.session.svc(),
            end = ?end,
            frames_sent = self.session.stats().frames_sent,
            frames_received = self.session.stats().frames_received,
            rejected,
            "session ended"
        );
        end
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let frame = self.session.seal_at(
            payload,
            self.ticks.current(),
            &self.signer,
            Instant::now(),
        )?;
        self.write(Envelope::Frame(frame)).await
    }

    async fn write(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let bytes = envelope.encode()?;
        let limit = self.config.send_timeout;
        tokio::time::timeout(limit, self.writer.send(bytes))
            .await
            .map_err(|_| TransportError::timed_out("frame write", limit))??;
        Ok(())
    }

    async fn receive(&mut self, bytes: &[u8], rejected: &mut u32) -> Step {
        let peer = self.session.peer();
        let frame = match Envelope::decode(bytes) {
            Ok(Envelope::Frame(frame)) => frame,
            Ok(Envelope::Goodbye) => return Step::Stop(SessionEnd::PeerClosed),
            Ok(Envelope::Hello(_)) => return self.reject(rejected, "hello after handshake"),
            Err(reason) => return self.reject(rejected, reason.as_str()),
        };

        match self.session.open_at(&frame, Instant::now()) {
            Ok(payload) => {
                let delivered = Inbound {
                    src: frame.src,
                    svc: frame.svc,
                    tick_ref: frame.tick_ref,
                    payload,
                };
                if self.inbound.send(delivered).await.is_err() {
                    return Step::Stop(SessionEnd::Closed);
                }
                Step::Continue
            },
            Err(TransportError::Rejected(reason)) => {
                debug!(peer = %peer, nonce = frame.nonce, "frame rejected: {reason}");
                self.reject(rejected, reason.as_str())
            },
            Err(err) => {
                debug!(peer = %peer, error = %err, "session expired on receive");
                Step::Stop(SessionEnd::Expired)
            },
        }
    }

    fn reject(&self, rejected: &mut u32, reason: &'static str) -> Step {
        *rejected += 1;
        warn!(
            peer = %self.session.peer(),
            reason,
            rejected = *rejected,
            "rejected inbound envelope"
        );
        if *rejected >= self.config.rejection_threshold {
            Step::Stop(SessionEnd::Misbehaving)
        } else {
            Step::Continue
        }
    }

    fn publish(&self, rejected: u32, ended: Option<SessionEnd>) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        *status = SessionStatus {
            stats: self.session.stats(),
            rejected,
            epochs: self.session.epochs(),
            ended,
        };
    }
}
