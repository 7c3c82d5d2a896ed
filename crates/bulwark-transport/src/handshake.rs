//! Session key agreement.
//!
//! ```text
//! Initiator                                       Responder
//!   |                                                 |
//!   |  -- Hello { initiator, cluster, svc, eph_i } -> |
//!   |                                                 |  verify with directory key
//!   |  <- Hello { responder, cluster, svc, eph_r } -- |
//!   |  verify with directory key                      |
//!   |                                                 |
//!   shared = X25519(eph, peer_eph)
//!   transcript = domain_hash(HandshakeTranscript, hello_i ‖ hello_r)
//!   keys = derive(shared, transcript)
//! ```
//!
//! Each hello is signed by the sender's long-term key over
//! `domain_hash(HandshakeTranscript, encode(body))`. Ephemeral secrets are
//! used once and dropped, so every handshake yields fresh keys.

use std::io;

use bulwark_core::crypto::{
    Digest, DomainTag, Signature, Signer, VerifyingKey, domain_hash, domain_hash_parts,
    verify_signature,
};
use bulwark_core::{SerializationError, canonical};
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::directory::PeerDirectory;
use crate::error::TransportError;
use crate::frame::{ClusterId, ServiceId};
use crate::keys::{Role, SessionKeys};
use crate::session::{Session, SessionLimits};
use crate::wire::Envelope;

/// Handshake protocol version.
pub const HANDSHAKE_VERSION: u8 = 1;

/// Signed portion of a hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloBody {
    /// [`HANDSHAKE_VERSION`].
    pub version: u8,
    /// Whether the sender dialed the connection.
    pub initiator: bool,
    /// Sender's cluster.
    pub cluster: ClusterId,
    /// Service the session is for.
    pub svc: ServiceId,
    /// Sender's X25519 ephemeral public key.
    pub ephemeral: [u8; 32],
}

/// A signed hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Signed fields.
    pub body: HelloBody,
    /// Signature by the sender's long-term key.
    pub signature: Signature,
}

impl Hello {
    /// Signs `body`.
    pub fn sign(body: HelloBody, signer: &Signer) -> Result<Self, SerializationError> {
        let digest = Self::digest(&body)?;
        Ok(Self {
            signature: signer.sign_digest(&digest),
            body,
        })
    }

    /// Checks the signature against `key`.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), TransportError> {
        verify_signature(key, &Self::digest(&self.body)?, &self.signature)?;
        Ok(())
    }

    fn digest(body: &HelloBody) -> Result<Digest, SerializationError> {
        Ok(domain_hash(
            DomainTag::HandshakeTranscript,
            &canonical::encode(body)?,
        ))
    }

    /// Canonical bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        canonical::encode(self)
    }

    /// Strict decode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        canonical::decode(bytes)
    }
}

/// This node's identity on the wire.
#[derive(Debug, Clone, Copy)]
pub struct LocalIdentity<'a> {
    /// Our cluster.
    pub cluster: ClusterId,
    /// Our long-term key.
    pub signer: &'a Signer,
}

/// Runs the initiator side against `peer` for `svc`.
///
/// # Errors
///
/// - [`TransportError::UnknownPeer`] if `peer` is not in `directory`
/// - [`TransportError::Handshake`] for an unexpected or mismatched reply
/// - [`TransportError::SignatureInvalid`] if the reply is not signed by
///   `peer`
/// - [`TransportError::Closed`] / [`TransportError::Io`] on stream failure
pub async fn initiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: LocalIdentity<'_>,
    peer: ClusterId,
    svc: ServiceId,
    directory: &dyn PeerDirectory,
    limits: SessionLimits,
) -> Result<Session, TransportError>
where
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    let peer_info = directory.lookup(&peer).ok_or(TransportError::UnknownPeer(peer))?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let ours = Hello::sign(
        HelloBody {
            version: HANDSHAKE_VERSION,
            initiator: true,
            cluster: local.cluster,
            svc,
            ephemeral: PublicKey::from(&secret).to_bytes(),
        },
        local.signer,
    )?;
    let ours_bytes = ours.to_bytes()?;
    writer.send(Envelope::Hello(ours).encode()?).await?;

    let theirs = read_hello(reader).await?;
    check_body(&theirs.body, false, svc)?;
    if theirs.body.cluster != peer {
        return Err(handshake_error(format!(
            "expected cluster {peer}, got {}",
            theirs.body.cluster
        )));
    }
    theirs.verify(&peer_info.verifying_key)?;

    let transcript = transcript(&ours_bytes, &theirs.to_bytes()?);
    let keys = agree(secret, &theirs.body.ephemeral, &transcript, Role::Initiator)?;
    debug!(peer = %peer, svc = %svc, "handshake complete (initiator)");
    Ok(Session::new(
        local.cluster,
        peer,
        svc,
        peer_info.verifying_key,
        keys,
        limits,
        Instant::now(),
    ))
}

/// Runs the responder side for a connection serving `svc`.
///
/// # Errors
///
/// As [`initiate`]; [`TransportError::UnknownPeer`] if the initiator's
/// cluster is not in `directory`.
pub async fn respond<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: LocalIdentity<'_>,
    svc: ServiceId,
    directory: &dyn PeerDirectory,
    limits: SessionLimits,
) -> Result<Session, TransportError>
where
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    let theirs = read_hello(reader).await?;
    check_body(&theirs.body, true, svc)?;
    let peer = theirs.body.cluster;
    let peer_info = directory.lookup(&peer).ok_or(TransportError::UnknownPeer(peer))?;
    theirs.verify(&peer_info.verifying_key)?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let ours = Hello::sign(
        HelloBody {
            version: HANDSHAKE_VERSION,
            initiator: false,
            cluster: local.cluster,
            svc,
            ephemeral: PublicKey::from(&secret).to_bytes(),
        },
        local.signer,
    )?;
    let ours_bytes = ours.to_bytes()?;
    writer.send(Envelope::Hello(ours).encode()?).await?;

    let transcript = transcript(&theirs.to_bytes()?, &ours_bytes);
    let keys = agree(secret, &theirs.body.ephemeral, &transcript, Role::Responder)?;
    debug!(peer = %peer, svc = %svc, "handshake complete (responder)");
    Ok(Session::new(
        local.cluster,
        peer,
        svc,
        peer_info.verifying_key,
        keys,
        limits,
        Instant::now(),
    ))
}

async fn read_hello<R>(reader: &mut R) -> Result<Hello, TransportError>
where
    R: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    let bytes = reader.next().await.ok_or(TransportError::Closed)??;
    match Envelope::decode(&bytes)? {
        Envelope::Hello(hello) => Ok(hello),
        Envelope::Frame(_) => Err(handshake_error("frame before handshake".to_string())),
        Envelope::Goodbye => Err(TransportError::Closed),
    }
}

fn check_body(body: &HelloBody, expect_initiator: bool, svc: ServiceId) -> Result<(), TransportError> {
    if body.version != HANDSHAKE_VERSION {
        return Err(handshake_error(format!(
            "unsupported handshake version {}",
            body.version
        )));
    }
    if body.initiator != expect_initiator {
        return Err(handshake_error("hello has the wrong role".to_string()));
    }
    if body.svc != svc {
        return Err(handshake_error(format!("service {} not served here", body.svc)));
    }
    Ok(())
}

fn transcript(initiator_hello: &[u8], responder_hello: &[u8]) -> Digest {
    domain_hash_parts(
        DomainTag::HandshakeTranscript,
        &[initiator_hello, responder_hello],
    )
}

fn agree(
    secret: EphemeralSecret,
    peer_ephemeral: &[u8; 32],
    transcript: &Digest,
    role: Role,
) -> Result<SessionKeys, TransportError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_ephemeral));
    if !shared.was_contributory() {
        return Err(handshake_error("non-contributory key exchange".to_string()));
    }
    Ok(SessionKeys::derive(shared.as_bytes(), transcript, role))
}

fn handshake_error(reason: String) -> TransportError {
    TransportError::Handshake { reason }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;
    use futures::future;

    use super::*;
    use crate::directory::{PeerInfo, StaticDirectory};
    use crate::frame::TickRef;
    use crate::session::{build_frame, verify_frame};

    type Reader = mpsc::UnboundedReceiver<io::Result<BytesMut>>;

    /// An in-memory duplex of envelopes.
    struct Pipe(mpsc::UnboundedSender<io::Result<BytesMut>>);

    impl Sink<Bytes> for Pipe {
        type Error = io::Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, item: Bytes) -> io::Result<()> {
            self.0
                .unbounded_send(Ok(BytesMut::from(&item[..])))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn pipes() -> ((Reader, Pipe), (Reader, Pipe)) {
        let (a_tx, b_rx) = mpsc::unbounded();
        let (b_tx, a_rx) = mpsc::unbounded();
        ((a_rx, Pipe(a_tx)), (b_rx, Pipe(b_tx)))
    }

    struct Node {
        id: ClusterId,
        signer: Signer,
    }

    fn node(n: u8) -> Node {
        Node {
            id: ClusterId::from_bytes([n; 16]),
            signer: Signer::from_secret_bytes(&[n; 32]),
        }
    }

    fn directory(nodes: &[&Node]) -> StaticDirectory {
        let dir = StaticDirectory::new();
        for n in nodes {
            dir.insert(
                n.id,
                PeerInfo {
                    verifying_key: n.signer.verifying_key(),
                    address: None,
                },
            );
        }
        dir
    }

    #[tokio::test]
    async fn handshake_yields_working_sessions() {
        let (a, b) = (node(1), node(2));
        let dir = directory(&[&a, &b]);
        let svc = ServiceId::from_name("receipts");
        let ((mut a_rx, mut a_tx), (mut b_rx, mut b_tx)) = pipes();

        let (ia, rb) = future::join(
            initiate(
                &mut a_rx,
                &mut a_tx,
                LocalIdentity {
                    cluster: a.id,
                    signer: &a.signer,
                },
                b.id,
                svc,
                &dir,
                SessionLimits::default(),
            ),
            respond(
                &mut b_rx,
                &mut b_tx,
                LocalIdentity {
                    cluster: b.id,
                    signer: &b.signer,
                },
                svc,
                &dir,
                SessionLimits::default(),
            ),
        )
        .await;
        let (mut sa, mut sb) = (ia.unwrap(), rb.unwrap());
        assert_eq!(sb.peer(), a.id);

        let f = build_frame(b.id, svc, b"hi", TickRef::default(), &mut sa, &a.signer).unwrap();
        assert_eq!(verify_frame(&f, &mut sb).unwrap(), b"hi");
        let g = build_frame(a.id, svc, b"yo", TickRef::default(), &mut sb, &b.signer).unwrap();
        assert_eq!(verify_frame(&g, &mut sa).unwrap(), b"yo");
    }

    #[tokio::test]
    async fn unknown_initiator_is_refused() {
        let (a, b) = (node(1), node(2));
        let dir_b = directory(&[]);
        let svc = ServiceId::from_name("receipts");
        let ((_a_rx, mut a_tx), (mut b_rx, mut b_tx)) = pipes();

        let hello = Hello::sign(
            HelloBody {
                version: HANDSHAKE_VERSION,
                initiator: true,
                cluster: a.id,
                svc,
                ephemeral: [9; 32],
            },
            &a.signer,
        )
        .unwrap();
        a_tx.send(Envelope::Hello(hello).encode().unwrap())
            .await
            .unwrap();

        let r = respond(
            &mut b_rx,
            &mut b_tx,
            LocalIdentity {
                cluster: b.id,
                signer: &b.signer,
            },
            svc,
            &dir_b,
            SessionLimits::default(),
        )
        .await;
        assert!(matches!(r, Err(TransportError::UnknownPeer(id)) if id == a.id));
    }

    #[tokio::test]
    async fn forged_hello_is_refused() {
        let (a, b) = (node(1), node(2));
        let dir = directory(&[&a, &b]);
        let svc = ServiceId::from_name("receipts");
        let ((_a_rx, mut a_tx), (mut b_rx, mut b_tx)) = pipes();

        // Claims to be `a` but is signed by someone else.
        let forger = Signer::from_secret_bytes(&[99; 32]);
        let forged = Hello::sign(
            HelloBody {
                version: HANDSHAKE_VERSION,
                initiator: true,
                cluster: a.id,
                svc,
                ephemeral: [9; 32],
            },
            &forger,
        )
        .unwrap();
        a_tx.send(Envelope::Hello(forged).encode().unwrap())
            .await
            .unwrap();

        let r = respond(
            &mut b_rx,
            &mut b_tx,
            LocalIdentity {
                cluster: b.id,
                signer: &b.signer,
            },
            svc,
            &dir,
            SessionLimits::default(),
        )
        .await;
        assert!(matches!(r, Err(TransportError::SignatureInvalid(_))));
    }

    #[tokio::test]
    async fn wrong_service_is_refused() {
        let (a, b) = (node(1), node(2));
        let dir = directory(&[&a, &b]);
        let ((_a_rx, mut a_tx), (mut b_rx, mut b_tx)) = pipes();
        let hello = Hello::sign(
            HelloBody {
                version: HANDSHAKE_VERSION,
                initiator: true,
                cluster: a.id,
                svc: ServiceId::from_name("other"),
                ephemeral: [9; 32],
            },
            &a.signer,
        )
        .unwrap();
        a_tx.send(Envelope::Hello(hello).encode().unwrap())
            .await
            .unwrap();

        let r = respond(
            &mut b_rx,
            &mut b_tx,
            LocalIdentity {
                cluster: b.id,
                signer: &b.signer,
            },
            ServiceId::from_name("receipts"),
            &dir,
            SessionLimits::default(),
        )
        .await;
        assert!(matches!(r, Err(TransportError::Handshake { .. })));
    }

    #[test]
    fn hello_signature_is_domain_separated() {
        let a = node(1);
        let body = HelloBody {
            version: HANDSHAKE_VERSION,
            initiator: true,
            cluster: a.id,
            svc: ServiceId::from_name("x"),
            ephemeral: [0; 32],
        };
        let hello = Hello::sign(body.clone(), &a.signer).unwrap();
        hello.verify(&a.signer.verifying_key()).unwrap();

        let plain = domain_hash(DomainTag::CanonicalRecord, &canonical::encode(&body).unwrap());
        assert!(verify_signature(&a.signer.verifying_key(), &plain, &hello.signature).is_err());
    }
}
