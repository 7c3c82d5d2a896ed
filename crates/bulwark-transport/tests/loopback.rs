//! Two transports talking over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::crypto::Signer;
use bulwark_transport::wire::{self, Envelope};
use bulwark_transport::{
    ClusterId, Inbound, LogicalTicks, PeerInfo, SessionEnd, SessionLimits, SessionSummary,
    StaticDirectory, TickRef, Transport, TransportConfig, TransportError, build_frame, handshake,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    id: ClusterId,
    signer: Arc<Signer>,
    transport: Transport,
    inbound: mpsc::Receiver<Inbound>,
    ticks: Arc<LogicalTicks>,
}

fn identity(seed: u8) -> (ClusterId, Arc<Signer>) {
    (
        ClusterId::from_bytes([seed; 16]),
        Arc::new(Signer::from_secret_bytes(&[seed; 32])),
    )
}

fn node(seed: u8, config: TransportConfig, directory: &Arc<StaticDirectory>) -> Node {
    let (id, signer) = identity(seed);
    directory.insert(
        id,
        PeerInfo {
            verifying_key: signer.verifying_key(),
            address: None,
        },
    );
    let ticks = Arc::new(LogicalTicks::new());
    let (transport, inbound) = Transport::new(
        id,
        Arc::clone(&signer),
        config,
        Arc::clone(directory) as _,
        Arc::clone(&ticks) as _,
    )
    .unwrap();
    Node {
        id,
        signer,
        transport,
        inbound,
        ticks,
    }
}

async fn serve(node: &Node, directory: &StaticDirectory) -> SocketAddr {
    let addr = node
        .transport
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    directory.insert(
        node.id,
        PeerInfo {
            verifying_key: node.signer.verifying_key(),
            address: Some(addr),
        },
    );
    addr
}

/// Polls the session table until a row matches.
async fn settled(transport: &Transport, matches: impl Fn(&SessionSummary) -> bool) -> SessionSummary {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(row) = transport.sessions().into_iter().find(|row| matches(row)) {
                return row;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session status never settled")
}

async fn recv(inbound: &mut mpsc::Receiver<Inbound>) -> Inbound {
    tokio::time::timeout(WAIT, inbound.recv())
        .await
        .expect("timed out waiting for a payload")
        .expect("inbound channel closed")
}

fn short_lived() -> TransportConfig {
    TransportConfig {
        limits: SessionLimits {
            rotate_after_frames: 4,
            rotation_interval: Duration::from_secs(2),
            overlap_window: Duration::from_millis(500),
            idle_timeout: Duration::from_millis(300),
        },
        maintenance_interval: Duration::from_millis(50),
        ..TransportConfig::default()
    }
}

#[tokio::test]
async fn payloads_arrive_in_order_both_ways() {
    let directory = Arc::new(StaticDirectory::new());
    let mut a = node(1, TransportConfig::default(), &directory);
    let mut b = node(2, TransportConfig::default(), &directory);
    serve(&b, &directory).await;

    a.ticks.advance();
    for i in 0..10u8 {
        a.transport.send(b.id, &[i; 3]).await.unwrap();
    }
    for i in 0..10u8 {
        let got = recv(&mut b.inbound).await;
        assert_eq!(got.src, a.id);
        assert_eq!(got.svc, b.transport.service());
        assert_eq!(got.payload, vec![i; 3]);
        assert_eq!(&got.tick_ref.0[..8], &1u64.to_le_bytes());
    }

    // B has no address for A; the reply rides the accepted session.
    b.transport.send(a.id, b"ack").await.unwrap();
    assert_eq!(recv(&mut a.inbound).await.payload, b"ack");
    assert!(a.transport.is_connected(b.id));
    assert!(b.transport.is_connected(a.id));

    a.transport.shutdown().await;
    b.transport.shutdown().await;
}

#[tokio::test]
async fn keys_rotate_under_traffic() {
    let directory = Arc::new(StaticDirectory::new());
    let a = node(1, short_lived(), &directory);
    let mut b = node(2, short_lived(), &directory);
    serve(&b, &directory).await;

    for i in 0..10u8 {
        a.transport.send(b.id, &[i]).await.unwrap();
        assert_eq!(recv(&mut b.inbound).await.payload, vec![i]);
    }
    let row = settled(&b.transport, |row| row.status.stats.frames_received == 10).await;
    assert_eq!(row.status.epochs.1, 2);
    assert_eq!(b.transport.sessions().len(), 1);
}

#[tokio::test]
async fn idle_session_is_replaced_on_next_send() {
    let directory = Arc::new(StaticDirectory::new());
    let a = node(1, short_lived(), &directory);
    let mut b = node(2, short_lived(), &directory);
    serve(&b, &directory).await;

    a.transport.send(b.id, b"first").await.unwrap();
    assert_eq!(recv(&mut b.inbound).await.payload, b"first");
    let first = a.transport.sessions()[0].id;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!a.transport.is_connected(b.id));

    a.transport.send(b.id, b"second").await.unwrap();
    assert_eq!(recv(&mut b.inbound).await.payload, b"second");
    let rows = a.transport.sessions();
    assert_eq!(rows.len(), 1);
    assert_ne!(rows[0].id, first);
}

#[tokio::test]
async fn unknown_destination_fails_fast() {
    let directory = Arc::new(StaticDirectory::new());
    let a = node(1, TransportConfig::default(), &directory);
    let stranger = ClusterId::from_bytes([9; 16]);
    assert!(matches!(
        a.transport.send(stranger, b"x").await,
        Err(TransportError::UnknownPeer(id)) if id == stranger
    ));
}

#[tokio::test]
async fn oversized_payload_is_refused_before_dialing() {
    let directory = Arc::new(StaticDirectory::new());
    let a = node(1, TransportConfig::default(), &directory);
    let payload = vec![0u8; wire::MAX_PAYLOAD_LEN + 1];
    assert!(matches!(
        a.transport.send(ClusterId::from_bytes([2; 16]), &payload).await,
        Err(TransportError::PayloadTooLarge { .. })
    ));
}

#[tokio::test]
async fn payload_limit_follows_configured_envelope_size() {
    let directory = Arc::new(StaticDirectory::new());
    let config = TransportConfig {
        max_envelope_len: wire::MIN_FRAME_ENVELOPE_LEN + 4096,
        ..TransportConfig::default()
    };
    let a = node(1, config.clone(), &directory);
    let mut b = node(2, config, &directory);
    serve(&b, &directory).await;

    a.transport.send(b.id, &[7; 4096]).await.unwrap();
    assert_eq!(recv(&mut b.inbound).await.payload.len(), 4096);

    assert!(matches!(
        a.transport.send(b.id, &[7; 4097]).await,
        Err(TransportError::PayloadTooLarge { len: 4097, max: 4096 })
    ));
    assert!(a.transport.is_connected(b.id));
}

#[tokio::test]
async fn replays_are_dropped_and_repeat_offenders_disconnected() {
    let directory = Arc::new(StaticDirectory::new());
    let config = TransportConfig {
        rejection_threshold: 3,
        ..TransportConfig::default()
    };
    let mut b = node(2, config.clone(), &directory);
    let addr = serve(&b, &directory).await;

    // A hand-driven client with A's identity.
    let (a_id, a_signer) = identity(1);
    directory.insert(
        a_id,
        PeerInfo {
            verifying_key: a_signer.verifying_key(),
            address: None,
        },
    );
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, wire::codec(config.max_envelope_len));
    let mut writer = FramedWrite::new(write_half, wire::codec(config.max_envelope_len));
    let mut session = handshake::initiate(
        &mut reader,
        &mut writer,
        handshake::LocalIdentity {
            cluster: a_id,
            signer: &a_signer,
        },
        b.id,
        config.service,
        directory.as_ref(),
        config.limits,
    )
    .await
    .unwrap();

    let frame = build_frame(
        b.id,
        config.service,
        b"once",
        TickRef::default(),
        &mut session,
        &a_signer,
    )
    .unwrap();
    let bytes = Envelope::Frame(frame).encode().unwrap();
    writer.send(bytes.clone()).await.unwrap();
    assert_eq!(recv(&mut b.inbound).await.payload, b"once");

    for _ in 0..3 {
        writer.send(bytes.clone()).await.unwrap();
    }
    let closed = tokio::time::timeout(WAIT, reader.next()).await.unwrap();
    assert!(closed.is_none());
    assert!(b.inbound.try_recv().is_err());

    let row = settled(&b.transport, |row| row.key.peer == a_id).await;
    assert_eq!(row.status.ended, Some(SessionEnd::Misbehaving));
    assert_eq!(row.status.rejected, 3);
    assert!(!b.transport.is_connected(a_id));
}
