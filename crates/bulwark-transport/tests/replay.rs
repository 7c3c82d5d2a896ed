//! Replay and tamper handling on a single session pair.

use bulwark_core::crypto::{Digest, Signer};
use bulwark_transport::keys::{Role, SessionKeys};
use bulwark_transport::{
    ClusterId, FrameRejected, ServiceId, Session, SessionLimits, TickRef, build_frame, verify_frame,
};
use tokio::time::Instant;

struct Ends {
    sender: Session,
    receiver: Session,
    signer: Signer,
}

fn ends() -> Ends {
    let signer = Signer::from_secret_bytes(&[0x51; 32]);
    let receiver_signer = Signer::from_secret_bytes(&[0x52; 32]);
    let a = ClusterId::from_bytes([0xaa; 16]);
    let b = ClusterId::from_bytes([0xbb; 16]);
    let svc = ServiceId::from_name("bulwark.receipts.v1");
    let transcript = Digest::from_bytes([0x33; 32]);
    let shared = [0x44; 32];
    let now = Instant::now();
    Ends {
        sender: Session::new(
            a,
            b,
            svc,
            receiver_signer.verifying_key(),
            SessionKeys::derive(&shared, &transcript, Role::Initiator),
            SessionLimits::default(),
            now,
        ),
        receiver: Session::new(
            b,
            a,
            svc,
            signer.verifying_key(),
            SessionKeys::derive(&shared, &transcript, Role::Responder),
            SessionLimits::default(),
            now,
        ),
        signer,
    }
}

#[test]
fn resending_nonce_five_is_a_replay() {
    let mut e = ends();
    let (dst, svc) = (e.sender.peer(), e.sender.svc());
    let frames: Vec<_> = (1..=5u8)
        .map(|i| build_frame(dst, svc, &[i], TickRef::default(), &mut e.sender, &e.signer).unwrap())
        .collect();
    let fifth = &frames[4];
    assert_eq!(fifth.nonce, 5);

    assert_eq!(verify_frame(fifth, &mut e.receiver).unwrap(), vec![5]);
    assert_eq!(e.receiver.last_nonce_seen(), 5);

    assert_eq!(
        verify_frame(fifth, &mut e.receiver),
        Err(FrameRejected::ReplayDetected {
            nonce: 5,
            last_seen: 5
        })
    );
    assert_eq!(e.receiver.last_nonce_seen(), 5);
}

#[test]
fn earlier_nonces_are_replays_after_a_later_one() {
    let mut e = ends();
    let (dst, svc) = (e.sender.peer(), e.sender.svc());
    let frames: Vec<_> = (0..3u8)
        .map(|i| build_frame(dst, svc, &[i], TickRef::default(), &mut e.sender, &e.signer).unwrap())
        .collect();
    verify_frame(&frames[2], &mut e.receiver).unwrap();
    for frame in &frames[..2] {
        assert!(matches!(
            verify_frame(frame, &mut e.receiver),
            Err(FrameRejected::ReplayDetected { .. })
        ));
    }
}

#[test]
fn rejected_frames_leave_the_session_usable() {
    let mut e = ends();
    let (dst, svc) = (e.sender.peer(), e.sender.svc());
    let good = build_frame(dst, svc, b"receipt", TickRef::default(), &mut e.sender, &e.signer).unwrap();

    let mut forged = good.clone();
    forged.aead_payload[0] ^= 0x01;
    assert_eq!(verify_frame(&forged, &mut e.receiver), Err(FrameRejected::AuthFailure));

    let mut bumped = good.clone();
    bumped.nonce += 10;
    assert_eq!(verify_frame(&bumped, &mut e.receiver), Err(FrameRejected::AuthFailure));

    let mut versioned = good.clone();
    versioned.version = 9;
    assert_eq!(
        verify_frame(&versioned, &mut e.receiver),
        Err(FrameRejected::BadVersion { version: 9 })
    );

    assert_eq!(e.receiver.last_nonce_seen(), 0);
    assert_eq!(verify_frame(&good, &mut e.receiver).unwrap(), b"receipt");
}
