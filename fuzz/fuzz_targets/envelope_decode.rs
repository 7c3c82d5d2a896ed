//! Fuzz harness for stream envelope parsing.
//!
//! Anything a peer can put on the wire reaches `Envelope::decode` before
//! any authentication, so it must never panic. Whatever parses must
//! re-encode to the same bytes.

#![no_main]
use bulwark_transport::Frame;
use bulwark_transport::wire::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::decode(data) {
        let encoded = envelope.encode().expect("decoded envelope re-encodes");
        assert_eq!(&encoded[..], data);
    }
    if let Ok(frame) = Frame::from_bytes(data) {
        assert_eq!(frame.to_bytes(), data);
    }
});
