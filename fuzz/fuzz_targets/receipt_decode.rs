//! Fuzz harness for strict canonical decoding of receipts.
//!
//! Peers deliver receipts as opaque payloads. Decoding must reject every
//! non-canonical form, so any accepted input re-encodes byte for byte.

#![no_main]
use bulwark_core::receipt::Receipt;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(receipt) = Receipt::from_bytes(data) {
        let encoded = receipt.to_bytes().expect("decoded receipt re-encodes");
        assert_eq!(encoded, data);
    }
});
