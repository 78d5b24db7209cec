#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pgm_transport::wire::PacketOptions;

/// Fuzz the options-chain parser in isolation.
///
/// The chain is the historical source of memory-safety bugs in PGM
/// implementations: every element length must be validated against both the
/// declared total and the packet tail before any field is read.
fuzz_target!(|data: &[u8]| {
    let bytes = Bytes::copy_from_slice(data);
    if let Some(options) = PacketOptions::decode(&mut bytes.clone()) {
        // A parsed chain must re-encode to a parseable chain.
        let mut buf = bytes::BytesMut::new();
        options.encode(&mut buf);
        if !options.is_empty() {
            let reparsed = PacketOptions::decode(&mut buf.freeze());
            assert!(reparsed.is_some());
        }
    }
});
