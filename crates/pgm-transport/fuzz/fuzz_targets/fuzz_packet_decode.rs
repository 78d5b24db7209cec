#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pgm_transport::wire::{verify, PgmHeader, PgmPacket};

/// Fuzz the whole packet decode pipeline.
///
/// Exercises header parsing, type dispatch, NLA decoding, options-chain
/// walking, and checksum verification. The decoder must never panic on any
/// input; malformed data yields `None`.
fuzz_target!(|data: &[u8]| {
    let bytes = Bytes::copy_from_slice(data);

    let _ = verify(&bytes);
    let _ = PgmPacket::decode(&bytes);

    let mut buf = bytes.clone();
    let _ = PgmHeader::decode(&mut buf);

    // Anything that decodes must re-encode without panicking.
    if let Some(packet) = PgmPacket::decode(&bytes) {
        let _ = packet.encode();
    }
});
