#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use pgm_transport::transport::{PacketSink, Transport};
use pgm_transport::tsi::Gsi;
use pgm_transport::wire::Nla;

struct NullSink;

impl PacketSink for NullSink {
    fn send_to_group(&self, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    fn send_unicast(&self, _to: &Nla, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

/// Feed arbitrary datagram streams through a bound receiving transport.
///
/// Input bytes are split into length-prefixed datagrams so one fuzz case
/// exercises multi-packet state (peer creation, window growth, NAK ladder
/// arming) rather than a single parse.
fuzz_target!(|data: &[u8]| {
    let group = Nla(IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1)));
    let transport = Transport::create(Gsi::new([1; 6]), 1000, 7500, vec![group], group);
    let _ = transport.set_rxw_sqns(64);
    if transport.bind(Arc::new(NullSink)).is_err() {
        return;
    }

    let mut rest = data;
    while rest.len() >= 2 {
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize % 512;
        rest = &rest[2..];
        let take = len.min(rest.len());
        transport.handle_packet(Bytes::copy_from_slice(&rest[..take]));
        rest = &rest[take..];
    }

    let mut buf = [0u8; 2048];
    while let Ok((pgm_transport::IoStatus::Normal(_), _)) = transport.recv(&mut buf, true) {}
    transport.destroy(false);
});
