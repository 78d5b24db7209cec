//! Property-based tests for the PGM wire format.
//!
//! Roundtrip correctness for headers, options chains, and whole packets
//! across the value space, plus checksum identities and parser robustness
//! against arbitrary mutations.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;

use pgm_transport::checksum;
use pgm_transport::sqn::Sqn;
use pgm_transport::tsi::{Gsi, Tsi};
use pgm_transport::wire::*;

// ─── Strategies ─────────────────────────────────────────────────────────────

fn arb_tsi() -> impl Strategy<Value = Tsi> {
    (any::<[u8; 6]>(), any::<u16>()).prop_map(|(gsi, sport)| Tsi::new(Gsi::new(gsi), sport))
}

fn arb_nla() -> impl Strategy<Value = Nla> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(|o| Nla(std::net::IpAddr::V4(o.into()))),
        any::<[u8; 16]>().prop_map(|o| Nla(std::net::IpAddr::V6(o.into()))),
    ]
}

fn arb_fragment() -> impl Strategy<Value = OptFragment> {
    (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(sqn, off, len)| OptFragment {
        first_sqn: Sqn::new(sqn),
        offset: off,
        apdu_len: len,
    })
}

fn arb_options() -> impl Strategy<Value = PacketOptions> {
    (
        proptest::option::of(arb_fragment()),
        proptest::collection::vec(any::<u32>(), 0..OPT_NAK_LIST_MAX),
        proptest::option::of((any::<bool>(), any::<bool>(), 2u32..=128)),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(fragment, nak_sqns, prm, syn, fin)| PacketOptions {
            fragment,
            nak_list: nak_sqns.into_iter().map(Sqn::new).collect(),
            parity_prm: prm.map(|(proactive, ondemand, tgs)| OptParityPrm {
                proactive,
                ondemand,
                tgs,
            }),
            syn,
            fin,
        })
}

fn arb_packet() -> impl Strategy<Value = PgmPacket> {
    (arb_tsi(), any::<u16>(), arb_body()).prop_map(|(tsi, dport, (packet_type, body))| PgmPacket {
        header: PgmHeader::new(tsi, dport, packet_type),
        body,
    })
}

fn arb_body() -> impl Strategy<Value = (PacketType, PacketBody)> {
    prop_oneof![
        (
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
            arb_nla(),
            arb_options()
        )
            .prop_map(|(sqn, trail, lead, nla, options)| {
                (
                    PacketType::Spm,
                    PacketBody::Spm(SpmPacket {
                        spm_sqn: Sqn::new(sqn),
                        trail: Sqn::new(trail),
                        lead: Sqn::new(lead),
                        nla,
                        options,
                    }),
                )
            }),
        (
            any::<u32>(),
            any::<u32>(),
            proptest::option::of(arb_fragment()),
            proptest::collection::vec(any::<u8>(), 0..1400)
        )
            .prop_map(|(sqn, trail, fragment, tsdu)| {
                (
                    PacketType::Odata,
                    PacketBody::Data(DataPacket {
                        sqn: Sqn::new(sqn),
                        trail: Sqn::new(trail),
                        options: PacketOptions {
                            fragment,
                            ..Default::default()
                        },
                        tsdu: Bytes::from(tsdu),
                    }),
                )
            }),
        (
            any::<u32>(),
            arb_nla(),
            arb_nla(),
            proptest::collection::vec(any::<u32>(), 0..OPT_NAK_LIST_MAX)
        )
            .prop_map(|(sqn, src, grp, list)| {
                (
                    PacketType::Nak,
                    PacketBody::Nak(NakPacket {
                        sqn: Sqn::new(sqn),
                        src_nla: src,
                        grp_nla: grp,
                        options: PacketOptions {
                            nak_list: list.into_iter().map(Sqn::new).collect(),
                            ..Default::default()
                        },
                    }),
                )
            }),
        Just((PacketType::Spmr, PacketBody::Spmr)),
    ]
}

// ─── Wire Roundtrip ─────────────────────────────────────────────────────────

proptest! {
    /// `decode(encode(p))` preserves every field, and re-encoding yields the
    /// identical byte string.
    #[test]
    fn packet_roundtrip(packet in arb_packet()) {
        let wire = packet.encode().freeze();
        prop_assert!(verify(&wire), "encoded packets carry valid checksums");

        let decoded = PgmPacket::decode(&wire).unwrap();
        prop_assert_eq!(decoded.header.tsi(), packet.header.tsi());
        prop_assert_eq!(decoded.header.packet_type, packet.header.packet_type);
        prop_assert_eq!(&decoded.body, &packet.body);

        let rewire = decoded.encode().freeze();
        prop_assert_eq!(wire, rewire, "serialize(parse(bytes)) == bytes");
    }

    #[test]
    fn options_roundtrip(options in arb_options()) {
        let mut buf = BytesMut::new();
        options.encode(&mut buf);
        if options.is_empty() {
            prop_assert!(buf.is_empty());
        } else {
            prop_assert_eq!(buf.len(), options.encoded_len());
            let decoded = PacketOptions::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded, options);
        }
    }

    /// The parser never panics and never reads past the buffer, no matter
    /// what bytes arrive.
    #[test]
    fn decode_arbitrary_bytes_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..256)) {
        let bytes = Bytes::from(raw);
        let _ = PgmPacket::decode(&bytes);
        let _ = verify(&bytes);
        let _ = PacketOptions::decode(&mut bytes.clone());
    }

    /// Flipping any single byte outside the checksum field changes the
    /// ones-complement sum by less than 0xFFFF, so it is always detected.
    #[test]
    fn bit_corruption_detected(
        packet in arb_packet(),
        flip_byte in 1u8..,
        pos in any::<prop::sample::Index>(),
    ) {
        let wire = packet.encode();
        let index = pos.index(wire.len());
        prop_assume!(!(CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2).contains(&index));
        prop_assume!(verify(&wire));

        let mut corrupt = wire.clone();
        corrupt[index] ^= flip_byte;
        prop_assert!(!verify(&corrupt), "single-byte corruption must be detected");
    }
}

// ─── Checksum Identities ────────────────────────────────────────────────────

proptest! {
    /// Splitting a buffer at any point and resuming the partial sum equals
    /// the one-shot sum.
    #[test]
    fn checksum_partial_split(
        data in proptest::collection::vec(any::<u8>(), 0..512),
        split in any::<prop::sample::Index>(),
    ) {
        let at = split.index(data.len().max(1)).min(data.len());
        // Resumption is only defined at even offsets; odd splits go through
        // block_add below.
        prop_assume!(at % 2 == 0);
        let whole = checksum::partial(&data, 0);
        let resumed = checksum::partial(&data[at..], checksum::partial(&data[..at], 0));
        prop_assert_eq!(checksum::fold(whole), checksum::fold(resumed));
    }

    /// `block_add` combines independent partials at any offset parity.
    #[test]
    fn checksum_block_add(
        a in proptest::collection::vec(any::<u8>(), 0..256),
        b in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut whole = a.clone();
        whole.extend_from_slice(&b);
        let combined = checksum::block_add(
            checksum::partial(&a, 0),
            checksum::partial(&b, 0),
            a.len(),
        );
        prop_assert_eq!(checksum::fold(checksum::partial(&whole, 0)), checksum::fold(combined));
    }

    /// `partial_copy` computes the same sum as `partial` and copies exactly.
    #[test]
    fn checksum_partial_copy(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut dst = vec![0u8; data.len()];
        let sum = checksum::partial_copy(&data, &mut dst, 0);
        prop_assert_eq!(sum, checksum::partial(&data, 0));
        prop_assert_eq!(dst, data);
    }

    /// Fold never produces the reserved on-wire zero.
    #[test]
    fn checksum_fold_nonzero(partial in any::<u32>()) {
        prop_assert_ne!(checksum::fold(partial), 0);
    }
}

// ─── Serial Number Arithmetic ───────────────────────────────────────────────

proptest! {
    /// Within half the sequence space, `after` is a strict order consistent
    /// with wrapped distance.
    #[test]
    fn sqn_after_consistent(base in any::<u32>(), delta in 1u32..0x7FFF_FFFF) {
        let a = Sqn::new(base);
        let b = a + delta;
        prop_assert!(b.after(a));
        prop_assert!(a.before(b));
        prop_assert!(!a.after(b));
        prop_assert_eq!(b.distance(a), delta);
    }

    #[test]
    fn sqn_next_prev_inverse(value in any::<u32>()) {
        let sqn = Sqn::new(value);
        prop_assert_eq!(sqn.next().prev(), sqn);
        prop_assert_eq!(sqn.prev().next(), sqn);
    }
}
