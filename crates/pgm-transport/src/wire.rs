//! # PGM Wire Format
//!
//! RFC 3208 packet headers, options chain, and NLA encoding.
//!
//! ## Common Header (16 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Source Port           |        Destination Port       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |    Options    |           Checksum            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Global Source ID (6 bytes) ...               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      ... GSI                  |          TSDU Length          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! An options chain follows the type-specific header when `OPT_PRESENT` is
//! set; the first option is always `OPT_LENGTH` carrying the chain's total
//! length, and `OPT_END` on a type octet terminates the chain.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::checksum;
use crate::sqn::Sqn;
use crate::tsi::{Gsi, Tsi, GSI_LEN};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Size of the PGM common header.
pub const PGM_HEADER_LEN: usize = 16;

/// Size of the ODATA/RDATA type-specific header (sqn + trail).
pub const PGM_DATA_HEADER_LEN: usize = 8;

/// Byte offset of the checksum field within the common header.
pub const CHECKSUM_OFFSET: usize = 6;

/// Maximum number of elements an options chain may carry.
pub const MAX_OPTIONS: usize = 16;

/// Maximum sqns in an OPT_NAK_LIST (62 plus the header-carried lead = 63).
pub const OPT_NAK_LIST_MAX: usize = 62;

// Header option-flag bits.
pub const OPT_PRESENT: u8 = 0x01;
pub const OPT_NETWORK: u8 = 0x02;
pub const OPT_VAR_PKTLEN: u8 = 0x40;
pub const OPT_PARITY: u8 = 0x80;

// Option type octet.
pub const OPT_MASK: u8 = 0x7F;
pub const OPT_END: u8 = 0x80;

// Option codes.
pub const OPT_LENGTH: u8 = 0x00;
pub const OPT_FRAGMENT: u8 = 0x01;
pub const OPT_NAK_LIST: u8 = 0x02;
pub const OPT_PARITY_PRM: u8 = 0x08;
pub const OPT_SYN: u8 = 0x0D;
pub const OPT_FIN: u8 = 0x0E;

// OPT_PARITY_PRM reserved-octet flags.
pub const PARITY_PRM_PRO: u8 = 0x02;
pub const PARITY_PRM_OND: u8 = 0x01;

// NLA address family indicators (RFC 1700).
pub const AFI_IP: u16 = 1;
pub const AFI_IP6: u16 = 2;

// ─── Packet Type ────────────────────────────────────────────────────────────

/// PGM packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Spm = 0x00,
    Poll = 0x01,
    Polr = 0x02,
    Odata = 0x04,
    Rdata = 0x05,
    Nak = 0x08,
    Nnak = 0x09,
    Ncf = 0x0A,
    Spmr = 0x0C,
    Ack = 0x0D,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(PacketType::Spm),
            0x01 => Some(PacketType::Poll),
            0x02 => Some(PacketType::Polr),
            0x04 => Some(PacketType::Odata),
            0x05 => Some(PacketType::Rdata),
            0x08 => Some(PacketType::Nak),
            0x09 => Some(PacketType::Nnak),
            0x0A => Some(PacketType::Ncf),
            0x0C => Some(PacketType::Spmr),
            0x0D => Some(PacketType::Ack),
            _ => None,
        }
    }

    /// Travels receiver → source (matched by the source's own TSI).
    pub fn is_upstream(self) -> bool {
        matches!(
            self,
            PacketType::Nak | PacketType::Nnak | PacketType::Spmr | PacketType::Polr | PacketType::Ack
        )
    }

    /// Travels source → receivers (matched by the sender's TSI).
    pub fn is_downstream(self) -> bool {
        matches!(
            self,
            PacketType::Spm
                | PacketType::Odata
                | PacketType::Rdata
                | PacketType::Poll
                | PacketType::Ncf
        )
    }

    /// May be observed multicast from a fellow receiver.
    pub fn is_peer(self) -> bool {
        matches!(self, PacketType::Nak | PacketType::Spmr)
    }
}

// ─── NLA ────────────────────────────────────────────────────────────────────

/// Network Layer Address: an IP address with an AFI prefix.
///
/// Wire form: `afi(16) reserved(16) address(4|16)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nla(pub IpAddr);

impl Nla {
    pub const UNSPECIFIED: Nla = Nla(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    pub fn encoded_len(&self) -> usize {
        match self.0 {
            IpAddr::V4(_) => 8,
            IpAddr::V6(_) => 20,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self.0 {
            IpAddr::V4(addr) => {
                buf.put_u16(AFI_IP);
                buf.put_u16(0);
                buf.put_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                buf.put_u16(AFI_IP6);
                buf.put_u16(0);
                buf.put_slice(&addr.octets());
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }
        let afi = buf.get_u16();
        let _reserved = buf.get_u16();
        match afi {
            AFI_IP => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Some(Nla(IpAddr::V4(Ipv4Addr::from(octets))))
            }
            AFI_IP6 => {
                if buf.remaining() < 16 {
                    return None;
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Some(Nla(IpAddr::V6(Ipv6Addr::from(octets))))
            }
            _ => None,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.0.is_unspecified()
    }
}

impl From<IpAddr> for Nla {
    fn from(addr: IpAddr) -> Self {
        Nla(addr)
    }
}

// ─── Common Header ──────────────────────────────────────────────────────────

/// The 16-byte PGM common header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgmHeader {
    pub sport: u16,
    pub dport: u16,
    pub packet_type: PacketType,
    /// OPT_PRESENT / OPT_NETWORK / OPT_VAR_PKTLEN / OPT_PARITY flag bits.
    pub options: u8,
    /// On-wire checksum; zero while building, filled by [`finalize`].
    pub checksum: u16,
    pub gsi: Gsi,
    pub tsdu_length: u16,
}

impl PgmHeader {
    pub fn new(tsi: Tsi, dport: u16, packet_type: PacketType) -> Self {
        PgmHeader {
            sport: tsi.sport,
            dport,
            packet_type,
            options: 0,
            checksum: 0,
            gsi: tsi.gsi,
            tsdu_length: 0,
        }
    }

    /// The sending session's identity. For upstream packets (NAK, SPMR) the
    /// TSI instead names the session being addressed; callers swap ports
    /// accordingly.
    pub fn tsi(&self) -> Tsi {
        Tsi::new(self.gsi, self.sport)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.sport);
        buf.put_u16(self.dport);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.options);
        buf.put_u16(self.checksum);
        buf.put_slice(self.gsi.as_bytes());
        buf.put_u16(self.tsdu_length);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < PGM_HEADER_LEN {
            return None;
        }
        let sport = buf.get_u16();
        let dport = buf.get_u16();
        let packet_type = PacketType::from_byte(buf.get_u8())?;
        let options = buf.get_u8();
        let checksum = buf.get_u16();
        let mut gsi = [0u8; GSI_LEN];
        buf.copy_to_slice(&mut gsi);
        let tsdu_length = buf.get_u16();
        Some(PgmHeader {
            sport,
            dport,
            packet_type,
            options,
            checksum,
            gsi: Gsi::new(gsi),
            tsdu_length,
        })
    }
}

// ─── Options Chain ──────────────────────────────────────────────────────────

/// OPT_FRAGMENT: places a TSDU within its APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptFragment {
    /// Sequence number of the APDU's first fragment.
    pub first_sqn: Sqn,
    /// Byte offset of this fragment within the APDU.
    pub offset: u32,
    /// Total APDU length in bytes.
    pub apdu_len: u32,
}

/// OPT_PARITY_PRM: advertises FEC capability on SPMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptParityPrm {
    pub proactive: bool,
    pub ondemand: bool,
    /// Transmission group size `k`.
    pub tgs: u32,
}

/// A parsed (or to-be-encoded) options chain.
///
/// Unrecognized options are skipped on parse; the chain is bounded by the
/// declared total length, the packet tail, and [`MAX_OPTIONS`] elements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketOptions {
    pub fragment: Option<OptFragment>,
    pub nak_list: Vec<Sqn>,
    pub parity_prm: Option<OptParityPrm>,
    pub syn: bool,
    pub fin: bool,
}

impl PacketOptions {
    pub fn is_empty(&self) -> bool {
        self.fragment.is_none()
            && self.nak_list.is_empty()
            && self.parity_prm.is_none()
            && !self.syn
            && !self.fin
    }

    /// Total encoded chain length including OPT_LENGTH.
    pub fn encoded_len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut len = 4; // OPT_LENGTH
        if self.fragment.is_some() {
            len += 16;
        }
        if !self.nak_list.is_empty() {
            len += 4 + 4 * self.nak_list.len();
        }
        if self.parity_prm.is_some() {
            len += 8;
        }
        if self.syn {
            len += 4;
        }
        if self.fin {
            len += 4;
        }
        len
    }

    /// Encode the chain. The caller sets OPT_PRESENT on the common header.
    pub fn encode(&self, buf: &mut BytesMut) {
        if self.is_empty() {
            return;
        }
        debug_assert!(self.nak_list.len() <= OPT_NAK_LIST_MAX);

        // Elements in emission order; the last carries OPT_END.
        let mut pending: Vec<u8> = Vec::with_capacity(6);
        if self.fragment.is_some() {
            pending.push(OPT_FRAGMENT);
        }
        if !self.nak_list.is_empty() {
            pending.push(OPT_NAK_LIST);
        }
        if self.parity_prm.is_some() {
            pending.push(OPT_PARITY_PRM);
        }
        if self.syn {
            pending.push(OPT_SYN);
        }
        if self.fin {
            pending.push(OPT_FIN);
        }

        buf.put_u8(OPT_LENGTH);
        buf.put_u8(4);
        buf.put_u16(self.encoded_len() as u16);

        let last = *pending.last().expect("non-empty chain");
        for code in pending {
            let type_octet = if code == last { code | OPT_END } else { code };
            match code {
                OPT_FRAGMENT => {
                    let frag = self.fragment.expect("fragment present");
                    buf.put_u8(type_octet);
                    buf.put_u8(16);
                    buf.put_u8(0); // header reserved
                    buf.put_u8(0); // option reserved
                    buf.put_u32(frag.first_sqn.value());
                    buf.put_u32(frag.offset);
                    buf.put_u32(frag.apdu_len);
                }
                OPT_NAK_LIST => {
                    buf.put_u8(type_octet);
                    buf.put_u8((4 + 4 * self.nak_list.len()) as u8);
                    buf.put_u8(0);
                    buf.put_u8(0);
                    for sqn in &self.nak_list {
                        buf.put_u32(sqn.value());
                    }
                }
                OPT_PARITY_PRM => {
                    let prm = self.parity_prm.expect("parity_prm present");
                    buf.put_u8(type_octet);
                    buf.put_u8(8);
                    buf.put_u8(0);
                    let flags = if prm.proactive { PARITY_PRM_PRO } else { 0 }
                        | if prm.ondemand { PARITY_PRM_OND } else { 0 };
                    buf.put_u8(flags);
                    buf.put_u32(prm.tgs);
                }
                OPT_SYN | OPT_FIN => {
                    buf.put_u8(type_octet);
                    buf.put_u8(4);
                    buf.put_u8(0);
                    buf.put_u8(0);
                }
                _ => unreachable!(),
            }
        }
    }

    /// Decode an options chain. Returns `None` on any bounds or structure
    /// violation; the chain is the classic source of parser bugs, so both the
    /// per-option length and the declared total are checked before any read.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let opt_type = buf.get_u8();
        let opt_len = buf.get_u8();
        if opt_type & OPT_MASK != OPT_LENGTH || opt_len != 4 {
            return None;
        }
        let total_length = buf.get_u16() as usize;
        if total_length < 4 || total_length - 4 > buf.remaining() {
            return None;
        }

        let mut opts = PacketOptions::default();
        let mut consumed = 4usize;
        let mut elements = 0usize;
        loop {
            if elements >= MAX_OPTIONS || consumed + 2 > total_length {
                return None;
            }
            let type_octet = buf.get_u8();
            let length = buf.get_u8() as usize;
            if length < 3 || consumed + length > total_length || buf.remaining() < length - 2 {
                return None;
            }
            let body_len = length - 2;
            match type_octet & OPT_MASK {
                OPT_FRAGMENT => {
                    if length != 16 {
                        return None;
                    }
                    buf.advance(2); // reserved octets
                    opts.fragment = Some(OptFragment {
                        first_sqn: Sqn::new(buf.get_u32()),
                        offset: buf.get_u32(),
                        apdu_len: buf.get_u32(),
                    });
                }
                OPT_NAK_LIST => {
                    if length < 4 || (length - 4) % 4 != 0 {
                        return None;
                    }
                    buf.advance(2);
                    let count = (length - 4) / 4;
                    if count > OPT_NAK_LIST_MAX {
                        return None;
                    }
                    opts.nak_list.reserve(count);
                    for _ in 0..count {
                        opts.nak_list.push(Sqn::new(buf.get_u32()));
                    }
                }
                OPT_PARITY_PRM => {
                    if length != 8 {
                        return None;
                    }
                    buf.advance(1);
                    let flags = buf.get_u8();
                    opts.parity_prm = Some(OptParityPrm {
                        proactive: flags & PARITY_PRM_PRO != 0,
                        ondemand: flags & PARITY_PRM_OND != 0,
                        tgs: buf.get_u32(),
                    });
                }
                OPT_SYN => {
                    buf.advance(body_len);
                    opts.syn = true;
                }
                OPT_FIN => {
                    buf.advance(body_len);
                    opts.fin = true;
                }
                _ => {
                    // Unknown option: skip within its declared length.
                    buf.advance(body_len);
                }
            }
            consumed += length;
            elements += 1;
            if type_octet & OPT_END != 0 {
                break;
            }
        }
        if consumed != total_length {
            return None;
        }
        Some(opts)
    }
}

// ─── Typed Bodies ───────────────────────────────────────────────────────────

/// SPM: ambient advertisement of the window edges and the source path NLA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpmPacket {
    pub spm_sqn: Sqn,
    pub trail: Sqn,
    pub lead: Sqn,
    pub nla: Nla,
    pub options: PacketOptions,
}

impl SpmPacket {
    pub fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.spm_sqn.value());
        buf.put_u32(self.trail.value());
        buf.put_u32(self.lead.value());
        self.nla.encode(buf);
        self.options.encode(buf);
    }

    pub fn decode_body(buf: &mut impl Buf, has_options: bool) -> Option<Self> {
        if buf.remaining() < 12 {
            return None;
        }
        let spm_sqn = Sqn::new(buf.get_u32());
        let trail = Sqn::new(buf.get_u32());
        let lead = Sqn::new(buf.get_u32());
        let nla = Nla::decode(buf)?;
        let options = if has_options {
            PacketOptions::decode(buf)?
        } else {
            PacketOptions::default()
        };
        Some(SpmPacket {
            spm_sqn,
            trail,
            lead,
            nla,
            options,
        })
    }
}

/// ODATA/RDATA: shared data header, options, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sqn: Sqn,
    pub trail: Sqn,
    pub options: PacketOptions,
    pub tsdu: Bytes,
}

impl DataPacket {
    pub fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sqn.value());
        buf.put_u32(self.trail.value());
        self.options.encode(buf);
        buf.put_slice(&self.tsdu);
    }

    /// Decode against the header's declared `tsdu_length`; the remaining
    /// bytes between options and payload must match exactly.
    pub fn decode_body(buf: &mut Bytes, has_options: bool, tsdu_length: u16) -> Option<Self> {
        if buf.remaining() < PGM_DATA_HEADER_LEN {
            return None;
        }
        let sqn = Sqn::new(buf.get_u32());
        let trail = Sqn::new(buf.get_u32());
        let options = if has_options {
            PacketOptions::decode(buf)?
        } else {
            PacketOptions::default()
        };
        if buf.remaining() < tsdu_length as usize {
            return None;
        }
        let tsdu = buf.copy_to_bytes(tsdu_length as usize);
        Some(DataPacket {
            sqn,
            trail,
            options,
            tsdu,
        })
    }
}

/// NAK / NCF / NNAK: a requested (or confirmed) sqn plus the source and group
/// path addresses, optionally extended by OPT_NAK_LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPacket {
    pub sqn: Sqn,
    pub src_nla: Nla,
    pub grp_nla: Nla,
    pub options: PacketOptions,
}

impl NakPacket {
    pub fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sqn.value());
        self.src_nla.encode(buf);
        self.grp_nla.encode(buf);
        self.options.encode(buf);
    }

    pub fn decode_body(buf: &mut impl Buf, has_options: bool) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let sqn = Sqn::new(buf.get_u32());
        let src_nla = Nla::decode(buf)?;
        let grp_nla = Nla::decode(buf)?;
        let options = if has_options {
            PacketOptions::decode(buf)?
        } else {
            PacketOptions::default()
        };
        Some(NakPacket {
            sqn,
            src_nla,
            grp_nla,
            options,
        })
    }

    /// All requested sqns: the header lead plus the OPT_NAK_LIST tail.
    pub fn sqns(&self) -> impl Iterator<Item = Sqn> + '_ {
        std::iter::once(self.sqn).chain(self.options.nak_list.iter().copied())
    }
}

// ─── Whole Packets ──────────────────────────────────────────────────────────

/// A decoded PGM packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgmPacket {
    pub header: PgmHeader,
    pub body: PacketBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Spm(SpmPacket),
    Data(DataPacket),
    Nak(NakPacket),
    Ncf(NakPacket),
    Nnak(NakPacket),
    Spmr,
    /// POLL/POLR/ACK: recognized, not driven.
    Opaque,
}

impl PgmPacket {
    /// Serialize header + body and fill in the checksum.
    pub fn encode(&self) -> BytesMut {
        let mut header = self.header.clone();
        let has_options = match &self.body {
            PacketBody::Spm(spm) => !spm.options.is_empty(),
            PacketBody::Data(data) => !data.options.is_empty(),
            PacketBody::Nak(nak) | PacketBody::Ncf(nak) | PacketBody::Nnak(nak) => {
                !nak.options.is_empty()
            }
            _ => false,
        };
        if has_options {
            header.options |= OPT_PRESENT | OPT_NETWORK;
        }
        if let PacketBody::Data(data) = &self.body {
            header.tsdu_length = data.tsdu.len() as u16;
        }
        header.checksum = 0;

        let mut buf = BytesMut::with_capacity(256);
        header.encode(&mut buf);
        match &self.body {
            PacketBody::Spm(spm) => spm.encode_body(&mut buf),
            PacketBody::Data(data) => data.encode_body(&mut buf),
            PacketBody::Nak(nak) | PacketBody::Ncf(nak) | PacketBody::Nnak(nak) => {
                nak.encode_body(&mut buf)
            }
            PacketBody::Spmr | PacketBody::Opaque => {}
        }
        finalize(&mut buf);
        buf
    }

    /// Decode a packet from raw bytes. Checksum is NOT verified here — call
    /// [`verify`] first so corrupt packets can be counted separately from
    /// malformed ones.
    pub fn decode(raw: &Bytes) -> Option<PgmPacket> {
        let mut buf = raw.clone();
        let header = PgmHeader::decode(&mut buf)?;
        let has_options = header.options & OPT_PRESENT != 0;
        let body = match header.packet_type {
            PacketType::Spm => PacketBody::Spm(SpmPacket::decode_body(&mut buf, has_options)?),
            PacketType::Odata | PacketType::Rdata => PacketBody::Data(DataPacket::decode_body(
                &mut buf,
                has_options,
                header.tsdu_length,
            )?),
            PacketType::Nak => PacketBody::Nak(NakPacket::decode_body(&mut buf, has_options)?),
            PacketType::Ncf => PacketBody::Ncf(NakPacket::decode_body(&mut buf, has_options)?),
            PacketType::Nnak => PacketBody::Nnak(NakPacket::decode_body(&mut buf, has_options)?),
            PacketType::Spmr => PacketBody::Spmr,
            PacketType::Poll | PacketType::Polr | PacketType::Ack => PacketBody::Opaque,
        };
        Some(PgmPacket { header, body })
    }
}

/// Compute the checksum over a fully serialized packet and write it into the
/// header field.
pub fn finalize(buf: &mut BytesMut) {
    debug_assert!(buf.len() >= PGM_HEADER_LEN);
    buf[CHECKSUM_OFFSET] = 0;
    buf[CHECKSUM_OFFSET + 1] = 0;
    let sum = checksum::fold(checksum::partial(buf, 0));
    buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());
}

/// Verify a packet's checksum. `0x0000` on the wire means "no checksum
/// supplied" and is accepted only for ODATA/RDATA.
pub fn verify(packet: &[u8]) -> bool {
    if packet.len() < PGM_HEADER_LEN {
        return false;
    }
    let wire = u16::from_be_bytes([packet[CHECKSUM_OFFSET], packet[CHECKSUM_OFFSET + 1]]);
    if wire == 0 {
        return matches!(packet[4], 0x04 | 0x05);
    }
    let mut sum = checksum::partial(&packet[..CHECKSUM_OFFSET], 0);
    sum = checksum::block_add(
        sum,
        checksum::partial(&packet[CHECKSUM_OFFSET + 2..], 0),
        CHECKSUM_OFFSET + 2,
    );
    checksum::fold(sum) == wire
}
