//! # Source Engine
//!
//! The sending half of a session: packetises APDUs into ODATA, keeps the
//! transmit window, answers NAKs with NCF + RDATA, and maintains the SPM
//! ambient/heartbeat schedule. Pure logic — serialized packets are queued on
//! an output ring the transport drains to its socket seam.
//!
//! ## Send resumability
//!
//! `send` must complete partially under rate limiting: fragments already
//! pushed to the window stay there, and the resume state records the APDU
//! offset so a retry with the same arguments continues without duplicating
//! window entries.

use bytes::Bytes;
use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{IoStatus, PgmError};
use crate::rate::RateLimiter;
use crate::sqn::Sqn;
use crate::stats::SourceStats;
use crate::tsi::Tsi;
use crate::txw::{FecParameters, TransmitWindow};
use crate::wire::{
    DataPacket, NakPacket, Nla, OptFragment, OptParityPrm, PacketBody, PacketOptions, PacketType,
    PgmHeader, PgmPacket, SpmPacket, OPT_PARITY, OPT_VAR_PKTLEN, PGM_DATA_HEADER_LEN,
    PGM_HEADER_LEN,
};

// ─── Configuration ──────────────────────────────────────────────────────────

/// FEC configuration on the sending side.
#[derive(Debug, Clone, Copy)]
pub struct FecConfig {
    /// Proactive parity packets per group (0 disables proactive parity).
    pub proactive_h: u8,
    /// Answer parity NAKs with on-demand parity.
    pub use_ondemand: bool,
    /// Allow variable-length transmission groups.
    pub use_varpktlen: bool,
    pub n: u8,
    pub k: u8,
}

/// Source-side parameters, frozen at bind time.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub tsi: Tsi,
    pub dport: u16,
    /// Largest wire packet including the IP header.
    pub max_tpdu: usize,
    /// IP header bytes the stack will prepend.
    pub iphdr_len: usize,
    /// Source path address advertised in SPMs.
    pub nla: Nla,
    /// Multicast group data is sent to; NAKs naming another group are
    /// discarded. Unspecified skips the check.
    pub group: Nla,
    pub spm_ambient_interval: Duration,
    /// Heartbeat ladder restarted by every data send; entries at or above
    /// the ambient interval end the ladder.
    pub spm_heartbeat_intervals: Vec<Duration>,
    pub txw_sqns: u32,
    pub txw_secs: u32,
    pub txw_max_rte: u64,
    pub fec: Option<FecConfig>,
    /// First data sqn will be `initial_sqn`.
    pub initial_sqn: Sqn,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            tsi: Tsi::default(),
            dport: 7500,
            max_tpdu: 1500,
            iphdr_len: 20,
            nla: Nla::UNSPECIFIED,
            group: Nla::UNSPECIFIED,
            spm_ambient_interval: Duration::from_millis(8192),
            spm_heartbeat_intervals: vec![
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(1300),
                Duration::from_secs(7),
                Duration::from_secs(16),
                Duration::from_secs(25),
                Duration::from_secs(30),
            ],
            txw_sqns: 0,
            txw_secs: 30,
            txw_max_rte: 400_000,
            fec: None,
            initial_sqn: Sqn::new(0),
        }
    }
}

// ─── Resumable Send State ───────────────────────────────────────────────────

#[derive(Debug)]
struct SendState {
    apdu: Bytes,
    data_bytes_offset: usize,
    first_sqn: Sqn,
    is_fragmented: bool,
}

// ─── Engine ─────────────────────────────────────────────────────────────────

pub struct SourceEngine {
    config: SourceConfig,
    window: TransmitWindow,
    rate: Option<RateLimiter>,
    spm_sqn: u32,
    next_ambient_spm: Instant,
    /// Armed while the heartbeat ladder is running.
    next_heartbeat_spm: Option<Instant>,
    heartbeat_index: usize,
    send_state: Option<SendState>,
    sent_any_data: bool,
    out: VecDeque<Bytes>,
    stats: SourceStats,
}

impl SourceEngine {
    pub fn new(config: SourceConfig, now: Instant) -> Self {
        let capacity = crate::txw::window_capacity(
            config.txw_sqns,
            config.txw_secs,
            config.txw_max_rte,
            config.max_tpdu,
        );
        let fec = config.fec.map(|f| FecParameters { n: f.n, k: f.k });
        let window = TransmitWindow::new(capacity, config.initial_sqn.prev(), fec);
        let rate = (config.txw_max_rte > 0)
            .then(|| RateLimiter::new(config.txw_max_rte, config.iphdr_len, now));
        SourceEngine {
            window,
            rate,
            spm_sqn: 0,
            next_ambient_spm: now + config.spm_ambient_interval,
            next_heartbeat_spm: None,
            heartbeat_index: 0,
            send_state: None,
            sent_any_data: false,
            out: VecDeque::new(),
            stats: SourceStats::new(),
            config,
        }
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    pub fn window(&self) -> &TransmitWindow {
        &self.window
    }

    /// Largest TSDU for one packet, with or without OPT_FRAGMENT overhead.
    pub fn max_tsdu(&self, fragmenting: bool) -> usize {
        let mut overhead = self.config.iphdr_len + PGM_HEADER_LEN + PGM_DATA_HEADER_LEN;
        if fragmenting {
            overhead += 4 + 16; // OPT_LENGTH + OPT_FRAGMENT
        }
        self.config.max_tpdu - overhead
    }

    /// Largest APDU the window can carry at once.
    pub fn max_apdu(&self) -> usize {
        self.max_tsdu(true) * self.window.max_length()
    }

    // ─── Sending ────────────────────────────────────────────────────────

    /// Submit (or resume) an APDU. Returns `RateLimited` with preserved
    /// state when the token bucket refuses a fragment in non-blocking mode.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<IoStatus, PgmError> {
        if self.send_state.is_some() {
            return self.send_bytes(Bytes::new(), now); // resume ignores args
        }
        self.send_bytes(Bytes::copy_from_slice(data), now)
    }

    /// Zero-copy send: `apdu` is taken as-is; window entries and wire
    /// packets reference its storage.
    pub fn send_bytes(&mut self, apdu: Bytes, now: Instant) -> Result<IoStatus, PgmError> {
        let mut state = match self.send_state.take() {
            Some(state) => state,
            None => {
                if apdu.is_empty() {
                    return Ok(IoStatus::Normal(0));
                }
                if apdu.len() > self.max_apdu() {
                    return Err(PgmError::MessageTooLarge {
                        size: apdu.len(),
                        max: self.max_apdu(),
                    });
                }
                SendState {
                    is_fragmented: apdu.len() > self.max_tsdu(false),
                    data_bytes_offset: 0,
                    first_sqn: self.window.next_lead(),
                    apdu,
                }
            }
        };

        let apdu_length = state.apdu.len();
        let max_tsdu = self.max_tsdu(state.is_fragmented);
        while state.data_bytes_offset < apdu_length {
            let tsdu_length = max_tsdu.min(apdu_length - state.data_bytes_offset);
            let tpdu_length = self.config.max_tpdu - self.config.iphdr_len
                - (max_tsdu - tsdu_length);
            if let Some(rate) = &mut self.rate {
                if !rate.check(tpdu_length, now) {
                    self.stats.rate_limited += 1;
                    self.send_state = Some(state);
                    return Ok(IoStatus::RateLimited);
                }
            }

            let tsdu = state
                .apdu
                .slice(state.data_bytes_offset..state.data_bytes_offset + tsdu_length);
            let fragment = state.is_fragmented.then(|| OptFragment {
                first_sqn: state.first_sqn,
                offset: state.data_bytes_offset as u32,
                apdu_len: apdu_length as u32,
            });
            let sequence = self.window.push(tsdu.clone(), fragment, now);
            debug_assert!(state.data_bytes_offset > 0 || sequence == state.first_sqn);

            let mut options = PacketOptions {
                fragment,
                ..Default::default()
            };
            if !self.sent_any_data {
                options.syn = true;
                self.sent_any_data = true;
            }
            let packet = PgmPacket {
                header: PgmHeader::new(self.config.tsi, self.config.dport, PacketType::Odata),
                body: PacketBody::Data(DataPacket {
                    sqn: sequence,
                    trail: self.window.trail(),
                    options,
                    tsdu,
                }),
            };
            self.queue(packet.encode().freeze());
            self.stats.data_packets_sent += 1;
            self.stats.data_bytes_sent += tsdu_length as u64;
            state.data_bytes_offset += tsdu_length;

            self.emit_proactive_parity(sequence);
        }

        self.stats.apdus_sent += 1;
        self.reset_heartbeat(now);
        Ok(IoStatus::Normal(apdu_length))
    }

    /// Gathered send: one APDU across many buffers, or one APDU per buffer.
    pub fn sendv(
        &mut self,
        vectors: &[&[u8]],
        is_one_apdu: bool,
        now: Instant,
    ) -> Result<IoStatus, PgmError> {
        if is_one_apdu {
            let gathered: Vec<u8> = vectors.concat();
            return self.send_bytes(Bytes::from(gathered), now);
        }
        let mut total = 0usize;
        for vector in vectors {
            match self.send(vector, now)? {
                IoStatus::Normal(count) => total += count,
                // Mid-vector suspension loses the completed prefix; callers
                // in non-blocking mode submit one APDU per call instead.
                other => return Ok(other),
            }
        }
        Ok(IoStatus::Normal(total))
    }

    /// Zero-copy gathered send over caller-provided reference-counted
    /// buffers. With `is_one_apdu` the buffers coalesce into one APDU;
    /// otherwise each buffer is its own APDU sent without copying.
    pub fn send_skbv(
        &mut self,
        buffers: &[Bytes],
        is_one_apdu: bool,
        now: Instant,
    ) -> Result<IoStatus, PgmError> {
        if is_one_apdu {
            let mut gathered = Vec::with_capacity(buffers.iter().map(|b| b.len()).sum());
            for buffer in buffers {
                gathered.extend_from_slice(buffer);
            }
            return self.send_bytes(Bytes::from(gathered), now);
        }
        let mut total = 0usize;
        for buffer in buffers {
            match self.send_bytes(buffer.clone(), now)? {
                IoStatus::Normal(count) => total += count,
                other => return Ok(other),
            }
        }
        Ok(IoStatus::Normal(total))
    }

    pub fn has_pending_send(&self) -> bool {
        self.send_state.is_some()
    }

    /// Broadcast proactive parity when `sequence` completes a transmission
    /// group.
    fn emit_proactive_parity(&mut self, sequence: Sqn) {
        let Some(fec) = self.config.fec else {
            return;
        };
        if fec.proactive_h == 0 {
            return;
        }
        let shift = self.window.tg_sqn_shift();
        if sequence.pkt_sqn(shift) != (fec.k as u32) - 1 {
            return;
        }
        let tg_sqn = sequence.tg_sqn(shift);
        for request in self.window.proactive_parity(tg_sqn, fec.proactive_h as u32) {
            let mut header = PgmHeader::new(self.config.tsi, self.config.dport, PacketType::Odata);
            header.options |= OPT_PARITY;
            if request.var_pktlen {
                header.options |= OPT_VAR_PKTLEN;
            }
            let packet = PgmPacket {
                header,
                body: PacketBody::Data(DataPacket {
                    sqn: request.sequence,
                    trail: self.window.trail(),
                    options: PacketOptions {
                        fragment: request.fragment,
                        ..Default::default()
                    },
                    tsdu: request.tsdu,
                }),
            };
            self.queue(packet.encode().freeze());
            self.stats.proactive_parity_sent += 1;
        }
    }

    // ─── SPM Schedule ───────────────────────────────────────────────────

    /// Restart the heartbeat ladder after a data send.
    fn reset_heartbeat(&mut self, now: Instant) {
        if self.config.spm_heartbeat_intervals.is_empty() {
            return;
        }
        self.heartbeat_index = 0;
        self.next_heartbeat_spm = Some(now + self.config.spm_heartbeat_intervals[0]);
    }

    /// Next SPM due time (ambient or heartbeat, whichever is earlier).
    pub fn next_spm(&self) -> Instant {
        match self.next_heartbeat_spm {
            Some(heartbeat) if heartbeat < self.next_ambient_spm => heartbeat,
            _ => self.next_ambient_spm,
        }
    }

    /// Emit any due SPMs and advance the schedule.
    pub fn spm_tick(&mut self, now: Instant) {
        if let Some(heartbeat) = self.next_heartbeat_spm {
            if heartbeat <= now {
                self.send_spm(false);
                self.heartbeat_index += 1;
                let intervals = &self.config.spm_heartbeat_intervals;
                let next = intervals.get(self.heartbeat_index).copied();
                self.next_heartbeat_spm = match next {
                    // The ladder ends where it meets the ambient cadence.
                    Some(ivl) if ivl < self.config.spm_ambient_interval => Some(now + ivl),
                    _ => None,
                };
            }
        }
        if self.next_ambient_spm <= now {
            self.send_spm(false);
            self.next_ambient_spm = now + self.config.spm_ambient_interval;
        }
    }

    /// Broadcast the session announce burst (bind time).
    pub fn announce(&mut self) {
        for _ in 0..3 {
            self.send_spm(false);
        }
    }

    /// Broadcast the session end burst (destroy with flush).
    pub fn send_fin(&mut self) {
        for _ in 0..3 {
            self.send_spm(true);
        }
    }

    fn send_spm(&mut self, fin: bool) {
        let mut options = PacketOptions {
            fin,
            ..Default::default()
        };
        if let Some(fec) = &self.config.fec {
            options.parity_prm = Some(OptParityPrm {
                proactive: fec.proactive_h > 0,
                ondemand: fec.use_ondemand,
                tgs: fec.k as u32,
            });
        }
        let packet = PgmPacket {
            header: PgmHeader::new(self.config.tsi, self.config.dport, PacketType::Spm),
            body: PacketBody::Spm(SpmPacket {
                spm_sqn: Sqn::new(self.spm_sqn),
                trail: self.window.trail(),
                lead: self.window.lead(),
                nla: self.config.nla,
                options,
            }),
        };
        self.spm_sqn = self.spm_sqn.wrapping_add(1);
        self.queue(packet.encode().freeze());
        self.stats.spms_sent += 1;
    }

    // ─── Upstream Handling ──────────────────────────────────────────────

    /// Process a NAK addressed to this session: confirm with an NCF, then
    /// queue the requested retransmissions.
    pub fn on_nak(&mut self, header: &PgmHeader, nak: &NakPacket, now: Instant) {
        let is_parity = header.options & OPT_PARITY != 0;
        if nak.src_nla != self.config.nla {
            trace!(nak_src = ?nak.src_nla, "NAK with foreign source NLA ignored");
            self.stats.naks_ignored += 1;
            return;
        }
        if !self.config.group.is_unspecified() && nak.grp_nla != self.config.group {
            trace!(nak_grp = ?nak.grp_nla, "NAK for another group ignored");
            self.stats.naks_ignored += 1;
            return;
        }
        if is_parity && !self.config.fec.map_or(false, |f| f.use_ondemand) {
            self.stats.naks_ignored += 1;
            return;
        }

        // NCF first, echoing the requested sqns.
        let ncf = PgmPacket {
            header: PgmHeader::new(self.config.tsi, self.config.dport, PacketType::Ncf),
            body: PacketBody::Ncf(NakPacket {
                sqn: nak.sqn,
                src_nla: nak.src_nla,
                grp_nla: nak.grp_nla,
                options: PacketOptions {
                    nak_list: nak.options.nak_list.clone(),
                    ..Default::default()
                },
            }),
        };
        self.queue(ncf.encode().freeze());
        self.stats.ncfs_sent += 1;

        let mut queued = 0usize;
        for sqn in nak.sqns() {
            if self.window.retransmit_push(sqn, is_parity) {
                queued += 1;
            }
        }
        if is_parity {
            self.stats.parity_naks_received += 1;
        } else {
            self.stats.naks_received += 1;
        }
        debug!(tsi = %header.tsi(), sqn = %nak.sqn, queued, is_parity, "NAK accepted");

        // RDATA goes out as soon as the rate budget allows.
        self.flush_retransmit(now);
    }

    /// Answer an SPMR with an immediate SPM.
    pub fn on_spmr(&mut self) {
        self.stats.spmrs_received += 1;
        self.send_spm(false);
    }

    pub fn on_nnak(&mut self) {
        self.stats.nnaks_received += 1;
    }

    pub fn on_ack(&mut self) {
        self.stats.acks_received += 1;
    }

    /// Drain the retransmit queue into RDATA packets, stopping when the
    /// rate limiter refuses. Returns `true` when the queue was emptied.
    pub fn flush_retransmit(&mut self, now: Instant) -> bool {
        loop {
            let Some(request) = self.window.retransmit_try_peek() else {
                // A parity request for an incomplete group wedges the queue
                // tail; drop it rather than spin.
                if !self.window.retransmit_is_empty() {
                    self.window.retransmit_drop_tail();
                    continue;
                }
                return true;
            };
            let tpdu_length =
                PGM_HEADER_LEN + PGM_DATA_HEADER_LEN + request.fragment.map_or(0, |_| 20) + request.tsdu.len();
            if let Some(rate) = &mut self.rate {
                if !rate.check(tpdu_length, now) {
                    self.stats.rate_limited += 1;
                    return false;
                }
            }

            let mut header = PgmHeader::new(self.config.tsi, self.config.dport, PacketType::Rdata);
            if request.is_parity {
                header.options |= OPT_PARITY;
                if request.var_pktlen {
                    header.options |= OPT_VAR_PKTLEN;
                }
            }
            let packet = PgmPacket {
                header,
                body: PacketBody::Data(DataPacket {
                    sqn: request.sequence,
                    trail: self.window.trail(),
                    options: PacketOptions {
                        fragment: request.fragment,
                        ..Default::default()
                    },
                    tsdu: request.tsdu.clone(),
                }),
            };
            self.queue(packet.encode().freeze());
            if request.is_parity {
                self.stats.parity_rdata_sent += 1;
            } else {
                self.stats.rdata_sent += 1;
            }
            self.window.retransmit_remove_head();
        }
    }

    /// Time until the rate limiter can cover a full TPDU, for blocking
    /// callers that got `RateLimited`.
    pub fn rate_delay(&self, now: Instant) -> Duration {
        self.rate
            .as_ref()
            .map_or(Duration::ZERO, |r| r.time_until(self.config.max_tpdu, now))
    }

    /// Earliest time the source needs the timer to run.
    pub fn next_expiry(&self, now: Instant) -> Instant {
        let mut next = self.next_spm();
        if !self.window.retransmit_is_empty() {
            // Rate-limited RDATA retries as soon as tokens accrue.
            let wait = self
                .rate
                .as_ref()
                .map_or(Duration::ZERO, |r| r.time_until(self.config.max_tpdu, now));
            next = next.min(now + wait);
        }
        next
    }

    /// Run the source half of a timer tick.
    pub fn tick(&mut self, now: Instant) {
        self.spm_tick(now);
        if !self.window.retransmit_is_empty() {
            self.flush_retransmit(now);
        }
    }

    // ─── Output ─────────────────────────────────────────────────────────

    fn queue(&mut self, packet: Bytes) {
        self.out.push_back(packet);
    }

    /// Wire-ready packets for the multicast group, in emission order.
    pub fn drain_out(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.out.drain(..)
    }

    pub fn pending_out(&self) -> usize {
        self.out.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsi::Gsi;
    use crate::wire::{self, PacketBody};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config() -> SourceConfig {
        SourceConfig {
            tsi: Tsi::new(Gsi::new([1, 2, 3, 4, 5, 6]), 7500),
            dport: 7500,
            nla: Nla(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            txw_sqns: 64,
            txw_max_rte: 0, // no rate limiting unless a test asks
            initial_sqn: Sqn::new(100),
            ..Default::default()
        }
    }

    fn engine() -> SourceEngine {
        SourceEngine::new(test_config(), Instant::now())
    }

    fn decode_all(engine: &mut SourceEngine) -> Vec<PgmPacket> {
        engine
            .drain_out()
            .map(|raw| {
                assert!(wire::verify(&raw), "queued packet must carry a valid checksum");
                PgmPacket::decode(&raw).expect("queued packet must parse")
            })
            .collect()
    }

    // ─── Send Path ──────────────────────────────────────────────────────

    #[test]
    fn send_single_apdu_emits_odata() {
        let mut src = engine();
        let status = src.send(&[0xAB; 500], Instant::now()).unwrap();
        assert_eq!(status, IoStatus::Normal(500));

        let packets = decode_all(&mut src);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.packet_type, PacketType::Odata);
        match &packets[0].body {
            PacketBody::Data(data) => {
                assert_eq!(data.sqn, Sqn::new(100));
                assert_eq!(data.tsdu.len(), 500);
                assert!(data.options.fragment.is_none());
                assert!(data.options.syn, "first ODATA announces the session");
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn send_fragments_large_apdu() {
        let mut src = engine();
        let max = src.max_tsdu(true);
        let apdu_len = max * 2 + 100;
        let status = src.send(&vec![7u8; apdu_len], Instant::now()).unwrap();
        assert_eq!(status, IoStatus::Normal(apdu_len));

        let packets = decode_all(&mut src);
        assert_eq!(packets.len(), 3);
        for (i, pkt) in packets.iter().enumerate() {
            match &pkt.body {
                PacketBody::Data(data) => {
                    let frag = data.options.fragment.expect("fragmented");
                    assert_eq!(frag.first_sqn, Sqn::new(100));
                    assert_eq!(frag.apdu_len as usize, apdu_len);
                    assert_eq!(frag.offset as usize, i * max);
                }
                other => panic!("expected data, got {other:?}"),
            }
        }
    }

    #[test]
    fn send_oversized_apdu_rejected() {
        let mut src = engine();
        let too_big = src.max_apdu() + 1;
        let err = src.send(&vec![0u8; too_big], Instant::now()).unwrap_err();
        assert!(matches!(err, PgmError::MessageTooLarge { .. }));
    }

    #[test]
    fn rate_limited_send_resumes_without_duplicates() {
        let mut config = test_config();
        config.txw_max_rte = 3000; // tokens for ~2 packets of 1480+20
        let now = Instant::now();
        let mut src = SourceEngine::new(config, now);

        let max = src.max_tsdu(true);
        let apdu_len = max * 3; // needs 3 fragments, budget covers 2
        let status = src.send(&vec![1u8; apdu_len], now).unwrap();
        assert_eq!(status, IoStatus::RateLimited);
        assert!(src.has_pending_send());
        let first_batch = decode_all(&mut src);
        assert_eq!(first_batch.len(), 2);

        // Retry a second later: remaining fragment goes out, nothing is
        // re-sent.
        let later = now + Duration::from_secs(1);
        let status = src.send(&vec![1u8; apdu_len], later).unwrap();
        assert_eq!(status, IoStatus::Normal(apdu_len));
        let second_batch = decode_all(&mut src);
        assert_eq!(second_batch.len(), 1);
        match &second_batch[0].body {
            PacketBody::Data(data) => {
                assert_eq!(data.sqn, Sqn::new(102), "resume continues the sqn run");
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn sendv_each_vector_is_an_apdu() {
        let mut src = engine();
        let status = src
            .sendv(&[&[1u8; 10], &[2u8; 20]], false, Instant::now())
            .unwrap();
        assert_eq!(status, IoStatus::Normal(30));
        assert_eq!(decode_all(&mut src).len(), 2);
    }

    #[test]
    fn send_skbv_shares_buffer_storage() {
        let mut src = engine();
        let apdu = Bytes::from(vec![3u8; 200]);
        let status = src.send_skbv(&[apdu.clone()], false, Instant::now()).unwrap();
        assert_eq!(status, IoStatus::Normal(200));
        // The window entry references the caller's buffer, not a copy.
        let stored = &src.window().peek(Sqn::new(100)).unwrap().tsdu;
        assert_eq!(stored.as_ptr(), apdu.as_ptr());
    }

    #[test]
    fn sendv_gathered_is_one_apdu() {
        let mut src = engine();
        let status = src
            .sendv(&[&[1u8; 10], &[2u8; 20]], true, Instant::now())
            .unwrap();
        assert_eq!(status, IoStatus::Normal(30));
        let packets = decode_all(&mut src);
        assert_eq!(packets.len(), 1);
        match &packets[0].body {
            PacketBody::Data(data) => assert_eq!(data.tsdu.len(), 30),
            other => panic!("expected data, got {other:?}"),
        }
    }

    // ─── SPM Schedule ───────────────────────────────────────────────────

    #[test]
    fn announce_sends_three_spms() {
        let mut src = engine();
        src.announce();
        let packets = decode_all(&mut src);
        assert_eq!(packets.len(), 3);
        let sqns: Vec<u32> = packets
            .iter()
            .map(|p| match &p.body {
                PacketBody::Spm(spm) => spm.spm_sqn.value(),
                other => panic!("expected SPM, got {other:?}"),
            })
            .collect();
        assert_eq!(sqns, vec![0, 1, 2], "spm_sqn strictly advances");
    }

    #[test]
    fn data_send_arms_heartbeat() {
        let now = Instant::now();
        let mut src = engine();
        src.send(b"data", now).unwrap();
        src.drain_out().for_each(drop);

        let first_heartbeat = now + Duration::from_millis(100);
        assert_eq!(src.next_spm(), first_heartbeat);

        src.spm_tick(first_heartbeat);
        let packets = decode_all(&mut src);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.packet_type, PacketType::Spm);
    }

    #[test]
    fn heartbeat_ladder_ends_at_ambient() {
        let mut config = test_config();
        config.spm_ambient_interval = Duration::from_secs(5);
        config.spm_heartbeat_intervals =
            vec![Duration::from_millis(100), Duration::from_secs(60)];
        let now = Instant::now();
        let mut src = SourceEngine::new(config, now);

        src.send(b"data", now).unwrap();
        src.spm_tick(now + Duration::from_millis(100));
        src.drain_out().for_each(drop);
        // The 60s step exceeds ambient: ladder disarms, ambient remains.
        assert_eq!(src.next_spm(), now + Duration::from_secs(5));
    }

    #[test]
    fn ambient_spm_carries_window_edges() {
        let now = Instant::now();
        let mut src = engine();
        src.send(b"one", now).unwrap();
        src.send(b"two", now).unwrap();
        src.drain_out().for_each(drop);

        src.spm_tick(now + Duration::from_secs(10));
        let packets = decode_all(&mut src);
        let spm = packets
            .iter()
            .find_map(|p| match &p.body {
                PacketBody::Spm(spm) => Some(spm),
                _ => None,
            })
            .expect("ambient SPM due");
        assert_eq!(spm.trail, Sqn::new(100));
        assert_eq!(spm.lead, Sqn::new(101));
    }

    #[test]
    fn spm_advertises_parity_capability() {
        let mut config = test_config();
        config.fec = Some(FecConfig {
            proactive_h: 0,
            use_ondemand: true,
            use_varpktlen: true,
            n: 6,
            k: 4,
        });
        let mut src = SourceEngine::new(config, Instant::now());
        src.announce();
        let packets = decode_all(&mut src);
        match &packets[0].body {
            PacketBody::Spm(spm) => {
                let prm = spm.options.parity_prm.expect("OPT_PARITY_PRM present");
                assert!(prm.ondemand);
                assert!(!prm.proactive);
                assert_eq!(prm.tgs, 4);
            }
            other => panic!("expected SPM, got {other:?}"),
        }
    }

    #[test]
    fn fin_spms_flag_session_end() {
        let mut src = engine();
        src.send_fin();
        let packets = decode_all(&mut src);
        assert_eq!(packets.len(), 3);
        for pkt in &packets {
            match &pkt.body {
                PacketBody::Spm(spm) => assert!(spm.options.fin),
                other => panic!("expected SPM, got {other:?}"),
            }
        }
    }

    // ─── NAK Handling ───────────────────────────────────────────────────

    fn nak_for(src: &SourceEngine, sqns: &[u32]) -> (PgmHeader, NakPacket) {
        let mut header = PgmHeader::new(src.config.tsi, src.config.tsi.sport, PacketType::Nak);
        header.dport = src.config.tsi.sport;
        let nak = NakPacket {
            sqn: Sqn::new(sqns[0]),
            src_nla: src.config.nla,
            grp_nla: Nla(IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1))),
            options: PacketOptions {
                nak_list: sqns[1..].iter().map(|&s| Sqn::new(s)).collect(),
                ..Default::default()
            },
        };
        (header, nak)
    }

    #[test]
    fn nak_answered_with_ncf_then_rdata() {
        let now = Instant::now();
        let mut src = engine();
        for _ in 0..5 {
            src.send(b"payload", now).unwrap();
        }
        src.drain_out().for_each(drop);

        let (header, nak) = nak_for(&src, &[102]);
        src.on_nak(&header, &nak, now);

        let packets = decode_all(&mut src);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].header.packet_type, PacketType::Ncf);
        assert_eq!(packets[1].header.packet_type, PacketType::Rdata);
        match &packets[1].body {
            PacketBody::Data(data) => assert_eq!(data.sqn, Sqn::new(102)),
            other => panic!("expected RDATA, got {other:?}"),
        }
        assert_eq!(src.stats().naks_received, 1);
        assert_eq!(src.stats().ncfs_sent, 1);
        assert_eq!(src.stats().rdata_sent, 1);
    }

    #[test]
    fn nak_list_retransmits_every_sqn() {
        let now = Instant::now();
        let mut src = engine();
        for _ in 0..8 {
            src.send(b"payload", now).unwrap();
        }
        src.drain_out().for_each(drop);

        let (header, nak) = nak_for(&src, &[101, 103, 105]);
        src.on_nak(&header, &nak, now);

        let packets = decode_all(&mut src);
        let rdata_sqns: Vec<u32> = packets
            .iter()
            .filter(|p| p.header.packet_type == PacketType::Rdata)
            .map(|p| match &p.body {
                PacketBody::Data(data) => data.sqn.value(),
                other => panic!("expected data, got {other:?}"),
            })
            .collect();
        assert_eq!(rdata_sqns, vec![101, 103, 105]);
        // NCF echoes the full list.
        match &packets[0].body {
            PacketBody::Ncf(ncf) => {
                assert_eq!(ncf.sqns().count(), 3);
            }
            other => panic!("expected NCF, got {other:?}"),
        }
    }

    #[test]
    fn nak_with_wrong_source_nla_ignored() {
        let now = Instant::now();
        let mut src = engine();
        src.send(b"payload", now).unwrap();
        src.drain_out().for_each(drop);

        let (header, mut nak) = nak_for(&src, &[100]);
        nak.src_nla = Nla(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)));
        src.on_nak(&header, &nak, now);
        assert_eq!(src.pending_out(), 0);
        assert_eq!(src.stats().naks_ignored, 1);
    }

    #[test]
    fn parity_nak_requires_ondemand_fec() {
        let now = Instant::now();
        let mut src = engine(); // no FEC configured
        src.send(b"payload", now).unwrap();
        src.drain_out().for_each(drop);

        let (mut header, nak) = nak_for(&src, &[100]);
        header.options |= OPT_PARITY;
        src.on_nak(&header, &nak, now);
        assert_eq!(src.pending_out(), 0);
        assert_eq!(src.stats().naks_ignored, 1);
    }

    #[test]
    fn parity_nak_emits_parity_rdata() {
        let now = Instant::now();
        let mut config = test_config();
        config.fec = Some(FecConfig {
            proactive_h: 0,
            use_ondemand: true,
            use_varpktlen: true,
            n: 6,
            k: 4,
        });
        let mut src = SourceEngine::new(config, now);
        for _ in 0..4 {
            src.send(&[9u8; 64], now).unwrap();
        }
        src.drain_out().for_each(drop);

        // Two parity packets for the group at 100.
        let (mut header, nak) = nak_for(&src, &[100 + 2]);
        header.options |= OPT_PARITY;
        src.on_nak(&header, &nak, now);

        let packets = decode_all(&mut src);
        let parity: Vec<_> = packets
            .iter()
            .filter(|p| {
                p.header.packet_type == PacketType::Rdata && p.header.options & OPT_PARITY != 0
            })
            .collect();
        assert_eq!(parity.len(), 2);
        assert_eq!(src.stats().parity_rdata_sent, 2);
        assert_eq!(src.stats().parity_naks_received, 1);
    }

    #[test]
    fn proactive_parity_follows_group_completion() {
        let now = Instant::now();
        let mut config = test_config();
        config.fec = Some(FecConfig {
            proactive_h: 2,
            use_ondemand: false,
            use_varpktlen: false,
            n: 6,
            k: 4,
        });
        let mut src = SourceEngine::new(config, now);
        for _ in 0..3 {
            src.send(&[7u8; 48], now).unwrap();
        }
        assert_eq!(src.pending_out(), 3, "no parity until the group closes");

        src.send(&[7u8; 48], now).unwrap();
        let packets = decode_all(&mut src);
        let parity: Vec<_> = packets
            .iter()
            .filter(|p| p.header.options & OPT_PARITY != 0)
            .collect();
        assert_eq!(parity.len(), 2);
        assert!(parity
            .iter()
            .all(|p| p.header.packet_type == PacketType::Odata));
        assert_eq!(src.stats().proactive_parity_sent, 2);

        // On-demand parity for the same group continues at the next index.
        let (mut header, nak) = nak_for(&src, &[101]);
        header.options |= OPT_PARITY;
        // Enable ondemand handling for this check.
        src.config.fec = Some(FecConfig {
            proactive_h: 2,
            use_ondemand: true,
            use_varpktlen: false,
            n: 6,
            k: 4,
        });
        src.on_nak(&header, &nak, now);
        let follow_up = decode_all(&mut src);
        let rdata = follow_up
            .iter()
            .find(|p| p.header.packet_type == PacketType::Rdata)
            .expect("on-demand parity RDATA");
        match &rdata.body {
            PacketBody::Data(data) => {
                // h advanced past the two proactive blocks: index 0 again
                // after wrapping n-k=2.
                assert_eq!(data.sqn.pkt_sqn(2), 0);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn rate_limited_rdata_defers_to_timer() {
        let now = Instant::now();
        let mut config = test_config();
        config.txw_max_rte = 1600; // one packet of budget
        let mut src = SourceEngine::new(config, now);
        src.send(&[0u8; 600], now).unwrap(); // drains most of the bucket
        src.send(&[0u8; 600], now).unwrap();
        src.drain_out().for_each(drop);

        let (header, nak) = nak_for(&src, &[100, 101]);
        src.on_nak(&header, &nak, now);
        let sent_now = decode_all(&mut src);
        assert!(
            sent_now.len() < 3,
            "rate budget cannot cover NCF + both RDATA immediately"
        );
        assert!(!src.window().retransmit_is_empty());

        // Timer retries once tokens accrue.
        let later = now + Duration::from_secs(1);
        assert!(src.next_expiry(now) <= later);
        src.tick(later);
        let deferred = decode_all(&mut src);
        assert!(deferred
            .iter()
            .any(|p| p.header.packet_type == PacketType::Rdata));
    }
}
