//! # Receiver Engine
//!
//! The receiving half of a session: one peer record per remote sender, each
//! owning a receive window behind its own lock. The engine ingests SPM,
//! ODATA/RDATA, NCF and fellow-receiver NAKs, schedules NAK emission across
//! the back-off ladder, requests SPMs from newly seen sources, and expires
//! idle peers.
//!
//! Control packets to emit (NAKs upstream, SPMRs to the group) are queued
//! with their destination and drained by the transport's socket seam.

use bytes::Bytes;
use quanta::Instant;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::rxw::{AddStatus, Apdu, ReceiveWindow, SlotState};
use crate::skb::RxBuffer;
use crate::sqn::{Sqn, SqnList};
use crate::stats::PeerStats;
use crate::tsi::Tsi;
use crate::wire::{
    DataPacket, NakPacket, Nla, PacketBody, PacketOptions, PacketType, PgmHeader, PgmPacket,
    SpmPacket, OPT_PARITY, OPT_VAR_PKTLEN,
};

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Our own session identity, to drop looped-back downstream traffic.
    pub tsi: Tsi,
    pub dport: u16,
    pub max_tpdu: usize,
    pub rxw_sqns: u32,
    pub rxw_secs: u32,
    pub rxw_max_rte: u64,
    pub peer_expiry: Duration,
    pub spmr_expiry: Duration,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_ncf_retries: u32,
    pub nak_data_retries: u32,
    /// The multicast group we joined; NAKs advertise it back upstream.
    pub group: Nla,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            tsi: Tsi::default(),
            dport: 7500,
            max_tpdu: 1500,
            rxw_sqns: 0,
            rxw_secs: 30,
            rxw_max_rte: 400_000,
            peer_expiry: Duration::from_millis(5 * 8192),
            spmr_expiry: Duration::from_millis(250),
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_secs(2),
            nak_rdata_ivl: Duration::from_secs(2),
            nak_ncf_retries: 5,
            nak_data_retries: 2,
            group: Nla::UNSPECIFIED,
        }
    }
}

// ─── Peer ───────────────────────────────────────────────────────────────────

/// One remote sender and its receive state.
pub struct Peer {
    pub tsi: Tsi,
    pub window: ReceiveWindow,
    /// Source path NLA, learned from the first SPM.
    pub nla: Option<Nla>,
    pub group_nla: Nla,
    /// Highest SPM sqn accepted.
    spm_sqn: Option<Sqn>,
    pub expiry: Instant,
    /// Armed while an SPMR is pending for this source.
    pub spmr_expiry: Option<Instant>,
    pub has_proactive_parity: bool,
    pub has_ondemand_parity: bool,
    pub rs_n: u8,
    pub rs_k: u8,
    /// Session-end signalled by OPT_FIN; torn down once drained.
    pub fin_received: bool,
    rng: StdRng,
    pub stats: PeerStats,
    /// Loss count already surfaced to the reader as a Reset.
    pub last_cumulative_losses: u32,
}

impl Peer {
    fn new(tsi: Tsi, config: &ReceiverConfig, now: Instant) -> Self {
        let capacity = crate::txw::window_capacity(
            config.rxw_sqns,
            config.rxw_secs,
            config.rxw_max_rte,
            config.max_tpdu,
        );
        // Seed per-peer jitter from the peer identity so runs are
        // reproducible under test while peers stay decorrelated.
        let seed = tsi
            .gsi
            .as_bytes()
            .iter()
            .fold(u64::from(tsi.sport), |acc, &b| (acc << 8) | u64::from(b));
        Peer {
            tsi,
            window: ReceiveWindow::new(capacity, config.max_tpdu),
            nla: None,
            group_nla: config.group,
            spm_sqn: None,
            expiry: now + config.peer_expiry,
            spmr_expiry: Some(now + config.spmr_expiry),
            has_proactive_parity: false,
            has_ondemand_parity: false,
            rs_n: 0,
            rs_k: 0,
            fin_received: false,
            rng: StdRng::seed_from_u64(seed),
            stats: PeerStats::new(),
            last_cumulative_losses: 0,
        }
    }

    /// Freshly randomized back-off deadline, drawn per BackOff entry.
    fn draw_backoff(&mut self, now: Instant, bo_ivl: Duration) -> Instant {
        let ceiling = bo_ivl.as_micros().max(1) as u64;
        now + Duration::from_micros(self.rng.random_range(1..=ceiling))
    }

    fn touch(&mut self, now: Instant, peer_expiry: Duration) {
        self.expiry = now + peer_expiry;
    }
}

// ─── Outbound Control ───────────────────────────────────────────────────────

/// A control packet the receiver wants sent.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Unicast to the source path address (NAKs).
    Unicast { to: Nla, data: Bytes },
    /// Multicast to the group (SPMRs, so fellow receivers can suppress).
    Multicast { data: Bytes },
}

// ─── Engine ─────────────────────────────────────────────────────────────────

pub struct ReceiverEngine {
    config: ReceiverConfig,
    peers: RwLock<HashMap<Tsi, Arc<Mutex<Peer>>>>,
    out: Mutex<VecDeque<Outbound>>,
    /// Peers with deliverable data, in arrival order.
    pending: Mutex<VecDeque<Tsi>>,
}

impl ReceiverEngine {
    pub fn new(config: ReceiverConfig) -> Self {
        ReceiverEngine {
            config,
            peers: RwLock::new(HashMap::new()),
            out: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peers lock").len()
    }

    pub fn with_peer<R>(&self, tsi: Tsi, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        let peer = self.peers.read().expect("peers lock").get(&tsi).cloned()?;
        let mut peer = peer.lock().expect("peer lock");
        Some(f(&mut peer))
    }

    /// Find or create the peer for a downstream packet's TSI.
    fn peer_for(&self, tsi: Tsi, now: Instant) -> Arc<Mutex<Peer>> {
        if let Some(peer) = self.peers.read().expect("peers lock").get(&tsi) {
            return peer.clone();
        }
        let mut table = self.peers.write().expect("peers lock");
        table
            .entry(tsi)
            .or_insert_with(|| {
                debug!(%tsi, "new peer");
                Arc::new(Mutex::new(Peer::new(tsi, &self.config, now)))
            })
            .clone()
    }

    fn mark_pending(&self, tsi: Tsi) {
        let mut pending = self.pending.lock().expect("pending lock");
        if !pending.contains(&tsi) {
            pending.push_back(tsi);
        }
    }

    // ─── Ingestion ──────────────────────────────────────────────────────

    /// Process an SPM. Returns `false` when discarded.
    pub fn on_spm(&self, header: &PgmHeader, spm: &SpmPacket, now: Instant) -> bool {
        let tsi = header.tsi();
        if tsi == self.config.tsi {
            return false; // our own loopback
        }
        let peer = self.peer_for(tsi, now);
        let mut peer = peer.lock().expect("peer lock");

        let advancing = match peer.spm_sqn {
            Some(last) => spm.spm_sqn.after(last),
            None => true,
        };
        if !advancing {
            peer.stats.spms_discarded += 1;
            return false;
        }

        peer.spm_sqn = Some(spm.spm_sqn);
        peer.nla = Some(spm.nla);
        peer.spmr_expiry = None;
        peer.stats.spms_received += 1;
        peer.touch(now, self.config.peer_expiry);

        if let Some(prm) = spm.options.parity_prm {
            if (2..=128).contains(&prm.tgs) && (prm.tgs as u8).is_power_of_two() {
                let k = prm.tgs as u8;
                peer.has_proactive_parity = prm.proactive;
                peer.has_ondemand_parity = prm.ondemand;
                // n is not advertised; the whole field is usable for parity
                // indices.
                let n = 255u8;
                if peer.rs_k != k {
                    peer.rs_n = n;
                    peer.rs_k = k;
                    peer.window.set_fec(n, k);
                }
            }
        }
        if spm.options.fin {
            peer.fin_received = true;
            // Session end: tear the peer down as soon as the reader drains.
            peer.expiry = now;
        }

        let rb_expiry = peer.draw_backoff(now, self.config.nak_bo_ivl);
        let new_naks = peer.window.update(spm.lead, spm.trail, now, rb_expiry);
        if new_naks > 0 {
            trace!(%tsi, new_naks, "SPM implied missing data");
        }
        if peer.window.has_deliverable() {
            drop(peer);
            self.mark_pending(tsi);
        }
        true
    }

    /// Process ODATA or RDATA. Returns the window status.
    pub fn on_data(&self, header: &PgmHeader, data: &DataPacket, now: Instant) -> AddStatus {
        let tsi = header.tsi();
        if tsi == self.config.tsi {
            return AddStatus::Duplicate; // our own loopback
        }
        let peer = self.peer_for(tsi, now);
        let mut peer = peer.lock().expect("peer lock");
        peer.stats.data_packets_received += 1;
        peer.stats.data_bytes_received += data.tsdu.len() as u64;
        peer.touch(now, self.config.peer_expiry);

        peer.window.advance_trail(data.trail, now);

        let is_parity = header.options & OPT_PARITY != 0;
        if is_parity {
            let var_pktlen = header.options & OPT_VAR_PKTLEN != 0;
            let buffer = RxBuffer::new(tsi, data.sqn, data.tsdu.clone(), now)
                .with_fragment(data.options.fragment)
                .as_repair();
            let recovered = peer.window.add_parity(buffer, var_pktlen, now);
            if !recovered.is_empty() {
                peer.stats.parity_recoveries += recovered.len() as u64;
                debug!(%tsi, count = recovered.len(), "parity reconstruction");
            }
            if peer.window.has_deliverable() {
                drop(peer);
                self.mark_pending(tsi);
            }
            return AddStatus::Inserted;
        }

        let is_rdata = header.packet_type == PacketType::Rdata;
        let buffer = {
            let mut buffer = RxBuffer::new(tsi, data.sqn, data.tsdu.clone(), now)
                .with_fragment(data.options.fragment);
            if is_rdata {
                buffer = buffer.as_repair();
            }
            buffer
        };
        let rb_expiry = peer.draw_backoff(now, self.config.nak_bo_ivl);
        let status = peer.window.add(buffer, now, rb_expiry);
        match status {
            AddStatus::Duplicate => peer.stats.duplicates += 1,
            AddStatus::Bounds | AddStatus::Malformed => peer.stats.packets_discarded += 1,
            _ => {}
        }
        peer.stats.losses = peer.window.cumulative_losses as u64;

        let deliverable = peer.window.has_deliverable();
        let reset = peer.window.cumulative_losses > peer.last_cumulative_losses;
        drop(peer);
        if deliverable || reset {
            self.mark_pending(tsi);
        }
        status
    }

    /// Process an NCF from the source.
    pub fn on_ncf(&self, header: &PgmHeader, ncf: &NakPacket, now: Instant) {
        let tsi = header.tsi();
        let Some(peer) = self.peers.read().expect("peers lock").get(&tsi).cloned() else {
            return; // NCF for a session we have no state for
        };
        let mut peer = peer.lock().expect("peer lock");
        peer.stats.ncfs_received += 1;
        peer.touch(now, self.config.peer_expiry);
        let rdata_expiry = now + self.config.nak_rdata_ivl;
        let rb_expiry = peer.draw_backoff(now, self.config.nak_bo_ivl);
        for sqn in ncf.sqns() {
            peer.window.confirm(sqn, now, rdata_expiry, rb_expiry);
        }
    }

    /// Process a fellow receiver's multicast NAK: suppress our own pending
    /// NAKs for the same sqns, as if confirmed.
    pub fn on_peer_nak(&self, session: Tsi, nak: &NakPacket, now: Instant) {
        let Some(peer) = self.peers.read().expect("peers lock").get(&session).cloned() else {
            return;
        };
        let mut peer = peer.lock().expect("peer lock");
        let rdata_expiry = now + self.config.nak_rdata_ivl;
        let rb_expiry = peer.draw_backoff(now, self.config.nak_bo_ivl);
        for sqn in nak.sqns() {
            if matches!(
                peer.window.state_of(sqn),
                Some(SlotState::BackOff) | Some(SlotState::WaitNcf)
            ) {
                peer.window.confirm(sqn, now, rdata_expiry, rb_expiry);
                peer.stats.selective_naks_suppressed += 1;
            }
        }
    }

    /// A fellow receiver's SPMR cancels our own pending request.
    pub fn on_peer_spmr(&self, session: Tsi) {
        let Some(peer) = self.peers.read().expect("peers lock").get(&session).cloned() else {
            return;
        };
        peer.lock().expect("peer lock").spmr_expiry = None;
    }

    // ─── NAK Scheduling ─────────────────────────────────────────────────

    /// Walk the back-off queue: expired entries either go Lost (no source
    /// path yet) or move to WaitNcf with a NAK queued upstream.
    /// Parity-capable peers get one parity NAK per completed transmission
    /// group instead.
    fn nak_rb_state(&self, peer: &mut Peer, now: Instant) {
        let Some(nla) = peer.nla else {
            // No source path: nothing to NAK at. Expired entries are dead.
            while let Some(sqn) = peer.window.expired_tail(SlotState::BackOff, now) {
                warn!(tsi = %peer.tsi, %sqn, "no NAK path, slot lost");
                peer.window.mark_lost(sqn, now);
            }
            peer.stats.losses = peer.window.cumulative_losses as u64;
            return;
        };

        let rpt_expiry = now + self.config.nak_rpt_ivl;
        let use_parity = peer.has_ondemand_parity && peer.window.has_ondemand_parity();
        let shift = peer.window.tg_sqn_shift();
        let current_tg = peer.window.lead().tg_sqn(shift);
        let mut list = SqnList::new();
        let mut parity_tgs: Vec<Sqn> = Vec::new();

        while let Some(sqn) = peer.window.expired_tail(SlotState::BackOff, now) {
            let in_closed_tg = use_parity && sqn.tg_sqn(shift) != current_tg;
            if in_closed_tg {
                let tg = sqn.tg_sqn(shift);
                if !parity_tgs.contains(&tg) {
                    parity_tgs.push(tg);
                }
                peer.window.nak_sent(sqn, rpt_expiry);
                continue;
            }

            peer.window.nak_sent(sqn, rpt_expiry);
            peer.stats.naks_sent += 1;
            if !list.push(sqn) {
                self.queue_nak(peer, nla, &list, false);
                list.clear();
                list.push(sqn);
            }
        }

        if !list.is_empty() {
            self.queue_nak(peer, nla, &list, false);
        }
        for tg in parity_tgs {
            // The packet count travels in the sqn's low bits, so it is
            // capped at k - 1.
            let cap = (1u32 << shift) - 1;
            let missing = peer.window.missing_in_tg(tg).clamp(1, cap);
            let mut parity_list = SqnList::new();
            parity_list.push(tg + missing);
            self.queue_nak(peer, nla, &parity_list, true);
            peer.stats.parity_naks_sent += 1;
        }
    }

    /// Walk the wait-NCF queue: expired entries retry through BackOff until
    /// the NCF retry budget is spent.
    fn nak_rpt_state(&self, peer: &mut Peer, now: Instant) {
        while let Some(sqn) = peer.window.expired_tail(SlotState::WaitNcf, now) {
            let rb_expiry = peer.draw_backoff(now, self.config.nak_bo_ivl);
            let retries = peer.window.retry_ncf(sqn, rb_expiry);
            if retries >= self.config.nak_ncf_retries {
                debug!(tsi = %peer.tsi, %sqn, retries, "NCF retries exhausted");
                peer.window.mark_lost(sqn, now);
            }
        }
        peer.stats.losses = peer.window.cumulative_losses as u64;
    }

    /// Walk the wait-data queue: expired entries retry through BackOff until
    /// the RDATA retry budget is spent.
    fn nak_rdata_state(&self, peer: &mut Peer, now: Instant) {
        while let Some(sqn) = peer.window.expired_tail(SlotState::WaitData, now) {
            let rb_expiry = peer.draw_backoff(now, self.config.nak_bo_ivl);
            let retries = peer.window.retry_data(sqn, rb_expiry);
            if retries >= self.config.nak_data_retries {
                debug!(tsi = %peer.tsi, %sqn, retries, "RDATA retries exhausted");
                peer.window.mark_lost(sqn, now);
            }
        }
        peer.stats.losses = peer.window.cumulative_losses as u64;
    }

    fn queue_nak(&self, peer: &Peer, nla: Nla, list: &SqnList, is_parity: bool) {
        let mut header = PgmHeader::new(
            Tsi::new(peer.tsi.gsi, self.config.dport),
            peer.tsi.sport,
            PacketType::Nak,
        );
        if is_parity {
            header.options |= OPT_PARITY;
        }
        let nak = PgmPacket {
            header,
            body: PacketBody::Nak(NakPacket {
                sqn: list.lead(),
                src_nla: nla,
                grp_nla: peer.group_nla,
                options: PacketOptions {
                    nak_list: list.tail().to_vec(),
                    ..Default::default()
                },
            }),
        };
        self.out.lock().expect("out lock").push_back(Outbound::Unicast {
            to: nla,
            data: nak.encode().freeze(),
        });
    }

    fn queue_spmr(&self, tsi: Tsi) {
        let header = PgmHeader::new(
            Tsi::new(tsi.gsi, self.config.dport),
            tsi.sport,
            PacketType::Spmr,
        );
        let spmr = PgmPacket {
            header,
            body: PacketBody::Spmr,
        };
        self.out
            .lock()
            .expect("out lock")
            .push_back(Outbound::Multicast {
                data: spmr.encode().freeze(),
            });
    }

    // ─── Timer ──────────────────────────────────────────────────────────

    /// Run all peer state checks: SPMR emission, the NAK ladder, expiry.
    pub fn tick(&self, now: Instant) {
        let peers: Vec<(Tsi, Arc<Mutex<Peer>>)> = self
            .peers
            .read()
            .expect("peers lock")
            .iter()
            .map(|(tsi, peer)| (*tsi, peer.clone()))
            .collect();

        let mut expired: Vec<Tsi> = Vec::new();
        for (tsi, peer) in peers {
            let mut peer = peer.lock().expect("peer lock");

            if let Some(spmr) = peer.spmr_expiry {
                if spmr <= now {
                    peer.spmr_expiry = None;
                    self.queue_spmr(tsi);
                }
            }

            self.nak_rb_state(&mut peer, now);
            self.nak_rpt_state(&mut peer, now);
            self.nak_rdata_state(&mut peer, now);

            if peer.window.has_deliverable()
                || peer.window.cumulative_losses > peer.last_cumulative_losses
            {
                drop(peer);
                self.mark_pending(tsi);
                continue;
            }

            if now >= peer.expiry {
                if peer.window.committed_count() == 0 {
                    expired.push(tsi);
                } else {
                    // Undelivered data holds the peer open.
                    peer.expiry = now + self.config.peer_expiry;
                }
            }
        }

        if !expired.is_empty() {
            let mut table = self.peers.write().expect("peers lock");
            for tsi in expired {
                debug!(%tsi, "peer expired");
                table.remove(&tsi);
            }
        }
    }

    /// Earliest deadline across all peers.
    pub fn next_expiry(&self) -> Option<Instant> {
        let peers = self.peers.read().expect("peers lock");
        peers
            .values()
            .filter_map(|peer| {
                let peer = peer.lock().expect("peer lock");
                [
                    peer.spmr_expiry,
                    peer.window.next_nak_expiry(),
                    Some(peer.expiry),
                ]
                .into_iter()
                .flatten()
                .min()
            })
            .min()
    }

    // ─── Delivery ───────────────────────────────────────────────────────

    /// Pull the next delivery event in arrival order.
    pub fn read(&self, max_apdus: usize) -> ReadOutcome {
        loop {
            let tsi = {
                let mut pending = self.pending.lock().expect("pending lock");
                match pending.pop_front() {
                    Some(tsi) => tsi,
                    None => return ReadOutcome::Empty,
                }
            };
            let Some(peer) = self.peers.read().expect("peers lock").get(&tsi).cloned() else {
                continue;
            };
            let mut peer = peer.lock().expect("peer lock");

            // Loss episodes surface exactly once, before any further data.
            let losses = peer.window.cumulative_losses;
            if losses > peer.last_cumulative_losses {
                peer.last_cumulative_losses = losses;
                if peer.window.has_deliverable() {
                    drop(peer);
                    self.mark_pending(tsi);
                }
                return ReadOutcome::Reset(tsi);
            }

            let apdus = peer.window.read(max_apdus);
            if apdus.is_empty() {
                continue;
            }
            peer.stats.apdus_delivered += apdus.len() as u64;
            peer.stats.bytes_delivered += apdus.iter().map(|a| a.len as u64).sum::<u64>();
            if peer.window.has_deliverable() {
                drop(peer);
                self.mark_pending(tsi);
            }
            return ReadOutcome::Data { tsi, apdus };
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().expect("pending lock").is_empty()
    }

    /// Drain queued control packets.
    pub fn drain_out(&self) -> Vec<Outbound> {
        self.out.lock().expect("out lock").drain(..).collect()
    }

    pub fn pending_out(&self) -> usize {
        self.out.lock().expect("out lock").len()
    }
}

/// Result of a delivery poll.
#[derive(Debug)]
pub enum ReadOutcome {
    Data { tsi: Tsi, apdus: Vec<Apdu> },
    /// Unrecoverable loss on this peer, reported once per episode.
    Reset(Tsi),
    Empty,
}
