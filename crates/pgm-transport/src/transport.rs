//! # Transport
//!
//! One object per session, tying the source and receiver engines, the
//! unified timer, and the socket seam together. Socket I/O stays outside:
//! the host feeds inbound datagrams to [`Transport::handle_packet`] and
//! supplies a [`PacketSink`] for outbound ones.
//!
//! Three roles may drive a transport concurrently — a producer calling
//! `send`, a consumer calling `recv`, and a timer driver calling `tick`.
//! The source engine sits behind one mutex, each peer behind its own, and
//! the shared wake-up is a condvar in [`TimerCore`].

use bytes::Bytes;
use quanta::Instant;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{trace, warn};

use crate::error::{IoStatus, PgmError};
use crate::receiver::{Outbound, ReadOutcome, ReceiverConfig, ReceiverEngine};
use crate::rxw::Apdu;
use crate::source::{FecConfig, SourceConfig, SourceEngine};
use crate::sqn::Sqn;
use crate::timer::{self, TimerCore, WaitOutcome};
use crate::tsi::{Gsi, Tsi};
use crate::stats::SourceStats;
use crate::wire::{self, Nla, PacketBody, PacketType, PgmPacket};

/// Longest uninterrupted timer sleep; bounds staleness when no deadline is
/// armed.
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(30);

// ─── Socket Seam ────────────────────────────────────────────────────────────

/// Outbound packet delivery, provided by the host's socket layer.
pub trait PacketSink: Send + Sync {
    /// Multicast to the send group (SPM, ODATA, RDATA, NCF, SPMR).
    fn send_to_group(&self, data: &[u8]) -> std::io::Result<()>;
    /// Unicast to a source path address (NAK).
    fn send_unicast(&self, to: &Nla, data: &[u8]) -> std::io::Result<()>;
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Session configuration; every field freezes at bind.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tsi: Tsi,
    pub dport: u16,
    pub recv_groups: Vec<Nla>,
    pub send_group: Nla,
    /// Source path address advertised in SPMs.
    pub nla: Nla,
    pub max_tpdu: usize,
    pub iphdr_len: usize,
    pub multicast_hops: u8,
    pub multicast_loop: bool,
    pub send_only: bool,
    pub recv_only: bool,
    pub abort_on_reset: bool,
    pub txw_sqns: u32,
    pub txw_secs: u32,
    pub txw_max_rte: u64,
    pub rxw_sqns: u32,
    pub rxw_secs: u32,
    pub rxw_max_rte: u64,
    pub peer_expiry: Duration,
    pub spmr_expiry: Duration,
    pub spm_ambient_interval: Duration,
    pub spm_heartbeat_intervals: Vec<Duration>,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_ncf_retries: u32,
    pub nak_data_retries: u32,
    pub fec: Option<FecConfig>,
    pub initial_sqn: Sqn,
}

// ─── Transport ──────────────────────────────────────────────────────────────

pub struct Transport {
    config: Mutex<TransportConfig>,
    bound: AtomicBool,
    destroyed: AtomicBool,
    source: Mutex<Option<SourceEngine>>,
    receiver: Mutex<Option<Arc<ReceiverEngine>>>,
    sink: Mutex<Option<Arc<dyn PacketSink>>>,
    pub(crate) timer: TimerCore,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    // Parse-layer counters (no session to attribute them to).
    pub cksum_errors: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub packets_discarded: AtomicU64,
}

/// File-descriptor-free poll information for a caller-owned reactor: the
/// host watches its own sockets and additionally honors `next_expiry`.
#[derive(Debug, Clone, Copy)]
pub struct PollInfo {
    pub next_expiry: Instant,
    /// Deliverable data is already waiting.
    pub readable: bool,
}

impl Transport {
    /// Create an unbound transport for one session.
    pub fn create(
        gsi: Gsi,
        sport: u16,
        dport: u16,
        recv_groups: Vec<Nla>,
        send_group: Nla,
    ) -> Self {
        let config = TransportConfig {
            tsi: Tsi::new(gsi, sport),
            dport,
            recv_groups,
            send_group,
            nla: Nla::UNSPECIFIED,
            max_tpdu: 1500,
            iphdr_len: 20,
            multicast_hops: 16,
            multicast_loop: false,
            send_only: false,
            recv_only: false,
            abort_on_reset: false,
            txw_sqns: 0,
            txw_secs: 30,
            txw_max_rte: 400_000,
            rxw_sqns: 0,
            rxw_secs: 30,
            rxw_max_rte: 400_000,
            peer_expiry: Duration::from_millis(5 * 8192),
            spmr_expiry: Duration::from_millis(250),
            spm_ambient_interval: Duration::from_millis(8192),
            spm_heartbeat_intervals: SourceConfig::default().spm_heartbeat_intervals,
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_secs(2),
            nak_rdata_ivl: Duration::from_secs(2),
            nak_ncf_retries: 5,
            nak_data_retries: 2,
            fec: None,
            initial_sqn: Sqn::new(0),
        };
        Transport {
            config: Mutex::new(config),
            bound: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            source: Mutex::new(None),
            receiver: Mutex::new(None),
            sink: Mutex::new(None),
            timer: TimerCore::new(),
            timer_thread: Mutex::new(None),
            cksum_errors: AtomicU64::new(0),
            malformed_packets: AtomicU64::new(0),
            packets_discarded: AtomicU64::new(0),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> TransportConfig {
        self.config.lock().expect("config lock").clone()
    }

    /// Snapshot of the source-side counters; `None` before bind or on a
    /// receive-only transport.
    pub fn source_stats(&self) -> Option<SourceStats> {
        self.source
            .lock()
            .expect("source lock")
            .as_ref()
            .map(|s| s.stats().clone())
    }

    // ─── Pre-bind Configuration ─────────────────────────────────────────

    fn configure(
        &self,
        f: impl FnOnce(&mut TransportConfig) -> Result<(), PgmError>,
    ) -> Result<(), PgmError> {
        if self.is_bound() {
            return Err(PgmError::AlreadyBound);
        }
        let mut config = self.config.lock().expect("config lock");
        f(&mut config)
    }

    pub fn set_max_tpdu(&self, max_tpdu: usize) -> Result<(), PgmError> {
        self.configure(|c| {
            if max_tpdu < c.iphdr_len + wire::PGM_HEADER_LEN + wire::PGM_DATA_HEADER_LEN + 20
                || max_tpdu > u16::MAX as usize
            {
                return Err(PgmError::InvalidConfig("max_tpdu out of range"));
            }
            c.max_tpdu = max_tpdu;
            Ok(())
        })
    }

    pub fn set_multicast_hops(&self, hops: u8) -> Result<(), PgmError> {
        self.configure(|c| {
            if hops == 0 {
                return Err(PgmError::InvalidConfig("hop count cannot be zero"));
            }
            c.multicast_hops = hops;
            Ok(())
        })
    }

    pub fn set_multicast_loop(&self, enable: bool) -> Result<(), PgmError> {
        self.configure(|c| {
            c.multicast_loop = enable;
            Ok(())
        })
    }

    pub fn set_send_only(&self, enable: bool) -> Result<(), PgmError> {
        self.configure(|c| {
            if enable && c.recv_only {
                return Err(PgmError::InvalidConfig("already recv-only"));
            }
            c.send_only = enable;
            Ok(())
        })
    }

    pub fn set_recv_only(&self, enable: bool) -> Result<(), PgmError> {
        self.configure(|c| {
            if enable && c.send_only {
                return Err(PgmError::InvalidConfig("already send-only"));
            }
            c.recv_only = enable;
            Ok(())
        })
    }

    pub fn set_abort_on_reset(&self, enable: bool) -> Result<(), PgmError> {
        self.configure(|c| {
            c.abort_on_reset = enable;
            Ok(())
        })
    }

    pub fn set_nla(&self, nla: Nla) -> Result<(), PgmError> {
        self.configure(|c| {
            c.nla = nla;
            Ok(())
        })
    }

    pub fn set_txw_sqns(&self, sqns: u32) -> Result<(), PgmError> {
        self.configure(|c| {
            if sqns == 0 || sqns > i32::MAX as u32 {
                return Err(PgmError::InvalidConfig("txw_sqns out of range"));
            }
            c.txw_sqns = sqns;
            Ok(())
        })
    }

    pub fn set_txw_secs(&self, secs: u32) -> Result<(), PgmError> {
        self.configure(|c| {
            if secs == 0 {
                return Err(PgmError::InvalidConfig("txw_secs cannot be zero"));
            }
            c.txw_secs = secs;
            Ok(())
        })
    }

    pub fn set_txw_max_rte(&self, max_rte: u64) -> Result<(), PgmError> {
        self.configure(|c| {
            if max_rte == 0 {
                return Err(PgmError::InvalidConfig("txw_max_rte cannot be zero"));
            }
            c.txw_max_rte = max_rte;
            Ok(())
        })
    }

    pub fn set_rxw_sqns(&self, sqns: u32) -> Result<(), PgmError> {
        self.configure(|c| {
            if sqns == 0 || sqns > i32::MAX as u32 {
                return Err(PgmError::InvalidConfig("rxw_sqns out of range"));
            }
            c.rxw_sqns = sqns;
            Ok(())
        })
    }

    pub fn set_rxw_secs(&self, secs: u32) -> Result<(), PgmError> {
        self.configure(|c| {
            if secs == 0 {
                return Err(PgmError::InvalidConfig("rxw_secs cannot be zero"));
            }
            c.rxw_secs = secs;
            Ok(())
        })
    }

    pub fn set_rxw_max_rte(&self, max_rte: u64) -> Result<(), PgmError> {
        self.configure(|c| {
            if max_rte == 0 {
                return Err(PgmError::InvalidConfig("rxw_max_rte cannot be zero"));
            }
            c.rxw_max_rte = max_rte;
            Ok(())
        })
    }

    pub fn set_peer_expiry(&self, expiry: Duration) -> Result<(), PgmError> {
        self.configure(|c| {
            if expiry < 2 * c.spm_ambient_interval {
                return Err(PgmError::InvalidConfig(
                    "peer_expiry below twice the ambient SPM interval",
                ));
            }
            c.peer_expiry = expiry;
            Ok(())
        })
    }

    pub fn set_spmr_expiry(&self, expiry: Duration) -> Result<(), PgmError> {
        self.configure(|c| {
            if expiry.is_zero() || expiry >= c.spm_ambient_interval {
                return Err(PgmError::InvalidConfig(
                    "spmr_expiry must fall below the ambient SPM interval",
                ));
            }
            c.spmr_expiry = expiry;
            Ok(())
        })
    }

    pub fn set_spm_ambient_interval(&self, interval: Duration) -> Result<(), PgmError> {
        self.configure(|c| {
            if interval.is_zero() {
                return Err(PgmError::InvalidConfig("ambient interval cannot be zero"));
            }
            c.spm_ambient_interval = interval;
            Ok(())
        })
    }

    pub fn set_spm_heartbeat_intervals(&self, intervals: Vec<Duration>) -> Result<(), PgmError> {
        self.configure(|c| {
            c.spm_heartbeat_intervals = intervals;
            Ok(())
        })
    }

    pub fn set_nak_bo_ivl(&self, interval: Duration) -> Result<(), PgmError> {
        self.configure(|c| {
            if interval.is_zero() {
                return Err(PgmError::InvalidConfig("nak_bo_ivl cannot be zero"));
            }
            c.nak_bo_ivl = interval;
            Ok(())
        })
    }

    pub fn set_nak_rpt_ivl(&self, interval: Duration) -> Result<(), PgmError> {
        self.configure(|c| {
            c.nak_rpt_ivl = interval;
            Ok(())
        })
    }

    pub fn set_nak_rdata_ivl(&self, interval: Duration) -> Result<(), PgmError> {
        self.configure(|c| {
            c.nak_rdata_ivl = interval;
            Ok(())
        })
    }

    pub fn set_nak_ncf_retries(&self, retries: u32) -> Result<(), PgmError> {
        self.configure(|c| {
            if retries == 0 {
                return Err(PgmError::InvalidConfig("ncf retries cannot be zero"));
            }
            c.nak_ncf_retries = retries;
            Ok(())
        })
    }

    pub fn set_nak_data_retries(&self, retries: u32) -> Result<(), PgmError> {
        self.configure(|c| {
            if retries == 0 {
                return Err(PgmError::InvalidConfig("data retries cannot be zero"));
            }
            c.nak_data_retries = retries;
            Ok(())
        })
    }

    pub fn set_fec(&self, fec: FecConfig) -> Result<(), PgmError> {
        self.configure(|c| {
            if !fec.k.is_power_of_two() || fec.k < 2 || fec.k > 128 {
                return Err(PgmError::InvalidConfig(
                    "FEC k must be a power of two in 2..=128",
                ));
            }
            if fec.n <= fec.k {
                return Err(PgmError::InvalidConfig("FEC requires n > k"));
            }
            if fec.proactive_h as usize > (fec.n - fec.k) as usize {
                return Err(PgmError::InvalidConfig("proactive parity exceeds n - k"));
            }
            c.fec = Some(fec);
            Ok(())
        })
    }

    pub fn set_initial_sqn(&self, sqn: Sqn) -> Result<(), PgmError> {
        self.configure(|c| {
            c.initial_sqn = sqn;
            Ok(())
        })
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Freeze configuration, build the engines, and announce the session.
    pub fn bind(&self, sink: Arc<dyn PacketSink>) -> Result<(), PgmError> {
        if self.is_destroyed() {
            return Err(PgmError::Closed);
        }
        if self.bound.swap(true, Ordering::AcqRel) {
            return Err(PgmError::AlreadyBound);
        }
        let config = self.config.lock().expect("config lock").clone();
        *self.sink.lock().expect("sink lock") = Some(sink);

        if !config.recv_only {
            let now = Instant::now();
            let mut source = SourceEngine::new(
                SourceConfig {
                    tsi: config.tsi,
                    dport: config.dport,
                    max_tpdu: config.max_tpdu,
                    iphdr_len: config.iphdr_len,
                    nla: config.nla,
                    group: config.send_group,
                    spm_ambient_interval: config.spm_ambient_interval,
                    spm_heartbeat_intervals: config.spm_heartbeat_intervals.clone(),
                    txw_sqns: config.txw_sqns,
                    txw_secs: config.txw_secs,
                    txw_max_rte: config.txw_max_rte,
                    fec: config.fec,
                    initial_sqn: config.initial_sqn,
                },
                now,
            );
            source.announce();
            self.flush_source(&mut source);
            *self.source.lock().expect("source lock") = Some(source);
        }
        if !config.send_only {
            let receiver = ReceiverEngine::new(ReceiverConfig {
                tsi: config.tsi,
                dport: config.dport,
                max_tpdu: config.max_tpdu,
                rxw_sqns: config.rxw_sqns,
                rxw_secs: config.rxw_secs,
                rxw_max_rte: config.rxw_max_rte,
                peer_expiry: config.peer_expiry,
                spmr_expiry: config.spmr_expiry,
                nak_bo_ivl: config.nak_bo_ivl,
                nak_rpt_ivl: config.nak_rpt_ivl,
                nak_rdata_ivl: config.nak_rdata_ivl,
                nak_ncf_retries: config.nak_ncf_retries,
                nak_data_retries: config.nak_data_retries,
                group: config.recv_groups.first().copied().unwrap_or(config.send_group),
            });
            *self.receiver.lock().expect("receiver lock") = Some(Arc::new(receiver));
        }
        self.timer.notify();
        Ok(())
    }

    /// Tear the session down. With `flush`, FIN-flagged SPMs are broadcast
    /// first. Concurrent `send`/`recv` return `Eof`; buffers already
    /// delivered to the caller stay valid.
    pub fn destroy(&self, flush: bool) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if flush {
            if let Some(source) = self.source.lock().expect("source lock").as_mut() {
                source.send_fin();
                self.flush_source(source);
            }
        }
        self.timer.shutdown();
        let handle = self.timer_thread.lock().expect("thread lock").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Thread-shaped driver: wakes at `next_expiry` and runs the tick until
    /// destroyed. The reactor shape instead polls [`Transport::poll_info`]
    /// and calls [`Transport::tick`] itself.
    pub fn spawn_timer(self: &Arc<Self>) {
        let transport = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("pgm-timer".into())
            .spawn(move || loop {
                let now = Instant::now();
                if transport.timer.is_shutdown() {
                    break;
                }
                let deadline =
                    timer::bounded_sleep(now, transport.next_expiry(now), MAX_TIMER_SLEEP);
                match transport.timer.wait(now, deadline) {
                    WaitOutcome::Shutdown => break,
                    WaitOutcome::Deadline => transport.tick(Instant::now()),
                    WaitOutcome::Notified => {}
                }
            })
            .expect("spawn pgm-timer");
        *self.timer_thread.lock().expect("thread lock") = Some(handle);
    }

    // ─── Timer Integration ──────────────────────────────────────────────

    /// Earliest deadline across the source schedule and every peer.
    pub fn next_expiry(&self, now: Instant) -> Instant {
        let source_next = self
            .source
            .lock()
            .expect("source lock")
            .as_ref()
            .map(|s| s.next_expiry(now));
        let receiver_next = self
            .receiver
            .lock()
            .expect("receiver lock")
            .as_ref()
            .and_then(|r| r.next_expiry());
        match source_next {
            Some(source) => timer::next_expiry(source, receiver_next),
            None => receiver_next.unwrap_or(now + MAX_TIMER_SLEEP),
        }
    }

    /// Run all due time-driven work: SPM emission, deferred RDATA, NAK
    /// ladder transitions, peer expiry. Wakes blocked readers when data or
    /// a reset became available.
    pub fn tick(&self, now: Instant) {
        if let Some(source) = self.source.lock().expect("source lock").as_mut() {
            source.tick(now);
            self.flush_source(source);
        }
        let receiver = self.receiver.lock().expect("receiver lock").clone();
        if let Some(receiver) = receiver {
            receiver.tick(now);
            self.flush_receiver(&receiver);
            if receiver.has_pending() {
                self.timer.notify();
            }
        }
    }

    pub fn poll_info(&self) -> PollInfo {
        let now = Instant::now();
        let readable = self
            .receiver
            .lock()
            .expect("receiver lock")
            .as_ref()
            .map_or(false, |r| r.has_pending());
        PollInfo {
            next_expiry: self.next_expiry(now),
            readable,
        }
    }

    // ─── Ingestion ──────────────────────────────────────────────────────

    /// Feed one inbound datagram (PGM payload, IP header already stripped).
    /// Malformed or mismatched packets are counted and dropped.
    pub fn handle_packet(&self, raw: Bytes) {
        if self.is_destroyed() || !self.is_bound() {
            return;
        }
        let now = Instant::now();
        if !wire::verify(&raw) {
            self.cksum_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(packet) = PgmPacket::decode(&raw) else {
            self.malformed_packets.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let config = self.config.lock().expect("config lock").clone();
        let header = &packet.header;

        // Upstream traffic addressed to our source session.
        if header.packet_type.is_upstream()
            && header.gsi == config.tsi.gsi
            && header.dport == config.tsi.sport
        {
            if let Some(source) = self.source.lock().expect("source lock").as_mut() {
                match &packet.body {
                    PacketBody::Nak(nak) => source.on_nak(header, nak, now),
                    PacketBody::Spmr => source.on_spmr(),
                    PacketBody::Nnak(_) => source.on_nnak(),
                    PacketBody::Opaque if header.packet_type == PacketType::Ack => {
                        // PGMCC is deferred: ACKs are counted, not driven.
                        source.on_ack();
                    }
                    _ => {
                        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.flush_source(source);
            }
            self.timer.notify();
            return;
        }

        // Downstream traffic for the session group we joined.
        if header.packet_type.is_downstream() && header.dport == config.dport {
            let receiver = self.receiver.lock().expect("receiver lock").clone();
            let Some(receiver) = receiver else {
                self.packets_discarded.fetch_add(1, Ordering::Relaxed);
                return;
            };
            match &packet.body {
                PacketBody::Spm(spm) => {
                    receiver.on_spm(header, spm, now);
                }
                PacketBody::Data(data) => {
                    receiver.on_data(header, data, now);
                }
                PacketBody::Ncf(ncf) => receiver.on_ncf(header, ncf, now),
                _ => {
                    self.packets_discarded.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.flush_receiver(&receiver);
            self.timer.notify();
            return;
        }

        // A fellow receiver's multicast NAK/SPMR for a session we follow.
        if header.packet_type.is_peer() {
            let session = Tsi::new(header.gsi, header.dport);
            let receiver = self.receiver.lock().expect("receiver lock").clone();
            if let Some(receiver) = receiver {
                match &packet.body {
                    PacketBody::Nak(nak) => receiver.on_peer_nak(session, nak, now),
                    PacketBody::Spmr => receiver.on_peer_spmr(session),
                    _ => {}
                }
            }
            return;
        }

        trace!(packet_type = ?header.packet_type, "packet for another session");
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    // ─── Send / Recv ────────────────────────────────────────────────────

    /// Submit one APDU. Blocking mode waits out the rate limiter;
    /// non-blocking returns `RateLimited` with resumable state.
    pub fn send(&self, data: &[u8], nonblocking: bool) -> Result<IoStatus, PgmError> {
        loop {
            if self.is_destroyed() {
                return Ok(IoStatus::Eof);
            }
            if !self.is_bound() {
                return Err(PgmError::NotBound);
            }
            let now = Instant::now();
            let (status, delay) = {
                let mut guard = self.source.lock().expect("source lock");
                let Some(source) = guard.as_mut() else {
                    return Err(PgmError::InvalidConfig("receive-only transport"));
                };
                let status = source.send(data, now)?;
                self.flush_source(source);
                (status, source.rate_delay(now))
            };
            match status {
                IoStatus::RateLimited if !nonblocking => {
                    if self.timer.wait(now, now + delay) == WaitOutcome::Shutdown {
                        return Ok(IoStatus::Eof);
                    }
                }
                other => {
                    // New data re-arms the heartbeat schedule.
                    self.timer.notify();
                    return Ok(other);
                }
            }
        }
    }

    /// Gathered send; see [`SourceEngine::sendv`].
    pub fn sendv(
        &self,
        vectors: &[&[u8]],
        is_one_apdu: bool,
        nonblocking: bool,
    ) -> Result<IoStatus, PgmError> {
        if is_one_apdu {
            let gathered: Vec<u8> = vectors.concat();
            return self.send(&gathered, nonblocking);
        }
        let mut total = 0usize;
        for vector in vectors {
            match self.send(vector, nonblocking)? {
                IoStatus::Normal(count) => total += count,
                other => return Ok(other),
            }
        }
        Ok(IoStatus::Normal(total))
    }

    /// Zero-copy gathered send over reference-counted buffers; see
    /// [`SourceEngine::send_skbv`]. Multi-APDU mode submits one buffer at a
    /// time so a blocking retry never re-sends a completed APDU.
    pub fn send_skbv(
        &self,
        buffers: &[Bytes],
        is_one_apdu: bool,
        nonblocking: bool,
    ) -> Result<IoStatus, PgmError> {
        if is_one_apdu {
            let mut gathered = Vec::with_capacity(buffers.iter().map(|b| b.len()).sum());
            for buffer in buffers {
                gathered.extend_from_slice(buffer);
            }
            return self.send_one_bytes(Bytes::from(gathered), nonblocking);
        }
        let mut total = 0usize;
        for buffer in buffers {
            match self.send_one_bytes(buffer.clone(), nonblocking)? {
                IoStatus::Normal(count) => total += count,
                other => return Ok(other),
            }
        }
        Ok(IoStatus::Normal(total))
    }

    fn send_one_bytes(&self, apdu: Bytes, nonblocking: bool) -> Result<IoStatus, PgmError> {
        loop {
            if self.is_destroyed() {
                return Ok(IoStatus::Eof);
            }
            if !self.is_bound() {
                return Err(PgmError::NotBound);
            }
            let now = Instant::now();
            let (status, delay) = {
                let mut guard = self.source.lock().expect("source lock");
                let Some(source) = guard.as_mut() else {
                    return Err(PgmError::InvalidConfig("receive-only transport"));
                };
                let status = source.send_bytes(apdu.clone(), now)?;
                self.flush_source(source);
                (status, source.rate_delay(now))
            };
            match status {
                IoStatus::RateLimited if !nonblocking => {
                    if self.timer.wait(now, now + delay) == WaitOutcome::Shutdown {
                        return Ok(IoStatus::Eof);
                    }
                }
                other => {
                    self.timer.notify();
                    return Ok(other);
                }
            }
        }
    }

    /// Receive one APDU into `buf`, returning the byte count and the
    /// sender's TSI. Blocking mode drives the timers while waiting.
    pub fn recv(
        &self,
        buf: &mut [u8],
        nonblocking: bool,
    ) -> Result<(IoStatus, Option<Tsi>), PgmError> {
        match self.recv_msgv(1, nonblocking)? {
            (IoStatus::Normal(_), Some((tsi, apdus))) => {
                let mut copied = 0usize;
                for fragment in &apdus[0].fragments {
                    let room = buf.len() - copied;
                    let take = fragment.len().min(room);
                    buf[copied..copied + take].copy_from_slice(&fragment[..take]);
                    copied += take;
                    if take < fragment.len() {
                        break; // caller's buffer is full; tail is dropped
                    }
                }
                Ok((IoStatus::Normal(copied), Some(tsi)))
            }
            (status, info) => Ok((status, info.map(|(tsi, _)| tsi))),
        }
    }

    /// Zero-copy receive: up to `max_apdus` APDUs from one sender, each a
    /// vector of fragment buffers.
    #[allow(clippy::type_complexity)]
    pub fn recv_msgv(
        &self,
        max_apdus: usize,
        nonblocking: bool,
    ) -> Result<(IoStatus, Option<(Tsi, Vec<Apdu>)>), PgmError> {
        loop {
            if self.is_destroyed() {
                return Ok((IoStatus::Eof, None));
            }
            if !self.is_bound() {
                return Err(PgmError::NotBound);
            }
            let now = Instant::now();

            // recv drives the timers too.
            if self.next_expiry(now) <= now {
                self.tick(now);
            }

            let receiver = self.receiver.lock().expect("receiver lock").clone();
            let Some(receiver) = receiver else {
                return Err(PgmError::InvalidConfig("send-only transport"));
            };
            match receiver.read(max_apdus) {
                ReadOutcome::Data { tsi, apdus } => {
                    let total = apdus.iter().map(|a| a.len).sum();
                    return Ok((IoStatus::Normal(total), Some((tsi, apdus))));
                }
                ReadOutcome::Reset(tsi) => {
                    let abort = self.config.lock().expect("config lock").abort_on_reset;
                    if abort {
                        self.destroy(false);
                    }
                    return Ok((IoStatus::Reset, Some((tsi, Vec::new()))));
                }
                ReadOutcome::Empty => {
                    if nonblocking {
                        return Ok((IoStatus::WouldBlock, None));
                    }
                    let deadline =
                        timer::bounded_sleep(now, self.next_expiry(now), MAX_TIMER_SLEEP);
                    match self.timer.wait(now, deadline) {
                        WaitOutcome::Shutdown => return Ok((IoStatus::Eof, None)),
                        WaitOutcome::Deadline => self.tick(Instant::now()),
                        WaitOutcome::Notified => {}
                    }
                }
            }
        }
    }

    // ─── Output Flushing ────────────────────────────────────────────────

    fn flush_source(&self, source: &mut SourceEngine) {
        let sink = self.sink.lock().expect("sink lock").clone();
        let Some(sink) = sink else {
            source.drain_out().for_each(drop);
            return;
        };
        for packet in source.drain_out() {
            if let Err(err) = sink.send_to_group(&packet) {
                warn!(%err, "source packet send failed");
            }
        }
    }

    fn flush_receiver(&self, receiver: &ReceiverEngine) {
        let sink = self.sink.lock().expect("sink lock").clone();
        let Some(sink) = sink else {
            receiver.drain_out();
            return;
        };
        for outbound in receiver.drain_out() {
            let result = match &outbound {
                Outbound::Unicast { to, data } => sink.send_unicast(to, data),
                Outbound::Multicast { data } => sink.send_to_group(data),
            };
            if let Err(err) = result {
                warn!(%err, "receiver packet send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex as StdMutex;

    /// Sink that records every packet, optionally looping group traffic
    /// into a partner transport.
    #[derive(Default)]
    struct CollectSink {
        group: StdMutex<Vec<Bytes>>,
        unicast: StdMutex<Vec<(Nla, Bytes)>>,
    }

    impl PacketSink for CollectSink {
        fn send_to_group(&self, data: &[u8]) -> std::io::Result<()> {
            self.group
                .lock()
                .unwrap()
                .push(Bytes::copy_from_slice(data));
            Ok(())
        }

        fn send_unicast(&self, to: &Nla, data: &[u8]) -> std::io::Result<()> {
            self.unicast
                .lock()
                .unwrap()
                .push((*to, Bytes::copy_from_slice(data)));
            Ok(())
        }
    }

    fn group() -> Nla {
        Nla(IpAddr::V4(Ipv4Addr::new(239, 192, 0, 1)))
    }

    fn sender_transport() -> (Arc<Transport>, Arc<CollectSink>) {
        let transport = Transport::create(
            Gsi::new([1, 2, 3, 4, 5, 6]),
            7500,
            7500,
            vec![group()],
            group(),
        );
        transport.set_nla(Nla(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))).unwrap();
        transport.set_txw_sqns(128).unwrap();
        transport.set_send_only(true).unwrap();
        let sink = Arc::new(CollectSink::default());
        transport.bind(sink.clone()).unwrap();
        (Arc::new(transport), sink)
    }

    fn receiver_transport() -> (Arc<Transport>, Arc<CollectSink>) {
        let transport = Transport::create(
            Gsi::new([6, 5, 4, 3, 2, 1]),
            4000,
            7500,
            vec![group()],
            group(),
        );
        transport.set_rxw_sqns(128).unwrap();
        transport.set_recv_only(true).unwrap();
        let sink = Arc::new(CollectSink::default());
        transport.bind(sink.clone()).unwrap();
        (Arc::new(transport), sink)
    }

    // ─── Configuration ──────────────────────────────────────────────────

    #[test]
    fn setters_validate() {
        let t = Transport::create(Gsi::random(), 1000, 1000, vec![group()], group());
        assert!(t.set_max_tpdu(100).is_err());
        assert!(t.set_max_tpdu(1500).is_ok());
        assert!(t.set_multicast_hops(0).is_err());
        assert!(t.set_txw_sqns(0).is_err());
        assert!(t
            .set_spmr_expiry(Duration::from_secs(60))
            .is_err());
        assert!(t.set_spmr_expiry(Duration::from_millis(250)).is_ok());
        assert!(t
            .set_peer_expiry(Duration::from_millis(100))
            .is_err());
        assert!(t.set_peer_expiry(Duration::from_secs(60)).is_ok());
        assert!(t
            .set_fec(FecConfig {
                proactive_h: 0,
                use_ondemand: true,
                use_varpktlen: false,
                n: 6,
                k: 3, // not a power of two
            })
            .is_err());
        assert!(t
            .set_fec(FecConfig {
                proactive_h: 0,
                use_ondemand: true,
                use_varpktlen: false,
                n: 6,
                k: 4,
            })
            .is_ok());
    }

    #[test]
    fn send_and_recv_only_exclude_each_other() {
        let t = Transport::create(Gsi::random(), 1000, 1000, vec![group()], group());
        t.set_send_only(true).unwrap();
        assert!(t.set_recv_only(true).is_err());
    }

    #[test]
    fn setters_rejected_after_bind() {
        let (t, _sink) = sender_transport();
        assert!(matches!(t.set_max_tpdu(1400), Err(PgmError::AlreadyBound)));
        assert!(matches!(
            t.set_multicast_loop(true),
            Err(PgmError::AlreadyBound)
        ));
    }

    #[test]
    fn double_bind_rejected() {
        let (t, sink) = sender_transport();
        assert!(matches!(
            t.bind(sink.clone()),
            Err(PgmError::AlreadyBound)
        ));
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    #[test]
    fn bind_announces_spms() {
        let (_t, sink) = sender_transport();
        let announced = sink.group.lock().unwrap();
        assert_eq!(announced.len(), 3);
        for raw in announced.iter() {
            let pkt = PgmPacket::decode(raw).unwrap();
            assert_eq!(pkt.header.packet_type, PacketType::Spm);
        }
    }

    #[test]
    fn destroy_flush_sends_fin() {
        let (t, sink) = sender_transport();
        sink.group.lock().unwrap().clear();
        t.destroy(true);
        let flushed = sink.group.lock().unwrap();
        assert_eq!(flushed.len(), 3);
        for raw in flushed.iter() {
            match PgmPacket::decode(raw).unwrap().body {
                PacketBody::Spm(spm) => assert!(spm.options.fin),
                other => panic!("expected FIN SPM, got {other:?}"),
            }
        }
    }

    #[test]
    fn operations_after_destroy_return_eof() {
        let (t, _sink) = sender_transport();
        t.destroy(false);
        assert_eq!(t.send(b"data", true).unwrap(), IoStatus::Eof);

        let (r, _sink) = receiver_transport();
        r.destroy(false);
        let mut buf = [0u8; 64];
        assert_eq!(r.recv(&mut buf, true).unwrap().0, IoStatus::Eof);
    }

    #[test]
    fn send_requires_bind() {
        let t = Transport::create(Gsi::random(), 1000, 1000, vec![group()], group());
        assert!(matches!(t.send(b"x", true), Err(PgmError::NotBound)));
    }

    // ─── Data Flow ──────────────────────────────────────────────────────

    #[test]
    fn send_reaches_sink_and_partner_recv() {
        let (tx, tx_sink) = sender_transport();
        let (rx, _rx_sink) = receiver_transport();
        tx_sink.group.lock().unwrap().clear();

        assert_eq!(tx.send(b"hello multicast", true).unwrap(), IoStatus::Normal(15));
        for raw in tx_sink.group.lock().unwrap().iter() {
            rx.handle_packet(raw.clone());
        }

        let mut buf = [0u8; 64];
        let (status, tsi) = rx.recv(&mut buf, true).unwrap();
        assert_eq!(status, IoStatus::Normal(15));
        assert_eq!(tsi, Some(Tsi::new(Gsi::new([1, 2, 3, 4, 5, 6]), 7500)));
        assert_eq!(&buf[..15], b"hello multicast");
    }

    #[test]
    fn recv_nonblocking_would_block_when_idle() {
        let (rx, _sink) = receiver_transport();
        let mut buf = [0u8; 16];
        assert_eq!(rx.recv(&mut buf, true).unwrap().0, IoStatus::WouldBlock);
    }

    #[test]
    fn recv_on_send_only_rejected() {
        let (tx, _sink) = sender_transport();
        let mut buf = [0u8; 16];
        assert!(tx.recv(&mut buf, true).is_err());
    }

    #[test]
    fn corrupt_packet_counted_not_crashed() {
        let (rx, _sink) = receiver_transport();
        rx.handle_packet(Bytes::from_static(b"\x00\x01\x02"));
        assert_eq!(rx.cksum_errors.load(Ordering::Relaxed), 1);

        // Valid length, broken checksum.
        let (tx, tx_sink) = sender_transport();
        tx.send(b"payload", true).unwrap();
        let mut raw = tx_sink.group.lock().unwrap().last().unwrap().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        rx.handle_packet(Bytes::from(raw));
        assert_eq!(rx.cksum_errors.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn ack_counted_not_discarded() {
        let (t, _sink) = sender_transport();
        let ack = PgmPacket {
            header: wire::PgmHeader::new(
                Tsi::new(Gsi::new([1, 2, 3, 4, 5, 6]), 7500),
                7500,
                PacketType::Ack,
            ),
            body: PacketBody::Opaque,
        };
        t.handle_packet(ack.encode().freeze());
        assert_eq!(t.source_stats().unwrap().acks_received, 1);
        assert_eq!(t.packets_discarded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn poll_info_reports_readable() {
        let (tx, tx_sink) = sender_transport();
        let (rx, _sink) = receiver_transport();
        assert!(!rx.poll_info().readable);

        tx.send(b"data", true).unwrap();
        for raw in tx_sink.group.lock().unwrap().iter() {
            rx.handle_packet(raw.clone());
        }
        assert!(rx.poll_info().readable);
    }

    #[test]
    fn timer_thread_lifecycle() {
        let (t, _sink) = sender_transport();
        t.spawn_timer();
        std::thread::sleep(Duration::from_millis(20));
        t.destroy(false);
        assert!(t.timer_thread.lock().unwrap().is_none(), "driver joined");
    }
}
