//! # Transport Statistics
//!
//! Source-side and per-peer counters, serializable for export. Counters are
//! plain fields bumped inline on the hot path; snapshots are cheap clones.

use serde::Serialize;

// ─── Source Stats ───────────────────────────────────────────────────────────

/// Counters for the sending side of a session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    /// ODATA packets sent.
    pub data_packets_sent: u64,
    /// ODATA payload bytes sent.
    pub data_bytes_sent: u64,
    /// APDUs accepted from the application.
    pub apdus_sent: u64,
    /// SPM packets sent (ambient + heartbeat).
    pub spms_sent: u64,
    /// Selective RDATA packets sent.
    pub rdata_sent: u64,
    /// Parity RDATA packets sent.
    pub parity_rdata_sent: u64,
    /// Proactive parity ODATA packets sent.
    pub proactive_parity_sent: u64,
    /// NCF packets sent.
    pub ncfs_sent: u64,
    /// Valid NAKs received.
    pub naks_received: u64,
    /// Parity NAKs received.
    pub parity_naks_received: u64,
    /// NAKs ignored: wrong TSI, address mismatch, out of window.
    pub naks_ignored: u64,
    /// NNAKs received (counted only).
    pub nnaks_received: u64,
    /// PGMCC ACKs received (counted only; congestion control not driven).
    pub acks_received: u64,
    /// SPMRs answered with an immediate SPM.
    pub spmrs_received: u64,
    /// Sends refused by the rate limiter.
    pub rate_limited: u64,
    /// Packets dropped during parse.
    pub malformed_packets: u64,
}

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repair overhead: RDATA (selective + parity) per ODATA sent.
    pub fn repair_ratio(&self) -> f64 {
        if self.data_packets_sent == 0 {
            0.0
        } else {
            (self.rdata_sent + self.parity_rdata_sent) as f64 / self.data_packets_sent as f64
        }
    }
}

// ─── Peer Stats ─────────────────────────────────────────────────────────────

/// Counters for one remote sender tracked by the receiving side.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStats {
    /// Data packets received (ODATA + RDATA, before dedup).
    pub data_packets_received: u64,
    /// Data payload bytes received.
    pub data_bytes_received: u64,
    /// APDUs delivered to the reader.
    pub apdus_delivered: u64,
    /// Bytes delivered to the reader.
    pub bytes_delivered: u64,
    /// SPMs accepted.
    pub spms_received: u64,
    /// SPMs discarded for a non-advancing sqn.
    pub spms_discarded: u64,
    /// NCFs received.
    pub ncfs_received: u64,
    /// Selective NAKs sent upstream.
    pub naks_sent: u64,
    /// Parity NAKs sent upstream.
    pub parity_naks_sent: u64,
    /// NAK retries suppressed by another receiver's NAK or an NCF.
    pub selective_naks_suppressed: u64,
    /// Duplicate data packets.
    pub duplicates: u64,
    /// Packets recovered by parity reconstruction.
    pub parity_recoveries: u64,
    /// Packets discarded: session mismatch, bounds, stale SPM.
    pub packets_discarded: u64,
    /// Packets dropped with invalid headers or options.
    pub malformed_packets: u64,
    /// Packets dropped on checksum mismatch.
    pub cksum_errors: u64,
    /// Total sqns declared lost.
    pub losses: u64,
}

impl PeerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unique-delivery efficiency: delivered per received.
    pub fn delivery_ratio(&self) -> f64 {
        if self.data_packets_received == 0 {
            0.0
        } else {
            self.apdus_delivered as f64 / self.data_packets_received as f64
        }
    }
}
