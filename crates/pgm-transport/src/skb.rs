//! # Packet Buffers
//!
//! The per-packet records the windows store. Transmit buffers keep the fully
//! serialized TPDU plus retransmit bookkeeping; receive buffers keep the
//! zero-copy TSDU slice plus reassembly metadata. `Bytes` carries the shared
//! reference count, so a buffer handed to the application stays valid after
//! the window slot is recycled.

use bytes::Bytes;
use quanta::Instant;

use crate::sqn::Sqn;
use crate::tsi::Tsi;
use crate::wire::OptFragment;

// ─── Transmit Buffer ────────────────────────────────────────────────────────

/// A packet held in the transmit window awaiting possible retransmission.
#[derive(Debug, Clone)]
pub struct TxBuffer {
    pub sequence: Sqn,
    /// TSDU bytes (payload only). May gain zero padding for parity encoding.
    pub tsdu: Bytes,
    /// Fragmentation option carried by the ODATA, if any.
    pub fragment: Option<OptFragment>,
    /// Saved partial checksum of the TSDU, reused when re-serializing RDATA.
    pub unfolded_odata: u32,
    /// When the ODATA was first transmitted.
    pub sent_at: Instant,
    /// Linked into the retransmit queue.
    pub waiting_retransmit: bool,
    /// Parity retransmission: packets requested for this transmission group.
    pub pkt_cnt_requested: u32,
    /// Parity retransmission: packets already generated and sent.
    pub pkt_cnt_sent: u32,
    /// TSDU padded to the group block size, computed at most once per
    /// original when a variable-length group is parity-encoded.
    pub padded_block: Option<Bytes>,
}

impl TxBuffer {
    pub fn new(sequence: Sqn, tsdu: Bytes, fragment: Option<OptFragment>, now: Instant) -> Self {
        let unfolded_odata = crate::checksum::partial(&tsdu, 0);
        TxBuffer {
            sequence,
            tsdu,
            fragment,
            unfolded_odata,
            sent_at: now,
            waiting_retransmit: false,
            pkt_cnt_requested: 0,
            pkt_cnt_sent: 0,
            padded_block: None,
        }
    }

    pub fn tsdu_length(&self) -> usize {
        self.tsdu.len()
    }

    /// Whether this original was already padded for parity encoding.
    pub fn zero_padded(&self) -> bool {
        self.padded_block.is_some()
    }
}

// ─── Receive Buffer ─────────────────────────────────────────────────────────

/// A packet held in a receive window slot.
#[derive(Debug, Clone)]
pub struct RxBuffer {
    pub tsi: Tsi,
    pub sequence: Sqn,
    /// TSDU bytes; a zero-copy slice of the inbound datagram, or a freshly
    /// reconstructed block after parity decode.
    pub tsdu: Bytes,
    pub fragment: Option<OptFragment>,
    /// Arrival (or reconstruction) time.
    pub arrived_at: Instant,
    /// Repaired rather than received: RDATA or parity reconstruction.
    pub repair: bool,
}

impl RxBuffer {
    pub fn new(tsi: Tsi, sequence: Sqn, tsdu: Bytes, now: Instant) -> Self {
        RxBuffer {
            tsi,
            sequence,
            tsdu,
            fragment: None,
            arrived_at: now,
            repair: false,
        }
    }

    pub fn with_fragment(mut self, fragment: Option<OptFragment>) -> Self {
        self.fragment = fragment;
        self
    }

    pub fn as_repair(mut self) -> Self {
        self.repair = true;
        self
    }

    /// Number of fragments in this buffer's APDU (1 when unfragmented).
    pub fn apdu_fragment_count(&self, max_tsdu: usize) -> u32 {
        match self.fragment {
            Some(frag) => frag.apdu_len.div_ceil(max_tsdu as u32).max(1),
            None => 1,
        }
    }
}
