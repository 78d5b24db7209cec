//! # Transmit Window
//!
//! Circular buffer of outgoing packets indexed by sequence number, with the
//! retransmit queue threaded through it. The window never refuses a push:
//! when full, the trailing (oldest, possibly still-unrepaired) entry is
//! evicted — advancing the trail is the documented recovery-horizon policy.
//!
//! Parity NAKs are keyed on the transmission-group lead: the lead entry's
//! packet counts track how many parity packets the group owes
//! (`pkt_cnt_requested`) and how many have been generated (`pkt_cnt_sent`,
//! cumulative, so the parity index `h` keeps advancing across NAK rounds and
//! receivers never get a duplicate parity block they already hold).

use bytes::Bytes;
use quanta::Instant;
use std::collections::VecDeque;

use crate::fec::{self, ReedSolomon};
use crate::skb::TxBuffer;
use crate::sqn::Sqn;
use crate::wire::OptFragment;

// ─── Configuration ──────────────────────────────────────────────────────────

/// FEC geometry for the transmit side.
#[derive(Debug, Clone, Copy)]
pub struct FecParameters {
    /// Total blocks per transmission group.
    pub n: u8,
    /// Original packets per transmission group; must be a power of two.
    pub k: u8,
}

impl FecParameters {
    pub fn tg_sqn_shift(&self) -> u8 {
        self.k.trailing_zeros() as u8
    }
}

/// Derive window capacity from either an explicit sqn count or a
/// seconds × rate budget.
pub fn window_capacity(sqns: u32, secs: u32, max_rte: u64, tpdu: usize) -> usize {
    if sqns > 0 {
        sqns as usize
    } else {
        ((secs as u64 * max_rte) / tpdu as u64).max(1) as usize
    }
}

// ─── Retransmit Request ─────────────────────────────────────────────────────

/// A retransmission the source should emit next, produced by
/// [`TransmitWindow::retransmit_try_peek`].
#[derive(Debug, Clone)]
pub struct RetransmitRequest {
    /// On-wire sqn: the original's sqn, or `tg_sqn | h` for parity.
    pub sequence: Sqn,
    pub is_parity: bool,
    /// TSDU to carry: original payload, or freshly encoded parity block.
    pub tsdu: Bytes,
    /// OPT_FRAGMENT to carry: the original's, or the RS-encoded fragment
    /// option when any original in the group was fragmented.
    pub fragment: Option<OptFragment>,
    /// Parity over a variable-length group (OPT_VAR_PKTLEN).
    pub var_pktlen: bool,
    /// Saved partial checksum of `tsdu` for the zero-copy send path.
    pub unfolded_checksum: u32,
}

// ─── Transmit Window ────────────────────────────────────────────────────────

pub struct TransmitWindow {
    ring: Vec<Option<TxBuffer>>,
    max_length: usize,
    /// Highest assigned sqn; `lead + 1 == trail` means empty.
    lead: Sqn,
    /// Lowest retained sqn.
    trail: Sqn,
    size_bytes: usize,
    /// Front = most recent request, back = oldest (served first).
    retransmit_queue: VecDeque<Sqn>,
    fec: Option<(ReedSolomon, FecParameters)>,
}

impl TransmitWindow {
    /// Create a window holding `capacity` entries, with the first pushed
    /// packet taking `initial_lead + 1`.
    ///
    /// With FEC enabled the capacity is rounded up to a whole number of
    /// transmission groups so groups never straddle the ring seam.
    pub fn new(capacity: usize, initial_lead: Sqn, fec: Option<FecParameters>) -> Self {
        assert!(capacity > 0, "transmit window cannot be empty");
        let capacity = match &fec {
            Some(params) => {
                assert!(params.k.is_power_of_two(), "FEC k must be a power of two");
                assert!(params.k >= 2 && params.k < params.n, "FEC requires 2 <= k < n");
                capacity.div_ceil(params.k as usize) * params.k as usize
            }
            None => capacity,
        };
        TransmitWindow {
            ring: (0..capacity).map(|_| None).collect(),
            max_length: capacity,
            lead: initial_lead,
            trail: initial_lead.next(),
            size_bytes: 0,
            retransmit_queue: VecDeque::new(),
            fec: fec.map(|params| (ReedSolomon::new(params.n as usize, params.k as usize), params)),
        }
    }

    // ─── Geometry ───────────────────────────────────────────────────────

    pub fn is_empty(&self) -> bool {
        self.lead.next() == self.trail
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.max_length
    }

    pub fn len(&self) -> usize {
        self.lead.next().distance(self.trail) as usize
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    /// The sqn the next push will be assigned.
    pub fn next_lead(&self) -> Sqn {
        self.lead.next()
    }

    pub fn tg_sqn_shift(&self) -> u8 {
        self.fec.as_ref().map_or(0, |(_, p)| p.tg_sqn_shift())
    }

    // ─── Push / Peek ────────────────────────────────────────────────────

    /// Append a packet, assigning it the next lead sqn. Evicts the trailing
    /// entry when full.
    pub fn push(&mut self, tsdu: Bytes, fragment: Option<OptFragment>, now: Instant) -> Sqn {
        if self.is_full() {
            self.remove_tail();
        }
        self.lead = self.lead.next();
        let sequence = self.lead;
        let index = sequence.value() as usize % self.max_length;
        self.size_bytes += tsdu.len();
        self.ring[index] = Some(TxBuffer::new(sequence, tsdu, fragment, now));
        sequence
    }

    /// Fetch an entry still inside `[trail, lead]`.
    pub fn peek(&self, sequence: Sqn) -> Option<&TxBuffer> {
        if self.is_empty() || sequence.before(self.trail) || sequence.after(self.lead) {
            return None;
        }
        let slot = self.ring[sequence.value() as usize % self.max_length].as_ref();
        debug_assert!(slot.map_or(true, |b| b.sequence == sequence));
        slot
    }

    fn peek_mut(&mut self, sequence: Sqn) -> Option<&mut TxBuffer> {
        if self.is_empty() || sequence.before(self.trail) || sequence.after(self.lead) {
            return None;
        }
        self.ring[sequence.value() as usize % self.max_length].as_mut()
    }

    fn remove_tail(&mut self) {
        debug_assert!(!self.is_empty());
        let index = self.trail.value() as usize % self.max_length;
        if let Some(buffer) = self.ring[index].take() {
            self.size_bytes -= buffer.tsdu.len();
            if buffer.waiting_retransmit {
                self.retransmit_queue.retain(|&s| s != buffer.sequence);
            }
        }
        self.trail = self.trail.next();
    }

    // ─── Retransmit Queue ───────────────────────────────────────────────

    /// Enqueue a retransmission request from a NAK.
    ///
    /// Selective requests are ignored when already queued or outside the
    /// window. Parity requests address the transmission group named by the
    /// sqn's high bits; the low bits carry the number of parity packets
    /// wanted.
    pub fn retransmit_push(&mut self, sequence: Sqn, is_parity: bool) -> bool {
        if self.is_empty() {
            return false;
        }
        if is_parity {
            self.retransmit_push_parity(sequence)
        } else {
            self.retransmit_push_selective(sequence)
        }
    }

    fn retransmit_push_selective(&mut self, sequence: Sqn) -> bool {
        let Some(buffer) = self.peek_mut(sequence) else {
            return false;
        };
        if buffer.waiting_retransmit {
            return false;
        }
        buffer.waiting_retransmit = true;
        self.retransmit_queue.push_front(sequence);
        true
    }

    fn retransmit_push_parity(&mut self, sequence: Sqn) -> bool {
        let Some((_, params)) = &self.fec else {
            return false;
        };
        let shift = params.tg_sqn_shift();
        let tg_sqn = sequence.tg_sqn(shift);
        let wanted = sequence.pkt_sqn(shift).max(1);
        let Some(buffer) = self.peek_mut(tg_sqn) else {
            return false;
        };
        // Counts are cumulative over the group's lifetime; the target is
        // expressed relative to what has already gone out.
        let target = buffer.pkt_cnt_sent + wanted;
        if buffer.waiting_retransmit {
            if buffer.pkt_cnt_requested < target {
                buffer.pkt_cnt_requested = target;
            }
            return false;
        }
        buffer.pkt_cnt_requested = target;
        buffer.waiting_retransmit = true;
        self.retransmit_queue.push_front(tg_sqn);
        true
    }

    pub fn retransmit_is_empty(&self) -> bool {
        self.retransmit_queue.is_empty()
    }

    /// Inspect the oldest queued request without consuming it. Parity
    /// requests synthesize their block here; the result is only sent (and
    /// the queue advanced) by [`TransmitWindow::retransmit_remove_head`].
    pub fn retransmit_try_peek(&mut self) -> Option<RetransmitRequest> {
        let sequence = *self.retransmit_queue.back()?;
        let buffer = self
            .peek(sequence)
            .expect("queued entry evicted without unlink");
        if buffer.pkt_cnt_requested == 0 {
            let tsdu = buffer.tsdu.clone();
            let unfolded = buffer.unfolded_odata;
            return Some(RetransmitRequest {
                sequence,
                is_parity: false,
                tsdu,
                fragment: buffer.fragment,
                var_pktlen: false,
                unfolded_checksum: unfolded,
            });
        }
        self.build_parity(sequence)
    }

    /// Consume the oldest request after it was sent. Parity groups stay
    /// queued until every owed parity packet has gone out.
    pub fn retransmit_remove_head(&mut self) {
        let Some(&sequence) = self.retransmit_queue.back() else {
            return;
        };
        let buffer = self
            .peek_mut(sequence)
            .expect("queued entry evicted without unlink");
        debug_assert!(buffer.waiting_retransmit);
        if buffer.pkt_cnt_requested > 0 {
            buffer.pkt_cnt_sent += 1;
            if buffer.pkt_cnt_sent != buffer.pkt_cnt_requested {
                return;
            }
        }
        buffer.waiting_retransmit = false;
        self.retransmit_queue.pop_back();
    }

    /// Drop the oldest request outright, e.g. a parity request whose group
    /// is no longer fully resident. Unlike `retransmit_remove_head` this
    /// does not advance the parity sent count.
    pub fn retransmit_drop_tail(&mut self) {
        if let Some(sequence) = self.retransmit_queue.pop_back() {
            if let Some(buffer) = self.peek_mut(sequence) {
                buffer.waiting_retransmit = false;
            }
        }
    }

    /// Generate `count` proactive parity blocks for a just-completed group.
    /// The group's sent count advances so later on-demand parity continues
    /// at the next unused index.
    pub fn proactive_parity(&mut self, tg_sqn: Sqn, count: u32) -> Vec<RetransmitRequest> {
        debug_assert!(self.fec.is_some());
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(request) = self.build_parity(tg_sqn) else {
                break;
            };
            if let Some(buffer) = self.peek_mut(tg_sqn) {
                buffer.pkt_cnt_sent += 1;
            }
            blocks.push(request);
        }
        blocks
    }

    // ─── Parity Synthesis ───────────────────────────────────────────────

    fn build_parity(&mut self, tg_sqn: Sqn) -> Option<RetransmitRequest> {
        let params = self.fec.as_ref().expect("parity request without FEC").1;
        let k = params.k as usize;
        let h = {
            let buffer = self.peek(tg_sqn)?;
            (buffer.pkt_cnt_sent % (params.n - params.k) as u32) as usize
        };

        // The whole group must still be inside the window.
        let group_tail = tg_sqn + (k as u32 - 1);
        if group_tail.after(self.lead) {
            return None;
        }

        let max_tsdu = (0..k)
            .map(|i| self.peek(tg_sqn + i as u32).expect("group member present").tsdu.len())
            .max()?;
        let var_pktlen = (0..k).any(|i| {
            self.peek(tg_sqn + i as u32).expect("group member present").tsdu.len() != max_tsdu
        });
        let has_fragment = (0..k)
            .any(|i| self.peek(tg_sqn + i as u32).expect("group member present").fragment.is_some());
        let block_len = if var_pktlen { max_tsdu + 2 } else { max_tsdu };

        // Pad variable-length originals once, caching the padded block.
        if var_pktlen {
            for i in 0..k {
                let sqn = tg_sqn + i as u32;
                let buffer = self.peek_mut(sqn).expect("group member present");
                if !buffer.zero_padded() {
                    buffer.padded_block =
                        Some(Bytes::from(fec::pad_var_pktlen(&buffer.tsdu, block_len)));
                }
            }
        }

        let blocks: Vec<Bytes> = (0..k)
            .map(|i| {
                let buffer = self.peek(tg_sqn + i as u32).expect("group member present");
                if var_pktlen {
                    buffer.padded_block.clone().expect("padded above")
                } else {
                    buffer.tsdu.clone()
                }
            })
            .collect();
        let refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_ref()).collect();
        let rs = &self.fec.as_ref().expect("parity request without FEC").0;
        let mut parity = vec![0u8; block_len];
        rs.encode_parity(&refs, h, &mut parity);

        // Fragment metadata is protected by the same code: encode the three
        // option words of each original (zeros when absent) into a parity
        // fragment option.
        let fragment = if has_fragment {
            let frag_blocks: Vec<[u8; 12]> = (0..k)
                .map(|i| {
                    let buffer = self.peek(tg_sqn + i as u32).expect("group member present");
                    encode_fragment_block(buffer.fragment)
                })
                .collect();
            let frag_refs: Vec<&[u8]> = frag_blocks.iter().map(|b| b.as_slice()).collect();
            let mut parity_frag = [0u8; 12];
            rs.encode_parity(&frag_refs, h, &mut parity_frag);
            Some(decode_fragment_block(&parity_frag))
        } else {
            None
        };

        let tsdu = Bytes::from(parity);
        let unfolded_checksum = crate::checksum::partial(&tsdu, 0);
        Some(RetransmitRequest {
            sequence: tg_sqn + h as u32,
            is_parity: true,
            tsdu,
            fragment,
            var_pktlen,
            unfolded_checksum,
        })
    }
}

/// Serialize a fragment option's three words for RS protection.
pub(crate) fn encode_fragment_block(fragment: Option<OptFragment>) -> [u8; 12] {
    let mut block = [0u8; 12];
    if let Some(frag) = fragment {
        block[0..4].copy_from_slice(&frag.first_sqn.value().to_be_bytes());
        block[4..8].copy_from_slice(&frag.offset.to_be_bytes());
        block[8..12].copy_from_slice(&frag.apdu_len.to_be_bytes());
    }
    block
}

/// Inverse of [`encode_fragment_block`].
pub(crate) fn decode_fragment_block(block: &[u8]) -> OptFragment {
    OptFragment {
        first_sqn: Sqn::new(u32::from_be_bytes(block[0..4].try_into().unwrap())),
        offset: u32::from_be_bytes(block[4..8].try_into().unwrap()),
        apdu_len: u32::from_be_bytes(block[8..12].try_into().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    fn push_n(window: &mut TransmitWindow, count: usize, len: usize) -> Vec<Sqn> {
        (0..count)
            .map(|i| window.push(Bytes::from(vec![i as u8; len]), None, now()))
            .collect()
    }

    // ─── Geometry ───────────────────────────────────────────────────────

    #[test]
    fn starts_empty() {
        let window = TransmitWindow::new(16, Sqn::new(99), None);
        assert!(window.is_empty());
        assert_eq!(window.len(), 0);
        assert_eq!(window.next_lead(), Sqn::new(100));
    }

    #[test]
    fn push_assigns_consecutive_sqns() {
        let mut window = TransmitWindow::new(16, Sqn::new(99), None);
        let sqns = push_n(&mut window, 3, 10);
        assert_eq!(sqns, vec![Sqn::new(100), Sqn::new(101), Sqn::new(102)]);
        assert_eq!(window.trail(), Sqn::new(100));
        assert_eq!(window.lead(), Sqn::new(102));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn full_window_evicts_tail() {
        let mut window = TransmitWindow::new(4, Sqn::new(u32::MAX), None);
        push_n(&mut window, 5, 10);
        assert_eq!(window.len(), 4);
        assert_eq!(window.trail(), Sqn::new(1));
        assert!(window.peek(Sqn::new(0)).is_none());
        assert!(window.peek(Sqn::new(4)).is_some());
    }

    #[test]
    fn peek_outside_window_is_none() {
        let mut window = TransmitWindow::new(8, Sqn::new(9), None);
        push_n(&mut window, 2, 10);
        assert!(window.peek(Sqn::new(9)).is_none());
        assert!(window.peek(Sqn::new(12)).is_none());
        assert!(window.peek(Sqn::new(10)).is_some());
    }

    #[test]
    fn fec_rounds_capacity_to_group_multiple() {
        let window = TransmitWindow::new(
            10,
            Sqn::new(0),
            Some(FecParameters { n: 6, k: 4 }),
        );
        assert_eq!(window.max_length(), 12);
        assert_eq!(window.tg_sqn_shift(), 2);
    }

    #[test]
    fn size_bytes_tracks_payloads() {
        let mut window = TransmitWindow::new(4, Sqn::new(0), None);
        push_n(&mut window, 2, 100);
        assert_eq!(window.size_bytes(), 200);
        push_n(&mut window, 3, 100); // evicts one
        assert_eq!(window.size_bytes(), 400);
    }

    // ─── Selective Retransmit ───────────────────────────────────────────

    #[test]
    fn selective_push_peek_remove() {
        let mut window = TransmitWindow::new(16, Sqn::new(99), None);
        push_n(&mut window, 5, 10);

        assert!(window.retransmit_push(Sqn::new(102), false));
        let req = window.retransmit_try_peek().unwrap();
        assert_eq!(req.sequence, Sqn::new(102));
        assert!(!req.is_parity);
        assert_eq!(req.unfolded_checksum, crate::checksum::partial(&req.tsdu, 0));

        window.retransmit_remove_head();
        assert!(window.retransmit_is_empty());
        assert!(!window.peek(Sqn::new(102)).unwrap().waiting_retransmit);
    }

    #[test]
    fn selective_duplicate_request_eliminated() {
        let mut window = TransmitWindow::new(16, Sqn::new(99), None);
        push_n(&mut window, 5, 10);
        assert!(window.retransmit_push(Sqn::new(101), false));
        assert!(!window.retransmit_push(Sqn::new(101), false));
    }

    #[test]
    fn selective_request_outside_window_eliminated() {
        let mut window = TransmitWindow::new(16, Sqn::new(99), None);
        push_n(&mut window, 5, 10);
        assert!(!window.retransmit_push(Sqn::new(99), false));
        assert!(!window.retransmit_push(Sqn::new(200), false));
    }

    #[test]
    fn queue_serves_oldest_first() {
        let mut window = TransmitWindow::new(16, Sqn::new(0), None);
        push_n(&mut window, 5, 10);
        window.retransmit_push(Sqn::new(2), false);
        window.retransmit_push(Sqn::new(4), false);

        assert_eq!(window.retransmit_try_peek().unwrap().sequence, Sqn::new(2));
        window.retransmit_remove_head();
        assert_eq!(window.retransmit_try_peek().unwrap().sequence, Sqn::new(4));
        window.retransmit_remove_head();
        assert!(window.retransmit_try_peek().is_none());
    }

    #[test]
    fn eviction_unlinks_queued_entry() {
        let mut window = TransmitWindow::new(4, Sqn::new(u32::MAX), None);
        push_n(&mut window, 4, 10);
        window.retransmit_push(Sqn::new(0), false);
        // Pushing a 5th entry evicts sqn 0, which must leave the queue too.
        push_n(&mut window, 1, 10);
        assert!(window.retransmit_is_empty());
    }

    // ─── Parity Retransmit ──────────────────────────────────────────────

    fn fec_window() -> TransmitWindow {
        TransmitWindow::new(16, Sqn::new(u32::MAX), Some(FecParameters { n: 6, k: 4 }))
    }

    #[test]
    fn parity_request_synthesizes_block() {
        let mut window = fec_window();
        push_n(&mut window, 4, 32); // sqns 0..=3, one full group

        // Request 1 parity packet for group 0.
        assert!(window.retransmit_push(Sqn::new(1), true));
        let req = window.retransmit_try_peek().unwrap();
        assert!(req.is_parity);
        assert_eq!(req.sequence, Sqn::new(0)); // tg 0, h 0
        assert_eq!(req.tsdu.len(), 32);
        assert!(!req.var_pktlen);

        window.retransmit_remove_head();
        assert!(window.retransmit_is_empty());
    }

    #[test]
    fn parity_count_tracks_multiple_packets() {
        let mut window = fec_window();
        push_n(&mut window, 4, 32);

        // Two parity packets wanted.
        assert!(window.retransmit_push(Sqn::new(2), true)); // tg 0, count 2
        let first = window.retransmit_try_peek().unwrap();
        assert_eq!(first.sequence.pkt_sqn(2), 0);
        window.retransmit_remove_head();
        // Still queued: one more owed, h advanced.
        assert!(!window.retransmit_is_empty());
        let second = window.retransmit_try_peek().unwrap();
        assert_eq!(second.sequence.pkt_sqn(2), 1);
        assert_ne!(first.tsdu, second.tsdu);
        window.retransmit_remove_head();
        assert!(window.retransmit_is_empty());
    }

    #[test]
    fn parity_request_bumps_queued_count() {
        let mut window = fec_window();
        push_n(&mut window, 4, 32);

        assert!(window.retransmit_push(Sqn::new(1), true)); // 1 wanted
        assert!(!window.retransmit_push(Sqn::new(2), true)); // raise to 2
        window.retransmit_remove_head();
        assert!(!window.retransmit_is_empty(), "raised count keeps group queued");
        window.retransmit_remove_head();
        assert!(window.retransmit_is_empty());
    }

    #[test]
    fn parity_h_advances_across_rounds() {
        let mut window = fec_window();
        push_n(&mut window, 4, 32);

        window.retransmit_push(Sqn::new(1), true);
        let first = window.retransmit_try_peek().unwrap();
        window.retransmit_remove_head();

        // A later round for the same group gets the next parity index.
        window.retransmit_push(Sqn::new(1), true);
        let second = window.retransmit_try_peek().unwrap();
        window.retransmit_remove_head();
        assert_eq!(first.sequence.pkt_sqn(2), 0);
        assert_eq!(second.sequence.pkt_sqn(2), 1);
    }

    #[test]
    fn parity_var_pktlen_pads_once() {
        let mut window = fec_window();
        window.push(Bytes::from(vec![1u8; 20]), None, now());
        window.push(Bytes::from(vec![2u8; 32]), None, now());
        window.push(Bytes::from(vec![3u8; 7]), None, now());
        window.push(Bytes::from(vec![4u8; 32]), None, now());

        window.retransmit_push(Sqn::new(1), true);
        let req = window.retransmit_try_peek().unwrap();
        assert!(req.var_pktlen);
        // Block = longest TSDU + 2-byte length trailer.
        assert_eq!(req.tsdu.len(), 34);
        assert!(window.peek(Sqn::new(0)).unwrap().zero_padded());

        // Peeking again must not re-pad.
        let padded_before = window.peek(Sqn::new(0)).unwrap().padded_block.clone().unwrap();
        let _ = window.retransmit_try_peek().unwrap();
        let padded_after = window.peek(Sqn::new(0)).unwrap().padded_block.clone().unwrap();
        // Bytes clones share storage; identical pointer means no recompute.
        assert_eq!(padded_before.as_ptr(), padded_after.as_ptr());
    }

    #[test]
    fn parity_fragment_option_is_encoded() {
        let mut window = fec_window();
        let frag = OptFragment {
            first_sqn: Sqn::new(0),
            offset: 0,
            apdu_len: 128,
        };
        for i in 0..4u32 {
            window.push(
                Bytes::from(vec![i as u8; 32]),
                Some(OptFragment {
                    offset: i * 32,
                    ..frag
                }),
                now(),
            );
        }
        window.retransmit_push(Sqn::new(1), true);
        let req = window.retransmit_try_peek().unwrap();
        assert!(req.fragment.is_some(), "fragmented group parity carries OPT_FRAGMENT");
    }

    #[test]
    fn parity_for_incomplete_group_is_rejected() {
        let mut window = fec_window();
        push_n(&mut window, 2, 32); // half a group
        window.retransmit_push(Sqn::new(1), true);
        assert!(window.retransmit_try_peek().is_none());
    }
}
