//! # Receive Window
//!
//! Per-peer circular buffer of inbound packets with the NAK state machine
//! threaded through it. Every tracked slot is in exactly one state:
//!
//! ```text
//!   Empty ──ODATA──▶ Received
//!     │
//!   gap detected
//!     ▼
//!  BackOff ──rb expiry──▶ WaitNcf ──NCF──▶ WaitData ──RDATA──▶ Received
//!     ▲                      │                  │
//!     └──────rpt expiry──────┘◀────rdata expiry─┘
//!                (retry budget exhausted ▶ Lost)
//! ```
//!
//! The three pending states each have an expiry queue threaded through the
//! slots by sequence number: new entries enter at the head, and because each
//! state's expiry formula is monotone in `now`, the tail is always the
//! earliest expiry — the timer only ever inspects queue tails.

use bytes::Bytes;
use quanta::Instant;
use std::collections::HashMap;

use crate::fec::{self, ReedSolomon};
use crate::skb::RxBuffer;
use crate::sqn::Sqn;
use crate::txw::{decode_fragment_block, encode_fragment_block};
use crate::wire::OptFragment;

// ─── Status Codes ───────────────────────────────────────────────────────────

/// Outcome of [`ReceiveWindow::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    /// Filled an existing placeholder inside the window.
    Inserted,
    /// Extended the lead by exactly one.
    Appended,
    /// Jumped past the lead: placeholders were created and NAK timers must
    /// be flushed promptly.
    Missing,
    Duplicate,
    Malformed,
    Bounds,
}

/// Outcome of [`ReceiveWindow::confirm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStatus {
    /// An existing pending slot moved to WaitData.
    Updated,
    /// The sqn was beyond the lead; placeholders were appended.
    Appended,
    NoOp,
}

// ─── Slot ───────────────────────────────────────────────────────────────────

/// NAK ladder state of a non-empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    BackOff,
    WaitNcf,
    WaitData,
    Received,
    Lost,
}

#[derive(Debug)]
struct Slot {
    sequence: Sqn,
    state: SlotState,
    buffer: Option<RxBuffer>,
    /// When the gap was first noticed, for fill/fail time accounting.
    missing_since: Instant,
    nak_rb_expiry: Instant,
    nak_rpt_expiry: Instant,
    nak_rdata_expiry: Instant,
    nak_transmit_count: u32,
    ncf_retry_count: u32,
    data_retry_count: u32,
    /// Intrusive expiry-queue links (toward head / toward tail).
    qprev: Option<Sqn>,
    qnext: Option<Sqn>,
}

impl Slot {
    fn placeholder(sequence: Sqn, now: Instant, rb_expiry: Instant) -> Self {
        Slot {
            sequence,
            state: SlotState::BackOff,
            buffer: None,
            missing_since: now,
            nak_rb_expiry: rb_expiry,
            nak_rpt_expiry: now,
            nak_rdata_expiry: now,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            qprev: None,
            qnext: None,
        }
    }

    fn received(buffer: RxBuffer, now: Instant) -> Self {
        Slot {
            sequence: buffer.sequence,
            state: SlotState::Received,
            buffer: Some(buffer),
            missing_since: now,
            nak_rb_expiry: now,
            nak_rpt_expiry: now,
            nak_rdata_expiry: now,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            qprev: None,
            qnext: None,
        }
    }

    fn expiry_for(&self, state: SlotState) -> Instant {
        match state {
            SlotState::BackOff => self.nak_rb_expiry,
            SlotState::WaitNcf => self.nak_rpt_expiry,
            SlotState::WaitData => self.nak_rdata_expiry,
            SlotState::Received | SlotState::Lost => self.nak_rb_expiry,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SlotQueue {
    head: Option<Sqn>,
    tail: Option<Sqn>,
    len: usize,
}

// ─── Delivered Data ─────────────────────────────────────────────────────────

/// One APDU handed to the reader: a vector of TSDU references, one per
/// fragment, in sqn order.
#[derive(Debug, Clone)]
pub struct Apdu {
    pub first_sqn: Sqn,
    pub fragments: Vec<Bytes>,
    /// Total byte length across fragments.
    pub len: usize,
    /// Any fragment arrived as RDATA or parity reconstruction.
    pub repair: bool,
}

// ─── Receive Window ─────────────────────────────────────────────────────────

pub struct ReceiveWindow {
    ring: Vec<Option<Slot>>,
    max_length: usize,
    /// Window defined once the first packet or SPM arrives.
    is_defined: bool,
    /// Highest tracked sqn.
    lead: Sqn,
    /// Lowest tracked sqn (slots below are freed).
    trail: Sqn,
    /// Next sqn to deliver to the reader.
    commit_lead: Sqn,
    /// Sender's advertised trail: data before this is unrecoverable.
    rxw_trail: Sqn,
    max_tsdu: usize,

    backoff_queue: SlotQueue,
    wait_ncf_queue: SlotQueue,
    wait_data_queue: SlotQueue,

    // FEC state, learned from OPT_PARITY_PRM.
    rs: Option<ReedSolomon>,
    tg_sqn_shift: u8,
    /// Parity blocks held per transmission-group lead sqn: `(h, buffer)`.
    parity: HashMap<u32, Vec<(u8, RxBuffer)>>,

    // Counters.
    pub cumulative_losses: u32,
    pub fragment_count: u32,
    pub min_fill_time: Option<std::time::Duration>,
    pub max_fill_time: Option<std::time::Duration>,
    pub min_fail_time: Option<std::time::Duration>,
    pub max_fail_time: Option<std::time::Duration>,
}

impl ReceiveWindow {
    pub fn new(capacity: usize, max_tsdu: usize) -> Self {
        assert!(capacity > 0, "receive window cannot be empty");
        ReceiveWindow {
            ring: (0..capacity).map(|_| None).collect(),
            max_length: capacity,
            is_defined: false,
            lead: Sqn::new(0),
            trail: Sqn::new(1),
            commit_lead: Sqn::new(1),
            rxw_trail: Sqn::new(1),
            max_tsdu,
            backoff_queue: SlotQueue::default(),
            wait_ncf_queue: SlotQueue::default(),
            wait_data_queue: SlotQueue::default(),
            rs: None,
            tg_sqn_shift: 0,
            parity: HashMap::new(),
            cumulative_losses: 0,
            fragment_count: 0,
            min_fill_time: None,
            max_fill_time: None,
            min_fail_time: None,
            max_fail_time: None,
        }
    }

    // ─── Geometry ───────────────────────────────────────────────────────

    pub fn is_empty(&self) -> bool {
        self.lead.next() == self.trail
    }

    pub fn len(&self) -> usize {
        self.lead.next().distance(self.trail) as usize
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn commit_lead(&self) -> Sqn {
        self.commit_lead
    }

    pub fn tg_sqn_shift(&self) -> u8 {
        self.tg_sqn_shift
    }

    pub fn has_ondemand_parity(&self) -> bool {
        self.rs.is_some()
    }

    /// Deliverable-but-unread backlog: contiguous Received slots at the
    /// commit lead. Peers with a backlog are not expired.
    pub fn committed_count(&self) -> usize {
        let mut count = 0;
        let mut sqn = self.commit_lead;
        while !sqn.after(self.lead) {
            match self.slot(sqn) {
                Some(slot) if slot.state == SlotState::Received => count += 1,
                _ => break,
            }
            sqn = sqn.next();
        }
        count
    }

    /// Configure (or reconfigure) FEC decode state from OPT_PARITY_PRM.
    pub fn set_fec(&mut self, n: u8, k: u8) {
        let shift = k.trailing_zeros() as u8;
        let reconfigure = match &self.rs {
            Some(rs) => rs.k() != k as usize || rs.n() != n as usize,
            None => true,
        };
        if reconfigure {
            self.rs = Some(ReedSolomon::new(n as usize, k as usize));
            self.tg_sqn_shift = shift;
            self.parity.clear();
        }
    }

    // ─── Slot Access ────────────────────────────────────────────────────

    fn index(&self, sequence: Sqn) -> usize {
        sequence.value() as usize % self.max_length
    }

    fn in_window(&self, sequence: Sqn) -> bool {
        !self.is_empty() && !sequence.before(self.trail) && !sequence.after(self.lead)
    }

    fn slot(&self, sequence: Sqn) -> Option<&Slot> {
        if !self.in_window(sequence) {
            return None;
        }
        let slot = self.ring[self.index(sequence)].as_ref();
        debug_assert!(slot.map_or(true, |s| s.sequence == sequence));
        slot
    }

    fn slot_mut(&mut self, sequence: Sqn) -> Option<&mut Slot> {
        if !self.in_window(sequence) {
            return None;
        }
        let index = self.index(sequence);
        self.ring[index].as_mut()
    }

    pub fn state_of(&self, sequence: Sqn) -> Option<SlotState> {
        self.slot(sequence).map(|s| s.state)
    }

    // ─── Queue Threading ────────────────────────────────────────────────

    fn queue_mut(&mut self, state: SlotState) -> &mut SlotQueue {
        match state {
            SlotState::BackOff => &mut self.backoff_queue,
            SlotState::WaitNcf => &mut self.wait_ncf_queue,
            SlotState::WaitData => &mut self.wait_data_queue,
            SlotState::Received | SlotState::Lost => unreachable!("terminal states have no queue"),
        }
    }

    fn queue_push_head(&mut self, state: SlotState, sequence: Sqn) {
        let old_head = self.queue_mut(state).head;
        {
            let slot = self.slot_mut(sequence).expect("slot exists");
            slot.qprev = None;
            slot.qnext = old_head;
        }
        if let Some(head) = old_head {
            self.slot_mut(head).expect("queued slot exists").qprev = Some(sequence);
        }
        let queue = self.queue_mut(state);
        queue.head = Some(sequence);
        if queue.tail.is_none() {
            queue.tail = Some(sequence);
        }
        queue.len += 1;
    }

    fn queue_unlink(&mut self, state: SlotState, sequence: Sqn) {
        let (qprev, qnext) = {
            let slot = self.slot_mut(sequence).expect("slot exists");
            let links = (slot.qprev, slot.qnext);
            slot.qprev = None;
            slot.qnext = None;
            links
        };
        match qprev {
            Some(prev) => self.slot_mut(prev).expect("queued slot exists").qnext = qnext,
            None => self.queue_mut(state).head = qnext,
        }
        match qnext {
            Some(next) => self.slot_mut(next).expect("queued slot exists").qprev = qprev,
            None => self.queue_mut(state).tail = qprev,
        }
        self.queue_mut(state).len -= 1;
    }

    /// Transition a slot between ladder states, maintaining the queue
    /// invariant that a slot is linked into at most one queue.
    fn set_state(&mut self, sequence: Sqn, new_state: SlotState) {
        let old_state = self.slot(sequence).expect("slot exists").state;
        if matches!(
            old_state,
            SlotState::BackOff | SlotState::WaitNcf | SlotState::WaitData
        ) {
            self.queue_unlink(old_state, sequence);
        }
        self.slot_mut(sequence).expect("slot exists").state = new_state;
        if matches!(
            new_state,
            SlotState::BackOff | SlotState::WaitNcf | SlotState::WaitData
        ) {
            self.queue_push_head(new_state, sequence);
        }
    }

    pub fn backoff_len(&self) -> usize {
        self.backoff_queue.len
    }

    pub fn wait_ncf_len(&self) -> usize {
        self.wait_ncf_queue.len
    }

    pub fn wait_data_len(&self) -> usize {
        self.wait_data_queue.len
    }

    /// Earliest pending expiry in the given state's queue (always the tail).
    pub fn queue_tail_expiry(&self, state: SlotState) -> Option<Instant> {
        let tail = match state {
            SlotState::BackOff => self.backoff_queue.tail,
            SlotState::WaitNcf => self.wait_ncf_queue.tail,
            SlotState::WaitData => self.wait_data_queue.tail,
            _ => None,
        }?;
        let slot = self.slot(tail)?;
        Some(slot.expiry_for(state))
    }

    /// Queue tail (earliest-expiry entry) if it has expired at `now`.
    pub fn expired_tail(&self, state: SlotState, now: Instant) -> Option<Sqn> {
        let tail = match state {
            SlotState::BackOff => self.backoff_queue.tail,
            SlotState::WaitNcf => self.wait_ncf_queue.tail,
            SlotState::WaitData => self.wait_data_queue.tail,
            _ => None,
        }?;
        let slot = self.slot(tail)?;
        if slot.expiry_for(state) <= now {
            Some(tail)
        } else {
            None
        }
    }

    /// Unified earliest NAK expiry across the three queues.
    pub fn next_nak_expiry(&self) -> Option<Instant> {
        [
            self.queue_tail_expiry(SlotState::BackOff),
            self.queue_tail_expiry(SlotState::WaitNcf),
            self.queue_tail_expiry(SlotState::WaitData),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ─── Ladder Transitions (driven by the receiver engine) ─────────────

    /// BackOff → WaitNcf after the first NAK goes out.
    pub fn nak_sent(&mut self, sequence: Sqn, rpt_expiry: Instant) {
        debug_assert_eq!(self.state_of(sequence), Some(SlotState::BackOff));
        {
            let slot = self.slot_mut(sequence).expect("slot exists");
            slot.nak_rpt_expiry = rpt_expiry;
            slot.nak_transmit_count += 1;
        }
        self.set_state(sequence, SlotState::WaitNcf);
    }

    /// BackOff/WaitNcf → WaitData on NCF (or a suppressing peer NAK).
    pub fn confirm(
        &mut self,
        sequence: Sqn,
        now: Instant,
        rdata_expiry: Instant,
        rb_expiry: Instant,
    ) -> ConfirmStatus {
        if !self.is_defined || sequence.before(self.commit_lead) {
            return ConfirmStatus::NoOp;
        }
        if sequence.after(self.lead) {
            // The source confirmed data we have not even seen: treat like a
            // detected gap so RDATA has somewhere to land.
            if self.grow_lead(sequence, now, rb_expiry).is_err() {
                return ConfirmStatus::NoOp;
            }
            let slot = self.slot_mut(sequence).expect("just appended");
            slot.nak_rdata_expiry = rdata_expiry;
            self.set_state(sequence, SlotState::WaitData);
            return ConfirmStatus::Appended;
        }
        match self.state_of(sequence) {
            Some(SlotState::BackOff) | Some(SlotState::WaitNcf) => {
                let slot = self.slot_mut(sequence).expect("slot exists");
                slot.nak_rdata_expiry = rdata_expiry;
                self.set_state(sequence, SlotState::WaitData);
                ConfirmStatus::Updated
            }
            _ => ConfirmStatus::NoOp,
        }
    }

    /// WaitNcf → BackOff when the NCF never arrived; the engine draws a
    /// fresh randomized back-off. Returns the new retry count.
    pub fn retry_ncf(&mut self, sequence: Sqn, rb_expiry: Instant) -> u32 {
        let count = {
            let slot = self.slot_mut(sequence).expect("slot exists");
            slot.ncf_retry_count += 1;
            slot.nak_rb_expiry = rb_expiry;
            slot.ncf_retry_count
        };
        self.set_state(sequence, SlotState::BackOff);
        count
    }

    /// WaitData → BackOff when the RDATA never arrived. Returns the new
    /// retry count.
    pub fn retry_data(&mut self, sequence: Sqn, rb_expiry: Instant) -> u32 {
        let count = {
            let slot = self.slot_mut(sequence).expect("slot exists");
            slot.data_retry_count += 1;
            slot.nak_rb_expiry = rb_expiry;
            slot.data_retry_count
        };
        self.set_state(sequence, SlotState::BackOff);
        count
    }

    /// Give up on a slot. The retry budget was exhausted, the peer has no
    /// path for a NAK, or the sender's trail moved past it.
    pub fn mark_lost(&mut self, sequence: Sqn, now: Instant) {
        let Some(slot) = self.slot(sequence) else {
            return;
        };
        if matches!(slot.state, SlotState::Received | SlotState::Lost) {
            return;
        }
        let fail = now.saturating_duration_since(slot.missing_since);
        self.min_fail_time = Some(self.min_fail_time.map_or(fail, |d| d.min(fail)));
        self.max_fail_time = Some(self.max_fail_time.map_or(fail, |d| d.max(fail)));
        self.set_state(sequence, SlotState::Lost);
        self.cumulative_losses += 1;
    }

    pub fn nak_transmit_count(&self, sequence: Sqn) -> u32 {
        self.slot(sequence).map_or(0, |s| s.nak_transmit_count)
    }

    // ─── Window Updates ─────────────────────────────────────────────────

    /// Learn the sender's window edges from an SPM (or data trail). Newly
    /// implied gaps become BackOff placeholders; data falling behind the
    /// sender's trail becomes Lost. Returns the number of new placeholders.
    pub fn update(
        &mut self,
        txw_lead: Sqn,
        txw_trail: Sqn,
        now: Instant,
        rb_expiry: Instant,
    ) -> usize {
        if !self.is_defined {
            self.define(txw_lead.next());
            self.rxw_trail = txw_trail;
            return 0;
        }

        self.advance_trail(txw_trail, now);

        let mut new_naks = 0;
        if txw_lead.after(self.lead) {
            let prior = self.lead;
            if self.grow_lead(txw_lead, now, rb_expiry).is_ok() {
                new_naks = txw_lead.distance(prior) as usize;
            }
        }
        new_naks
    }

    /// Learn the sender's trail from a data packet's trail field. Pending
    /// slots below it can never be repaired and become Lost.
    pub fn advance_trail(&mut self, txw_trail: Sqn, now: Instant) {
        if !self.is_defined {
            return;
        }
        self.advance_trail_inner(txw_trail, now);
    }

    fn advance_trail_inner(&mut self, txw_trail: Sqn, now: Instant) {
        if !txw_trail.after(self.rxw_trail) {
            return;
        }
        self.rxw_trail = txw_trail;
        // Pending slots below the sender's trail can never be repaired.
        let mut sqn = self.trail;
        while !sqn.after(self.lead) && sqn.before(txw_trail) {
            if let Some(state) = self.state_of(sqn) {
                if matches!(
                    state,
                    SlotState::BackOff | SlotState::WaitNcf | SlotState::WaitData
                ) {
                    self.mark_lost(sqn, now);
                }
            }
            sqn = sqn.next();
        }
    }

    fn define(&mut self, next: Sqn) {
        self.is_defined = true;
        self.lead = next.prev();
        self.trail = next;
        self.commit_lead = next;
        self.rxw_trail = next;
    }

    /// Extend the lead to `target`, creating a BackOff placeholder for every
    /// new sqn up to and including `target`. Fails when the jump exceeds the
    /// window capacity.
    fn grow_lead(&mut self, target: Sqn, now: Instant, rb_expiry: Instant) -> Result<(), ()> {
        let added = target.distance(self.lead);
        if added as usize > self.max_length {
            return Err(());
        }
        // Make room: evict delivered/trailing slots as the lead advances.
        while self.len() + added as usize > self.max_length {
            self.evict_trail(now);
        }
        while self.lead != target {
            self.lead = self.lead.next();
            let index = self.index(self.lead);
            debug_assert!(self.ring[index].is_none(), "stale slot in ring");
            self.ring[index] = Some(Slot::placeholder(self.lead, now, rb_expiry));
            self.queue_push_head(SlotState::BackOff, self.lead);
        }
        Ok(())
    }

    fn evict_trail(&mut self, now: Instant) {
        debug_assert!(!self.is_empty());
        let sequence = self.trail;
        if let Some(state) = self.state_of(sequence) {
            match state {
                SlotState::BackOff | SlotState::WaitNcf | SlotState::WaitData => {
                    // Forced out while still unrepaired.
                    self.mark_lost(sequence, now);
                }
                SlotState::Received if !sequence.before(self.commit_lead) => {
                    // Undelivered data squeezed out by a window jump.
                    self.cumulative_losses += 1;
                }
                _ => {}
            }
        }
        let index = self.index(sequence);
        self.ring[index] = None;
        self.trail = self.trail.next();
        if self.commit_lead.before(self.trail) {
            self.commit_lead = self.trail;
        }
    }

    /// Abandon the current window and restart coverage at `floor`: used when
    /// fresh data jumps further than the window can span. Everything tracked
    /// or skipped is accounted as loss.
    fn slide_to(&mut self, floor: Sqn, now: Instant) {
        while !self.is_empty() {
            self.evict_trail(now);
        }
        let unseen = floor.distance(self.lead.next());
        self.cumulative_losses += unseen;
        self.define(floor);
    }

    // ─── Packet Insertion ───────────────────────────────────────────────

    /// Insert an ODATA/RDATA buffer.
    pub fn add(&mut self, buffer: RxBuffer, now: Instant, rb_expiry: Instant) -> AddStatus {
        let sequence = buffer.sequence;

        if !self.is_defined {
            self.define(sequence);
        }

        if sequence.before(self.commit_lead) {
            return AddStatus::Duplicate;
        }
        // Bounded by the recovery horizon: one window span past whichever
        // trail is fresher, ours or the sender's advertised one.
        let horizon_base = if self.rxw_trail.after(self.trail) {
            self.rxw_trail
        } else {
            self.trail
        };
        let horizon = horizon_base + self.max_length as u32;
        if !sequence.before(horizon) && sequence.after(self.lead) {
            return AddStatus::Bounds;
        }

        if buffer.fragment.is_some() {
            self.fragment_count += 1;
        }

        if !sequence.after(self.lead) {
            // Inside the window: fill a placeholder (or resurrect Lost).
            let state = match self.state_of(sequence) {
                Some(state) => state,
                None => return AddStatus::Bounds,
            };
            match state {
                SlotState::Received => AddStatus::Duplicate,
                SlotState::Lost => {
                    // Late repair for an abandoned slot: take it anyway.
                    self.fill(sequence, buffer, now);
                    self.cumulative_losses = self.cumulative_losses.saturating_sub(1);
                    AddStatus::Inserted
                }
                _ => {
                    self.fill(sequence, buffer, now);
                    AddStatus::Inserted
                }
            }
        } else if sequence == self.lead.next() {
            if self.grow_lead_with(buffer, now).is_err() {
                return AddStatus::Bounds;
            }
            AddStatus::Appended
        } else {
            // Jumped past the lead: everything between is now known missing.
            if sequence.distance(self.lead) as usize > self.max_length {
                // The jump exceeds the window span; restart coverage at the
                // recovery floor (nothing below the sender's trail is
                // repairable anyway).
                let min_floor = sequence - (self.max_length as u32 - 1);
                let floor = if self.rxw_trail.after(min_floor) {
                    self.rxw_trail
                } else {
                    min_floor
                };
                self.slide_to(floor, now);
            }
            if self.grow_lead(sequence.prev(), now, rb_expiry).is_err() {
                return AddStatus::Bounds;
            }
            if self.grow_lead_with(buffer, now).is_err() {
                return AddStatus::Bounds;
            }
            AddStatus::Missing
        }
    }

    fn grow_lead_with(&mut self, buffer: RxBuffer, now: Instant) -> Result<(), ()> {
        if self.len() + 1 > self.max_length {
            self.evict_trail(now);
        }
        self.lead = self.lead.next();
        debug_assert_eq!(self.lead, buffer.sequence);
        let index = self.index(self.lead);
        debug_assert!(self.ring[index].is_none(), "stale slot in ring");
        self.ring[index] = Some(Slot::received(buffer, now));
        Ok(())
    }

    fn fill(&mut self, sequence: Sqn, buffer: RxBuffer, now: Instant) {
        let fill = {
            let slot = self.slot(sequence).expect("slot exists");
            now.saturating_duration_since(slot.missing_since)
        };
        self.min_fill_time = Some(self.min_fill_time.map_or(fill, |d| d.min(fill)));
        self.max_fill_time = Some(self.max_fill_time.map_or(fill, |d| d.max(fill)));
        self.set_state(sequence, SlotState::Received);
        self.slot_mut(sequence).expect("slot exists").buffer = Some(buffer);
    }

    // ─── Parity ─────────────────────────────────────────────────────────

    /// Insert a parity RDATA block (`h` in the sqn's low bits) and attempt
    /// reconstruction of its transmission group. Returns the sqns recovered.
    pub fn add_parity(
        &mut self,
        buffer: RxBuffer,
        var_pktlen: bool,
        now: Instant,
    ) -> Vec<Sqn> {
        if self.rs.is_none() || !self.is_defined {
            return Vec::new();
        }
        let shift = self.tg_sqn_shift;
        let tg_sqn = buffer.sequence.tg_sqn(shift);
        let h = buffer.sequence.pkt_sqn(shift) as u8;

        let entry = self.parity.entry(tg_sqn.value()).or_default();
        if entry.iter().any(|(held, _)| *held == h) {
            return Vec::new();
        }
        entry.push((h, buffer));
        self.try_reconstruct(tg_sqn, var_pktlen, now)
    }

    fn try_reconstruct(&mut self, tg_sqn: Sqn, var_pktlen: bool, now: Instant) -> Vec<Sqn> {
        let rs = self.rs.as_ref().expect("fec configured");
        let k = rs.k();
        let group_tail = tg_sqn + (k as u32 - 1);
        if tg_sqn.before(self.commit_lead) || group_tail.after(self.lead) {
            return Vec::new();
        }

        let missing: Vec<Sqn> = (0..k as u32)
            .map(|i| tg_sqn + i)
            .filter(|&sqn| self.state_of(sqn) != Some(SlotState::Received))
            .collect();
        if missing.is_empty() {
            self.parity.remove(&tg_sqn.value());
            return Vec::new();
        }
        let held = self.parity.get(&tg_sqn.value()).map_or(0, |v| v.len());
        if held < missing.len() {
            return Vec::new();
        }

        let mut parity_blocks = self.parity.remove(&tg_sqn.value()).expect("checked above");
        let block_len = parity_blocks.iter().map(|(_, b)| b.tsdu.len()).max().expect("non-empty");
        // A block shorter than the group's is truncated junk; drop it.
        parity_blocks.retain(|(_, b)| b.tsdu.len() == block_len);
        if parity_blocks.len() < missing.len() {
            self.parity.insert(tg_sqn.value(), parity_blocks);
            return Vec::new();
        }

        // Assemble the original shards, padding receiver-side exactly as the
        // sender padded for encoding.
        let mut shards: Vec<Option<Vec<u8>>> = (0..k as u32)
            .map(|i| {
                let sqn = tg_sqn + i;
                if self.state_of(sqn) != Some(SlotState::Received) {
                    return None;
                }
                let tsdu = &self.slot(sqn).expect("received").buffer.as_ref().expect("buffer").tsdu;
                if var_pktlen {
                    Some(fec::pad_var_pktlen(tsdu, block_len))
                } else {
                    let mut block = vec![0u8; block_len];
                    let copy = tsdu.len().min(block_len);
                    block[..copy].copy_from_slice(&tsdu[..copy]);
                    Some(block)
                }
            })
            .collect();
        let parity_refs: Vec<(usize, &[u8])> = parity_blocks
            .iter()
            .map(|(h, buf)| (*h as usize, buf.tsdu.as_ref()))
            .collect();

        let rs = self.rs.as_ref().expect("fec configured");
        if !rs.reconstruct(&mut shards, &parity_refs, block_len) {
            return Vec::new();
        }

        // Fragment metadata travels RS-encoded on parity packets; rebuild the
        // missing originals' options the same way when present.
        let has_fragment = parity_blocks.iter().any(|(_, buf)| buf.fragment.is_some());
        let recovered_fragments: Option<Vec<Option<OptFragment>>> = if has_fragment {
            let mut frag_shards: Vec<Option<Vec<u8>>> = (0..k as u32)
                .map(|i| {
                    let sqn = tg_sqn + i;
                    if self.state_of(sqn) != Some(SlotState::Received) {
                        return None;
                    }
                    let frag = self.slot(sqn).expect("received").buffer.as_ref().expect("buffer").fragment;
                    Some(encode_fragment_block(frag).to_vec())
                })
                .collect();
            let frag_parity: Vec<(usize, Vec<u8>)> = parity_blocks
                .iter()
                .map(|(h, buf)| (*h as usize, encode_fragment_block(buf.fragment).to_vec()))
                .collect();
            let frag_refs: Vec<(usize, &[u8])> = frag_parity
                .iter()
                .map(|(h, block)| (*h, block.as_slice()))
                .collect();
            if rs.reconstruct(&mut frag_shards, &frag_refs, 12) {
                Some(
                    frag_shards
                        .into_iter()
                        .map(|block| {
                            let block = block.expect("reconstructed");
                            if block.iter().all(|&b| b == 0) {
                                None
                            } else {
                                Some(decode_fragment_block(&block))
                            }
                        })
                        .collect(),
                )
            } else {
                None
            }
        } else {
            None
        };

        let tsi = parity_blocks[0].1.tsi;
        let mut recovered = Vec::with_capacity(missing.len());
        for &sqn in &missing {
            let offset = sqn.distance(tg_sqn) as usize;
            let block = shards[offset].take().expect("reconstructed");
            let tsdu = if var_pktlen {
                let len = match fec::unpad_var_pktlen(&block) {
                    Some(len) => len,
                    None => continue,
                };
                Bytes::from(block).slice(..len)
            } else {
                Bytes::from(block)
            };
            let fragment = recovered_fragments
                .as_ref()
                .and_then(|frags| frags[offset]);
            let buffer = RxBuffer::new(tsi, sqn, tsdu, now)
                .with_fragment(fragment)
                .as_repair();
            self.fill(sqn, buffer, now);
            recovered.push(sqn);
        }
        recovered
    }

    /// Count of originals not yet Received in the transmission group,
    /// for sizing a parity NAK.
    pub fn missing_in_tg(&self, tg_sqn: Sqn) -> u32 {
        let Some(rs) = &self.rs else {
            return 0;
        };
        (0..rs.k() as u32)
            .map(|i| tg_sqn + i)
            .filter(|&sqn| {
                self.in_window(sqn) && self.state_of(sqn) != Some(SlotState::Received)
            })
            .count() as u32
    }

    // ─── Delivery ───────────────────────────────────────────────────────

    /// Read deliverable APDUs in sequence order, up to `max_apdus`,
    /// advancing the commit lead and freeing delivered slots. Lost slots at
    /// the commit lead are skipped (their loss was already accounted).
    pub fn read(&mut self, max_apdus: usize) -> Vec<Apdu> {
        let mut apdus = Vec::new();
        while apdus.len() < max_apdus {
            // Skip over abandoned data and orphaned fragment tails.
            loop {
                match self.state_of(self.commit_lead) {
                    Some(SlotState::Lost) => {
                        self.commit_lead = self.commit_lead.next();
                    }
                    Some(SlotState::Received) if self.is_orphan_fragment(self.commit_lead) => {
                        self.cumulative_losses += 1;
                        self.commit_lead = self.commit_lead.next();
                    }
                    _ => break,
                }
            }
            let Some(apdu) = self.assemble_apdu() else {
                break;
            };
            let next = apdu.first_sqn + apdu.fragments.len() as u32;
            self.commit_lead = next;
            apdus.push(apdu);
        }
        // Release everything delivered.
        while self.trail.before(self.commit_lead) && !self.is_empty() {
            let index = self.index(self.trail);
            self.ring[index] = None;
            self.trail = self.trail.next();
        }
        apdus
    }

    /// A Received fragment whose APDU head is already gone: undeliverable.
    fn is_orphan_fragment(&self, sequence: Sqn) -> bool {
        let Some(slot) = self.slot(sequence) else {
            return false;
        };
        let Some(buffer) = slot.buffer.as_ref() else {
            return false;
        };
        matches!(buffer.fragment, Some(frag) if frag.first_sqn != sequence)
    }

    fn assemble_apdu(&mut self) -> Option<Apdu> {
        let first = self.commit_lead;
        let slot = self.slot(first)?;
        if slot.state != SlotState::Received {
            return None;
        }
        let buffer = slot.buffer.as_ref().expect("received slot has data");

        let Some(frag) = buffer.fragment else {
            // Unfragmented: a single-TSDU APDU.
            return Some(Apdu {
                first_sqn: first,
                len: buffer.tsdu.len(),
                repair: buffer.repair,
                fragments: vec![buffer.tsdu.clone()],
            });
        };
        debug_assert_eq!(frag.first_sqn, first, "orphans skipped before assembly");

        let apdu_len = frag.apdu_len as usize;
        if apdu_len == 0 {
            // Degenerate fragment option from a broken sender: deliver the
            // slot standalone so the commit lead keeps moving.
            return Some(Apdu {
                first_sqn: first,
                len: buffer.tsdu.len(),
                repair: buffer.repair,
                fragments: vec![buffer.tsdu.clone()],
            });
        }
        let mut fragments = Vec::new();
        let mut total = 0usize;
        let mut repair = false;
        let mut sqn = first;
        while total < apdu_len {
            let slot = self.slot(sqn)?;
            if slot.state != SlotState::Received {
                return None; // gap inside the APDU, wait
            }
            let buffer = slot.buffer.as_ref().expect("received slot has data");
            match buffer.fragment {
                Some(f) if f.first_sqn == first && f.offset as usize == total => {}
                _ => return None, // inconsistent chain, wait for repair
            }
            total += buffer.tsdu.len();
            repair |= buffer.repair;
            fragments.push(buffer.tsdu.clone());
            sqn = sqn.next();
            if fragments.len() > self.max_length {
                return None;
            }
        }
        if total != apdu_len {
            return None;
        }
        Some(Apdu {
            first_sqn: first,
            fragments,
            len: total,
            repair,
        })
    }

    /// Whether an in-order APDU is ready for the reader.
    pub fn has_deliverable(&self) -> bool {
        let mut sqn = self.commit_lead;
        while self.state_of(sqn) == Some(SlotState::Lost) {
            sqn = sqn.next();
        }
        let Some(slot) = self.slot(sqn) else {
            return false;
        };
        if slot.state != SlotState::Received {
            return false;
        }
        let buffer = slot.buffer.as_ref().expect("received slot has data");
        match buffer.fragment {
            None => true,
            Some(frag) => {
                if frag.first_sqn != sqn {
                    return true; // will resolve to a skip-and-retry in read()
                }
                let mut total = 0usize;
                let mut cursor = sqn;
                while total < frag.apdu_len as usize {
                    match self.slot(cursor) {
                        Some(s) if s.state == SlotState::Received => {
                            total += s.buffer.as_ref().expect("buffer").tsdu.len();
                        }
                        _ => return false,
                    }
                    cursor = cursor.next();
                }
                true
            }
        }
    }

    pub fn max_tsdu(&self) -> usize {
        self.max_tsdu
    }
}
