// src/reorder.rs — RTP reorder engine.
//
// A power-of-two ring of `W` slots indexed by `seq & (W-1)`, with a
// `base_seq` draining loop and gap/overflow counters, keyed on the 16-bit
// RTP sequence space using RFC 1982 serial arithmetic.
use crate::pool::{MemRef, Pool};
use crate::util::serial16_diff;

pub const WINDOW_NO_FEC: usize = 32;
pub const WINDOW_WITH_FEC: usize = 512;
const INIT_COLLECT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Collecting,
    Active,
}

pub struct ReorderBuffer {
    window: usize,
    mask: u32,
    slots: Vec<Option<(u16, MemRef)>>,
    base_seq: u16,
    count: usize,
    phase: Phase,
    collecting: Vec<(u16, MemRef)>,
    head_wait_since_ms: Option<u64>,
    pub lost: u64,
    pub recovered: u64,
    pub late_dropped: u64,
    pub duplicates: u64,
}

#[derive(Default)]
pub struct InsertOutcome {
    pub delivered: Vec<MemRef>,
    pub dropped_late: bool,
    pub overflow_advanced: bool,
}

impl ReorderBuffer {
    pub fn new(window: usize) -> Self {
        assert!(window.is_power_of_two());
        Self {
            window,
            mask: (window - 1) as u32,
            slots: (0..window).map(|_| None).collect(),
            base_seq: 0,
            count: 0,
            phase: Phase::NotStarted,
            collecting: Vec::with_capacity(INIT_COLLECT),
            head_wait_since_ms: None,
            lost: 0,
            recovered: 0,
            late_dropped: 0,
            duplicates: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn base_seq(&self) -> u16 {
        self.base_seq
    }

    fn idx(&self, seq: u16) -> usize {
        (seq as u32 & self.mask) as usize
    }

    /// Inserts a newly-arrived RTP packet. During `Collecting`, packets are
    /// buffered without being delivered until `INIT_COLLECT` packets have
    /// arrived; `base_seq` is then bootstrapped from the minimum sequence
    /// seen (handles a slow first packet arriving after later ones).
    pub fn insert(&mut self, seq: u16, buf: MemRef, pool: &mut Pool) -> InsertOutcome {
        match self.phase {
            Phase::NotStarted => {
                self.phase = Phase::Collecting;
                self.collecting.push((seq, buf));
                InsertOutcome::default()
            }
            Phase::Collecting => {
                self.collecting.push((seq, buf));
                if self.collecting.len() >= INIT_COLLECT {
                    self.bootstrap_from_collected(pool)
                } else {
                    InsertOutcome::default()
                }
            }
            Phase::Active => self.insert_active(seq, buf, pool),
        }
    }

    fn bootstrap_from_collected(&mut self, pool: &mut Pool) -> InsertOutcome {
        let mut items = std::mem::take(&mut self.collecting);
        // Minimum by serial order: fold with serial16_diff rather than plain `<`.
        let min_seq = items
            .iter()
            .map(|(s, _)| *s)
            .reduce(|a, b| if serial16_diff(b, a) < 0 { b } else { a })
            .expect("collected at least one packet");
        self.base_seq = min_seq;
        self.phase = Phase::Active;
        let mut outcome = InsertOutcome::default();
        for (seq, buf) in items.drain(..) {
            let sub = self.insert_active(seq, buf, pool);
            outcome.delivered.extend(sub.delivered);
            outcome.dropped_late |= sub.dropped_late;
            outcome.overflow_advanced |= sub.overflow_advanced;
        }
        outcome
    }

    fn insert_active(&mut self, seq: u16, buf: MemRef, pool: &mut Pool) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        let d = serial16_diff(seq, self.base_seq);
        if d < 0 {
            self.late_dropped += 1;
            pool.ref_put(buf);
            outcome.dropped_late = true;
            return outcome;
        }
        if d as usize >= self.window {
            // Window-full overflow: advance base past the new packet minus
            // one window, releasing any still-occupied slots in between.
            let advance = d as usize - self.window + 1;
            self.advance_base_releasing(advance, pool);
            outcome.overflow_advanced = true;
        }
        let idx = self.idx(seq);
        match &self.slots[idx] {
            Some((stored_seq, _)) if *stored_seq == seq => {
                // Duplicate of an already-buffered packet.
                self.duplicates += 1;
                pool.ref_put(buf);
                return outcome;
            }
            Some((stored_seq, stored_buf)) => {
                // Stale entry from a prior window revolution; replace it.
                pool.ref_put(*stored_buf);
                self.slots[idx] = Some((seq, buf));
            }
            None => {
                self.slots[idx] = Some((seq, buf));
                self.count += 1;
            }
        }
        self.drain_contiguous(&mut outcome, pool);
        outcome
    }

    fn drain_contiguous(&mut self, outcome: &mut InsertOutcome, _pool: &mut Pool) {
        loop {
            let idx = self.idx(self.base_seq);
            match self.slots[idx].take() {
                Some((s, buf)) if s == self.base_seq => {
                    self.count -= 1;
                    outcome.delivered.push(buf);
                    self.base_seq = self.base_seq.wrapping_add(1);
                    self.head_wait_since_ms = None;
                }
                other => {
                    self.slots[idx] = other;
                    break;
                }
            }
        }
    }

    fn advance_base_releasing(&mut self, count: usize, pool: &mut Pool) {
        for _ in 0..count {
            let idx = self.idx(self.base_seq);
            if let Some((s, buf)) = self.slots[idx].take() {
                if s == self.base_seq {
                    self.count -= 1;
                }
                pool.ref_put(buf);
            }
            self.base_seq = self.base_seq.wrapping_add(1);
        }
        self.head_wait_since_ms = None;
    }

    /// Called on an idle tick. If the head of the window (`base_seq`) is
    /// still empty and has been for at least `reorder_wait_ms`, the caller
    /// should attempt FEC recovery for `base_seq`. Returns the gapped
    /// sequence to recover, or `None` if nothing is stuck.
    pub fn check_timeout(&mut self, now_ms: u64, reorder_wait_ms: u64) -> Option<u16> {
        if self.phase != Phase::Active {
            return None;
        }
        let idx = self.idx(self.base_seq);
        if self.slots[idx].is_some() {
            return None;
        }
        match self.head_wait_since_ms {
            None => {
                self.head_wait_since_ms = Some(now_ms);
                None
            }
            Some(since) if now_ms.saturating_sub(since) >= reorder_wait_ms => Some(self.base_seq),
            Some(_) => None,
        }
    }

    /// FEC recovered the payload for `seq` (must equal `base_seq`); insert
    /// it and drain as usual.
    pub fn fill_recovered(&mut self, seq: u16, buf: MemRef, pool: &mut Pool) -> Vec<MemRef> {
        debug_assert_eq!(seq, self.base_seq);
        self.recovered += 1;
        let mut outcome = InsertOutcome::default();
        let idx = self.idx(seq);
        self.slots[idx] = Some((seq, buf));
        self.count += 1;
        self.drain_contiguous(&mut outcome, pool);
        outcome.delivered
    }

    /// FEC (or the timeout path with FEC disabled) could not fill the gap:
    /// advance `base_seq` past it to keep the stream moving, counting a
    /// loss, and continue draining whatever else is now contiguous.
    pub fn skip_gap(&mut self, pool: &mut Pool) -> Vec<MemRef> {
        self.lost += 1;
        self.base_seq = self.base_seq.wrapping_add(1);
        self.head_wait_since_ms = None;
        let mut outcome = InsertOutcome::default();
        self.drain_contiguous(&mut outcome, pool);
        outcome.delivered
    }

    /// Fetch a currently-buffered RTP payload by sequence, for FEC recovery
    /// (which needs the surviving data packets in a group). Does not remove
    /// it from the ring.
    pub fn peek(&self, seq: u16) -> Option<MemRef> {
        let idx = self.idx(seq);
        match self.slots[idx] {
            Some((s, buf)) if s == seq => Some(buf),
            _ => None,
        }
    }

    pub fn release_range(&mut self, from: u16, to_inclusive: u16, pool: &mut Pool) {
        let mut s = from;
        loop {
            let idx = self.idx(s);
            if let Some((stored, buf)) = self.slots[idx] {
                if stored == s {
                    pool.ref_put(buf);
                    self.slots[idx] = None;
                    self.count -= 1;
                }
            }
            if s == to_inclusive {
                break;
            }
            s = s.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pool() -> Pool {
        Pool::new(64, 1024, 1024, 0, 0, 1024)
    }

    #[test]
    fn in_order_delivery_after_bootstrap() {
        let mut pool = new_pool();
        let mut rb = ReorderBuffer::new(WINDOW_NO_FEC);
        let mut delivered = Vec::new();
        for seq in 100u16..116 {
            let buf = pool.alloc().unwrap();
            let out = rb.insert(seq, buf, &mut pool);
            for d in out.delivered {
                delivered.push(d);
                pool.ref_put(d);
            }
        }
        assert_eq!(delivered.len(), 16 - 8); // first 8 collected, then delivered as they drain
        assert_eq!(rb.base_seq(), 108);
    }

    #[test]
    fn reordered_arrival_delivers_in_sequence() {
        let mut pool = new_pool();
        let mut rb = ReorderBuffer::new(WINDOW_NO_FEC);
        // Bootstrap with 8 in-order packets first.
        for seq in 200u16..208 {
            let buf = pool.alloc().unwrap();
            let out = rb.insert(seq, buf, &mut pool);
            for d in out.delivered {
                pool.ref_put(d);
            }
        }
        assert_eq!(rb.phase(), Phase::Active);
        assert_eq!(rb.base_seq(), 200);

        // Now feed out of order: 210, 209, then 208 fills a 2-gap.
        for seq in [210u16, 209, 208] {
            let buf = pool.alloc().unwrap();
            let out = rb.insert(seq, buf, &mut pool);
            for d in out.delivered {
                pool.ref_put(d);
            }
        }
        // 208 fill drains 208,209,210 contiguously.
        assert_eq!(rb.base_seq(), 211);
    }

    #[test]
    fn late_duplicate_is_dropped() {
        let mut pool = new_pool();
        let mut rb = ReorderBuffer::new(WINDOW_NO_FEC);
        for seq in 50u16..58 {
            let buf = pool.alloc().unwrap();
            let out = rb.insert(seq, buf, &mut pool);
            for d in out.delivered {
                pool.ref_put(d);
            }
        }
        let before_free = pool.num_free();
        let buf = pool.alloc().unwrap();
        let out = rb.insert(10, buf, &mut pool); // far in the past
        assert!(out.dropped_late);
        assert!(out.delivered.is_empty());
        assert_eq!(pool.num_free(), before_free, "alloc immediately released back");
    }

    #[test]
    fn timeout_then_skip_advances_base() {
        let mut pool = new_pool();
        let mut rb = ReorderBuffer::new(WINDOW_NO_FEC);
        for seq in 0u16..8 {
            let buf = pool.alloc().unwrap();
            let out = rb.insert(seq, buf, &mut pool);
            for d in out.delivered {
                pool.ref_put(d);
            }
        }
        let base = rb.base_seq();
        assert!(rb.check_timeout(0, 50).is_none()); // first observation just starts the clock
        assert_eq!(rb.check_timeout(100, 50), Some(base));
        let delivered = rb.skip_gap(&mut pool);
        assert_eq!(rb.base_seq(), base.wrapping_add(1));
        assert!(delivered.is_empty());
        assert_eq!(rb.lost, 1);
    }
}
