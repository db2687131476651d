// src/fec.rs — Reed–Solomon erasure FEC engine.
//
// Groups are keyed by their (begin, end) RTP sequence range and resolved
// locally against cached FEC parity rather than a replay service. Erasure
// decode itself is delegated to `reed_solomon_erasure`, lazily cached per
// (k, m) rather than pre-sized for every combination up front.
use crate::pool::{MemRef, Pool};
use crate::util::serial16_diff;
use hashbrown::HashMap;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::rc::Rc;

/// Fixed trailer following the RTP header on an FEC multicast packet.
pub const FEC_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct FecHeader {
    pub rtp_begin_seq: u16,
    pub rtp_end_seq: u16,
    pub redund_num: u8,
    pub redund_idx: u8,
    pub fec_len: u16,
    pub rtp_len: u16,
}

impl FecHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FEC_HEADER_LEN {
            return None;
        }
        Some(Self {
            rtp_begin_seq: u16::from_be_bytes([buf[0], buf[1]]),
            rtp_end_seq: u16::from_be_bytes([buf[2], buf[3]]),
            redund_num: buf[4],
            redund_idx: buf[5],
            fec_len: u16::from_be_bytes([buf[6], buf[7]]),
            rtp_len: u16::from_be_bytes([buf[8], buf[9]]),
        })
    }
}

fn group_k(begin: u16, end: u16) -> usize {
    (serial16_diff(end, begin) as usize) + 1
}

struct Group {
    begin: u16,
    end: u16,
    k: usize,
    m: usize,
    rtp_len: u16,
    fec_len: u16,
    parity: Vec<Option<MemRef>>,
    fec_received: usize,
    created_at_ms: u64,
}

impl Group {
    fn min_end_seq_key(&self) -> u16 {
        self.end
    }
}

/// Lazily-built Reed–Solomon codec cache keyed by (k, m); constructing one
/// allocates internal Vandermonde-derived tables so it's worth reusing
/// across groups that share shape (the common case: one FEC stream has a
/// fixed k/m for its lifetime).
#[derive(Default)]
struct CodecCache {
    codecs: HashMap<(usize, usize), Rc<ReedSolomon>>,
}

impl CodecCache {
    fn get(&mut self, k: usize, m: usize) -> Option<Rc<ReedSolomon>> {
        if let Some(c) = self.codecs.get(&(k, m)) {
            return Some(c.clone());
        }
        let rs = ReedSolomon::new(k, m).ok()?;
        let rc = Rc::new(rs);
        self.codecs.insert((k, m), rc.clone());
        Some(rc)
    }
}

pub struct FecContext {
    max_groups: usize,
    groups: Vec<Group>,
    codecs: CodecCache,
    pub fec_received_total: u64,
    pub lost: u64,
    pub recovered: u64,
}

/// A group evicted to make room for a newer one; the reorder engine must
/// release any RTP buffers it still holds in `[begin, end]` since FEC can no
/// longer recover them.
pub struct EvictedRange {
    pub begin: u16,
    pub end: u16,
}

impl FecContext {
    pub fn new(max_groups: usize) -> Self {
        Self {
            max_groups,
            groups: Vec::with_capacity(max_groups),
            codecs: CodecCache::default(),
            fec_received_total: 0,
            lost: 0,
            recovered: 0,
        }
    }

    fn find_group_idx(&self, begin: u16, end: u16) -> Option<usize> {
        self.groups.iter().position(|g| g.begin == begin && g.end == end)
    }

    /// Ingests an FEC parity packet, allocating its group on first sight.
    /// Returns an evicted range if making room required dropping the
    /// oldest group.
    pub fn on_fec_packet(
        &mut self,
        hdr: &FecHeader,
        parity_buf: MemRef,
        pool: &mut Pool,
        now_ms: u64,
    ) -> Option<EvictedRange> {
        self.fec_received_total += 1;
        let mut evicted = None;
        let idx = match self.find_group_idx(hdr.rtp_begin_seq, hdr.rtp_end_seq) {
            Some(i) => i,
            None => {
                if self.groups.len() >= self.max_groups {
                    evicted = self.evict_oldest(pool);
                }
                let k = group_k(hdr.rtp_begin_seq, hdr.rtp_end_seq);
                let m = hdr.redund_num as usize;
                self.groups.push(Group {
                    begin: hdr.rtp_begin_seq,
                    end: hdr.rtp_end_seq,
                    k,
                    m,
                    rtp_len: hdr.rtp_len,
                    fec_len: hdr.fec_len,
                    parity: vec![None; m.max(1)],
                    fec_received: 0,
                    created_at_ms: now_ms,
                });
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[idx];
        let slot = hdr.redund_idx as usize;
        if slot < group.parity.len() {
            if let Some(old) = group.parity[slot].replace(parity_buf) {
                pool.ref_put(old);
            } else {
                group.fec_received += 1;
            }
        } else {
            pool.ref_put(parity_buf);
        }
        evicted
    }

    fn evict_oldest(&mut self, pool: &mut Pool) -> Option<EvictedRange> {
        if self.groups.is_empty() {
            return None;
        }
        let (oldest_idx, _) = self
            .groups
            .iter()
            .enumerate()
            .min_by_key(|(_, g)| g.created_at_ms)?;
        let group = self.groups.remove(oldest_idx);
        for slot in group.parity.into_iter().flatten() {
            pool.ref_put(slot);
        }
        Some(EvictedRange {
            begin: group.begin,
            end: group.end,
        })
    }

    /// Drops groups whose range has fully passed the reorder window's
    /// current base, to bound memory.
    pub fn release_expired_groups(&mut self, reorder_base_seq: u16, pool: &mut Pool) {
        let mut i = 0;
        while i < self.groups.len() {
            if serial16_diff(self.groups[i].min_end_seq_key(), reorder_base_seq) < 0 {
                let group = self.groups.remove(i);
                for slot in group.parity.into_iter().flatten() {
                    pool.ref_put(slot);
                }
                continue;
            }
            i += 1;
        }
    }

    /// Attempts to recover the payload at sequence `seq` using whichever
    /// group covers it. `fetch_rtp` supplies already-buffered RTP data
    /// packets (from the reorder ring) by sequence; returns `None` for
    /// ones not currently held (treated as erased).
    pub fn try_recover(
        &mut self,
        seq: u16,
        pool: &mut Pool,
        fetch_rtp: impl Fn(u16) -> Option<MemRef>,
    ) -> Option<MemRef> {
        let idx = self.groups.iter().position(|g| {
            serial16_diff(seq, g.begin) >= 0 && serial16_diff(g.end, seq) >= 0
        })?;
        let (k, m, begin, rtp_len) = {
            let g = &self.groups[idx];
            (g.k, g.m, g.begin, g.rtp_len as usize)
        };
        let data_received: usize = (0..k)
            .filter(|i| fetch_rtp(begin.wrapping_add(*i as u16)).is_some())
            .count();
        let fec_received = self.groups[idx].fec_received;
        if data_received + fec_received < k {
            return None;
        }
        let codec = self.codecs.get(k, m)?;

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(k + m);
        let mut present = vec![false; k + m];
        for i in 0..k {
            let s = begin.wrapping_add(i as u16);
            match fetch_rtp(s) {
                Some(mr) => {
                    let mut shard = vec![0u8; rtp_len];
                    let payload = pool.payload(mr);
                    let n = payload.len().min(rtp_len);
                    shard[..n].copy_from_slice(&payload[..n]);
                    present[i] = true;
                    shards.push(shard);
                }
                None => shards.push(vec![0u8; rtp_len]),
            }
        }
        for j in 0..m {
            match self.groups[idx].parity[j] {
                Some(mr) => {
                    let mut shard = vec![0u8; rtp_len];
                    let payload = pool.payload(mr);
                    let n = payload.len().min(rtp_len);
                    shard[..n].copy_from_slice(&payload[..n]);
                    present[k + j] = true;
                    shards.push(shard);
                }
                None => shards.push(vec![0u8; rtp_len]),
            }
        }

        let mut shard_opts: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for (i, p) in present.iter().enumerate() {
            if !p {
                shard_opts[i] = None;
            }
        }
        if codec.reconstruct(&mut shard_opts).is_err() {
            return None;
        }

        let want_idx = serial16_diff(seq, begin) as usize;
        let recovered_shard = shard_opts[want_idx].take()?;
        let out = pool.alloc()?;
        {
            let storage = pool.storage_mut(out);
            let n = recovered_shard.len().min(storage.len());
            storage[..n].copy_from_slice(&recovered_shard[..n]);
        }
        pool.set_data_off(out, 0);
        pool.set_data_len(out, recovered_shard.len() as u32);
        self.recovered += 1;
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pool() -> Pool {
        Pool::new(256, 64, 256, 0, 0, 256)
    }

    fn make_fec_header(begin: u16, end: u16, m: u8, idx: u8, rtp_len: u16) -> FecHeader {
        FecHeader {
            rtp_begin_seq: begin,
            rtp_end_seq: end,
            redund_num: m,
            redund_idx: idx,
            fec_len: rtp_len,
            rtp_len,
        }
    }

    #[test]
    fn group_k_counts_inclusive_range() {
        assert_eq!(group_k(200, 209), 10);
        assert_eq!(group_k(5, 5), 1);
    }

    #[test]
    fn recovers_single_erasure_with_xor_parity() {
        // k=2, m=1 so the single parity shard is a plain byte-wise XOR,
        // independent of the Reed-Solomon field internals.
        let mut pool = new_pool();
        let mut fec = FecContext::new(16);

        let d0 = pool.alloc().unwrap();
        pool.storage_mut(d0)[..4].copy_from_slice(&[1, 2, 3, 4]);
        pool.set_data_len(d0, 4);
        let d1 = pool.alloc().unwrap();
        pool.storage_mut(d1)[..4].copy_from_slice(&[5, 6, 7, 8]);
        pool.set_data_len(d1, 4);

        let parity = pool.alloc().unwrap();
        {
            let a = pool.payload(d0).to_vec();
            let b = pool.payload(d1).to_vec();
            let xor: Vec<u8> = a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect();
            pool.storage_mut(parity)[..4].copy_from_slice(&xor);
        }
        pool.set_data_len(parity, 4);

        let hdr = make_fec_header(100, 101, 1, 0, 4);
        fec.on_fec_packet(&hdr, parity, &mut pool, 0);

        // seq 101 missing, 100 present.
        let data_store: HashMap<u16, MemRef> = [(100u16, d0)].into_iter().collect();
        let recovered = fec.try_recover(101, &mut pool, |s| data_store.get(&s).copied());
        assert!(recovered.is_some());
        let rec = recovered.unwrap();
        assert_eq!(pool.payload(rec), &[5, 6, 7, 8]);
        assert_eq!(fec.recovered, 1);
    }

    #[test]
    fn insufficient_shards_fails_recovery() {
        let mut pool = new_pool();
        let mut fec = FecContext::new(16);
        let parity = pool.alloc().unwrap();
        pool.set_data_len(parity, 4);
        let hdr = make_fec_header(300, 303, 1, 0, 4); // k=4, only 1 parity, no data present
        fec.on_fec_packet(&hdr, parity, &mut pool, 0);
        let recovered = fec.try_recover(301, &mut pool, |_| None);
        assert!(recovered.is_none());
    }

    #[test]
    fn eviction_returns_oldest_range_when_full() {
        let mut pool = new_pool();
        let mut fec = FecContext::new(2);
        for (i, (begin, end)) in [(0u16, 9u16), (10, 19), (20, 29)].into_iter().enumerate() {
            let parity = pool.alloc().unwrap();
            pool.set_data_len(parity, 4);
            let hdr = make_fec_header(begin, end, 1, 0, 4);
            let evicted = fec.on_fec_packet(&hdr, parity, &mut pool, i as u64);
            if i == 2 {
                let ev = evicted.expect("third group should evict the first");
                assert_eq!((ev.begin, ev.end), (0, 9));
            }
        }
        assert_eq!(fec.groups.len(), 2);
    }
}
