// src/pool.rs
//
// Fixed-size, cache-aligned, reference-counted packet buffers with
// segmented growth/shrink and batched receive. Single-threaded per worker,
// so refcounts are plain `Cell<u32>` rather than atomics. Free slots are
// tracked on an explicit free-stack rather than an intrusive free-list:
// safe Rust, one extra allocation for the stack, no raw next-pointers.
use crate::util::now_nanos;
use std::cell::Cell;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// 64-byte alignment matches common DMA/cacheline alignment; 1536 bytes
/// comfortably covers Ethernet MTU + RTP/RTCP headers.
#[repr(align(64))]
struct AlignedBuf(Box<[u8]>);

struct Slot {
    data: AlignedBuf,
    refcount: Cell<u32>,
    data_off: Cell<u32>,
    data_len: Cell<u32>,
    peer_addr: Cell<Option<SocketAddr>>,
}

impl Slot {
    fn new(size: usize) -> Self {
        Self {
            data: AlignedBuf(vec![0u8; size].into_boxed_slice()),
            refcount: Cell::new(0),
            data_off: Cell::new(0),
            data_len: Cell::new(0),
            peer_addr: Cell::new(None),
        }
    }
}

struct Segment {
    slots: Vec<Slot>,
    created_at_ms: u64,
    num_free: Cell<usize>,
}

/// A cheap, `Copy` handle into the pool. `ref_get`/`ref_put` operate on the
/// slot the handle addresses, so cloning a `MemRef` via `Pool::ref_get` is
/// the moral equivalent of an `Rc::clone` without an actual `Rc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    segment: u32,
    slot: u32,
}

/// A handle over either a pool-owned memory slab or an external fd queued
/// for `sendfile`-style transmission. The file variant owns its fd outright
/// and is not pool-managed; it carries its own partial send cursor (`sent`).
pub enum BufRef {
    Mem(MemRef),
    File(FileBuf),
}

pub struct FileBuf {
    pub fd: RawFd,
    pub offset: u64,
    pub length: u64,
    pub sent: u64,
}

impl Drop for FileBuf {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

impl BufRef {
    pub fn remaining_len(&self, pool: &Pool) -> usize {
        match self {
            BufRef::Mem(m) => pool.data_len(*m) as usize - pool.data_off(*m) as usize,
            BufRef::File(f) => (f.length - f.sent) as usize,
        }
    }
}

pub struct Pool {
    segments: Vec<Segment>,
    /// LIFO free list of (segment, slot) for cache warmth.
    free_list: Vec<(u32, u32)>,
    buffer_size: usize,
    expand_batch: usize,
    low_watermark: usize,
    high_watermark: usize,
    max_buffers: usize,
    total_buffers: usize,
    grace_period_ms: u64,
}

const MAX_RECV_PACKETS_PER_BATCH: usize = 64;

impl Pool {
    pub fn new(
        buffer_size: usize,
        initial: usize,
        max_buffers: usize,
        expand_batch: usize,
        low_watermark: usize,
        high_watermark: usize,
    ) -> Self {
        let mut pool = Self {
            segments: Vec::new(),
            free_list: Vec::with_capacity(initial.min(max_buffers)),
            buffer_size,
            expand_batch,
            low_watermark,
            high_watermark,
            max_buffers,
            total_buffers: 0,
            grace_period_ms: 30_000,
        };
        pool.add_segment(initial.min(max_buffers).max(1));
        pool
    }

    fn add_segment(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let seg_idx = self.segments.len() as u32;
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(Slot::new(self.buffer_size));
        }
        for i in 0..count {
            self.free_list.push((seg_idx, i as u32));
        }
        self.segments.push(Segment {
            slots,
            created_at_ms: now_nanos() / 1_000_000,
            num_free: Cell::new(count),
        });
        self.total_buffers += count;
    }

    fn slot(&self, r: MemRef) -> &Slot {
        &self.segments[r.segment as usize].slots[r.slot as usize]
    }

    pub fn data_len(&self, r: MemRef) -> u32 {
        self.slot(r).data_len.get()
    }

    pub fn data_off(&self, r: MemRef) -> u32 {
        self.slot(r).data_off.get()
    }

    pub fn set_data_off(&self, r: MemRef, off: u32) {
        self.slot(r).data_off.set(off);
    }

    pub fn set_data_len(&self, r: MemRef, len: u32) {
        self.slot(r).data_len.set(len);
    }

    pub fn peer_addr(&self, r: MemRef) -> Option<SocketAddr> {
        self.slot(r).peer_addr.get()
    }

    pub fn set_peer_addr(&self, r: MemRef, addr: Option<SocketAddr>) {
        self.slot(r).peer_addr.set(addr);
    }

    /// Immutable view of the full backing buffer (capacity, not `data_len`).
    pub fn storage(&self, r: MemRef) -> &[u8] {
        &self.slot(r).data.0
    }

    pub fn storage_mut(&mut self, r: MemRef) -> &mut [u8] {
        &mut self.segments[r.segment as usize].slots[r.slot as usize].data.0
    }

    /// The live payload: `storage[data_off..data_len]`.
    pub fn payload(&self, r: MemRef) -> &[u8] {
        let s = self.slot(r);
        &s.data.0[s.data_off.get() as usize..s.data_len.get() as usize]
    }

    pub fn alloc(&mut self) -> Option<MemRef> {
        let (seg, slot) = self.free_list.pop()?;
        let segment = &self.segments[seg as usize];
        segment.num_free.set(segment.num_free.get() - 1);
        let s = &segment.slots[slot as usize];
        s.refcount.set(1);
        s.data_off.set(0);
        s.data_len.set(0);
        s.peer_addr.set(None);
        Some(MemRef {
            segment: seg,
            slot,
        })
    }

    /// Pops up to `n` buffers in one call, stopping at exhaustion. Returns
    /// the allocated handles and how many were actually obtained.
    pub fn alloc_batch(&mut self, n: usize) -> (Vec<MemRef>, usize) {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.alloc() {
                Some(r) => out.push(r),
                None => break,
            }
        }
        let got = out.len();
        (out, got)
    }

    pub fn ref_get(&self, r: MemRef) -> MemRef {
        let s = self.slot(r);
        s.refcount.set(s.refcount.get() + 1);
        r
    }

    /// Decrements the refcount; on reaching zero, returns the slot to its
    /// segment and to the pool's free list.
    pub fn ref_put(&mut self, r: MemRef) {
        let rc = {
            let s = self.slot(r);
            let rc = s.refcount.get() - 1;
            s.refcount.set(rc);
            rc
        };
        if rc == 0 {
            let segment = &self.segments[r.segment as usize];
            segment.num_free.set(segment.num_free.get() + 1);
            self.free_list.push((r.segment, r.slot));
        }
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_total(&self) -> usize {
        self.total_buffers
    }

    /// Grows the pool when free buffers fall below the low watermark, and
    /// shrinks idle segments when above the high watermark.
    pub fn update_stats(&mut self) {
        if self.num_free() < self.low_watermark && self.total_buffers < self.max_buffers {
            let room = self.max_buffers - self.total_buffers;
            self.add_segment(self.expand_batch.min(room));
        }
        if self.num_free() > self.high_watermark {
            self.try_shrink();
        }
    }

    fn try_shrink(&mut self) {
        let now_ms = now_nanos() / 1_000_000;
        let mut i = 0;
        while i < self.segments.len() {
            if self.num_free() <= self.high_watermark {
                break;
            }
            let seg = &self.segments[i];
            let fully_free = seg.num_free.get() == seg.slots.len();
            let aged = now_ms.saturating_sub(seg.created_at_ms) >= self.grace_period_ms;
            if fully_free && aged && self.segments.len() > 1 {
                let removed = self.segments.remove(i);
                self.total_buffers -= removed.slots.len();
                self.free_list.retain(|(seg_idx, _)| *seg_idx as usize != i);
                // Indices above `i` shifted down by one segment.
                for (seg_idx, _) in self.free_list.iter_mut() {
                    if *seg_idx as usize > i {
                        *seg_idx -= 1;
                    }
                }
                continue;
            }
            i += 1;
        }
    }

    /// Batched non-blocking receive: allocates up to
    /// `MAX_RECV_PACKETS_PER_BATCH` buffers and fills them via `recvfrom`.
    /// On pool exhaustion, drains one more datagram into a discard buffer
    /// (to avoid spinning the event loop on a readable fd with no space)
    /// and reports it as dropped.
    pub fn batch_recv(
        &mut self,
        sock_fd: RawFd,
        save_peer: bool,
    ) -> (Vec<MemRef>, usize, usize) {
        let mut received = Vec::with_capacity(MAX_RECV_PACKETS_PER_BATCH);
        let mut dropped = 0usize;
        for _ in 0..MAX_RECV_PACKETS_PER_BATCH {
            let Some(r) = self.alloc() else {
                dropped += drain_one_discard(sock_fd);
                break;
            };
            let cap = self.slot(r).data.0.len();
            let buf = self.storage_mut(r);
            match recv_one(sock_fd, buf, cap, save_peer) {
                Some((n, peer)) => {
                    self.set_data_len(r, n as u32);
                    if save_peer {
                        self.set_peer_addr(r, peer);
                    }
                    received.push(r);
                }
                None => {
                    self.ref_put(r);
                    break;
                }
            }
        }
        let count = received.len();
        (received, count, dropped)
    }
}

fn recv_one(fd: RawFd, buf: &mut [u8], cap: usize, save_peer: bool) -> Option<(usize, Option<SocketAddr>)> {
    use nix::sys::socket::{recvfrom, SockaddrStorage};
    if save_peer {
        match recvfrom::<SockaddrStorage>(fd, &mut buf[..cap]) {
            Ok((n, addr)) => Some((n, addr.and_then(sockaddr_to_std))),
            Err(_) => None,
        }
    } else {
        match nix::unistd::read(fd, &mut buf[..cap]) {
            Ok(n) => Some((n, None)),
            Err(_) => None,
        }
    }
}

fn sockaddr_to_std(addr: nix::sys::socket::SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        Some(SocketAddr::V4(std::net::SocketAddrV4::new(
            std::net::Ipv4Addr::from(v4.ip()),
            v4.port(),
        )))
    } else {
        addr.as_sockaddr_in6().map(|v6| {
            SocketAddr::V6(std::net::SocketAddrV6::new(
                v6.ip(),
                v6.port(),
                0,
                0,
            ))
        })
    }
}

/// Drains exactly one pending datagram into a small stack buffer, discarding
/// it, so a readable-but-pool-exhausted fd doesn't spin the event loop.
fn drain_one_discard(fd: RawFd) -> usize {
    let mut scratch = [0u8; 2048];
    match nix::unistd::read(fd, &mut scratch) {
        Ok(_) => 1,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pool() -> Pool {
        Pool::new(1536, 16, 64, 16, 4, 32)
    }

    #[test]
    fn alloc_release_is_lifo() {
        let mut pool = new_pool();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        pool.ref_put(b);
        pool.ref_put(a);
        let c = pool.alloc().unwrap();
        assert_eq!(c, a, "LIFO free list returns the most recently freed region");
    }

    #[test]
    fn refcount_requires_all_puts_before_reuse() {
        let mut pool = new_pool();
        let r = pool.alloc().unwrap();
        let r2 = pool.ref_get(r);
        let before = pool.num_free();
        pool.ref_put(r);
        assert_eq!(pool.num_free(), before, "still one ref outstanding");
        pool.ref_put(r2);
        assert_eq!(pool.num_free(), before + 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = Pool::new(64, 2, 2, 0, 0, 2);
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn free_list_len_matches_segment_sum() {
        let mut pool = new_pool();
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.alloc().unwrap());
        }
        for r in held {
            pool.ref_put(r);
        }
        let sum: usize = pool.segments.iter().map(|s| s.num_free.get()).sum();
        assert_eq!(sum, pool.num_free());
    }
}
