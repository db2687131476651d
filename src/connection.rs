// src/connection.rs — per-client egress queue.
//
// Zero-copy scatter-gather send and completion-queue draining go through
// raw `libc` calls rather than `nix`'s higher-level wrappers: `MSG_ZEROCOPY`
// and `MSG_ERRQUEUE` aren't modeled by `nix::sys::socket::MsgFlags`.
use crate::error::GatewayError;
use crate::pool::{BufRef, FileBuf, MemRef, Pool};
use std::collections::VecDeque;
use std::os::fd::RawFd;

pub const ZEROCOPY_MAX_IOVECS: usize = 64;
pub const ZEROCOPY_BATCH_BYTES: usize = 64 * 1024;
pub const FLUSH_TIMEOUT_US: u64 = 15_000;

struct PendingEntry {
    id: u64,
    buf: BufRef,
}

pub struct Connection {
    pub fd: RawFd,
    send_queue: VecDeque<BufRef>,
    pending: VecDeque<PendingEntry>,
    total_bytes: usize,
    next_zc_id: u64,
    first_queued_us: Option<u64>,
    pub closing: bool,
    pub stream_registered: bool,
    /// `MSG_ZEROCOPY` is the default; an `ENOBUFS` from the kernel's locked-
    /// memory limit flips this to a plain copying `sendmsg` for the rest of
    /// the connection's life rather than tearing it down.
    zerocopy: bool,
}

impl Connection {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            send_queue: VecDeque::new(),
            pending: VecDeque::new(),
            total_bytes: 0,
            next_zc_id: 0,
            first_queued_us: None,
            closing: false,
            stream_registered: false,
            zerocopy: true,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn queue_add(&mut self, buf_ref: BufRef, pool: &Pool, now_us: u64) {
        self.total_bytes += buf_ref.remaining_len(pool);
        if self.send_queue.is_empty() {
            self.first_queued_us = Some(now_us);
        }
        self.send_queue.push_back(buf_ref);
    }

    pub fn queue_add_file(&mut self, fd: RawFd, offset: u64, length: u64, now_us: u64) {
        let buf_ref = BufRef::File(FileBuf {
            fd,
            offset,
            length,
            sent: 0,
        });
        if self.send_queue.is_empty() {
            self.first_queued_us = Some(now_us);
        }
        self.total_bytes += length as usize;
        self.send_queue.push_back(buf_ref);
    }

    pub fn should_flush(&self, now_us: u64) -> bool {
        self.total_bytes >= ZEROCOPY_BATCH_BYTES
            || self.send_queue.len() >= ZEROCOPY_MAX_IOVECS
            || self
                .first_queued_us
                .is_some_and(|t| now_us.saturating_sub(t) >= FLUSH_TIMEOUT_US)
    }

    /// Sends as much of the queue head as the kernel accepts in one call.
    /// Memory-backed entries are coalesced into one scatter-gather
    /// `sendmsg(MSG_ZEROCOPY)`; a file-backed entry at the head is sent
    /// alone via `sendfile` and is never batched with memory entries.
    pub fn flush(&mut self, pool: &mut Pool) -> Result<usize, GatewayError> {
        if self.closing {
            return Err(GatewayError::ClientGone);
        }
        match self.send_queue.front() {
            None => Ok(0),
            Some(BufRef::File(_)) => self.flush_file(),
            Some(BufRef::Mem(_)) => self.flush_mem(pool),
        }
    }

    fn flush_mem(&mut self, pool: &mut Pool) -> Result<usize, GatewayError> {
        let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(ZEROCOPY_MAX_IOVECS);
        let mut mem_refs: Vec<MemRef> = Vec::with_capacity(ZEROCOPY_MAX_IOVECS);
        for entry in self.send_queue.iter() {
            if iovecs.len() >= ZEROCOPY_MAX_IOVECS {
                break;
            }
            match entry {
                BufRef::Mem(m) => {
                    let off = pool.data_off(*m) as usize;
                    let len = pool.data_len(*m) as usize;
                    if off >= len {
                        continue;
                    }
                    let ptr = pool.storage(*m)[off..len].as_ptr() as *mut libc::c_void;
                    iovecs.push(libc::iovec {
                        iov_base: ptr,
                        iov_len: len - off,
                    });
                    mem_refs.push(*m);
                }
                BufRef::File(_) => break,
            }
        }
        if iovecs.is_empty() {
            return Ok(0);
        }

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iovecs.as_mut_ptr();
        msg.msg_iovlen = iovecs.len() as _;

        let flags = if self.zerocopy {
            libc::MSG_ZEROCOPY | libc::MSG_NOSIGNAL
        } else {
            libc::MSG_NOSIGNAL
        };
        let n = unsafe { libc::sendmsg(self.fd, &msg, flags) };
        if n < 0 {
            let errno = std::io::Error::last_os_error();
            return match errno.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Err(GatewayError::Transient),
                Some(libc::ENOBUFS) if self.zerocopy => {
                    // Locked-memory limit hit; fall back to a copying send
                    // for the rest of this connection and retry once the
                    // socket is writable again.
                    self.zerocopy = false;
                    Err(GatewayError::Transient)
                }
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => Err(GatewayError::ClientGone),
                _ => Err(GatewayError::Fatal(errno.to_string())),
            };
        }
        let mut remaining = n as usize;
        let zc_id = self.next_zc_id;
        self.next_zc_id += 1;

        while remaining > 0 {
            let Some(front) = self.send_queue.front().copied_mem() else {
                break;
            };
            let off = pool.data_off(front) as usize;
            let len = pool.data_len(front) as usize;
            let avail = len - off;
            if avail <= remaining {
                remaining -= avail;
                let buf_ref = self.send_queue.pop_front().unwrap();
                self.total_bytes -= avail;
                if self.zerocopy {
                    self.pending.push_back(PendingEntry { id: zc_id, buf: buf_ref });
                } else if let BufRef::Mem(m) = buf_ref {
                    // A copying send has already duplicated the bytes into
                    // the kernel; no MSG_ERRQUEUE completion will follow.
                    pool.ref_put(m);
                }
            } else {
                pool.set_data_off(front, (off + remaining) as u32);
                self.total_bytes -= remaining;
                remaining = 0;
            }
        }
        Ok(n as usize)
    }

    fn flush_file(&mut self) -> Result<usize, GatewayError> {
        let Some(BufRef::File(f)) = self.send_queue.front_mut() else {
            return Ok(0);
        };
        let mut off = (f.offset + f.sent) as libc::off_t;
        let remaining = (f.length - f.sent) as usize;
        let n = unsafe { libc::sendfile(self.fd, f.fd, &mut off, remaining) };
        if n < 0 {
            let errno = std::io::Error::last_os_error();
            return match errno.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Err(GatewayError::Transient),
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => Err(GatewayError::ClientGone),
                _ => Err(GatewayError::Fatal(errno.to_string())),
            };
        }
        f.sent += n as u64;
        self.total_bytes -= n as usize;
        if f.sent >= f.length {
            self.send_queue.pop_front();
        }
        Ok(n as usize)
    }

    /// Drains `MSG_ERRQUEUE` for zero-copy completion notifications and
    /// releases the references the pending queue holds for ids in range.
    pub fn handle_completion(&mut self, pool: &mut Pool) {
        loop {
            let mut control = [0u8; 128];
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.len();
            let n = unsafe { libc::recvmsg(self.fd, &mut msg, libc::MSG_ERRQUEUE) };
            if n < 0 {
                break;
            }
            let Some((lo, hi, is_zerocopy)) = parse_zerocopy_completion(&msg) else {
                break;
            };
            self.release_pending_range(lo, hi, is_zerocopy, pool);
        }
    }

    fn release_pending_range(&mut self, lo: u32, hi: u32, _is_zerocopy: bool, pool: &mut Pool) {
        self.pending.retain(|entry| {
            let id = entry.id as u32;
            if id >= lo && id <= hi {
                if let BufRef::Mem(m) = entry.buf {
                    pool.ref_put(m);
                }
                false
            } else {
                true
            }
        });
    }

    pub fn close(&mut self, pool: &mut Pool) {
        self.closing = true;
        for buf in self.send_queue.drain(..) {
            if let BufRef::Mem(m) = buf {
                pool.ref_put(m);
            }
        }
        for entry in self.pending.drain(..) {
            if let BufRef::Mem(m) = entry.buf {
                pool.ref_put(m);
            }
        }
    }
}

trait FrontMem {
    fn copied_mem(self) -> Option<MemRef>;
}
impl FrontMem for Option<&BufRef> {
    fn copied_mem(self) -> Option<MemRef> {
        match self {
            Some(BufRef::Mem(m)) => Some(*m),
            _ => None,
        }
    }
}

/// Parses a `SO_EE_ORIGIN_ZEROCOPY` extended error from a `MSG_ERRQUEUE`
/// `recvmsg` result: `(ee_data, ee_info)` form an inclusive id range, and
/// `ee_code == SO_EE_CODE_ZEROCOPY_COPIED` flags the kernel-copied fallback.
fn parse_zerocopy_completion(msg: &libc::msghdr) -> Option<(u32, u32, bool)> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let c = &*cmsg;
            if c.cmsg_level == libc::SOL_IP && c.cmsg_type == libc::IP_RECVERR
                || c.cmsg_level == libc::SOL_IPV6 && c.cmsg_type == libc::IPV6_RECVERR
            {
                let ee = libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err;
                let ee = &*ee;
                if ee.ee_origin == libc::SO_EE_ORIGIN_ZEROCOPY as u8 {
                    let is_copied = ee.ee_code == libc::SO_EE_CODE_ZEROCOPY_COPIED as u8;
                    return Some((ee.ee_data, ee.ee_info, !is_copied));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_flush_on_iovec_cap() {
        let pool = Pool::new(64, 4, 4, 0, 0, 4);
        let mut conn = Connection::new(-1);
        for _ in 0..ZEROCOPY_MAX_IOVECS {
            conn.send_queue.push_back(BufRef::Mem(mem_ref_for_test()));
        }
        let _ = pool;
        assert!(conn.should_flush(0));
    }

    #[test]
    fn should_flush_on_timeout() {
        let mut conn = Connection::new(-1);
        conn.first_queued_us = Some(1_000);
        assert!(!conn.should_flush(1_500));
        assert!(conn.should_flush(1_000 + FLUSH_TIMEOUT_US));
    }

    // `MemRef`'s fields are private; construct one via an allocation for
    // tests that only need a placeholder handle, not real pool semantics.
    fn mem_ref_for_test() -> MemRef {
        let mut pool = Pool::new(64, 1, 1, 0, 0, 1);
        pool.alloc().unwrap()
    }
}
