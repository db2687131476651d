// src/util.rs
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative shutdown flag, raised once by a signal handler and polled by
/// the event loop and tick callbacks.
pub struct BarrierFlag(AtomicBool);

impl Default for BarrierFlag {
    fn default() -> Self {
        Self(AtomicBool::new(false))
    }
}

impl BarrierFlag {
    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[inline]
pub fn now_nanos() -> u64 {
    #[cfg(target_os = "linux")]
    {
        use nix::time::{clock_gettime, ClockId};
        if let Ok(ts) = clock_gettime(ClockId::CLOCK_MONOTONIC) {
            return (ts.tv_sec() as u64) * 1_000_000_000 + (ts.tv_nsec() as u64);
        }
    }
    use std::time::Instant;
    static START: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
    START.elapsed().as_nanos() as u64
}

#[inline]
pub fn now_ms() -> u64 {
    now_nanos() / 1_000_000
}

/// RFC 1982 serial-number arithmetic for 16-bit RTP sequence numbers:
/// the signed distance `a - b` taken modulo 2^16, in (-32768, 32768].
#[inline]
pub fn serial16_diff(a: u16, b: u16) -> i32 {
    (a.wrapping_sub(b) as i16) as i32
}

/// True if `a` is considered "after" `b` in serial order (strictly newer).
#[inline]
pub fn serial16_gt(a: u16, b: u16) -> bool {
    serial16_diff(a, b) > 0
}

#[inline]
pub fn lock_all_memory_if(enabled: bool) {
    if !enabled {
        return;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        let lim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        let _ = libc::setrlimit(libc::RLIMIT_MEMLOCK, &lim);
        let _ = libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_diff_handles_wraparound() {
        assert_eq!(serial16_diff(10, 5), 5);
        assert_eq!(serial16_diff(5, 10), -5);
        assert_eq!(serial16_diff(0, 65530), 6);
        assert_eq!(serial16_diff(65530, 0), -6);
        assert!(serial16_gt(10, 5));
        assert!(serial16_gt(0, 65530));
        assert!(!serial16_gt(65530, 0));
    }
}
