// src/event_loop.rs — per-worker readiness multiplexer.
//
// A wait-with-timeout, dispatch-by-fd polling loop built on a general
// fd -> owner map so HTTP listeners, client sockets, multicast/FCC/RTSP
// ingress sockets, and background subprocess stdout fds can all be
// registered uniformly. One instance per worker process; never shared
// across workers — no shared data mutates across workers at steady state.
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

/// Opaque handle identifying the owner of a registered fd: an index into
/// whatever per-worker arena the caller keeps (connection table, ingress
/// source table, ...). The event loop never dereferences these, keeping
/// cyclic references out by having sessions hold indices, not pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

/// One entry in the deadline schedule: fires `owner`'s `tick` no earlier
/// than `deadline_ms` (monotonic ms, see `util::now_ms`).
#[derive(Debug, Clone, Copy)]
struct Deadline {
    owner: OwnerId,
    deadline_ms: u64,
}

pub struct EventLoop {
    epfd: RawFd,
    owners: HashMap<RawFd, OwnerId>,
    deadlines: Vec<Deadline>,
    events_buf: Vec<EpollEvent>,
}

/// One readiness notification handed back from `poll`. Carries the
/// specific fd that became ready (not just its owner) because one owner
/// (a stream) can have several fds registered at once — client socket,
/// multicast socket, FCC unicast socket, FEC socket — and the dispatcher
/// needs to know which one to read from.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub owner: OwnerId,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl EventLoop {
    pub fn new(max_events: usize) -> nix::Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epfd,
            owners: HashMap::new(),
            deadlines: Vec::new(),
            events_buf: vec![EpollEvent::empty(); max_events.max(1)],
        })
    }

    /// Registers `fd` under `owner`, watching for readability (and
    /// writability if `write_interest`). Edge-triggered.
    pub fn register(&mut self, fd: BorrowedFd<'_>, owner: OwnerId, write_interest: bool) -> nix::Result<()> {
        let raw = fd.as_raw_fd();
        let flags = interest_flags(write_interest);
        let mut ev = EpollEvent::new(flags, raw as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, raw, &mut ev)?;
        self.owners.insert(raw, owner);
        Ok(())
    }

    /// Flips write-interest on an already-registered fd — called when a
    /// connection transitions between "queue empty" and "queue has data".
    pub fn modify_write_interest(&mut self, fd: BorrowedFd<'_>, write_interest: bool) -> nix::Result<()> {
        let raw = fd.as_raw_fd();
        let mut ev = EpollEvent::new(interest_flags(write_interest), raw as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, raw, &mut ev)
    }

    /// Removes `fd` from the multiplexer and its fd->owner entry: closing a
    /// connection removes every owned fd and unlinks the fd->owner entries.
    pub fn unregister(&mut self, fd: BorrowedFd<'_>) -> nix::Result<()> {
        let raw = fd.as_raw_fd();
        self.owners.remove(&raw);
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, raw, None)
    }

    pub fn owner_of(&self, fd: RawFd) -> Option<OwnerId> {
        self.owners.get(&fd).copied()
    }

    /// Schedules `owner`'s tick to run no earlier than `deadline_ms`.
    /// Multiple deadlines per owner are allowed — the loop wakes at the
    /// earliest and the caller's `tick` decides what's actually due.
    pub fn schedule(&mut self, owner: OwnerId, deadline_ms: u64) {
        self.deadlines.push(Deadline { owner, deadline_ms });
    }

    pub fn cancel_deadlines(&mut self, owner: OwnerId) {
        self.deadlines.retain(|d| d.owner != owner);
    }

    fn next_deadline_ms(&self) -> Option<u64> {
        self.deadlines.iter().map(|d| d.deadline_ms).min()
    }

    /// Waits for readiness or the next deadline, whichever comes first.
    /// Returns ready events; `due_ticks` receives the owners whose
    /// deadline has passed (each owner listed at most once).
    pub fn poll(&mut self, now_ms: u64, due_ticks: &mut Vec<OwnerId>) -> nix::Result<Vec<ReadyEvent>> {
        let timeout_ms: isize = match self.next_deadline_ms() {
            Some(d) if d > now_ms => (d - now_ms).min(60_000) as isize,
            Some(_) => 0,
            None => 1000,
        };
        let n = epoll_wait(self.epfd, &mut self.events_buf, timeout_ms)?;

        let mut out = Vec::with_capacity(n);
        for ev in &self.events_buf[..n] {
            let flags = ev.events();
            let fd = ev.data() as RawFd;
            let Some(owner) = self.owners.get(&fd).copied() else {
                continue; // unregistered between epoll_wait and dispatch
            };
            out.push(ReadyEvent {
                fd,
                owner,
                readable: flags.contains(EpollFlags::EPOLLIN),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                error: flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP),
            });
        }

        due_ticks.clear();
        let mut seen = std::collections::HashSet::new();
        self.deadlines.retain(|d| {
            if d.deadline_ms <= now_ms {
                if seen.insert(d.owner.0) {
                    due_ticks.push(d.owner);
                }
                false
            } else {
                true
            }
        });

        Ok(out)
    }

    pub fn registered_count(&self) -> usize {
        self.owners.len()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epfd);
    }
}

fn interest_flags(write_interest: bool) -> EpollFlags {
    let mut flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLET;
    if write_interest {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{close, pipe};
    use std::os::fd::AsFd;

    #[test]
    fn register_and_readiness_on_write() {
        let mut ev_loop = EventLoop::new(16).unwrap();
        let (r, w) = pipe().unwrap();
        ev_loop.register(r.as_fd(), OwnerId(42), false).unwrap();

        nix::unistd::write(&w, b"hi").unwrap();

        let mut due = Vec::new();
        let events = ev_loop.poll(0, &mut due).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].owner, OwnerId(42));
        assert!(events[0].readable);

        ev_loop.unregister(r.as_fd()).unwrap();
        close(w.as_raw_fd()).ok();
    }

    #[test]
    fn deadline_fires_when_due() {
        let mut ev_loop = EventLoop::new(16).unwrap();
        ev_loop.schedule(OwnerId(7), 100);
        let mut due = Vec::new();
        let events = ev_loop.poll(150, &mut due).unwrap();
        assert!(events.is_empty());
        assert_eq!(due, vec![OwnerId(7)]);
        assert!(ev_loop.next_deadline_ms().is_none());
    }

    #[test]
    fn cancel_deadlines_removes_owner_entries() {
        let mut ev_loop = EventLoop::new(16).unwrap();
        ev_loop.schedule(OwnerId(1), 10);
        ev_loop.schedule(OwnerId(2), 20);
        ev_loop.cancel_deadlines(OwnerId(1));
        let mut due = Vec::new();
        ev_loop.poll(30, &mut due).unwrap();
        assert_eq!(due, vec![OwnerId(2)]);
    }
}
