// src/worker.rs — per-worker main loop.
//
// Ties the event loop, buffer pool, connection egress queues, and ingress
// sources together into a one-way pipeline: ingress socket -> receive-batch
// -> reorder/FEC -> egress queue -> zero-copy send -> refcount release.
// Batch receive, dispatch, and forward happen in shape like a classic
// multi-stage pipeline, but collapsed into a single-threaded
// per-connection state machine rather than cross-thread channels: workers
// share nothing, and parallelism comes from forked processes, not threads.
use crate::config::AppConfig;
use crate::connection::Connection;
use crate::event_loop::{EventLoop, OwnerId};
use crate::fcc::{FccAction, FccSession};
use crate::fec::FecContext;
use crate::http::{self, Route};
use crate::multicast::MulticastSession;
use crate::playlist;
use crate::pool::{BufRef, MemRef, Pool};
use crate::reorder::{ReorderBuffer, WINDOW_NO_FEC, WINDOW_WITH_FEC};
use crate::rtp::RtpHeader;
use crate::service::{RequestForm, Service};
use crate::snapshot::SnapshotAccumulator;
use crate::status::{self, ClientStatusEntry, StatusRegion};
use crate::util::{now_ms, now_nanos, BarrierFlag};
use socket2::{Domain, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;

const MAX_EPOLL_EVENTS: usize = 1024;
const MAX_REQUEST_BUFFER: usize = http::MAX_REQUEST_LINE;

/// Which role a registered non-client fd plays for its owning stream, so
/// the readiness dispatcher knows how to interpret a batch of buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdKind {
    Listener(usize),
    Client(usize),
    Multicast(usize),
    FccUnicast(usize),
    Fec(usize),
    Encoder(usize),
}

/// A snapshot encoder subprocess in flight: its stdout fd is registered
/// under `FdKind::Encoder` and drained as it becomes readable. `acc` stays
/// alive for the job's whole lifetime so its scratch file isn't unlinked
/// out from under the encoder, which opens the path itself after `spawn`
/// returns rather than inheriting an already-open fd.
struct EncodeJob {
    child: std::process::Child,
    acc: SnapshotAccumulator,
    stdout_fd: RawFd,
    buf: Vec<u8>,
}

struct Stream {
    connection: Connection,
    service: Service,
    req_buf: Vec<u8>,
    headers_sent: bool,
    awaiting_request: bool,
    multicast: Option<MulticastSession>,
    fcc: Option<FccSession>,
    fcc_fd: Option<RawFd>,
    reorder: ReorderBuffer,
    fec: Option<FecContext>,
    fec_fd: Option<RawFd>,
    last_activity_ms: u64,
    peer: SocketAddr,
    connected_since_ms: u64,
    conn_id: u64,
    snapshot: Option<SnapshotAccumulator>,
    want_snapshot: bool,
    encode: Option<EncodeJob>,
    /// Set once a one-shot response (status page, playlist, error, or
    /// snapshot JPEG) has been queued; `try_flush` closes the stream once
    /// the egress queue fully drains instead of leaving it open.
    close_after_flush: bool,
}

/// One worker process's entire runtime state. Everything here is
/// process-local; two workers never touch each other's `Pool` or `Stream`
/// table.
pub struct Worker {
    cfg: AppConfig,
    pool: Pool,
    ev: EventLoop,
    listeners: Vec<TcpListener>,
    fd_kinds: std::collections::HashMap<RawFd, FdKind>,
    streams: Vec<Option<Stream>>,
    free_slots: Vec<usize>,
    status: StatusRegion,
    next_fcc_port: u16,
    next_conn_id: u64,
}

impl Worker {
    pub fn new(cfg: AppConfig) -> anyhow::Result<Self> {
        let pool = Pool::new(
            cfg.pool.buffer_size,
            cfg.pool.initial,
            cfg.pool.max,
            cfg.pool.expand,
            cfg.pool.low_watermark,
            cfg.pool.high_watermark,
        );
        let mut ev = EventLoop::new(MAX_EPOLL_EVENTS)?;
        let mut listeners = Vec::new();
        let mut fd_kinds = std::collections::HashMap::new();
        for (i, bind) in cfg.general.bind.iter().enumerate() {
            let addr: SocketAddr = bind.parse()?;
            let domain = match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            };
            let sock = Socket::new(domain, Type::STREAM, None)?;
            sock.set_reuse_address(true).ok();
            #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
            sock.set_reuse_port(true).ok();
            sock.bind(&addr.into())?;
            sock.listen(1024)?;
            sock.set_nonblocking(true)?;
            let listener: TcpListener = sock.into();
            ev.register(listener.as_fd(), OwnerId(i as u64), false)?;
            fd_kinds.insert(listener.as_raw_fd(), FdKind::Listener(i));
            listeners.push(listener);
        }
        let fcc_port_min = cfg.fcc.listen_port_min;
        Ok(Self {
            cfg,
            pool,
            ev,
            listeners,
            fd_kinds,
            streams: Vec::new(),
            free_slots: Vec::new(),
            status: StatusRegion::new(),
            next_fcc_port: fcc_port_min,
            next_conn_id: 0,
        })
    }

    pub fn run(&mut self, shutdown: Arc<BarrierFlag>) -> anyhow::Result<()> {
        let mut due = Vec::new();
        while !shutdown.is_raised() {
            self.pool.update_stats();
            status::set_pool_stats(self.pool.num_free(), self.pool.num_total());
            let now = now_ms();
            let events = match self.ev.poll(now, &mut due) {
                Ok(e) => e,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };
            for ev in events {
                let Some(kind) = self.fd_kinds.get(&ev.fd).copied() else {
                    continue;
                };
                match kind {
                    FdKind::Listener(i) => self.accept_all(i),
                    FdKind::Client(idx) => self.on_client_ready(idx, ev.readable, ev.writable, ev.error),
                    FdKind::Multicast(idx) => self.on_multicast_ready(idx),
                    FdKind::FccUnicast(idx) => self.on_fcc_unicast_ready(idx),
                    FdKind::Fec(idx) => self.on_fec_ready(idx),
                    FdKind::Encoder(idx) => self.on_encoder_ready(idx),
                }
            }
            for owner in &due {
                self.tick(owner.0 as usize);
            }
            self.refresh_status_clients();
        }
        for idx in 0..self.streams.len() {
            self.close_stream(idx);
        }
        Ok(())
    }

    fn alloc_slot(&mut self, stream: Stream) -> usize {
        if let Some(idx) = self.free_slots.pop() {
            self.streams[idx] = Some(stream);
            idx
        } else {
            self.streams.push(Some(stream));
            self.streams.len() - 1
        }
    }

    fn accept_all(&mut self, _listener_idx: usize) {
        loop {
            let listener = &self.listeners[_listener_idx];
            let (sock, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            };
            sock.set_nonblocking(true).ok();
            let fd = sock.as_raw_fd();
            std::mem::forget(sock); // ownership transfers into Connection's raw fd
            let now = now_ms();
            let conn_id = self.next_conn_id;
            self.next_conn_id += 1;
            let stream = Stream {
                connection: Connection::new(fd),
                service: Service {
                    form: RequestForm::Udp,
                    mcast_group: "0.0.0.0:0".parse().unwrap(),
                    ssm_source: None,
                    fcc_server: None,
                    vendor: None,
                    fec_port: None,
                    rtsp_url: None,
                    playseek: None,
                },
                req_buf: Vec::with_capacity(512),
                headers_sent: false,
                awaiting_request: true,
                multicast: None,
                fcc: None,
                fcc_fd: None,
                reorder: ReorderBuffer::new(WINDOW_NO_FEC),
                fec: None,
                fec_fd: None,
                last_activity_ms: now,
                peer,
                connected_since_ms: now,
                conn_id,
                snapshot: None,
                want_snapshot: false,
                encode: None,
                close_after_flush: false,
            };
            let idx = self.alloc_slot(stream);
            let owner = OwnerId(idx as u64);
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            if self.ev.register(borrowed, owner, false).is_err() {
                self.close_stream(idx);
                continue;
            }
            self.fd_kinds.insert(fd, FdKind::Client(idx));
            status::inc_connections();
        }
    }

    fn on_client_ready(&mut self, idx: usize, readable: bool, writable: bool, error: bool) {
        if error {
            self.close_stream(idx);
            return;
        }
        if readable {
            self.read_client_request(idx);
        }
        if writable {
            self.try_flush(idx);
        }
    }

    fn read_client_request(&mut self, idx: usize) {
        let Some(stream) = self.streams[idx].as_mut() else { return };
        if !stream.awaiting_request {
            return;
        }
        let fd = stream.connection.fd;
        let mut tmp = [0u8; 2048];
        loop {
            let n = unsafe { libc::read(fd, tmp.as_mut_ptr() as *mut libc::c_void, tmp.len()) };
            if n < 0 {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() != Some(libc::EAGAIN) && errno.raw_os_error() != Some(libc::EWOULDBLOCK) {
                    self.close_stream(idx);
                }
                break;
            }
            if n == 0 {
                self.close_stream(idx);
                return;
            }
            let stream = self.streams[idx].as_mut().unwrap();
            stream.req_buf.extend_from_slice(&tmp[..n as usize]);
            if stream.req_buf.len() > MAX_REQUEST_BUFFER {
                self.reject_request(idx, 400, "Request Line Too Long");
                return;
            }
        }
        let stream = self.streams[idx].as_ref().unwrap();
        match http::try_parse_request(&stream.req_buf) {
            None => {}
            Some(Err(_reason)) => self.reject_request(idx, 400, "Bad Request"),
            Some(Ok(parsed)) => self.dispatch_request(idx, parsed),
        }
    }

    fn reject_request(&mut self, idx: usize, status_code: u16, reason: &str) {
        if self.streams[idx].is_none() {
            return;
        }
        let mut out = Vec::new();
        http::write_error_response(&mut out, status_code, reason);
        self.queue_response(idx, &out);
    }

    /// Queues a fully-formed one-shot HTTP response (status page, playlist,
    /// error page, snapshot JPEG) across as many pool buffers as it takes,
    /// rather than a single non-blocking `write` that can silently
    /// short-write on a slow client. Marks the stream to close once the
    /// queue fully drains.
    fn queue_response(&mut self, idx: usize, data: &[u8]) {
        let now_us = now_nanos() / 1000;
        let chunk_size = self.cfg.pool.buffer_size.max(1);
        for chunk in data.chunks(chunk_size) {
            let Some(mem) = self.pool.alloc() else {
                log::warn!("pool exhausted queuing a one-shot response; response truncated");
                break;
            };
            {
                let storage = self.pool.storage_mut(mem);
                storage[..chunk.len()].copy_from_slice(chunk);
            }
            self.pool.set_data_off(mem, 0);
            self.pool.set_data_len(mem, chunk.len() as u32);
            let Some(stream) = self.streams[idx].as_mut() else {
                self.pool.ref_put(mem);
                return;
            };
            stream.connection.queue_add(BufRef::Mem(mem), &self.pool, now_us);
        }
        if let Some(stream) = self.streams[idx].as_mut() {
            stream.close_after_flush = true;
        }
        self.try_flush(idx);
    }

    fn dispatch_request(&mut self, idx: usize, parsed: http::ParsedRequest) {
        let now = now_ms();
        match &parsed.route {
            Route::Status => {
                let body = self.status.render_html();
                let mut out = Vec::new();
                out.extend_from_slice(b"HTTP/1.0 200 OK\r\nContent-Type: text/html\r\n");
                out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
                out.extend_from_slice(body.as_bytes());
                self.queue_response(idx, &out);
                return;
            }
            Route::Playlist => {
                let hostname = self.cfg.general.hostname.clone().unwrap_or_else(|| "localhost".to_string());
                let port = self.cfg.general.bind.first().and_then(|b| b.rsplit(':').next()).and_then(|p| p.parse().ok()).unwrap_or(5140);
                let source = self
                    .cfg
                    .general
                    .playlist_source_path
                    .as_ref()
                    .and_then(|p| std::fs::read_to_string(p).ok())
                    .unwrap_or_else(|| "#EXTM3U\n".to_string());
                let rewritten = playlist::rewrite(&source, &hostname, port);
                let mut out = Vec::new();
                out.extend_from_slice(b"HTTP/1.0 200 OK\r\nContent-Type: application/vnd.apple.mpegurl\r\n");
                out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", rewritten.len()).as_bytes());
                out.extend_from_slice(rewritten.as_bytes());
                self.queue_response(idx, &out);
                return;
            }
            Route::NotFound => {
                self.reject_request(idx, 404, "Not Found");
                return;
            }
            Route::Rtsp { .. } => {
                // RTSP signaling is external-interface only (out of scope);
                // the interleaved relay path isn't wired into the HTTP
                // front door in this gateway.
                self.reject_request(idx, 501, "Not Implemented");
                return;
            }
            Route::Udp { .. } | Route::Rtp { .. } => {}
        }

        let Some(service) = http::service_from_request(&parsed) else {
            self.reject_request(idx, 400, "Bad Request");
            return;
        };

        let window = if service.uses_fec() { WINDOW_WITH_FEC } else { WINDOW_NO_FEC };
        let stream = self.streams[idx].as_mut().unwrap();
        stream.awaiting_request = false;
        stream.service = service.clone();
        stream.reorder = ReorderBuffer::new(window);
        stream.fec = if service.uses_fec() { Some(FecContext::new(self.cfg.fec.max_groups)) } else { None };
        stream.want_snapshot = parsed.snapshot;

        if parsed.snapshot {
            // A snapshot request holds its response until one IDR access
            // unit has been accumulated and encoded (see `start_encode`);
            // no headers go out yet since the Content-Length isn't known.
            let scratch_dir = std::path::Path::new(&self.cfg.snapshot.scratch_dir);
            let conn_id = self.streams[idx].as_ref().unwrap().conn_id;
            let acc = SnapshotAccumulator::new(scratch_dir, conn_id).ok();
            let ok = acc.is_some();
            let stream = self.streams[idx].as_mut().unwrap();
            stream.snapshot = acc;
            stream.headers_sent = true;
            if !ok {
                self.reject_request(idx, 500, "Snapshot Unavailable");
                return;
            }
        } else {
            let mut headers = Vec::new();
            http::write_streaming_headers(&mut headers, "video/mp2t");
            if let Some(mem) = self.pool.alloc() {
                {
                    let storage = self.pool.storage_mut(mem);
                    let n = headers.len().min(storage.len());
                    storage[..n].copy_from_slice(&headers[..n]);
                }
                self.pool.set_data_off(mem, 0);
                self.pool.set_data_len(mem, headers.len() as u32);
                let stream = self.streams[idx].as_mut().unwrap();
                stream.connection.queue_add(BufRef::Mem(mem), &self.pool, now_nanos() / 1000);
            }
            let stream = self.streams[idx].as_mut().unwrap();
            stream.headers_sent = true;
        }

        if service.uses_fcc() {
            self.start_fcc(idx, now);
        } else {
            self.start_multicast(idx, now);
        }
    }

    fn start_multicast(&mut self, idx: usize, now: u64) {
        let stream = self.streams[idx].as_ref().unwrap();
        let iface = self.cfg.interfaces.for_multicast().and_then(|s| s.parse::<Ipv4Addr>().ok());
        let rejoin = self.cfg.timeouts.mcast_rejoin_interval_secs.map(|s| s * 1000);
        match MulticastSession::join(stream.service.mcast_group, stream.service.ssm_source, iface, self.cfg.general.udp_rcvbuf_size, rejoin, now) {
            Ok(sess) => {
                let fd = sess.fd();
                let stream = self.streams[idx].as_mut().unwrap();
                stream.multicast = Some(sess);
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                let _ = self.ev.register(borrowed, OwnerId(idx as u64), false);
                self.fd_kinds.insert(fd, FdKind::Multicast(idx));
                self.ev.schedule(OwnerId(idx as u64), now + self.cfg.timeouts.mcast_timeout_ms);

                if stream.service.uses_fec() {
                    self.start_fec(idx, now);
                }
            }
            Err(_) => self.close_stream(idx),
        }
    }

    fn start_fec(&mut self, idx: usize, now: u64) {
        let stream = self.streams[idx].as_ref().unwrap();
        let Some(fec_port) = stream.service.fec_port else { return };
        let fec_group = SocketAddr::new(stream.service.mcast_group.ip(), fec_port);
        let iface = self.cfg.interfaces.for_multicast().and_then(|s| s.parse::<Ipv4Addr>().ok());
        if let Ok(sess) = MulticastSession::join(fec_group, stream.service.ssm_source, iface, self.cfg.general.udp_rcvbuf_size, None, now) {
            let fd = sess.fd();
            let stream = self.streams[idx].as_mut().unwrap();
            stream.fec_fd = Some(fd);
            // The FEC socket's own MulticastSession is kept alive via the fd
            // entry in `fd_kinds`; the socket itself is leaked intentionally
            // into the fd table's ownership via `std::mem::forget`, mirroring
            // `accept_all`'s fd-ownership transfer pattern below.
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let _ = self.ev.register(borrowed, OwnerId(idx as u64), false);
            self.fd_kinds.insert(fd, FdKind::Fec(idx));
            std::mem::forget(sess);
        }
    }

    fn start_fcc(&mut self, idx: usize, now: u64) {
        let stream = self.streams[idx].as_ref().unwrap();
        let (Some(server), Some(vendor)) = (stream.service.fcc_server, stream.service.vendor) else {
            self.start_multicast(idx, now);
            return;
        };
        let port = self.next_fcc_port;
        self.next_fcc_port = if self.next_fcc_port >= self.cfg.fcc.listen_port_max { self.cfg.fcc.listen_port_min } else { self.next_fcc_port + 1 };

        let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
        let Ok(sock) = std::net::UdpSocket::bind(bind_addr) else {
            self.start_multicast(idx, now);
            return;
        };
        sock.set_nonblocking(true).ok();
        let fd = sock.as_raw_fd();
        std::mem::forget(sock);

        let mut session = FccSession::new(vendor, server, self.cfg.fcc.max_redirect);
        let local_ip = Ipv4Addr::UNSPECIFIED;
        let action = session.start(local_ip, port, stream.service.mcast_group);

        let stream = self.streams[idx].as_mut().unwrap();
        stream.fcc = Some(session);
        stream.fcc_fd = Some(fd);
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let _ = self.ev.register(borrowed, OwnerId(idx as u64), false);
        self.fd_kinds.insert(fd, FdKind::FccUnicast(idx));
        self.ev.schedule(OwnerId(idx as u64), now + self.cfg.timeouts.fcc_sync_wait_ms);

        self.apply_fcc_action(idx, action);
    }

    fn apply_fcc_action(&mut self, idx: usize, action: FccAction) {
        match action {
            FccAction::None => {}
            FccAction::SendRequest(buf, addr) | FccAction::SendTerm(buf, addr) => {
                if let Some(fd) = self.streams[idx].as_ref().and_then(|s| s.fcc_fd) {
                    send_to(fd, &buf, addr);
                }
            }
            FccAction::JoinMulticast => {
                self.start_multicast(idx, now_ms());
            }
            FccAction::FlushPending(pending) => {
                for (seq, buf) in pending {
                    self.ingest_rtp(idx, seq, buf);
                }
            }
            FccAction::Abort => self.close_stream(idx),
        }
    }

    fn on_multicast_ready(&mut self, idx: usize) {
        let Some(stream) = self.streams[idx].as_mut() else { return };
        let Some(sess) = stream.multicast.as_ref() else { return };
        let fd = sess.fd();
        let (bufs, _received, dropped) = self.pool.batch_recv(fd, false);
        if dropped > 0 {
            status::add_packets_lost(dropped as u64);
        }
        let now = now_ms();
        if let Some(stream) = self.streams[idx].as_mut() {
            if let Some(sess) = stream.multicast.as_mut() {
                sess.note_activity(now);
            }
        }
        self.ev.schedule(OwnerId(idx as u64), now + self.cfg.timeouts.mcast_timeout_ms);
        for buf in bufs {
            self.on_multicast_packet(idx, buf);
        }
    }

    fn on_multicast_packet(&mut self, idx: usize, buf: MemRef) {
        if self.streams[idx].is_none() {
            self.pool.ref_put(buf);
            return;
        }
        let data_len = self.pool.data_len(buf) as usize;
        let payload = self.pool.storage(buf);
        let header = RtpHeader::parse(&payload[..data_len.min(payload.len())]);
        let Some(hdr) = header else {
            self.pool.ref_put(buf);
            return;
        };
        let seq = hdr.sequence;

        if let Some(fcc) = self.streams[idx].as_mut().and_then(|s| s.fcc.as_mut()) {
            if !matches!(fcc.state, crate::fcc::FccState::McastActive) {
                let action = fcc.on_multicast_rtp(seq, buf);
                self.apply_fcc_action(idx, action);
                return;
            }
        }
        self.ingest_rtp(idx, seq, buf);
    }

    fn on_fcc_unicast_ready(&mut self, idx: usize) {
        let Some(fd) = self.streams[idx].as_ref().and_then(|s| s.fcc_fd) else { return };
        let (bufs, _received, _dropped) = self.pool.batch_recv(fd, false);
        let now = now_ms();
        for buf in bufs {
            let data_len = self.pool.data_len(buf) as usize;
            let storage = self.pool.storage(buf);
            let slice = &storage[..data_len.min(storage.len())];

            // The FCC server sends both the 4-byte RTCP control replies and
            // the unicast RTP burst on the same socket; distinguish by the
            // RTP version nibble.
            if let Some(hdr) = RtpHeader::parse(slice) {
                let Some(stream) = self.streams[idx].as_mut() else {
                    self.pool.ref_put(buf);
                    continue;
                };
                let outcome = stream.fcc.as_mut().map(|fcc| {
                    let (forwarded, action) = fcc.on_unicast_rtp(hdr.sequence);
                    (forwarded, fcc.should_drop_unicast(), action)
                });
                match outcome {
                    Some((forwarded, drop_unicast, action)) => {
                        // Apply the handover action (flushing any packets
                        // queued during MCAST_REQUESTED) before deciding the
                        // fate of this packet, so ordering is preserved.
                        self.apply_fcc_action(idx, action);
                        if forwarded && !drop_unicast {
                            self.ingest_rtp(idx, hdr.sequence, buf);
                        } else {
                            self.pool.ref_put(buf);
                        }
                    }
                    None => self.pool.ref_put(buf),
                }
                continue;
            }

            let Some(stream) = self.streams[idx].as_mut() else {
                self.pool.ref_put(buf);
                continue;
            };
            if let Some(fcc) = stream.fcc.as_mut() {
                if crate::fcc::is_sync_notification(stream.service.vendor.unwrap_or(crate::service::Vendor::Huawei), slice) {
                    let action = fcc.on_sync_or_timeout();
                    self.pool.ref_put(buf);
                    self.apply_fcc_action(idx, action);
                    continue;
                }
                let action = fcc.on_server_response(slice);
                self.pool.ref_put(buf);
                self.apply_fcc_action(idx, action);
                continue;
            }
            self.pool.ref_put(buf);
        }
        self.ev.schedule(OwnerId(idx as u64), now + self.cfg.timeouts.fcc_burst_inactivity_ms);
    }

    fn on_fec_ready(&mut self, idx: usize) {
        let Some(fd) = self.streams[idx].as_ref().and_then(|s| s.fec_fd) else { return };
        let (bufs, _received, _dropped) = self.pool.batch_recv(fd, false);
        let now = now_ms();
        for buf in bufs {
            let data_len = self.pool.data_len(buf) as usize;
            let storage = self.pool.storage(buf);
            let slice = &storage[..data_len.min(storage.len())];
            let Some(fec_hdr) = crate::rtp::RtpHeader::payload_offset(slice).and_then(|off| crate::fec::FecHeader::parse(&slice[off..])) else {
                self.pool.ref_put(buf);
                continue;
            };
            let Some(stream) = self.streams[idx].as_mut() else {
                self.pool.ref_put(buf);
                continue;
            };
            if let Some(fec) = stream.fec.as_mut() {
                let evicted = fec.on_fec_packet(&fec_hdr, buf, &mut self.pool, now);
                if let Some(range) = evicted {
                    stream.reorder.release_range(range.begin, range.end, &mut self.pool);
                }
            } else {
                self.pool.ref_put(buf);
            }
        }
    }

    /// Feeds one raw RTP packet (full buffer, header included) into the
    /// reorder engine and queues whatever it delivers onto the client
    /// connection, payload-only (header bytes are skipped via `data_off`).
    fn ingest_rtp(&mut self, idx: usize, seq: u16, buf: MemRef) {
        let Some(stream) = self.streams[idx].as_mut() else {
            self.pool.ref_put(buf);
            return;
        };
        let delivered = stream.reorder.insert(seq, buf, &mut self.pool);
        for mem in delivered.delivered {
            self.deliver_payload(idx, mem);
        }
        let base = self.streams[idx].as_ref().map(|s| s.reorder.base_seq());
        if let Some(base) = base {
            if let Some(fec) = self.streams[idx].as_mut().and_then(|s| s.fec.as_mut()) {
                fec.release_expired_groups(base, &mut self.pool);
            }
        }
        self.try_flush(idx);
        self.mark_activity(idx);
    }

    fn mark_activity(&mut self, idx: usize) {
        if let Some(stream) = self.streams[idx].as_mut() {
            stream.last_activity_ms = now_ms();
        }
    }

    fn try_flush(&mut self, idx: usize) {
        let Some(stream) = self.streams[idx].as_mut() else { return };
        match stream.connection.flush(&mut self.pool) {
            Ok(_) => {}
            Err(crate::error::GatewayError::Transient) => {
                let fd = stream.connection.fd;
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                let _ = self.ev.modify_write_interest(borrowed, true);
            }
            Err(_) => {
                self.close_stream(idx);
                return;
            }
        }
        let Some(stream) = self.streams[idx].as_mut() else { return };
        stream.connection.handle_completion(&mut self.pool);
        if stream.close_after_flush && stream.connection.total_bytes() == 0 {
            self.close_stream(idx);
        }
    }

    fn tick(&mut self, idx: usize) {
        if idx >= self.streams.len() || self.streams[idx].is_none() {
            return;
        }
        let now = now_ms();

        // FCC sync-wait / request timeout.
        if let Some(stream) = self.streams[idx].as_mut() {
            if let Some(fcc) = stream.fcc.as_mut() {
                match fcc.state {
                    crate::fcc::FccState::Requested => {
                        let action = fcc.on_request_timeout();
                        self.apply_fcc_action(idx, action);
                    }
                    crate::fcc::FccState::UnicastActive => {
                        let action = fcc.on_sync_or_timeout();
                        self.apply_fcc_action(idx, action);
                    }
                    _ => {}
                }
            }
        }

        // Multicast inactivity timeout: fatal, tear the stream down.
        let idle = self.streams[idx]
            .as_ref()
            .and_then(|s| s.multicast.as_ref())
            .map(|sess| sess.is_idle(now, self.cfg.timeouts.mcast_timeout_ms))
            .unwrap_or(false);
        if idle {
            self.close_stream(idx);
            return;
        }
        if let Some(stream) = self.streams[idx].as_mut() {
            if let Some(sess) = stream.multicast.as_mut() {
                sess.tick_rejoin(now);
            }
        }

        // Reorder timeout -> FEC recovery -> skip.
        if let Some(stream) = self.streams[idx].as_mut() {
            if let Some(gap_seq) = stream.reorder.check_timeout(now, self.cfg.timeouts.reorder_wait_ms) {
                let recovered = if let Some(fec) = stream.fec.as_mut() {
                    let reorder = &stream.reorder;
                    fec.try_recover(gap_seq, &mut self.pool, |s| reorder.peek(s))
                } else {
                    None
                };
                match recovered {
                    Some(mem) => {
                        let delivered = stream.reorder.fill_recovered(gap_seq, mem, &mut self.pool);
                        status::add_packets_recovered(1);
                        self.flush_delivered(idx, delivered);
                    }
                    None => {
                        let delivered = stream.reorder.skip_gap(&mut self.pool);
                        status::add_packets_lost(1);
                        self.flush_delivered(idx, delivered);
                    }
                }
            }
        }
        if self.streams[idx].is_some() {
            self.ev.schedule(OwnerId(idx as u64), now + self.cfg.timeouts.reorder_wait_ms.max(50));
        }
    }

    fn flush_delivered(&mut self, idx: usize, delivered: Vec<MemRef>) {
        for mem in delivered {
            self.deliver_payload(idx, mem);
        }
        self.try_flush(idx);
    }

    /// Delivers one reassembled RTP payload (header already to be stripped
    /// via `data_off`): queued onto the client's egress buffer in the common
    /// case, or fed to the MPEG-TS snapshot accumulator when the request
    /// asked for a still frame instead of a live stream.
    fn deliver_payload(&mut self, idx: usize, mem: MemRef) {
        let data_len = self.pool.data_len(mem);
        let payload_off = {
            let storage = self.pool.storage(mem);
            RtpHeader::payload_offset(&storage[..data_len as usize]).unwrap_or(0) as u32
        };
        let want_snapshot = self.streams[idx].as_ref().map(|s| s.want_snapshot).unwrap_or(false);
        if want_snapshot {
            let complete = {
                let storage = self.pool.storage(mem);
                let payload = &storage[payload_off as usize..data_len as usize];
                self.feed_snapshot(idx, payload)
            };
            self.pool.ref_put(mem);
            if complete {
                self.start_encode(idx);
            }
            return;
        }
        self.pool.set_data_off(mem, payload_off);
        let n = (data_len - payload_off) as u64;
        if let Some(stream) = self.streams[idx].as_mut() {
            stream.connection.queue_add(BufRef::Mem(mem), &self.pool, now_nanos() / 1000);
            status::add_bytes_sent(n);
        } else {
            self.pool.ref_put(mem);
        }
    }

    /// Splits a reassembled RTP payload into 188-byte MPEG-TS packets and
    /// feeds each into the stream's snapshot accumulator.
    fn feed_snapshot(&mut self, idx: usize, payload: &[u8]) -> bool {
        let Some(stream) = self.streams[idx].as_mut() else { return false };
        let Some(acc) = stream.snapshot.as_mut() else { return false };
        let mut complete = false;
        for chunk in payload.chunks(188) {
            if chunk.len() == 188 && acc.feed(chunk) {
                complete = true;
            }
        }
        complete
    }

    /// Spawns the configured encoder over the accumulated IDR access unit
    /// and registers its stdout fd with the event loop; `on_encoder_ready`
    /// drains it as it becomes readable; nothing here blocks the loop.
    fn start_encode(&mut self, idx: usize) {
        let Some(stream) = self.streams[idx].as_mut() else { return };
        let Some(mut acc) = stream.snapshot.take() else {
            self.close_stream(idx);
            return;
        };
        let encoder_path = self.cfg.general.ffmpeg_path.clone().unwrap_or_else(|| "ffmpeg".to_string());
        let encoder_args = self.cfg.general.ffmpeg_args.clone();
        let mut child = match acc.spawn_encoder(&encoder_path, &encoder_args) {
            Ok(child) => child,
            Err(e) => {
                log::warn!("snapshot encoder spawn failed: {e}");
                self.fail_snapshot(idx, "Snapshot Unavailable");
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            self.fail_snapshot(idx, "Snapshot Unavailable");
            return;
        };
        let fd = stdout.as_raw_fd();
        std::mem::forget(stdout); // fd ownership moves into EncodeJob; closed explicitly in finish_encode
        if set_nonblocking(fd).is_err() {
            unsafe { libc::close(fd) };
            let _ = child.kill();
            let _ = child.wait();
            self.fail_snapshot(idx, "Snapshot Unavailable");
            return;
        }
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        if self.ev.register(borrowed, OwnerId(idx as u64), false).is_err() {
            unsafe { libc::close(fd) };
            let _ = child.kill();
            let _ = child.wait();
            self.fail_snapshot(idx, "Snapshot Unavailable");
            return;
        }
        self.fd_kinds.insert(fd, FdKind::Encoder(idx));
        let Some(stream) = self.streams[idx].as_mut() else {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let _ = self.ev.unregister(borrowed);
            self.fd_kinds.remove(&fd);
            unsafe { libc::close(fd) };
            return;
        };
        stream.encode = Some(EncodeJob { child, acc, stdout_fd: fd, buf: Vec::new() });
    }

    /// The encoder's stdout pipe became readable: drain whatever's
    /// available without blocking. EOF (or a real read error) means the
    /// process is done with its end, so reap it and emit the response.
    fn on_encoder_ready(&mut self, idx: usize) {
        let Some(fd) = self.streams[idx].as_ref().and_then(|s| s.encode.as_ref()).map(|j| j.stdout_fd) else {
            return;
        };
        let mut chunk = Vec::new();
        let mut tmp = [0u8; 8192];
        let mut done = false;
        loop {
            let n = unsafe { libc::read(fd, tmp.as_mut_ptr() as *mut libc::c_void, tmp.len()) };
            if n > 0 {
                chunk.extend_from_slice(&tmp[..n as usize]);
                continue;
            }
            if n == 0 {
                done = true;
                break;
            }
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::EAGAIN) || errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                break;
            }
            done = true;
            break;
        }
        if !chunk.is_empty() {
            if let Some(job) = self.streams[idx].as_mut().and_then(|s| s.encode.as_mut()) {
                job.buf.extend_from_slice(&chunk);
            }
        }
        if done {
            self.finish_encode(idx);
        }
    }

    /// Reaps the encoder, unregisters and closes its stdout fd, and emits
    /// either the JPEG response or a 500 if the encode failed.
    fn finish_encode(&mut self, idx: usize) {
        let Some(stream) = self.streams[idx].as_mut() else { return };
        let Some(mut job) = stream.encode.take() else { return };
        let fd = job.stdout_fd;
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let _ = self.ev.unregister(borrowed);
        self.fd_kinds.remove(&fd);
        unsafe { libc::close(fd) };

        let status = job.child.wait();
        let ok = matches!(status, Ok(ref s) if s.success()) && !job.buf.is_empty();
        if ok {
            let mut out = Vec::new();
            out.extend_from_slice(b"HTTP/1.0 200 OK\r\nContent-Type: image/jpeg\r\nConnection: close\r\n");
            out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", job.buf.len()).as_bytes());
            out.extend_from_slice(&job.buf);
            self.queue_response(idx, &out);
        } else {
            log::warn!("snapshot encode failed for connection {idx}: {status:?}");
            self.fail_snapshot(idx, "Snapshot Encode Failed");
        }
        // `job.acc` drops here, unlinking the scratch file now that the
        // encoder has exited and no longer needs it open.
    }

    /// Emits a 500 response for a snapshot request that couldn't be
    /// satisfied, instead of silently closing the connection.
    fn fail_snapshot(&mut self, idx: usize, reason: &str) {
        let mut out = Vec::new();
        http::write_error_response(&mut out, 500, reason);
        self.queue_response(idx, &out);
    }

    fn close_stream(&mut self, idx: usize) {
        let Some(mut stream) = self.streams[idx].take() else { return };
        let client_fd = stream.connection.fd;
        let client_borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(client_fd) };
        let _ = self.ev.unregister(client_borrowed);
        self.fd_kinds.remove(&client_fd);
        self.ev.cancel_deadlines(OwnerId(idx as u64));

        if let Some(sess) = stream.multicast.take() {
            let fd = sess.fd();
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let _ = self.ev.unregister(borrowed);
            self.fd_kinds.remove(&fd);
            unsafe { libc::close(fd) };
        }
        if let Some(fd) = stream.fec_fd.take() {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let _ = self.ev.unregister(borrowed);
            self.fd_kinds.remove(&fd);
            unsafe { libc::close(fd) };
        }
        if let Some(mut job) = stream.encode.take() {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(job.stdout_fd) };
            let _ = self.ev.unregister(borrowed);
            self.fd_kinds.remove(&job.stdout_fd);
            unsafe { libc::close(job.stdout_fd) };
            let _ = job.child.kill();
            let _ = job.child.wait();
        }
        if let Some(fcc_fd) = stream.fcc_fd.take() {
            if let Some(mut fcc) = stream.fcc.take() {
                if let Some((term, addr)) = fcc.close(&mut self.pool) {
                    send_to(fcc_fd, &term, addr);
                }
            }
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fcc_fd) };
            let _ = self.ev.unregister(borrowed);
            self.fd_kinds.remove(&fcc_fd);
            unsafe { libc::close(fcc_fd) };
        }

        stream.connection.close(&mut self.pool);
        unsafe { libc::close(client_fd) };
        status::dec_connections();
        self.free_slots.push(idx);
    }

    pub fn refresh_status_clients(&mut self) {
        let now = now_ms();
        let entries: Vec<ClientStatusEntry> = self
            .streams
            .iter()
            .flatten()
            .map(|s| ClientStatusEntry {
                peer: s.peer.to_string(),
                channel: s.service.mcast_group.to_string(),
                bytes_sent: s.connection.total_bytes() as u64,
                connected_since_ms: now.saturating_sub(s.connected_since_ms),
            })
            .collect();
        self.status.set_clients(entries);
    }
}

/// Flips `O_NONBLOCK` on a plain pipe fd (a spawned child's stdout doesn't
/// inherit the listening-socket nonblocking setup `socket2` gives us).
fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if r < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn send_to(fd: RawFd, buf: &[u8], addr: SocketAddr) {
    let sockaddr: socket2::SockAddr = addr.into();
    unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            sockaddr.as_ptr(),
            sockaddr.len(),
        );
    }
}
