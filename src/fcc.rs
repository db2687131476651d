// src/fcc.rs — vendor-dispatched Fast Channel Change state machine.
//
// States and vendor payload builders are matched on a plain enum — tag
// dispatch rather than a `dyn Vendor` trait object, since the set of
// vendors is closed and fixed.
use crate::pool::{MemRef, Pool};
use crate::rtp::RtcpFccHeader;
use crate::service::Vendor;
use crate::util::serial16_diff;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccState {
    Init,
    Requested,
    UnicastPending,
    UnicastActive,
    McastRequested,
    McastActive,
    Error,
}

/// RTCP FMT codes dispatched by vendor.
mod fmt {
    pub const HUAWEI_REQUEST: u8 = 5;
    pub const HUAWEI_RESPONSE: u8 = 6;
    pub const HUAWEI_SYNC: u8 = 8;
    pub const HUAWEI_TERM: u8 = 9;
    pub const HUAWEI_NAT: u8 = 12;

    pub const TELECOM_REQUEST: u8 = 2;
    pub const TELECOM_RESPONSE: u8 = 3;
    pub const TELECOM_SYNC: u8 = 4;
    pub const TELECOM_TERM: u8 = 5;
}

const HUAWEI_REQUEST_LEN: usize = 32;
const HUAWEI_TERM_LEN: usize = 16;
const TELECOM_REQUEST_LEN: usize = 40;
const TELECOM_TERM_LEN: usize = 16;

/// Builds the vendor FCC request packet: header + multicast group + local
/// IP + ephemeral client port, zero-padded to the vendor-constant length.
pub fn build_request(vendor: Vendor, mcast_group: SocketAddr, local_ip: Ipv4Addr, client_port: u16) -> Vec<u8> {
    let (fmt_code, total_len) = match vendor {
        Vendor::Huawei => (fmt::HUAWEI_REQUEST, HUAWEI_REQUEST_LEN),
        Vendor::Telecom => (fmt::TELECOM_REQUEST, TELECOM_REQUEST_LEN),
    };
    let mut buf = vec![0u8; total_len];
    let word_len = ((total_len / 4) as u16).saturating_sub(1);
    buf[..RtcpFccHeader::LEN].copy_from_slice(&RtcpFccHeader::build(fmt_code, word_len));
    let mut off = RtcpFccHeader::LEN;
    if let SocketAddr::V4(v4) = mcast_group {
        buf[off..off + 4].copy_from_slice(&v4.ip().octets());
        buf[off + 4..off + 6].copy_from_slice(&v4.port().to_be_bytes());
    }
    off += 6;
    buf[off..off + 4].copy_from_slice(&local_ip.octets());
    off += 4;
    buf[off..off + 2].copy_from_slice(&client_port.to_be_bytes());
    buf
}

/// Builds the vendor termination packet carrying the RTP sequence at which
/// the server should stop the retransmission burst.
pub fn build_term(vendor: Vendor, term_seq: u16) -> Vec<u8> {
    let (fmt_code, total_len) = match vendor {
        Vendor::Huawei => (fmt::HUAWEI_TERM, HUAWEI_TERM_LEN),
        Vendor::Telecom => (fmt::TELECOM_TERM, TELECOM_TERM_LEN),
    };
    let mut buf = vec![0u8; total_len];
    let word_len = ((total_len / 4) as u16).saturating_sub(1);
    buf[..RtcpFccHeader::LEN].copy_from_slice(&RtcpFccHeader::build(fmt_code, word_len));
    buf[RtcpFccHeader::LEN..RtcpFccHeader::LEN + 2].copy_from_slice(&term_seq.to_be_bytes());
    buf
}

fn response_fmt_for(vendor: Vendor) -> u8 {
    match vendor {
        Vendor::Huawei => fmt::HUAWEI_RESPONSE,
        Vendor::Telecom => fmt::TELECOM_RESPONSE,
    }
}

fn sync_fmt_for(vendor: Vendor) -> u8 {
    match vendor {
        Vendor::Huawei => fmt::HUAWEI_SYNC,
        Vendor::Telecom => fmt::TELECOM_SYNC,
    }
}

/// Parsed server response to an FCC request: either a redirect to another
/// server or acceptance with an assigned unicast media port.
#[derive(Debug, Clone, Copy)]
pub enum ServerResponse {
    Accepted { media_port: u16 },
    Redirect { addr: SocketAddr },
}

/// `media_port` and `redirect_addr` are read from fixed offsets following
/// the 4-byte RTCP header; vendor response bodies share this minimal shape.
pub fn parse_response(vendor: Vendor, buf: &[u8]) -> Option<ServerResponse> {
    let hdr = RtcpFccHeader::parse(buf)?;
    if hdr.fmt != response_fmt_for(vendor) {
        return None;
    }
    if buf.len() < RtcpFccHeader::LEN + 2 {
        return None;
    }
    let flag = buf[RtcpFccHeader::LEN];
    if flag == 0xff {
        // Redirect: IPv4 + port follow the flag byte.
        if buf.len() < RtcpFccHeader::LEN + 7 {
            return None;
        }
        let ip_off = RtcpFccHeader::LEN + 1;
        let ip = Ipv4Addr::new(buf[ip_off], buf[ip_off + 1], buf[ip_off + 2], buf[ip_off + 3]);
        let port = u16::from_be_bytes([buf[ip_off + 4], buf[ip_off + 5]]);
        Some(ServerResponse::Redirect {
            addr: SocketAddr::new(IpAddr::V4(ip), port),
        })
    } else {
        let port_off = RtcpFccHeader::LEN;
        let media_port = u16::from_be_bytes([buf[port_off], buf[port_off + 1]]);
        Some(ServerResponse::Accepted { media_port })
    }
}

pub fn is_sync_notification(vendor: Vendor, buf: &[u8]) -> bool {
    RtcpFccHeader::parse(buf).map(|h| h.fmt == sync_fmt_for(vendor)).unwrap_or(false)
}

#[derive(Debug)]
pub enum FccAction {
    None,
    SendRequest(Vec<u8>, SocketAddr),
    SendTerm(Vec<u8>, SocketAddr),
    JoinMulticast,
    /// Multicast packets queued while MCAST_REQUESTED should be flushed to
    /// the normal RTP delivery path in original arrival order.
    FlushPending(Vec<(u16, MemRef)>),
    Abort,
}

pub struct FccSession {
    pub state: FccState,
    vendor: Vendor,
    server_addr: SocketAddr,
    max_redirect: u32,
    redirect_count: u32,
    unicast_seq: Option<u16>,
    term_seq: Option<u16>,
    term_sent: bool,
    pending_mcast: VecDeque<(u16, MemRef)>,
}

impl FccSession {
    pub fn new(vendor: Vendor, server_addr: SocketAddr, max_redirect: u32) -> Self {
        Self {
            state: FccState::Init,
            vendor,
            server_addr,
            max_redirect,
            redirect_count: 0,
            unicast_seq: None,
            term_seq: None,
            term_sent: false,
            pending_mcast: VecDeque::new(),
        }
    }

    pub fn start(&mut self, local_ip: Ipv4Addr, client_port: u16, mcast_group: SocketAddr) -> FccAction {
        debug_assert_eq!(self.state, FccState::Init);
        self.state = FccState::Requested;
        FccAction::SendRequest(
            build_request(self.vendor, mcast_group, local_ip, client_port),
            self.server_addr,
        )
    }

    pub fn on_server_response(&mut self, buf: &[u8]) -> FccAction {
        if self.state != FccState::Requested {
            return FccAction::None;
        }
        match parse_response(self.vendor, buf) {
            Some(ServerResponse::Accepted { .. }) => {
                self.state = FccState::UnicastPending;
                FccAction::None
            }
            Some(ServerResponse::Redirect { addr }) => {
                self.redirect_count += 1;
                if self.redirect_count > self.max_redirect {
                    self.state = FccState::Error;
                    return FccAction::Abort;
                }
                self.server_addr = addr;
                self.state = FccState::Init;
                FccAction::None
            }
            None => {
                // Unparseable response: fall back to direct multicast.
                self.state = FccState::McastActive;
                FccAction::JoinMulticast
            }
        }
    }

    pub fn on_request_timeout(&mut self) -> FccAction {
        if self.state == FccState::Requested {
            self.state = FccState::McastActive;
            FccAction::JoinMulticast
        } else {
            FccAction::None
        }
    }

    /// A unicast RTP data packet arrived on the FCC media socket. Returns
    /// whether the packet itself should be forwarded, plus any action the
    /// transition triggers. Reaching `McastActive` here (the handover
    /// completing on a unicast packet rather than a multicast one) flushes
    /// whatever multicast packets piled up in `pending_mcast` during the
    /// `McastRequested` window — otherwise they'd sit until `close()` and
    /// be dropped.
    pub fn on_unicast_rtp(&mut self, seq: u16) -> (bool, FccAction) {
        match self.state {
            FccState::UnicastPending => {
                self.state = FccState::UnicastActive;
                self.unicast_seq = Some(seq);
                (true, FccAction::None)
            }
            FccState::UnicastActive => {
                self.unicast_seq = Some(seq);
                (true, FccAction::None)
            }
            FccState::McastRequested => {
                self.unicast_seq = Some(seq);
                let mut action = FccAction::None;
                if let Some(term) = self.term_seq {
                    if serial16_diff(seq, term.wrapping_sub(1)) >= 0 {
                        self.state = FccState::McastActive;
                        if !self.pending_mcast.is_empty() {
                            action = FccAction::FlushPending(self.pending_mcast.drain(..).collect());
                        }
                    }
                }
                (true, action)
            }
            _ => (false, FccAction::None),
        }
    }

    /// Server sent a sync notification (or the configured sync timeout
    /// elapsed): begin joining multicast.
    pub fn on_sync_or_timeout(&mut self) -> FccAction {
        if self.state == FccState::UnicastActive {
            self.state = FccState::McastRequested;
            FccAction::JoinMulticast
        } else {
            FccAction::None
        }
    }

    /// A multicast RTP packet arrived while the session is past join.
    /// During MCAST_REQUESTED, packets are queued (an extra ref is held by
    /// the caller for each queued buffer) rather than forwarded.
    pub fn on_multicast_rtp(&mut self, seq: u16, buf: MemRef) -> FccAction {
        match self.state {
            FccState::McastRequested => {
                if self.term_seq.is_none() {
                    self.term_seq = Some(seq.wrapping_add(2));
                }
                self.pending_mcast.push_back((seq, buf));
                if !self.term_sent {
                    self.term_sent = true;
                    let term = build_term(self.vendor, self.term_seq.unwrap());
                    return FccAction::SendTerm(term, self.server_addr);
                }
                FccAction::None
            }
            FccState::McastActive => {
                let mut out: Vec<(u16, MemRef)> = self.pending_mcast.drain(..).collect();
                out.push((seq, buf));
                FccAction::FlushPending(out)
            }
            _ => FccAction::None,
        }
    }

    pub fn should_forward_multicast(&self) -> bool {
        matches!(self.state, FccState::McastActive)
    }

    pub fn should_drop_unicast(&self) -> bool {
        matches!(self.state, FccState::McastActive)
    }

    /// Cleanup on connection close: send the termination packet if it
    /// hasn't already gone out and release any still-pending buffers.
    pub fn close(&mut self, pool: &mut Pool) -> Option<(Vec<u8>, SocketAddr)> {
        for (_, buf) in self.pending_mcast.drain(..) {
            pool.ref_put(buf);
        }
        if self.term_sent || self.state == FccState::Init || self.state == FccState::Requested {
            return None;
        }
        self.term_sent = true;
        let term_seq = self.term_seq.or(self.unicast_seq).unwrap_or(0);
        Some((build_term(self.vendor, term_seq), self.server_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(p: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), p)
    }

    #[test]
    fn request_builders_match_vendor_constant_lengths() {
        let group = "239.1.1.1:5000".parse().unwrap();
        assert_eq!(
            build_request(Vendor::Huawei, group, Ipv4Addr::new(1, 2, 3, 4), 40000).len(),
            HUAWEI_REQUEST_LEN
        );
        assert_eq!(
            build_request(Vendor::Telecom, group, Ipv4Addr::new(1, 2, 3, 4), 40000).len(),
            TELECOM_REQUEST_LEN
        );
    }

    #[test]
    fn accepted_response_moves_to_unicast_pending() {
        let mut s = FccSession::new(Vendor::Huawei, addr(9000), 3);
        let group = "239.1.1.1:5000".parse().unwrap();
        let _ = s.start(Ipv4Addr::new(1, 2, 3, 4), 40000, group);
        assert_eq!(s.state, FccState::Requested);

        let mut resp = vec![0u8; 8];
        resp[..4].copy_from_slice(&RtcpFccHeader::build(fmt::HUAWEI_RESPONSE, 1));
        resp[4..6].copy_from_slice(&40010u16.to_be_bytes());
        let action = s.on_server_response(&resp);
        assert_eq!(s.state, FccState::UnicastPending);
        assert!(matches!(action, FccAction::None));
    }

    #[test]
    fn redirect_beyond_cap_aborts() {
        let mut s = FccSession::new(Vendor::Telecom, addr(9000), 1);
        let group = "239.1.1.1:5000".parse().unwrap();
        let _ = s.start(Ipv4Addr::new(1, 2, 3, 4), 40000, group);

        let mut redirect = vec![0u8; 11];
        redirect[..4].copy_from_slice(&RtcpFccHeader::build(fmt::TELECOM_RESPONSE, 2));
        redirect[4] = 0xff;
        redirect[5..9].copy_from_slice(&[10, 0, 0, 2]);
        redirect[9..11].copy_from_slice(&9001u16.to_be_bytes());

        let action = s.on_server_response(&redirect);
        assert!(matches!(action, FccAction::None));
        assert_eq!(s.state, FccState::Init);

        let _ = s.start(Ipv4Addr::new(1, 2, 3, 4), 40000, group);
        let action2 = s.on_server_response(&redirect);
        assert!(matches!(action2, FccAction::Abort));
        assert_eq!(s.state, FccState::Error);
    }

    #[test]
    fn term_sent_exactly_once_on_first_multicast_packet() {
        let mut pool = Pool::new(64, 8, 8, 0, 0, 8);
        let mut s = FccSession::new(Vendor::Huawei, addr(9000), 3);
        s.state = FccState::McastRequested;

        let buf1 = pool.alloc().unwrap();
        let a1 = s.on_multicast_rtp(548, buf1);
        assert!(matches!(a1, FccAction::SendTerm(_, _)));
        assert_eq!(s.term_seq, Some(550));

        let buf2 = pool.alloc().unwrap();
        let a2 = s.on_multicast_rtp(549, buf2);
        assert!(matches!(a2, FccAction::None));
    }

    #[test]
    fn unicast_reaching_term_seq_minus_one_activates_multicast() {
        let mut s = FccSession::new(Vendor::Huawei, addr(9000), 3);
        s.state = FccState::McastRequested;
        s.term_seq = Some(550);
        let (forwarded, action) = s.on_unicast_rtp(548);
        assert!(forwarded);
        assert!(matches!(action, FccAction::None));
        assert_eq!(s.state, FccState::McastRequested);
        let (forwarded, action) = s.on_unicast_rtp(549);
        assert!(forwarded);
        assert!(matches!(action, FccAction::None));
        assert_eq!(s.state, FccState::McastActive);
    }

    #[test]
    fn unicast_activation_flushes_packets_queued_during_handover() {
        let mut pool = Pool::new(64, 8, 8, 0, 0, 8);
        let mut s = FccSession::new(Vendor::Huawei, addr(9000), 3);
        s.state = FccState::McastRequested;
        s.term_seq = Some(550);

        let buf1 = pool.alloc().unwrap();
        let buf2 = pool.alloc().unwrap();
        s.pending_mcast.push_back((547, buf1));
        s.pending_mcast.push_back((548, buf2));

        let (forwarded, action) = s.on_unicast_rtp(549);
        assert!(forwarded);
        assert_eq!(s.state, FccState::McastActive);
        match action {
            FccAction::FlushPending(pending) => {
                assert_eq!(pending.len(), 2);
                assert_eq!(pending[0].0, 547);
                assert_eq!(pending[1].0, 548);
            }
            other => panic!("expected FlushPending, got {other:?}"),
        }
        assert!(s.pending_mcast.is_empty());
    }
}
