// src/igmp.rs — unsolicited IGMP membership reports for periodic rejoin.
// Built as raw bytes and sent over a raw IPPROTO_IGMP socket carrying the
// IP Router-Alert option, reaching for `libc::setsockopt` directly where
// socket2 doesn't expose a knob (IP_OPTIONS here).
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;

const IGMPV2_MEMBERSHIP_REPORT: u8 = 0x16;
const IGMPV3_MEMBERSHIP_REPORT: u8 = 0x22;
const MODE_IS_INCLUDE: u8 = 1;
const MODE_IS_EXCLUDE: u8 = 2;
const IGMPV3_ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

/// 4-byte IP Router-Alert option (RFC 2113), set via `IP_OPTIONS` so every
/// datagram sent on the socket carries it.
pub const ROUTER_ALERT_OPTION: [u8; 4] = [0x94, 0x04, 0x00, 0x00];

fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// IGMPv2 Membership Report (type 0x16): ASM rejoin, unicast to the group
/// address itself.
pub fn igmpv2_membership_report(group: Ipv4Addr) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0] = IGMPV2_MEMBERSHIP_REPORT;
    buf[1] = 0; // max response time, unused in a report
    buf[4..8].copy_from_slice(&group.octets());
    let cksum = internet_checksum(&buf);
    buf[2..4].copy_from_slice(&cksum.to_be_bytes());
    buf
}

/// IGMPv3 Membership Report (type 0x22), sent to 224.0.0.22: one group
/// record, MODE_IS_EXCLUDE (ASM, no source filter) or MODE_IS_INCLUDE with
/// the SSM source list.
pub fn igmpv3_membership_report(group: Ipv4Addr, ssm_source: Option<Ipv4Addr>) -> Vec<u8> {
    let num_sources: u16 = ssm_source.is_some() as u16;
    let record_type = if ssm_source.is_some() { MODE_IS_INCLUDE } else { MODE_IS_EXCLUDE };
    let record_len = 8 + (num_sources as usize) * 4;
    let mut buf = vec![0u8; 8 + record_len];

    buf[0] = IGMPV3_MEMBERSHIP_REPORT;
    buf[1] = 0; // reserved
    // buf[2..4] checksum, filled last
    buf[6..8].copy_from_slice(&1u16.to_be_bytes()); // number of group records

    let rec = &mut buf[8..];
    rec[0] = record_type;
    rec[1] = 0; // aux data len
    rec[2..4].copy_from_slice(&num_sources.to_be_bytes());
    rec[4..8].copy_from_slice(&group.octets());
    if let Some(src) = ssm_source {
        rec[8..12].copy_from_slice(&src.octets());
    }

    let cksum = internet_checksum(&buf);
    buf[2..4].copy_from_slice(&cksum.to_be_bytes());
    buf
}

/// Raw socket used solely to emit unsolicited membership reports; no
/// receive path (the kernel's own IGMP stack owns actual group membership,
/// this just refreshes upstream snooping state).
pub struct IgmpRejoiner {
    sock: Socket,
}

impl IgmpRejoiner {
    pub fn new() -> io::Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(libc::IPPROTO_IGMP)))?;
        let opt = ROUTER_ALERT_OPTION;
        let rc = unsafe {
            libc::setsockopt(
                sock.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_OPTIONS,
                opt.as_ptr() as *const libc::c_void,
                opt.len() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sock })
    }

    pub fn send_v2(&self, group: Ipv4Addr) -> io::Result<()> {
        let pkt = igmpv2_membership_report(group);
        let dest: SocketAddr = SocketAddr::V4(SocketAddrV4::new(group, 0));
        self.sock.send_to(&pkt, &dest.into())?;
        Ok(())
    }

    pub fn send_v3(&self, group: Ipv4Addr, ssm_source: Option<Ipv4Addr>) -> io::Result<()> {
        let pkt = igmpv3_membership_report(group, ssm_source);
        let dest: SocketAddr = SocketAddr::V4(SocketAddrV4::new(IGMPV3_ALL_ROUTERS, 0));
        self.sock.send_to(&pkt, &dest.into())?;
        Ok(())
    }
}

pub fn is_ipv4(addr: IpAddr) -> bool {
    matches!(addr, IpAddr::V4(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_report_checksum_is_self_consistent() {
        let pkt = igmpv2_membership_report(Ipv4Addr::new(239, 1, 1, 1));
        assert_eq!(internet_checksum(&pkt), 0);
        assert_eq!(pkt[0], IGMPV2_MEMBERSHIP_REPORT);
    }

    #[test]
    fn v3_asm_report_uses_exclude_with_no_sources() {
        let pkt = igmpv3_membership_report(Ipv4Addr::new(239, 1, 1, 1), None);
        assert_eq!(internet_checksum(&pkt), 0);
        assert_eq!(pkt[8], MODE_IS_EXCLUDE);
        assert_eq!(u16::from_be_bytes([pkt[10], pkt[11]]), 0);
        assert_eq!(pkt.len(), 16);
    }

    #[test]
    fn v3_ssm_report_includes_source_address() {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let pkt = igmpv3_membership_report(Ipv4Addr::new(239, 1, 1, 1), Some(src));
        assert_eq!(internet_checksum(&pkt), 0);
        assert_eq!(pkt[8], MODE_IS_INCLUDE);
        assert_eq!(u16::from_be_bytes([pkt[10], pkt[11]]), 1);
        assert_eq!(&pkt[16..20], &src.octets());
        assert_eq!(pkt.len(), 20);
    }
}
