// src/multicast.rs — multicast join and periodic rejoin.
//
// Socket construction (socket2 builder, `SO_REUSEADDR`, wildcard bind,
// `set_recv_buffer_size`, interface-scoped join) is generalized to the
// gateway's per-request service/interface configuration, and extended with
// `MCAST_JOIN_SOURCE_GROUP` for SSM plus an IGMP rejoin scheduler.
use crate::igmp::IgmpRejoiner;
use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

/// `setsockopt(IPPROTO_IP, MCAST_JOIN_SOURCE_GROUP, struct group_source_req)`
/// — socket2 has no SSM-join wrapper, so this falls back to raw `libc` for
/// the option it doesn't expose.
fn join_source_group_v4(sock: &Socket, group: Ipv4Addr, source: Ipv4Addr, iface: Ipv4Addr) -> std::io::Result<()> {
    let mut req: libc::group_source_req = unsafe { std::mem::zeroed() };
    req.gsr_interface = u32::from(iface) as _;

    let group_sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(group.octets()),
        },
        sin_zero: [0; 8],
    };
    let source_sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(source.octets()),
        },
        sin_zero: [0; 8],
    };
    unsafe {
        std::ptr::copy_nonoverlapping(
            &group_sin as *const _ as *const u8,
            &mut req.gsr_group as *mut _ as *mut u8,
            std::mem::size_of::<libc::sockaddr_in>(),
        );
        std::ptr::copy_nonoverlapping(
            &source_sin as *const _ as *const u8,
            &mut req.gsr_source as *mut _ as *mut u8,
            std::mem::size_of::<libc::sockaddr_in>(),
        );
    }

    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::MCAST_JOIN_SOURCE_GROUP,
            &req as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::group_source_req>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub struct MulticastSession {
    pub sock: UdpSocket,
    pub group: SocketAddr,
    pub ssm_source: Option<IpAddr>,
    rejoiner: Option<IgmpRejoiner>,
    rejoin_interval_ms: Option<u64>,
    last_rejoin_ms: u64,
    pub last_activity_ms: u64,
}

impl MulticastSession {
    /// Joins `group` (ASM) or `(group, ssm_source)` (SSM) on `iface`,
    /// binding to the group's port with `SO_REUSEADDR` set.
    pub fn join(
        group: SocketAddr,
        ssm_source: Option<IpAddr>,
        iface: Option<Ipv4Addr>,
        rcvbuf: usize,
        rejoin_interval_ms: Option<u64>,
        now_ms: u64,
    ) -> anyhow::Result<Self> {
        let domain = match group {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket")?;
        sock.set_reuse_address(true).ok();
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        sock.set_reuse_port(true).ok();

        let bind_addr = match group {
            SocketAddr::V4(v4) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), v4.port()),
            SocketAddr::V6(v6) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), v6.port()),
        };
        sock.bind(&bind_addr.into()).context("bind")?;

        if rcvbuf > 0 {
            let _ = sock.set_recv_buffer_size(rcvbuf);
        }

        match (group, ssm_source, iface) {
            (SocketAddr::V4(g), Some(IpAddr::V4(src)), iface) => {
                join_source_group_v4(&sock, *g.ip(), src, iface.unwrap_or(Ipv4Addr::UNSPECIFIED))
                    .context("MCAST_JOIN_SOURCE_GROUP")?;
            }
            (SocketAddr::V4(g), None, iface) => {
                sock.join_multicast_v4(g.ip(), &iface.unwrap_or(Ipv4Addr::UNSPECIFIED))
                    .context("join_multicast_v4")?;
            }
            (SocketAddr::V6(g), _, _) => {
                sock.join_multicast_v6(g.ip(), 0).context("join_multicast_v6")?;
            }
            _ => anyhow::bail!("address family mismatch between group and SSM source"),
        }

        let s: UdpSocket = sock.into();
        s.set_nonblocking(true).ok();

        let rejoiner = if rejoin_interval_ms.is_some() {
            IgmpRejoiner::new().ok()
        } else {
            None
        };

        Ok(Self {
            sock: s,
            group,
            ssm_source,
            rejoiner,
            rejoin_interval_ms,
            last_rejoin_ms: now_ms,
            last_activity_ms: now_ms,
        })
    }

    pub fn fd(&self) -> std::os::fd::RawFd {
        self.sock.as_raw_fd()
    }

    pub fn note_activity(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    pub fn is_idle(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) >= timeout_ms
    }

    /// Sends one IGMPv2 report to the group and one IGMPv3 report to
    /// 224.0.0.22, if the rejoin interval has elapsed.
    pub fn tick_rejoin(&mut self, now_ms: u64) {
        let Some(interval) = self.rejoin_interval_ms else {
            return;
        };
        if now_ms.saturating_sub(self.last_rejoin_ms) < interval {
            return;
        }
        self.last_rejoin_ms = now_ms;
        let (IpAddr::V4(group_ip), rejoiner) = (self.group.ip(), &self.rejoiner) else {
            return;
        };
        if let Some(r) = rejoiner {
            let _ = r.send_v2(group_ip);
            let ssm_v4 = match self.ssm_source {
                Some(IpAddr::V4(ip)) => Some(ip),
                _ => None,
            };
            let _ = r.send_v3(group_ip, ssm_v4);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_idle_compares_against_timeout() {
        // Exercised without an actual socket join (no multicast-capable
        // interface in CI sandboxes); construct the struct fields directly.
        let sock = UdpSocket::bind("0.0.0.0:0").unwrap();
        sock.set_nonblocking(true).ok();
        let sess = MulticastSession {
            sock,
            group: "239.0.0.1:1234".parse().unwrap(),
            ssm_source: None,
            rejoiner: None,
            rejoin_interval_ms: None,
            last_rejoin_ms: 0,
            last_activity_ms: 1000,
        };
        assert!(!sess.is_idle(1500, 1000));
        assert!(sess.is_idle(2500, 1000));
    }
}
