// src/service.rs — immutable per-channel descriptor.
//
// Dispatch on vendor/service kind is a tagged enum matched at the builder
// call sites rather than a trait object per vendor: the set of vendors and
// request forms is closed and small.
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Huawei,
    Telecom,
}

impl Vendor {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "huawei" => Some(Vendor::Huawei),
            "telecom" => Some(Vendor::Telecom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// `GET /udp/<addr>:<port>` — raw UDP payload passthrough, no RTP header.
    Udp,
    /// `GET /rtp/<addr>:<port>` — RTP payloads, header stripped.
    Rtp,
    /// `GET /rtsp/<url>` — interleaved RTP-over-TCP relay.
    Rtsp,
}

/// Immutable channel descriptor, built once at request parse.
#[derive(Debug, Clone)]
pub struct Service {
    pub form: RequestForm,
    pub mcast_group: SocketAddr,
    pub ssm_source: Option<std::net::IpAddr>,
    pub fcc_server: Option<SocketAddr>,
    pub vendor: Option<Vendor>,
    pub fec_port: Option<u16>,
    pub rtsp_url: Option<String>,
    pub playseek: Option<String>,
}

impl Service {
    pub fn uses_fcc(&self) -> bool {
        self.fcc_server.is_some() && self.vendor.is_some()
    }

    pub fn uses_fec(&self) -> bool {
        self.fec_port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_parses_case_insensitively() {
        assert_eq!(Vendor::parse("Huawei"), Some(Vendor::Huawei));
        assert_eq!(Vendor::parse("TELECOM"), Some(Vendor::Telecom));
        assert_eq!(Vendor::parse("cisco"), None);
    }

    #[test]
    fn service_without_fcc_reports_no_fcc() {
        let svc = Service {
            form: RequestForm::Rtp,
            mcast_group: "239.0.0.1:1234".parse().unwrap(),
            ssm_source: None,
            fcc_server: None,
            vendor: None,
            fec_port: None,
            rtsp_url: None,
            playseek: None,
        };
        assert!(!svc.uses_fcc());
        assert!(!svc.uses_fec());
    }
}
