// src/http.rs — minimal HTTP/1.0-1.1 request line parser and response
// writer.
//
// Byte-scanning request-line parser (scan for spaces, no framework, no
// regex) rather than pulling in a full HTTP crate.
use crate::service::{RequestForm, Service, Vendor};
use std::collections::HashMap;
use std::net::SocketAddr;

pub const MAX_REQUEST_LINE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Udp { target: SocketAddr },
    Rtp { target: SocketAddr },
    Rtsp { url: String },
    Status,
    Playlist,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub route: Route,
    pub query: HashMap<String, String>,
    pub snapshot: bool,
}

/// Returns `None` until `\r\n\r\n` has been seen (request incomplete), and
/// `Some(Err(..))` for a complete-but-malformed request line.
pub fn try_parse_request(buf: &[u8]) -> Option<Result<ParsedRequest, &'static str>> {
    let header_end = find_header_end(buf)?;
    let request_line_end = buf.iter().position(|&b| b == b'\r' || b == b'\n').unwrap_or(header_end);
    let line = &buf[..request_line_end];

    let first_space = line.iter().position(|&b| b == b' ');
    let Some(fs) = first_space else {
        return Some(Err("missing method"));
    };
    let rest = &line[fs + 1..];
    let Some(ss) = rest.iter().position(|&b| b == b' ') else {
        return Some(Err("missing HTTP version"));
    };
    let path_and_query = &rest[..ss];
    let Ok(raw) = std::str::from_utf8(path_and_query) else {
        return Some(Err("non-utf8 path"));
    };
    Some(Ok(parse_path_and_query(raw)))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_path_and_query(raw: &str) -> ParsedRequest {
    let (path, qs) = match raw.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (raw, None),
    };
    let query = qs.map(parse_query_string).unwrap_or_default();
    let snapshot = query.get("snapshot").map(|v| v == "1").unwrap_or(false);
    let route = route_for_path(path);
    ParsedRequest { route, query, snapshot }
}

fn parse_query_string(qs: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in qs.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(url_decode(k), url_decode(v));
    }
    map
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn route_for_path(path: &str) -> Route {
    if let Some(rest) = path.strip_prefix("/udp/") {
        return rest.parse().map(|t| Route::Udp { target: t }).unwrap_or(Route::NotFound);
    }
    if let Some(rest) = path.strip_prefix("/rtp/") {
        return rest.parse().map(|t| Route::Rtp { target: t }).unwrap_or(Route::NotFound);
    }
    if let Some(rest) = path.strip_prefix("/rtsp/") {
        return Route::Rtsp { url: url_decode(rest) };
    }
    match path {
        "/status" => Route::Status,
        "/playlist.m3u" => Route::Playlist,
        _ => Route::NotFound,
    }
}

/// Builds a `Service` descriptor from a parsed `/udp` or `/rtp` request and
/// its query parameters (`fcc`, `vendor`, `fec`, `msrc`).
pub fn service_from_request(req: &ParsedRequest) -> Option<Service> {
    let (form, target) = match req.route {
        Route::Udp { target } => (RequestForm::Udp, target),
        Route::Rtp { target } => (RequestForm::Rtp, target),
        Route::Rtsp { ref url } => {
            return Some(Service {
                form: RequestForm::Rtsp,
                mcast_group: "0.0.0.0:0".parse().unwrap(),
                ssm_source: None,
                fcc_server: None,
                vendor: None,
                fec_port: None,
                rtsp_url: Some(url.clone()),
                playseek: req.query.get("playseek").cloned(),
            });
        }
        _ => return None,
    };
    let fcc_server = req.query.get("fcc").and_then(|s| s.parse().ok());
    let vendor = req.query.get("vendor").and_then(|s| Vendor::parse(s));
    let fec_port = req.query.get("fec").and_then(|s| s.parse().ok());
    let ssm_source = req.query.get("msrc").and_then(|s| s.parse().ok());
    Some(Service {
        form,
        mcast_group: target,
        ssm_source,
        fcc_server,
        vendor,
        fec_port,
        rtsp_url: None,
        playseek: None,
    })
}

pub fn write_streaming_headers(out: &mut Vec<u8>, content_type: &str) {
    out.extend_from_slice(b"HTTP/1.0 200 OK\r\n");
    out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    out.extend_from_slice(b"Connection: close\r\n");
    out.extend_from_slice(b"Cache-Control: no-cache\r\n\r\n");
}

pub fn write_error_response(out: &mut Vec<u8>, status: u16, reason: &str) {
    let body = format!("{status} {reason}\n");
    out.extend_from_slice(format!("HTTP/1.0 {status} {reason}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_route_with_query() {
        let req = b"GET /udp/239.1.1.1:1234?fcc=10.0.0.1:9000&vendor=huawei HTTP/1.1\r\nHost: x\r\n\r\n";
        let parsed = try_parse_request(req).unwrap().unwrap();
        match parsed.route {
            Route::Udp { target } => assert_eq!(target, "239.1.1.1:1234".parse().unwrap()),
            other => panic!("unexpected route: {other:?}"),
        }
        assert_eq!(parsed.query.get("vendor").unwrap(), "huawei");
        let svc = service_from_request(&parsed).unwrap();
        assert_eq!(svc.vendor, Some(Vendor::Huawei));
    }

    #[test]
    fn incomplete_request_returns_none() {
        let req = b"GET /udp/239.1.1.1:1234 HTTP/1.1\r\nHost: x\r\n";
        assert!(try_parse_request(req).is_none());
    }

    #[test]
    fn snapshot_query_flag_detected() {
        let req = b"GET /rtp/239.1.1.1:1234?snapshot=1 HTTP/1.0\r\n\r\n";
        let parsed = try_parse_request(req).unwrap().unwrap();
        assert!(parsed.snapshot);
    }

    #[test]
    fn status_and_playlist_routes() {
        let req = b"GET /status HTTP/1.1\r\n\r\n";
        assert_eq!(try_parse_request(req).unwrap().unwrap().route, Route::Status);
        let req2 = b"GET /playlist.m3u HTTP/1.1\r\n\r\n";
        assert_eq!(try_parse_request(req2).unwrap().unwrap().route, Route::Playlist);
    }
}
