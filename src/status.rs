// src/status.rs — Prometheus metrics + the /status admin dashboard.
//
// A `Lazy<...>` + `Registry` idiom and a `tiny_http`-backed exporter thread
// (`spawn_metrics_http`) expose gateway counters: connections, bytes, FCC
// sessions, reorder/FEC outcomes.
//
// The `/status` HTML+JSON dashboard itself is served from the worker's own
// event loop via `http.rs`, not this thread: each worker's `StatusRegion`
// covers only the clients that worker owns, and there is no cross-worker
// shared-memory segment (see DESIGN.md for that tradeoff).
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::collections::VecDeque;
use std::net::ToSocketAddrs;
use std::thread;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("connections_active", "Currently open client connections").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static BYTES_SENT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("bytes_sent_total", "Payload bytes sent to clients").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static PACKETS_LOST_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("reorder_packets_lost_total", "RTP packets lost after recovery failed").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static PACKETS_RECOVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("fec_packets_recovered_total", "RTP packets recovered via FEC").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static FCC_SESSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("fcc_sessions_total", "FCC sessions by terminal state"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static POOL_FREE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("pool_buffers_free", "Free buffers in this worker's pool").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static POOL_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("pool_buffers_total", "Total buffers allocated in this worker's pool").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn inc_connections() {
    CONNECTIONS_ACTIVE.inc();
}
pub fn dec_connections() {
    CONNECTIONS_ACTIVE.dec();
}
pub fn add_bytes_sent(n: u64) {
    BYTES_SENT_TOTAL.inc_by(n);
}
pub fn add_packets_lost(n: u64) {
    PACKETS_LOST_TOTAL.inc_by(n);
}
pub fn add_packets_recovered(n: u64) {
    PACKETS_RECOVERED_TOTAL.inc_by(n);
}
pub fn inc_fcc_outcome(outcome: &str) {
    FCC_SESSIONS_TOTAL.with_label_values(&[outcome]).inc();
}
pub fn set_pool_stats(free: usize, total: usize) {
    POOL_FREE.set(free as i64);
    POOL_TOTAL.set(total as i64);
}

/// Spawns the `/metrics` Prometheus exporter on a dedicated thread, outside
/// the per-worker event loop — it's cross-cutting ambient infrastructure,
/// not a client-facing stream, so it doesn't belong on the fd→owner map.
pub fn spawn_metrics_http<A: ToSocketAddrs + Send + 'static>(addr: A) -> thread::JoinHandle<()> {
    let addr_string = addr
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "0.0.0.0:9090".to_string());

    thread::spawn(move || {
        let server = match tiny_http::Server::http(&addr_string) {
            Ok(s) => s,
            Err(e) => {
                log::error!("metrics http listener failed on {addr_string}: {e}");
                return;
            }
        };
        log::info!("prometheus metrics listening on http://{addr_string}/metrics");
        let encoder = TextEncoder::new();
        for req in server.incoming_requests() {
            match req.url() {
                "/metrics" => {
                    let metric_families = REGISTRY.gather();
                    let mut buf = Vec::with_capacity(8 * 1024);
                    encoder.encode(&metric_families, &mut buf).ok();
                    let resp = tiny_http::Response::from_data(buf).with_status_code(200).with_header(
                        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4"[..]).unwrap(),
                    );
                    let _ = req.respond(resp);
                }
                "/healthz" => {
                    let _ = req.respond(tiny_http::Response::from_string("OK").with_status_code(200));
                }
                _ => {
                    let _ = req.respond(tiny_http::Response::empty(404));
                }
            }
        }
    })
}

const MAX_LOG_LINES: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientStatusEntry {
    pub peer: String,
    pub channel: String,
    pub bytes_sent: u64,
    pub connected_since_ms: u64,
}

/// Per-worker, single-threaded "status region": no locking needed since
/// it's only ever touched from the event loop that owns it. `/status`
/// reads render from this directly.
#[derive(Default)]
pub struct StatusRegion {
    clients: Vec<ClientStatusEntry>,
    log: VecDeque<String>,
}

impl StatusRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_clients(&mut self, clients: Vec<ClientStatusEntry>) {
        self.clients = clients;
    }

    pub fn append_log(&mut self, line: String) {
        if self.log.len() >= MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    pub fn render_json(&self) -> String {
        let mut out = String::from("{\"clients\":[");
        for (i, c) in self.clients.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!(
                "{{\"peer\":\"{}\",\"channel\":\"{}\",\"bytes_sent\":{},\"connected_since_ms\":{}}}",
                json_escape(&c.peer),
                json_escape(&c.channel),
                c.bytes_sent,
                c.connected_since_ms,
            ));
        }
        out.push_str("],\"log\":[");
        for (i, l) in self.log.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('"');
            out.push_str(&json_escape(l));
            out.push('"');
        }
        out.push_str("]}");
        out
    }

    pub fn render_html(&self) -> String {
        let mut rows = String::new();
        for c in &self.clients {
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                html_escape(&c.peer),
                html_escape(&c.channel),
                c.bytes_sent,
                c.connected_since_ms,
            ));
        }
        format!(
            "<html><head><title>iptvgwd status</title></head><body>\
             <h1>Clients</h1><table border=\"1\"><tr><th>Peer</th><th>Channel</th><th>Bytes Sent</th><th>Connected Since (ms)</th></tr>{rows}</table>\
             <h1>Log</h1><pre>{log}</pre></body></html>",
            log = html_escape(&self.log.iter().cloned().collect::<Vec<_>>().join("\n")),
        )
    }
}

fn json_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_region_renders_json_with_clients() {
        let mut region = StatusRegion::new();
        region.set_clients(vec![ClientStatusEntry {
            peer: "1.2.3.4:5555".into(),
            channel: "239.0.0.1:1234".into(),
            bytes_sent: 1024,
            connected_since_ms: 1000,
        }]);
        region.append_log("started".into());
        let json = region.render_json();
        assert!(json.contains("\"bytes_sent\":1024"));
        assert!(json.contains("\"log\":[\"started\"]"));
    }

    #[test]
    fn log_ring_bounds_at_max_lines() {
        let mut region = StatusRegion::new();
        for i in 0..(MAX_LOG_LINES + 10) {
            region.append_log(format!("line {i}"));
        }
        assert_eq!(region.log.len(), MAX_LOG_LINES);
        assert_eq!(region.log.front().unwrap(), &format!("line {}", 10));
    }
}
