// src/playlist.rs — M3U playlist rewriter.
//
// Not a fetch subsystem: the source playlist arrives from wherever the
// admin configured it, and fetching it is left to that external plumbing.
// The URL rewrite itself is the core job: each `udp://` / `rtp://` entry is
// turned into an absolute `http://<hostname>` URL through this gateway, the
// way UDPxy-style proxies rewrite playlists.
const UDP_SCHEME: &str = "udp://";
const RTP_SCHEME: &str = "rtp://";

/// Rewrites every multicast-scheme line of `source` into an HTTP URL
/// pointing at this gateway (`hostname:port`), leaving all other lines
/// (`#EXTM3U`, `#EXTINF`, comments, already-HTTP entries) untouched.
pub fn rewrite(source: &str, hostname: &str, port: u16) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim_end();
        if let Some(rest) = trimmed.strip_prefix(UDP_SCHEME) {
            out.push_str(&format!("http://{hostname}:{port}/udp/{rest}"));
        } else if let Some(rest) = trimmed.strip_prefix(RTP_SCHEME) {
            out.push_str(&format!("http://{hostname}:{port}/rtp/{rest}"));
        } else {
            out.push_str(trimmed);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_udp_and_rtp_entries() {
        let src = "#EXTM3U\n#EXTINF:-1,Channel One\nudp://239.1.1.1:1234\n#EXTINF:-1,Channel Two\nrtp://239.1.1.2:1234\n";
        let out = rewrite(src, "gw.example.com", 5140);
        assert!(out.contains("http://gw.example.com:5140/udp/239.1.1.1:1234"));
        assert!(out.contains("http://gw.example.com:5140/rtp/239.1.1.2:1234"));
        assert!(out.contains("#EXTM3U"));
    }

    #[test]
    fn leaves_non_multicast_lines_untouched() {
        let src = "#EXTM3U\nhttp://already.example/stream\n";
        let out = rewrite(src, "gw", 5140);
        assert_eq!(out, "#EXTM3U\nhttp://already.example/stream\n");
    }
}
