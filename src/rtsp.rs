// src/rtsp.rs — RTSP interleaved ingress plus a thin RTSP request builder.
//
// Full DESCRIBE/SETUP/PLAY session negotiation is treated as a minimal
// external-interface stub here: just enough request-string building and
// status-line parsing to get a session going. The interleaved binary-data
// framing (RFC 2326 §10.12, `$<channel><len><payload>`) gets full treatment,
// using the same byte-scanning idiom as `http.rs`'s request-line parser.
use std::collections::HashMap;

const INTERLEAVED_MAGIC: u8 = b'$';
const INTERLEAVED_HEADER_LEN: usize = 4;

/// Incrementally reassembles `$`-framed RTP/RTCP packets off an RTSP TCP
/// control connection. Holds a growable byte buffer rather than a fixed
/// ring, since interleaved frame sizes vary with RTP payload size.
pub struct InterleavedFrameReader {
    buf: Vec<u8>,
}

impl Default for InterleavedFrameReader {
    fn default() -> Self {
        Self { buf: Vec::with_capacity(4096) }
    }
}

impl InterleavedFrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops one complete interleaved frame `(channel, payload)` if the
    /// buffer holds one, discarding bytes before a `$` that don't look like
    /// an interleaved header (e.g. stray RTSP response text sharing the
    /// connection).
    pub fn try_next_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        loop {
            let start = self.buf.iter().position(|&b| b == INTERLEAVED_MAGIC)?;
            if start > 0 {
                self.buf.drain(..start);
            }
            if self.buf.len() < INTERLEAVED_HEADER_LEN {
                return None;
            }
            let channel = self.buf[1];
            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            if self.buf.len() < INTERLEAVED_HEADER_LEN + len {
                return None;
            }
            let payload = self.buf[INTERLEAVED_HEADER_LEN..INTERLEAVED_HEADER_LEN + len].to_vec();
            self.buf.drain(..INTERLEAVED_HEADER_LEN + len);
            return Some((channel, payload));
        }
    }
}

/// Minimal RTSP/1.0 request builder: CSeq-tracked OPTIONS/DESCRIBE/SETUP/
/// PLAY strings. No response state machine beyond reading the status code
/// and a handful of headers (`Session`, `Transport`) a caller pulls out
/// with `parse_headers`.
pub struct RtspRequestBuilder {
    cseq: u32,
}

impl Default for RtspRequestBuilder {
    fn default() -> Self {
        Self { cseq: 1 }
    }
}

impl RtspRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cseq(&mut self) -> u32 {
        let c = self.cseq;
        self.cseq += 1;
        c
    }

    pub fn describe(&mut self, url: &str) -> Vec<u8> {
        format!("DESCRIBE {url} RTSP/1.0\r\nCSeq: {}\r\nAccept: application/sdp\r\n\r\n", self.next_cseq())
            .into_bytes()
    }

    pub fn setup(&mut self, url: &str, interleaved_channels: (u8, u8)) -> Vec<u8> {
        format!(
            "SETUP {url} RTSP/1.0\r\nCSeq: {}\r\nTransport: RTP/AVP/TCP;interleaved={}-{}\r\n\r\n",
            self.next_cseq(),
            interleaved_channels.0,
            interleaved_channels.1
        )
        .into_bytes()
    }

    pub fn play(&mut self, url: &str, session: &str, playseek: Option<&str>) -> Vec<u8> {
        let mut req = format!("PLAY {url} RTSP/1.0\r\nCSeq: {}\r\nSession: {session}\r\n", self.next_cseq());
        if let Some(seek) = playseek {
            req.push_str(&format!("Range: clock={seek}\r\n"));
        }
        req.push_str("\r\n");
        req.into_bytes()
    }

    pub fn teardown(&mut self, url: &str, session: &str) -> Vec<u8> {
        format!("TEARDOWN {url} RTSP/1.0\r\nCSeq: {}\r\nSession: {session}\r\n\r\n", self.next_cseq()).into_bytes()
    }
}

/// Parses the numeric status code out of an RTSP response's first line.
pub fn parse_status_code(response: &[u8]) -> Option<u16> {
    let line_end = response.iter().position(|&b| b == b'\r' || b == b'\n')?;
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    parts.next()?; // "RTSP/1.0"
    parts.next()?.parse().ok()
}

/// Pulls out a flat header map from an RTSP response (case-sensitive keys
/// as sent; good enough for the handful this gateway reads).
pub fn parse_headers(response: &[u8]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let text = String::from_utf8_lossy(response);
    for line in text.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_single_interleaved_frame() {
        let mut reader = InterleavedFrameReader::new();
        let mut data = vec![b'$', 0, 0, 4];
        data.extend_from_slice(&[1, 2, 3, 4]);
        reader.feed(&data);
        let (chan, payload) = reader.try_next_frame().unwrap();
        assert_eq!(chan, 0);
        assert_eq!(payload, vec![1, 2, 3, 4]);
        assert!(reader.try_next_frame().is_none());
    }

    #[test]
    fn handles_split_across_feeds() {
        let mut reader = InterleavedFrameReader::new();
        reader.feed(&[b'$', 1, 0, 4, 9, 9]);
        assert!(reader.try_next_frame().is_none());
        reader.feed(&[8, 8]);
        let (chan, payload) = reader.try_next_frame().unwrap();
        assert_eq!(chan, 1);
        assert_eq!(payload, vec![9, 9, 8, 8]);
    }

    #[test]
    fn skips_garbage_before_magic_byte() {
        let mut reader = InterleavedFrameReader::new();
        let mut data = vec![b'X', b'Y', b'$', 2, 0, 2, 7, 7];
        reader.feed(&mut data);
        let (chan, payload) = reader.try_next_frame().unwrap();
        assert_eq!(chan, 2);
        assert_eq!(payload, vec![7, 7]);
    }

    #[test]
    fn parses_status_code_and_headers() {
        let resp = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: abc123;timeout=60\r\n\r\n";
        assert_eq!(parse_status_code(resp), Some(200));
        let headers = parse_headers(resp);
        assert_eq!(headers.get("Session").unwrap(), "abc123;timeout=60");
    }
}
