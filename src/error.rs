// src/error.rs
//
// Errors on the hot per-packet path are a plain enum (no `thiserror`,
// cheap concrete types in the inner loop); setup/config errors use
// `anyhow::Result` instead, the way `config.rs` does at its edges.

use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    /// Transient I/O condition (EAGAIN/EINTR/ENOBUFS): retry on next readiness.
    Transient,
    /// Pool had no free buffers.
    PoolExhausted,
    /// RTP/RTCP packet failed a structural check (bad version, short header, ...).
    Malformed(&'static str),
    /// The client's TCP socket is gone (EOF or EPIPE equivalent).
    ClientGone,
    /// Fatal to the owning connection/session; caller should tear it down.
    Fatal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Transient => write!(f, "transient I/O condition"),
            GatewayError::PoolExhausted => write!(f, "buffer pool exhausted"),
            GatewayError::Malformed(why) => write!(f, "malformed packet: {why}"),
            GatewayError::ClientGone => write!(f, "client disconnected"),
            GatewayError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

pub type Result<T> = std::result::Result<T, GatewayError>;
