// src/config.rs
use serde::Deserialize;
use std::{fs, path::Path};

/// Recognized options: workers, bind, udp_rcvbuf_size, fcc_listen_port_min/
/// max, mcast_rejoin_interval, upstream_interface[_fcc|_multicast|_rtsp|
/// _http], hostname, xff, ffmpeg_path/args, verbosity.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: General,
    #[serde(default)]
    pub pool: PoolCfg,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub fcc: FccCfg,
    #[serde(default)]
    pub fec: FecCfg,
    #[serde(default)]
    pub snapshot: SnapshotCfg,
    #[serde(default)]
    pub interfaces: Interfaces,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Number of worker processes forked by the supervisor, each with its
    /// own event loop, sharing the listening socket(s) via SO_REUSEPORT.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bind addresses the HTTP listener(s) accept on, e.g. "0.0.0.0:5140".
    #[serde(default = "default_bind")]
    pub bind: Vec<String>,
    /// SO_RCVBUF size requested on every UDP ingress socket.
    #[serde(default = "default_udp_rcvbuf")]
    pub udp_rcvbuf_size: usize,
    /// Externally reachable hostname, used by the M3U playlist rewriter.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Path to the source M3U the admin maintains; `/playlist.m3u` rewrites
    /// its `udp://`/`rtp://` entries into this gateway's HTTP URLs. Fetching
    /// it is out of scope for the core (see `playlist.rs`); a missing or
    /// unreadable path falls back to an empty `#EXTM3U` playlist.
    #[serde(default)]
    pub playlist_source_path: Option<String>,
    /// Honor X-Forwarded-For when logging/binding client identity.
    #[serde(default)]
    pub xff: bool,
    #[serde(default)]
    pub ffmpeg_path: Option<String>,
    #[serde(default)]
    pub ffmpeg_args: Vec<String>,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_verbosity")]
    pub verbosity: String,
    /// Minimum gap between worker respawns, rate-limiting restart storms.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    /// `mlockall(MCL_CURRENT | MCL_FUTURE)` in each worker after its pool is
    /// sized, so pages backing hot buffers never get paged out.
    #[serde(default)]
    pub mlock_all: bool,
    /// Bind address for the `/metrics` + `/healthz` exporter thread spawned
    /// once by the supervisor. `None` disables it.
    #[serde(default)]
    pub metrics_bind: Option<String>,
}

fn default_workers() -> usize {
    1
}
fn default_bind() -> Vec<String> {
    vec!["0.0.0.0:5140".to_string()]
}
fn default_udp_rcvbuf() -> usize {
    4 << 20
}
fn default_verbosity() -> String {
    "info".to_string()
}
fn default_restart_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolCfg {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_initial")]
    pub initial: usize,
    #[serde(default = "default_max")]
    pub max: usize,
    #[serde(default = "default_expand")]
    pub expand: usize,
    #[serde(default = "default_low_wm")]
    pub low_watermark: usize,
    #[serde(default = "default_high_wm")]
    pub high_watermark: usize,
}

impl Default for PoolCfg {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            initial: default_initial(),
            max: default_max(),
            expand: default_expand(),
            low_watermark: default_low_wm(),
            high_watermark: default_high_wm(),
        }
    }
}

fn default_buffer_size() -> usize {
    1536
}
fn default_initial() -> usize {
    4096
}
fn default_max() -> usize {
    1 << 18
}
fn default_expand() -> usize {
    1024
}
fn default_low_wm() -> usize {
    256
}
fn default_high_wm() -> usize {
    8192
}

#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_fcc_sync_wait_ms")]
    pub fcc_sync_wait_ms: u64,
    #[serde(default = "default_fcc_burst_inactivity_ms")]
    pub fcc_burst_inactivity_ms: u64,
    #[serde(default = "default_mcast_timeout_ms")]
    pub mcast_timeout_ms: u64,
    #[serde(default = "default_reorder_wait_ms")]
    pub reorder_wait_ms: u64,
    #[serde(default)]
    pub mcast_rejoin_interval_secs: Option<u64>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fcc_sync_wait_ms: default_fcc_sync_wait_ms(),
            fcc_burst_inactivity_ms: default_fcc_burst_inactivity_ms(),
            mcast_timeout_ms: default_mcast_timeout_ms(),
            reorder_wait_ms: default_reorder_wait_ms(),
            mcast_rejoin_interval_secs: None,
        }
    }
}

fn default_fcc_sync_wait_ms() -> u64 {
    500
}
fn default_fcc_burst_inactivity_ms() -> u64 {
    2000
}
fn default_mcast_timeout_ms() -> u64 {
    10_000
}
fn default_reorder_wait_ms() -> u64 {
    80
}

#[derive(Debug, Clone, Deserialize)]
pub struct FccCfg {
    #[serde(default = "default_fcc_port_min")]
    pub listen_port_min: u16,
    #[serde(default = "default_fcc_port_max")]
    pub listen_port_max: u16,
    #[serde(default = "default_max_redirect")]
    pub max_redirect: u32,
}

impl Default for FccCfg {
    fn default() -> Self {
        Self {
            listen_port_min: default_fcc_port_min(),
            listen_port_max: default_fcc_port_max(),
            max_redirect: default_max_redirect(),
        }
    }
}

fn default_fcc_port_min() -> u16 {
    30000
}
fn default_fcc_port_max() -> u16 {
    40000
}
fn default_max_redirect() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct FecCfg {
    #[serde(default = "default_fec_max_groups")]
    pub max_groups: usize,
}

impl Default for FecCfg {
    fn default() -> Self {
        Self {
            max_groups: default_fec_max_groups(),
        }
    }
}

fn default_fec_max_groups() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotCfg {
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
}

impl Default for SnapshotCfg {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
        }
    }
}

fn default_scratch_dir() -> String {
    "/tmp/iptvgw-snapshot".to_string()
}

/// `upstream_interface[_fcc|_multicast|_rtsp|_http]`: the interface used by
/// default, overridable per ingress kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Interfaces {
    #[serde(default)]
    pub upstream_interface: Option<String>,
    #[serde(default)]
    pub upstream_interface_fcc: Option<String>,
    #[serde(default)]
    pub upstream_interface_multicast: Option<String>,
    #[serde(default)]
    pub upstream_interface_rtsp: Option<String>,
    #[serde(default)]
    pub upstream_interface_http: Option<String>,
}

impl Interfaces {
    pub fn for_multicast(&self) -> Option<&str> {
        self.upstream_interface_multicast
            .as_deref()
            .or(self.upstream_interface.as_deref())
    }

    pub fn for_fcc(&self) -> Option<&str> {
        self.upstream_interface_fcc
            .as_deref()
            .or(self.upstream_interface.as_deref())
    }

    pub fn for_rtsp(&self) -> Option<&str> {
        self.upstream_interface_rtsp
            .as_deref()
            .or(self.upstream_interface.as_deref())
    }

    pub fn for_http(&self) -> Option<&str> {
        self.upstream_interface_http
            .as_deref()
            .or(self.upstream_interface.as_deref())
    }
}

impl AppConfig {
    pub fn from_file(p: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.workers == 0 {
            anyhow::bail!("general.workers must be > 0");
        }
        if self.general.bind.is_empty() {
            anyhow::bail!("general.bind must list at least one address");
        }
        if self.pool.buffer_size < 512 {
            anyhow::bail!("pool.buffer_size must be >= 512 (RTP MTU headroom)");
        }
        if self.pool.low_watermark >= self.pool.high_watermark {
            anyhow::bail!("pool.low_watermark must be < pool.high_watermark");
        }
        if self.pool.initial > self.pool.max {
            anyhow::bail!("pool.initial must be <= pool.max");
        }
        if self.fcc.listen_port_min >= self.fcc.listen_port_max {
            anyhow::bail!("fcc.listen_port_min must be < fcc.listen_port_max");
        }
        if self.fec.max_groups == 0 {
            anyhow::bail!("fec.max_groups must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let toml_src = "[general]\n";
        let cfg: AppConfig = toml::from_str(toml_src).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.general.workers, 1);
        assert_eq!(cfg.pool.buffer_size, 1536);
    }

    #[test]
    fn rejects_bad_watermarks() {
        let toml_src = "[general]\n[pool]\nlow_watermark = 100\nhigh_watermark = 10\n";
        let cfg: AppConfig = toml::from_str(toml_src).unwrap();
        assert!(cfg.validate().is_err());
    }
}
