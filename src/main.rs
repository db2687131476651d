// src/main.rs — supervisor: loads config, forks N worker processes sharing
// the listening socket(s) via SO_REUSEPORT, and restarts any that exit
// abnormally with a rate limiter.
mod config;
mod connection;
mod error;
mod event_loop;
mod fcc;
mod fec;
mod http;
mod igmp;
mod multicast;
mod playlist;
mod pool;
mod reorder;
mod rtp;
mod rtsp;
mod service;
mod snapshot;
mod status;
mod util;
mod worker;

use crate::config::AppConfig;
use crate::util::{lock_all_memory_if, now_ms, BarrierFlag};
use crate::worker::Worker;
use log::{error, info, warn};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let cfg_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config.toml"));
    let cfg = AppConfig::from_file(&cfg_path)?;
    init_logging(&cfg);
    info!("loaded config from {}: {} worker(s), bind {:?}", cfg_path.display(), cfg.general.workers, cfg.general.bind);

    let shutdown = Arc::new(BarrierFlag::default());
    {
        let s = shutdown.clone();
        ctrlc::set_handler(move || s.raise())?;
    }

    // Fork every worker while the process is still single-threaded: forking
    // after the metrics thread (spawned below) starts would only carry the
    // forking thread into the child, risking locks the other thread held.
    let mut children: Vec<(usize, Pid)> = Vec::with_capacity(cfg.general.workers);
    for slot in 0..cfg.general.workers {
        children.push((slot, spawn_worker(slot, &cfg, &shutdown)?));
    }

    if let Some(bind) = cfg.general.metrics_bind.clone() {
        status::spawn_metrics_http(bind);
    }

    supervise(children, cfg, shutdown)
}

/// Forks one worker, returning its pid to the supervisor. The child branch
/// never returns: it runs the worker to completion and calls
/// `std::process::exit` directly.
fn spawn_worker(slot: usize, cfg: &AppConfig, shutdown: &Arc<BarrierFlag>) -> anyhow::Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let code = run_worker(slot, cfg.clone(), shutdown.clone());
            std::process::exit(code);
        }
    }
}

fn run_worker(slot: usize, cfg: AppConfig, shutdown: Arc<BarrierFlag>) -> i32 {
    lock_all_memory_if(cfg.general.mlock_all);
    let mut worker = match Worker::new(cfg) {
        Ok(w) => w,
        Err(e) => {
            error!("worker {slot}: failed to initialize: {e:?}");
            return 1;
        }
    };
    match worker.run(shutdown) {
        Ok(()) => 0,
        Err(e) => {
            error!("worker {slot}: exited with error: {e:?}");
            1
        }
    }
}

/// Waits on children, respawning any that exit abnormally while the
/// supervisor itself hasn't been asked to shut down, rate-limited by
/// `restart_backoff_ms` per slot.
fn supervise(mut children: Vec<(usize, Pid)>, cfg: AppConfig, shutdown: Arc<BarrierFlag>) -> anyhow::Result<()> {
    let mut last_restart_ms = vec![0u64; cfg.general.workers];
    while !children.is_empty() {
        let status = match waitpid(None::<Pid>, None) {
            Ok(s) => s,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => return Err(e.into()),
        };
        let (pid, abnormal) = match status {
            WaitStatus::Exited(pid, code) => (pid, code != 0),
            WaitStatus::Signaled(pid, sig, _) => {
                warn!("worker pid {pid} killed by signal {sig:?}");
                (pid, true)
            }
            _ => continue,
        };
        let Some(pos) = children.iter().position(|&(_, p)| p == pid) else {
            continue;
        };
        let (slot, _) = children.remove(pos);

        if shutdown.is_raised() {
            info!("worker {slot} (pid {pid}) exited during shutdown");
            continue;
        }
        if !abnormal {
            info!("worker {slot} (pid {pid}) exited cleanly without a shutdown request; not restarting");
            continue;
        }

        let now = now_ms();
        let elapsed = now.saturating_sub(last_restart_ms[slot]);
        if elapsed < cfg.general.restart_backoff_ms {
            std::thread::sleep(std::time::Duration::from_millis(cfg.general.restart_backoff_ms - elapsed));
        }
        last_restart_ms[slot] = now_ms();
        warn!("restarting worker {slot} after abnormal exit");
        let new_pid = spawn_worker(slot, &cfg, &shutdown)?;
        children.push((slot, new_pid));
    }
    info!("clean shutdown");
    Ok(())
}

fn init_logging(cfg: &AppConfig) {
    if cfg.general.json_logs {
        let mut b = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.general.verbosity.as_str()));
        b.format(|buf, record| {
            use std::io::Write;
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            writeln!(
                buf,
                "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"msg\":\"{}\"}}",
                ts,
                record.level(),
                record.target(),
                record.args().to_string().replace('"', "'")
            )
        })
        .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.general.verbosity.as_str())).init();
    }
}
