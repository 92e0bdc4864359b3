//! Supervision of long-lived daemon processes.
//!
//! Each started daemon gets a monitor task which respawns it with exponential backoff whenever it
//! exits, until the daemon is stopped or the system shuts down.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use castle_core::AppError;

/// A shared handle to a supervisor implementation.
pub type DynSupervisor = Arc<dyn Supervisor>;

const METRIC_PROCESS_RESTARTS: &str = "castle_process_restarts";

/// The base of the restart backoff, in seconds.
const BACKOFF_BASE: u64 = 2;
/// The cap of the restart backoff.
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// A daemon which stays up this long is considered healthy again.
const STABLE_RUN: Duration = Duration::from_secs(30);
/// The time a daemon is given to exit after SIGTERM before it is killed.
const GRACEFUL_STOP: Duration = Duration::from_secs(10);
/// Consecutive failures after which a daemon is reported as crash looping.
const CRASH_LOOP_THRESHOLD: u32 = 5;

/// What to do when a process matching the signature of a new daemon is already running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartPolicy {
    /// Terminate the existing process, then spawn a new one.
    RestartExisting,
    /// Adopt the existing process; nothing new is spawned.
    ReuseExisting,
}

/// A handle to a supervised daemon.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcHandle {
    pub id: u64,
    pub name: String,
}

/// Runs and supervises daemon processes.
#[async_trait::async_trait]
pub trait Supervisor: Send + Sync {
    /// Run the given command to completion.
    async fn run(&self, name: &str, binary: &str, args: &[String]) -> Result<()>;

    /// Start a supervised daemon. `signature` is a regex matched against the command lines of
    /// running processes of the same binary. Returns `None` when an existing process was adopted.
    async fn start(&self, name: &str, binary: &str, signature: &str, policy: StartPolicy, args: &[String]) -> Result<Option<ProcHandle>>;

    /// Stop a daemon and wait for it to exit. No further restarts happen.
    async fn stop(&self, handle: &ProcHandle) -> Result<()>;

    /// Stop every running process of `binary` matching `signature`, supervised or not.
    async fn stop_matching(&self, binary: &str, signature: &str) -> Result<usize>;

    /// Stop every supervised daemon.
    async fn stop_all(&self);
}

/// The restart delay after the given number of consecutive failures: `min(2^k, 30)` seconds.
pub fn backoff_delay(failures: u32) -> Duration {
    let secs = BACKOFF_BASE.checked_pow(failures).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(BACKOFF_MAX)
}

/// The daemon type a storage binary is launched as through the driver CLI.
pub fn daemon_type(binary: &str) -> Option<&'static str> {
    match Path::new(binary).file_name().and_then(|name| name.to_str()) {
        Some("ceph-mon") => Some("mon"),
        Some("ceph-osd") => Some("osd"),
        Some("ceph-mds") => Some("mds"),
        Some("radosgw") => Some("rgw"),
        _ => None,
    }
}

/// The restart bookkeeping of a single daemon.
#[derive(Debug, Default)]
struct RestartTracker {
    /// Consecutive failed runs.
    failures: u32,
}

impl RestartTracker {
    /// Account for an exit of the daemon after it ran for `ran_for`. A clean exit or a stable
    /// run clears the failure count.
    fn exited(&mut self, success: bool, ran_for: Duration) {
        if success || ran_for >= STABLE_RUN {
            self.failures = 0;
        }
    }

    /// The delay before the next restart, and whether the daemon is now crash looping.
    fn next_restart(&mut self) -> (Duration, bool) {
        let delay = backoff_delay(self.failures);
        self.failures += 1;
        (delay, self.failures >= CRASH_LOOP_THRESHOLD)
    }
}

struct ManagedProc {
    name: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The supervisor of host processes.
#[derive(Clone)]
pub struct ProcManager {
    inner: Arc<ProcManagerInner>,
}

struct ProcManagerInner {
    config: Arc<Config>,
    /// Supervised daemons by handle id.
    procs: RwLock<HashMap<u64, ManagedProc>>,
    next_id: AtomicU64,
}

impl ProcManager {
    pub fn new(config: Arc<Config>) -> Self {
        metrics::register_counter!(METRIC_PROCESS_RESTARTS, metrics::Unit::Count, "supervised process restarts");
        Self {
            inner: Arc::new(ProcManagerInner {
                config,
                procs: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl ProcManagerInner {
    /// Build the command for the given daemon, going through the driver CLI when configured.
    fn command(&self, binary: &str, args: &[String]) -> Command {
        let mut cmd = match (&self.config.daemon_launcher, daemon_type(binary)) {
            (Some(launcher), Some(kind)) => {
                let mut cmd = Command::new(launcher);
                cmd.arg("daemon").arg(format!("--type={}", kind)).arg("--");
                cmd
            }
            _ => Command::new(binary),
        };
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
        cmd
    }

    fn spawn_child(&self, name: &str, binary: &str, args: &[String]) -> Result<Child> {
        self.command(binary, args)
            .spawn()
            .with_context(|| format!("error spawning {} ({})", name, binary))
    }

    /// The monitor loop of a single daemon.
    async fn supervise(self: Arc<Self>, name: String, binary: String, args: Vec<String>, mut child: Child, mut stop_rx: watch::Receiver<bool>) {
        let mut restarts = RestartTracker::default();
        loop {
            let started = Instant::now();
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => {
                            if !status.success() {
                                tracing::warn!(name = %name, %status, "supervised process exited");
                            }
                            restarts.exited(status.success(), started.elapsed());
                        }
                        Err(err) => tracing::error!(error = ?err, name = %name, "error waiting on supervised process"),
                    }
                }
                _ = stop_rx.changed() => {
                    terminate_child(&name, &mut child).await;
                    return;
                }
            }

            // Respawn after the backoff delay, unless asked to stop in the meantime.
            loop {
                let (delay, crash_looping) = restarts.next_restart();
                if crash_looping {
                    let err = AppError::ProcessCrashLoop {
                        name: name.clone(),
                        failures: restarts.failures,
                    };
                    tracing::warn!(error = %err, ?delay, "restarting process");
                } else {
                    tracing::info!(name = %name, ?delay, "restarting process");
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => (),
                    _ = stop_rx.changed() => return,
                }
                match self.spawn_child(&name, &binary, &args) {
                    Ok(new_child) => {
                        metrics::increment_counter!(METRIC_PROCESS_RESTARTS);
                        child = new_child;
                        break;
                    }
                    Err(err) => tracing::error!(error = ?err, "error respawning supervised process"),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Supervisor for ProcManager {
    #[tracing::instrument(level = "debug", skip(self, args))]
    async fn run(&self, name: &str, binary: &str, args: &[String]) -> Result<()> {
        let status = self
            .inner
            .command(binary, args)
            .status()
            .await
            .with_context(|| format!("error running {} ({})", name, binary))?;
        if !status.success() {
            bail!(AppError::TransientIo(format!("{} ({}) exited with {}", name, binary, status)));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, args))]
    async fn start(&self, name: &str, binary: &str, signature: &str, policy: StartPolicy, args: &[String]) -> Result<Option<ProcHandle>> {
        let pattern = Regex::new(signature).with_context(|| format!("invalid process signature {:?}", signature))?;
        let existing = find_processes(binary, &pattern);
        if !existing.is_empty() {
            match policy {
                StartPolicy::ReuseExisting => {
                    tracing::info!(name, pids = ?existing, "adopting existing process");
                    return Ok(None);
                }
                StartPolicy::RestartExisting => {
                    for pid in existing {
                        tracing::info!(name, pid, "terminating existing process");
                        terminate_pid(pid).await;
                    }
                }
            }
        }

        let child = self.inner.spawn_child(name, binary, args)?;
        tracing::info!(name, pid = ?child.id(), "started process");
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.inner.clone().supervise(name.to_string(), binary.to_string(), args.to_vec(), child, stop_rx));
        self.inner.procs.write().await.insert(
            id,
            ManagedProc {
                name: name.to_string(),
                stop_tx,
                task,
            },
        );
        Ok(Some(ProcHandle { id, name: name.to_string() }))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn stop(&self, handle: &ProcHandle) -> Result<()> {
        let proc = match self.inner.procs.write().await.remove(&handle.id) {
            Some(proc) => proc,
            None => return Ok(()),
        };
        let _ = proc.stop_tx.send(true);
        proc.task.await.with_context(|| format!("error joining monitor task of {}", proc.name))?;
        tracing::info!(name = %proc.name, "stopped process");
        Ok(())
    }

    async fn stop_matching(&self, binary: &str, signature: &str) -> Result<usize> {
        let pattern = Regex::new(signature).with_context(|| format!("invalid process signature {:?}", signature))?;
        let pids = find_processes(binary, &pattern);
        for pid in pids.iter() {
            terminate_pid(*pid).await;
        }
        Ok(pids.len())
    }

    async fn stop_all(&self) {
        let ids: Vec<(u64, String)> = self.inner.procs.read().await.iter().map(|(id, proc)| (*id, proc.name.clone())).collect();
        for (id, name) in ids {
            if let Err(err) = self.stop(&ProcHandle { id, name }).await {
                tracing::error!(error = ?err, "error stopping supervised process");
            }
        }
    }
}

/// Send SIGTERM to our child, killing it if it does not exit in time.
async fn terminate_child(name: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a pid has no memory safety implications.
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    }
    match tokio::time::timeout(GRACEFUL_STOP, child.wait()).await {
        Ok(_) => (),
        Err(_) => {
            tracing::warn!(name, "process did not exit after SIGTERM, killing");
            if let Err(err) = child.kill().await {
                tracing::error!(error = ?err, name, "error killing process");
            }
        }
    }
}

/// Send SIGTERM to a process we did not spawn, killing it if it does not exit in time.
async fn terminate_pid(pid: i32) {
    // SAFETY: signalling a pid has no memory safety implications.
    unsafe { libc::kill(pid, libc::SIGTERM) };
    let deadline = Instant::now() + GRACEFUL_STOP;
    while Instant::now() < deadline {
        // SAFETY: signal 0 only checks for the existence of the process.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!(pid, "process did not exit after SIGTERM, killing");
    // SAFETY: as above.
    unsafe { libc::kill(pid, libc::SIGKILL) };
}

/// Find running processes of `binary` whose command line matches `pattern`.
#[cfg(target_os = "linux")]
fn find_processes(binary: &str, pattern: &Regex) -> Vec<i32> {
    let procs = match procfs::process::all_processes() {
        Ok(procs) => procs,
        Err(err) => {
            tracing::error!(error = ?err, "error listing processes");
            return vec![];
        }
    };
    let binary = Path::new(binary).file_name().and_then(|name| name.to_str()).unwrap_or(binary).to_string();
    procs
        .into_iter()
        .filter_map(|proc| proc.cmdline().ok().map(|cmdline| (proc.stat.pid, cmdline)))
        .filter(|(_, cmdline)| {
            // Daemons started through the driver CLI carry the binary's daemon type instead.
            let launched_as = daemon_type(&binary).map(|kind| format!("--type={}", kind));
            cmdline.iter().any(|arg| Path::new(arg).file_name().and_then(|name| name.to_str()) == Some(binary.as_str()))
                || launched_as.map(|flag| cmdline.contains(&flag)).unwrap_or(false)
        })
        .filter(|(_, cmdline)| pattern.is_match(&cmdline.join(" ")))
        .map(|(pid, _)| pid)
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn find_processes(_binary: &str, _pattern: &Regex) -> Vec<i32> {
    vec![]
}

#[cfg(test)]
#[path = "proc_test.rs"]
mod proc_test;
