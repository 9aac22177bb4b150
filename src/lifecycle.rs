//! Agent bookkeeping: the in-memory process table, per-agent heartbeat
//! files, non-blocking reaping, and process-wide signal flags.
//!
//! A heartbeat file is named by the agent's pid and lives under the
//! runtime proc directory. The file going missing is the signal that the
//! agent is gone; pruning trusts the filesystem, not the table.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Snapshot written into the heartbeat file at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub pid: i32,
    pub proxy_user: String,
    pub client_user: String,
    pub started_unix: u64,
}

impl HeartbeatInfo {
    pub fn new(pid: i32, proxy_user: &str, client_user: &str) -> Self {
        HeartbeatInfo {
            pid,
            proxy_user: proxy_user.to_string(),
            client_user: client_user.to_string(),
            started_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

pub fn heartbeat_path(proc_dir: &Path, pid: i32) -> PathBuf {
    proc_dir.join(pid.to_string())
}

pub fn write_heartbeat(proc_dir: &Path, info: &HeartbeatInfo) -> Result<()> {
    std::fs::create_dir_all(proc_dir)
        .with_context(|| format!("failed to create {}", proc_dir.display()))?;
    let path = heartbeat_path(proc_dir, info.pid);
    let body = serde_json::to_vec(info).context("heartbeat serialization")?;
    std::fs::write(&path, body)
        .with_context(|| format!("failed to write heartbeat {}", path.display()))?;
    Ok(())
}

pub fn remove_heartbeat(proc_dir: &Path, pid: i32) {
    let _ = std::fs::remove_file(heartbeat_path(proc_dir, pid));
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub pid: i32,
    pub proxy_user: String,
    pub client_user: String,
    pub started_at: SystemTime,
}

/// Process table for spawned agents. Newest entries sit at the head so
/// the common reap case scans the least.
pub struct AgentTable {
    agents: Mutex<Vec<AgentRecord>>,
    proc_dir: PathBuf,
}

impl AgentTable {
    pub fn new(proc_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&proc_dir)
            .with_context(|| format!("failed to create {}", proc_dir.display()))?;
        Ok(AgentTable {
            agents: Mutex::new(Vec::new()),
            proc_dir,
        })
    }

    pub fn proc_dir(&self) -> &Path {
        &self.proc_dir
    }

    pub fn record_spawn(&self, record: AgentRecord) {
        self.agents.lock().insert(0, record);
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.lock().is_empty()
    }

    /// Drop table entries whose heartbeat file has vanished. Returns the
    /// number pruned.
    pub fn prune_stale(&self) -> usize {
        let mut agents = self.agents.lock();
        let before = agents.len();
        agents.retain(|r| heartbeat_path(&self.proc_dir, r.pid).exists());
        let pruned = before - agents.len();
        if pruned > 0 {
            debug!(pruned, "stale agent records dropped");
        }
        pruned
    }

    /// Reconciled live count used for connection admission. Agents are
    /// children of the factory, so the listener can only observe their
    /// heartbeat files, never wait on them.
    pub fn live_count(&self) -> usize {
        self.prune_stale();
        self.len()
    }

    /// Graceful drain: wait for heartbeats to disappear until the grace
    /// period runs out, then SIGTERM every straggler.
    pub fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while !self.is_empty() && Instant::now() < deadline {
            self.prune_stale();
            if self.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let stragglers: Vec<i32> = self.agents.lock().iter().map(|r| r.pid).collect();
        for pid in &stragglers {
            warn!(pid, "agent outlived the grace period, sending SIGTERM");
            let _ = kill(Pid::from_raw(*pid), Signal::SIGTERM);
        }
        if !stragglers.is_empty() {
            std::thread::sleep(Duration::from_millis(200));
            self.prune_stale();
        }
        info!(remaining = self.len(), "agent table drained");
    }
}

/// Reap exited agents from the factory process and retire their
/// heartbeat files. Non-blocking; returns the number collected.
pub fn reap_children(proc_dir: &Path) -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                debug!(pid = pid.as_raw(), code, "agent exited");
                remove_heartbeat(proc_dir, pid.as_raw());
                reaped += 1;
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                warn!(pid = pid.as_raw(), signal = %sig, "agent killed by signal");
                remove_heartbeat(proc_dir, pid.as_raw());
                reaped += 1;
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    reaped
}

static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigchld(_: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::Relaxed);
}

extern "C" fn on_shutdown_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Flag-only handlers; all real work happens on the accept loop.
pub fn install_signal_handlers() -> Result<()> {
    let chld = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    let term = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGCHLD, &chld).context("installing SIGCHLD handler")?;
        sigaction(Signal::SIGTERM, &term).context("installing SIGTERM handler")?;
        sigaction(Signal::SIGINT, &term).context("installing SIGINT handler")?;
    }
    Ok(())
}

/// True once since the last call if any child has exited.
pub fn take_child_flag() -> bool {
    CHILD_EXITED.swap(false, Ordering::Relaxed)
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

#[cfg(test)]
pub fn request_shutdown_for_test() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: i32) -> AgentRecord {
        AgentRecord {
            pid,
            proxy_user: "rods".to_string(),
            client_user: "alice".to_string(),
            started_at: SystemTime::now(),
        }
    }

    #[test]
    fn newest_record_sits_at_the_head() {
        let dir = tempfile::tempdir().unwrap();
        let table = AgentTable::new(dir.path().to_path_buf()).unwrap();
        table.record_spawn(record(100));
        table.record_spawn(record(200));
        assert_eq!(table.agents.lock()[0].pid, 200);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn prune_follows_heartbeat_files() {
        let dir = tempfile::tempdir().unwrap();
        let table = AgentTable::new(dir.path().to_path_buf()).unwrap();

        let info = HeartbeatInfo::new(100, "rods", "alice");
        write_heartbeat(dir.path(), &info).unwrap();
        table.record_spawn(record(100));
        table.record_spawn(record(200)); // no heartbeat on disk

        assert_eq!(table.prune_stale(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.agents.lock()[0].pid, 100);

        remove_heartbeat(dir.path(), 100);
        assert_eq!(table.prune_stale(), 1);
        assert!(table.is_empty());

        // pruning again with nothing changed removes nothing
        assert_eq!(table.prune_stale(), 0);
    }

    #[test]
    fn heartbeat_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let info = HeartbeatInfo::new(4242, "rods", "bob");
        write_heartbeat(dir.path(), &info).unwrap();

        let raw = std::fs::read(heartbeat_path(dir.path(), 4242)).unwrap();
        let back: HeartbeatInfo = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.pid, 4242);
        assert_eq!(back.client_user, "bob");
    }

    #[test]
    fn shutdown_with_empty_table_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let table = AgentTable::new(dir.path().to_path_buf()).unwrap();
        let start = Instant::now();
        table.shutdown(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn child_flag_is_take_once() {
        CHILD_EXITED.store(true, Ordering::Relaxed);
        assert!(take_child_flag());
        assert!(!take_child_flag());
    }
}
