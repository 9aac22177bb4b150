//! Agent factory process. Runs as a child of the listener, stays
//! single-threaded so forking is safe, and turns each handed-off
//! connection into a dedicated agent process.

use std::os::fd::{AsFd, AsRawFd, IntoRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{close, fork, ForkResult};
use tracing::{debug, info, warn};

use crate::agent;
use crate::config::ServerConfig;
use crate::handoff::{read_record, recv_fd, send_record};
use crate::lifecycle::{
    install_signal_handlers, reap_children, shutdown_requested, take_child_flag, write_heartbeat,
    HeartbeatInfo,
};
use crate::protocol::{self, timeouts};
use crate::status::Status;

/// Everything an agent needs to know about its session, parsed from the
/// NAME=VALUE bootstrap records.
#[derive(Debug, Clone, Default)]
pub struct AgentBootstrap {
    pub proxy_user: String,
    pub proxy_zone: String,
    pub client_user: String,
    pub client_zone: String,
    pub option: String,
    pub negotiation: String,
    pub connect_cnt: u32,
    pub shared_secret_hex: String,
}

impl AgentBootstrap {
    pub fn from_records(records: &[(String, String)]) -> Result<Self, Status> {
        let mut boot = AgentBootstrap::default();
        for (name, value) in records {
            match name.as_str() {
                "SP_PROXY_USER" => boot.proxy_user = value.clone(),
                "SP_PROXY_ZONE" => boot.proxy_zone = value.clone(),
                "SP_CLIENT_USER" => boot.client_user = value.clone(),
                "SP_CLIENT_ZONE" => boot.client_zone = value.clone(),
                "SP_OPTION" => boot.option = value.clone(),
                "SP_NEGOTIATION" => boot.negotiation = value.clone(),
                "SP_CONNECT_CNT" => {
                    boot.connect_cnt = value.parse().map_err(|_| Status::BadMsgType)?;
                }
                "SP_SHARED_SECRET" => boot.shared_secret_hex = value.clone(),
                other => debug!(name = other, "ignoring unknown bootstrap record"),
            }
        }
        if boot.proxy_user.is_empty() || boot.client_user.is_empty() {
            return Err(Status::BadMsgType);
        }
        Ok(boot)
    }

    pub fn to_records(&self) -> Vec<(String, String)> {
        let mut records = vec![
            ("SP_PROXY_USER".to_string(), self.proxy_user.clone()),
            ("SP_PROXY_ZONE".to_string(), self.proxy_zone.clone()),
            ("SP_CLIENT_USER".to_string(), self.client_user.clone()),
            ("SP_CLIENT_ZONE".to_string(), self.client_zone.clone()),
            ("SP_CONNECT_CNT".to_string(), self.connect_cnt.to_string()),
        ];
        if !self.option.is_empty() {
            records.push(("SP_OPTION".to_string(), self.option.clone()));
        }
        if !self.negotiation.is_empty() {
            records.push(("SP_NEGOTIATION".to_string(), self.negotiation.clone()));
        }
        if !self.shared_secret_hex.is_empty() {
            records.push(("SP_SHARED_SECRET".to_string(), self.shared_secret_hex.clone()));
        }
        records
    }
}

fn read_bootstrap_records(stream: &mut UnixStream) -> Result<Vec<(String, String)>, Status> {
    let mut records = Vec::new();
    loop {
        let line = read_record(stream)?;
        if line == protocol::END_OF_VARS {
            return Ok(records);
        }
        match line.split_once('=') {
            Some((name, value)) => records.push((name.to_string(), value.to_string())),
            None => return Err(Status::BadMsgType),
        }
    }
}

/// Accept the listener's single control connection, then serve spawn
/// requests until the control stream closes. Agents are this process's
/// children; they get reaped here between requests and their heartbeat
/// files retired with them.
pub fn run(control_path: &Path, cfg: &ServerConfig) -> Result<()> {
    install_signal_handlers()?;
    let _ = std::fs::remove_file(control_path);
    if let Some(parent) = control_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let listener = UnixListener::bind(control_path)
        .with_context(|| format!("binding control socket {}", control_path.display()))?;
    info!(path = %control_path.display(), "factory ready");

    let (mut control, _) = listener.accept().context("accepting control connection")?;
    let proc_dir = cfg.proc_dir();

    loop {
        if shutdown_requested() {
            break;
        }
        if take_child_flag() {
            reap_children(&proc_dir);
        }

        let mut fds = [PollFd::new(control.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeouts::ACCEPT_POLL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("polling control stream"),
        }

        let spawn_path = match read_record(&mut control) {
            Ok(p) => p,
            Err(_) => {
                info!("control stream closed, factory exiting");
                break;
            }
        };
        match handle_spawn(&mut control, Path::new(&spawn_path), &listener, cfg) {
            Ok(pid) => debug!(pid, "agent spawned"),
            Err(st) => warn!(%st, path = %spawn_path, "spawn request failed"),
        }
    }

    reap_children(&proc_dir);
    Ok(())
}

fn handle_spawn(
    control: &mut UnixStream,
    spawn_path: &Path,
    control_listener: &UnixListener,
    cfg: &ServerConfig,
) -> Result<i32, Status> {
    // connect before acking so the peer's accept cannot block
    let mut spawn_stream = match UnixStream::connect(spawn_path) {
        Ok(s) => s,
        Err(_) => {
            send_record(control, protocol::SPAWN_FAILURE)?;
            return Err(Status::SpawnErr);
        }
    };
    send_record(control, protocol::ACK_OK)?;

    let boot = match read_bootstrap_records(&mut spawn_stream) {
        Ok(records) => match AgentBootstrap::from_records(&records) {
            Ok(b) => b,
            Err(st) => {
                send_record(&mut spawn_stream, protocol::SPAWN_FAILURE)?;
                return Err(st);
            }
        },
        Err(st) => {
            let _ = send_record(&mut spawn_stream, protocol::SPAWN_FAILURE);
            return Err(st);
        }
    };
    send_record(&mut spawn_stream, protocol::ACK_OK)?;

    let client_fd = recv_fd(&spawn_stream)?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // the agent must not pin the factory's sockets open
            let _ = close(control_listener.as_raw_fd());
            let _ = close(control.as_raw_fd());
            let _ = close(spawn_stream.as_raw_fd());
            let code = match agent::run(client_fd.into_raw_fd(), &boot, cfg) {
                Ok(()) => 0,
                Err(st) => {
                    warn!(%st, "agent session failed");
                    1
                }
            };
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            let info = HeartbeatInfo::new(child.as_raw(), &boot.proxy_user, &boot.client_user);
            if let Err(e) = write_heartbeat(&cfg.proc_dir(), &info) {
                warn!(error = %e, pid = child.as_raw(), "heartbeat write failed");
            }
            send_record(&mut spawn_stream, protocol::CONNECTION_SUCCESSFUL)?;
            send_record(&mut spawn_stream, &child.as_raw().to_string())?;
            Ok(child.as_raw())
        }
        Err(_) => {
            let _ = send_record(&mut spawn_stream, protocol::SPAWN_FAILURE);
            Err(Status::SpawnErr)
        }
    }
}
