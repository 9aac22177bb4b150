//! Front listener: the select/accept loop, the startup-parsing worker
//! pool, and the spawn manager that hands admitted connections to the
//! agent factory.
//!
//! The accept loop does nothing but poll, accept, and queue. Startup
//! packs are parsed by a fixed worker pool; admitted connections move to
//! the spawn queue; rejected ones get a version reply, are closed at
//! once, and only their log entries wait for the periodic drain.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::process::{Child, Command};
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::factory::AgentBootstrap;
use crate::handoff::FactoryChannel;
use crate::lifecycle::{self, AgentRecord, AgentTable};
use crate::protocol::{timeouts, HEARTBEAT_LITERAL, REQ_SVR_NEG};
use crate::queue::ConnQueue;
use crate::startup::{self, StartupPack};
use crate::status::Status;

struct PendingConn {
    stream: TcpStream,
    peer: SocketAddr,
}

struct SpawnItem {
    stream: TcpStream,
    pack: StartupPack,
    peer: SocketAddr,
}

/// Logged during housekeeping, long after the stream itself was closed.
struct BadRequest {
    peer: SocketAddr,
    status: Status,
}

enum Triage {
    HeartbeatProbe,
    Startup(StartupPack),
    Reject(Status),
}

/// Split heartbeat probes from startup envelopes. A probe is either the
/// bare HEARTBEAT literal on the wire or a well-formed startup pack whose
/// option string carries it; anything else must parse as a startup pack
/// within the read timeout.
fn triage(stream: &mut TcpStream) -> Triage {
    if stream
        .set_read_timeout(Some(timeouts::READ_STARTUP_PACK))
        .is_err()
    {
        return Triage::Reject(Status::SockReadErr);
    }

    let mut prefix = [0u8; 4];
    if stream.read_exact(&mut prefix).is_err() {
        return Triage::Reject(Status::SockReadErr);
    }

    let literal = HEARTBEAT_LITERAL.as_bytes();
    if prefix == literal[..4] {
        let mut rest = [0u8; 5];
        if stream.read_exact(&mut rest).is_err() || rest != literal[4..] {
            return Triage::Reject(Status::BadMsgType);
        }
        return Triage::HeartbeatProbe;
    }

    let mut chained = (&prefix[..]).chain(&mut *stream);
    let result = startup::read_startup_pack(&mut chained);
    let _ = stream.set_read_timeout(None);
    match result {
        Ok(pack) if pack.option == HEARTBEAT_LITERAL => Triage::HeartbeatProbe,
        Ok(pack) => Triage::Startup(pack),
        Err(st) => Triage::Reject(st),
    }
}

/// Admission verdict for a parsed startup pack.
fn admit(pack: &StartupPack, table: &AgentTable, cfg: &ServerConfig) -> Status {
    if pack.connect_cnt > cfg.max_connect_cnt {
        return Status::ExceedConnectCnt;
    }
    if let Some(max) = cfg.max_connections {
        // the count reconciles against heartbeat files before rejecting
        if table.live_count() >= max as usize {
            return Status::ExceedMaxConnections;
        }
    }
    Status::Ok
}

fn bootstrap_vars(pack: &StartupPack) -> Vec<(String, String)> {
    // the negotiation keyword travels as its own record, never inside
    // the option string the agent sees
    let (option, negotiation) = match pack.option.find(REQ_SVR_NEG) {
        Some(pos) => (pack.option[..pos].to_string(), REQ_SVR_NEG.to_string()),
        None => (pack.option.clone(), String::new()),
    };
    AgentBootstrap {
        proxy_user: pack.proxy_user.clone(),
        proxy_zone: pack.proxy_zone.clone(),
        client_user: pack.client_user.clone(),
        client_zone: pack.client_zone.clone(),
        option,
        negotiation,
        connect_cnt: pack.connect_cnt,
        shared_secret_hex: pack.session_token.clone(),
    }
    .to_records()
}

fn read_worker_loop(
    conn_queue: Arc<ConnQueue<PendingConn>>,
    spawn_queue: Arc<ConnQueue<SpawnItem>>,
    bad_queue: Arc<ConnQueue<BadRequest>>,
    table: Arc<AgentTable>,
    cfg: Arc<ServerConfig>,
) {
    while let Some(mut pending) = conn_queue.pop_wait() {
        match triage(&mut pending.stream) {
            Triage::HeartbeatProbe => {
                debug!(peer = %pending.peer, "heartbeat probe");
                let _ = pending.stream.write_all(HEARTBEAT_LITERAL.as_bytes());
            }
            Triage::Startup(pack) => match admit(&pack, &table, &cfg) {
                Status::Ok => spawn_queue.push_back(SpawnItem {
                    stream: pending.stream,
                    pack,
                    peer: pending.peer,
                }),
                verdict => {
                    let _ = startup::send_version_reply(&mut pending.stream, verdict);
                    bad_queue.push_front(BadRequest {
                        peer: pending.peer,
                        status: verdict,
                    });
                }
            },
            Triage::Reject(st) => {
                let _ = startup::send_version_reply(&mut pending.stream, st);
                bad_queue.push_front(BadRequest {
                    peer: pending.peer,
                    status: st,
                });
            }
        }
        // rejected streams close here, on the worker, never on the
        // accept loop
    }
}

fn spawn_manager_loop(
    spawn_queue: Arc<ConnQueue<SpawnItem>>,
    factory: Arc<FactoryChannel>,
    table: Arc<AgentTable>,
) {
    while let Some(item) = spawn_queue.pop_wait() {
        let vars = bootstrap_vars(&item.pack);
        match factory.spawn_agent(item.stream.as_raw_fd(), &vars) {
            Ok(pid) => {
                info!(pid, peer = %item.peer, client_user = %item.pack.client_user, "agent spawned");
                table.record_spawn(AgentRecord {
                    pid,
                    proxy_user: item.pack.proxy_user.clone(),
                    client_user: item.pack.client_user.clone(),
                    started_at: SystemTime::now(),
                });
                // the agent owns its copy of the descriptor now
                drop(item.stream);
            }
            Err(st) => {
                warn!(peer = %item.peer, %st, "handoff failed");
                let mut stream = item.stream;
                let _ = startup::send_version_reply(&mut stream, Status::SpawnErr);
            }
        }
    }
}

fn spawn_factory(control_path: &Path, config_path: Option<&Path>) -> Result<Child> {
    let exe = std::env::current_exe().context("locating server binary")?;
    let mut cmd = Command::new(exe);
    cmd.arg("factory").arg("--control").arg(control_path);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.spawn().context("spawning the agent factory")
}

/// Run the server until a shutdown signal arrives.
pub fn run(cfg: ServerConfig, config_path: Option<&Path>) -> Result<()> {
    lifecycle::install_signal_handlers()?;
    std::fs::create_dir_all(&cfg.runtime_dir)
        .with_context(|| format!("failed to create {}", cfg.runtime_dir.display()))?;
    let table = Arc::new(AgentTable::new(cfg.proc_dir())?);

    let control_path = cfg.runtime_dir.join("factory.sock");
    let mut factory_child = spawn_factory(&control_path, config_path)?;
    let factory = Arc::new(FactoryChannel::connect(
        &control_path,
        cfg.runtime_dir.join("handoff"),
    )?);

    let listener = TcpListener::bind(&cfg.bind)
        .with_context(|| format!("binding listener to {}", cfg.bind))?;
    info!(bind = %cfg.bind, read_workers = cfg.read_workers, "listener ready");

    let cfg = Arc::new(cfg);
    let conn_queue = Arc::new(ConnQueue::<PendingConn>::new());
    let spawn_queue = Arc::new(ConnQueue::<SpawnItem>::new());
    let bad_queue = Arc::new(ConnQueue::<BadRequest>::new());

    let mut workers = Vec::new();
    for i in 0..cfg.read_workers {
        let conn_queue = Arc::clone(&conn_queue);
        let spawn_queue = Arc::clone(&spawn_queue);
        let bad_queue = Arc::clone(&bad_queue);
        let table = Arc::clone(&table);
        let cfg = Arc::clone(&cfg);
        let handle = thread::Builder::new()
            .name(format!("read-{i}"))
            .spawn(move || read_worker_loop(conn_queue, spawn_queue, bad_queue, table, cfg))
            .context("spawning read worker")?;
        workers.push(handle);
    }

    let spawn_mgr = {
        let spawn_queue = Arc::clone(&spawn_queue);
        let factory = Arc::clone(&factory);
        let table = Arc::clone(&table);
        thread::Builder::new()
            .name("spawn-mgr".to_string())
            .spawn(move || spawn_manager_loop(spawn_queue, factory, table))
            .context("spawning spawn manager")?
    };

    let mut last_drain = Instant::now();
    loop {
        if lifecycle::shutdown_requested() {
            info!("shutdown requested");
            break;
        }

        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeouts::ACCEPT_POLL_MS)) {
            Ok(0) => {}
            Ok(_) => match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    conn_queue.push_back(PendingConn { stream, peer });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                warn!(error = %e, "poll failed");
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }

        // housekeeping, kept off the accept path
        if lifecycle::take_child_flag() {
            if let Ok(Some(code)) = factory_child.try_wait() {
                error!(%code, "agent factory died, shutting down");
                break;
            }
        }
        if last_drain.elapsed() >= timeouts::BAD_REQ_DRAIN {
            for bad in bad_queue.try_drain() {
                warn!(peer = %bad.peer, status = %bad.status, "rejected connection");
            }
            table.prune_stale();
            last_drain = Instant::now();
        }
    }

    conn_queue.shutdown();
    spawn_queue.shutdown();
    bad_queue.shutdown();
    for worker in workers {
        let _ = worker.join();
    }
    let _ = spawn_mgr.join();

    for bad in bad_queue.try_drain() {
        warn!(peer = %bad.peer, status = %bad.status, "rejected connection");
    }

    table.shutdown(timeouts::SHUTDOWN_GRACE);
    drop(factory); // control stream closes and the factory exits
    let _ = factory_child.wait();
    info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{write_heartbeat, HeartbeatInfo};
    use std::net::TcpListener;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn sample_pack() -> StartupPack {
        StartupPack {
            protocol_version: 1,
            proxy_user: "rods".into(),
            proxy_zone: "tempZone".into(),
            client_user: "alice".into(),
            client_zone: "tempZone".into(),
            rel_version: startup::REL_VERSION.into(),
            api_version: startup::API_VERSION.into(),
            session_token: "cafe".into(),
            ..StartupPack::default()
        }
    }

    #[test]
    fn triage_recognizes_heartbeat_probe() {
        let (mut server, mut client) = tcp_pair();
        client.write_all(HEARTBEAT_LITERAL.as_bytes()).unwrap();
        assert!(matches!(triage(&mut server), Triage::HeartbeatProbe));
    }

    #[test]
    fn triage_recognizes_heartbeat_in_pack_option() {
        let (mut server, mut client) = tcp_pair();
        let mut pack = sample_pack();
        pack.option = HEARTBEAT_LITERAL.to_string();
        startup::write_startup_pack(&mut client, &pack).unwrap();
        assert!(matches!(triage(&mut server), Triage::HeartbeatProbe));
    }

    #[test]
    fn triage_parses_startup_pack() {
        let (mut server, mut client) = tcp_pair();
        startup::write_startup_pack(&mut client, &sample_pack()).unwrap();
        match triage(&mut server) {
            Triage::Startup(pack) => assert_eq!(pack.client_user, "alice"),
            _ => panic!("expected a startup pack"),
        }
    }

    #[test]
    fn triage_rejects_garbage() {
        let (mut server, mut client) = tcp_pair();
        client.write_all(b"GARBAGE-NOT-A-PACK").unwrap();
        drop(client);
        match triage(&mut server) {
            Triage::Reject(st) => assert_ne!(st, Status::Ok),
            _ => panic!("expected a rejection"),
        }
    }

    #[test]
    fn admit_enforces_connect_count_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let table = AgentTable::new(dir.path().to_path_buf()).unwrap();
        let cfg = ServerConfig::default();

        let mut pack = sample_pack();
        pack.connect_cnt = cfg.max_connect_cnt + 1;
        assert_eq!(admit(&pack, &table, &cfg), Status::ExceedConnectCnt);

        pack.connect_cnt = cfg.max_connect_cnt;
        assert_eq!(admit(&pack, &table, &cfg), Status::Ok);
    }

    #[test]
    fn admit_enforces_agent_ceiling_after_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let table = AgentTable::new(dir.path().to_path_buf()).unwrap();
        let mut cfg = ServerConfig::default();
        cfg.max_connections = Some(1);

        // a live agent: record plus heartbeat file
        write_heartbeat(dir.path(), &HeartbeatInfo::new(100, "rods", "alice")).unwrap();
        table.record_spawn(AgentRecord {
            pid: 100,
            proxy_user: "rods".into(),
            client_user: "alice".into(),
            started_at: SystemTime::now(),
        });
        assert_eq!(admit(&sample_pack(), &table, &cfg), Status::ExceedMaxConnections);

        // the agent dies: heartbeat vanishes and admission recovers
        crate::lifecycle::remove_heartbeat(dir.path(), 100);
        assert_eq!(admit(&sample_pack(), &table, &cfg), Status::Ok);
    }

    #[test]
    fn zero_length_pack_routes_to_the_bad_queue() {
        let dir = tempfile::tempdir().unwrap();
        let table = Arc::new(AgentTable::new(dir.path().to_path_buf()).unwrap());
        let cfg = Arc::new(ServerConfig::default());
        let conn_queue = Arc::new(ConnQueue::<PendingConn>::new());
        let spawn_queue = Arc::new(ConnQueue::<SpawnItem>::new());
        let bad_queue = Arc::new(ConnQueue::<BadRequest>::new());

        let (server, mut client) = tcp_pair();
        let peer = server.peer_addr().unwrap();
        // an envelope declaring length zero
        client.write_all(&0u32.to_be_bytes()).unwrap();
        client.write_all(&[0u8; 8]).unwrap();
        conn_queue.push_back(PendingConn { stream: server, peer });

        let worker = {
            let conn_queue = Arc::clone(&conn_queue);
            let spawn_queue = Arc::clone(&spawn_queue);
            let bad_queue = Arc::clone(&bad_queue);
            let table = Arc::clone(&table);
            let cfg = Arc::clone(&cfg);
            thread::spawn(move || read_worker_loop(conn_queue, spawn_queue, bad_queue, table, cfg))
        };
        while bad_queue.is_empty() {
            thread::sleep(std::time::Duration::from_millis(10));
        }
        conn_queue.shutdown();
        worker.join().unwrap();

        assert!(spawn_queue.is_empty());
        let rejected = bad_queue.try_drain();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].status, Status::HeaderLenErr);
    }

    #[test]
    fn bootstrap_vars_carry_the_session_token() {
        let vars = bootstrap_vars(&sample_pack());
        assert!(vars.contains(&("SP_PROXY_USER".to_string(), "rods".to_string())));
        assert!(vars.contains(&("SP_SHARED_SECRET".to_string(), "cafe".to_string())));
        assert!(!vars.iter().any(|(n, _)| n == "SP_OPTION"));
    }

    #[test]
    fn negotiation_keyword_is_stripped_from_the_option() {
        let mut pack = sample_pack();
        pack.option = format!("recon;{};trailing", REQ_SVR_NEG);
        let vars = bootstrap_vars(&pack);

        let option = vars.iter().find(|(n, _)| n == "SP_OPTION").unwrap();
        assert_eq!(option.1, "recon;");
        assert!(!option.1.contains(REQ_SVR_NEG));
        let neg = vars.iter().find(|(n, _)| n == "SP_NEGOTIATION").unwrap();
        assert_eq!(neg.1, REQ_SVR_NEG);
    }

    #[test]
    fn plain_option_passes_through_unchanged() {
        let mut pack = sample_pack();
        pack.option = "recon".to_string();
        let vars = bootstrap_vars(&pack);
        assert!(vars.contains(&("SP_OPTION".to_string(), "recon".to_string())));
        assert!(!vars.iter().any(|(n, _)| n == "SP_NEGOTIATION"));
    }
}
