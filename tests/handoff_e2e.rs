use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Result;

use gangway::handoff::{read_record, recv_fd, send_record, FactoryChannel};
use gangway::protocol;
use gangway::status::Status;

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

fn read_vars(stream: &mut UnixStream) -> Vec<String> {
    let mut vars = Vec::new();
    loop {
        let record = read_record(stream).unwrap();
        if record == protocol::END_OF_VARS {
            return vars;
        }
        vars.push(record);
    }
}

/// Stand-in for the factory process: accepts the control connection and
/// answers one spawn request the way the real factory does.
fn fake_factory(control_path: PathBuf, fail_spawn: bool) -> thread::JoinHandle<()> {
    let listener = UnixListener::bind(&control_path).unwrap();
    thread::spawn(move || {
        let (mut control, _) = listener.accept().unwrap();
        let spawn_path = read_record(&mut control).unwrap();

        let mut spawn_stream = UnixStream::connect(Path::new(&spawn_path)).unwrap();
        send_record(&mut control, protocol::ACK_OK).unwrap();

        let vars = read_vars(&mut spawn_stream);
        assert!(vars.iter().any(|v| v == "SP_CLIENT_USER=alice"));
        send_record(&mut spawn_stream, protocol::ACK_OK).unwrap();

        let fd = recv_fd(&spawn_stream).unwrap();

        if fail_spawn {
            send_record(&mut spawn_stream, protocol::SPAWN_FAILURE).unwrap();
            return;
        }

        // prove the descriptor is live before reporting success
        let mut handed: TcpStream = fd.into();
        handed.write_all(b"agent says hi").unwrap();

        send_record(&mut spawn_stream, protocol::CONNECTION_SUCCESSFUL).unwrap();
        send_record(&mut spawn_stream, "4242").unwrap();
    })
}

fn vars() -> Vec<(String, String)> {
    vec![
        ("SP_PROXY_USER".to_string(), "rods".to_string()),
        ("SP_CLIENT_USER".to_string(), "alice".to_string()),
    ]
}

#[test]
fn handoff_passes_a_live_descriptor() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let control_path = dir.path().join("factory.sock");
    let socket_dir = dir.path().join("handoff");

    let factory_thread = fake_factory(control_path.clone(), false);
    let channel = FactoryChannel::connect(&control_path, socket_dir.clone())?;

    let (handed_end, mut client_end) = tcp_pair();
    let pid = channel.spawn_agent(handed_end.as_raw_fd(), &vars()).unwrap();
    assert_eq!(pid, 4242);

    // the fake factory wrote through its copy of the descriptor
    drop(handed_end);
    let mut buf = String::new();
    client_end.read_to_string(&mut buf)?;
    assert_eq!(buf, "agent says hi");

    factory_thread.join().unwrap();

    // per-spawn sockets do not accumulate
    let leftovers: Vec<_> = std::fs::read_dir(&socket_dir)?.collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[test]
fn spawn_failure_is_reported_and_cleaned_up() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let control_path = dir.path().join("factory.sock");
    let socket_dir = dir.path().join("handoff");

    let factory_thread = fake_factory(control_path.clone(), true);
    let channel = FactoryChannel::connect(&control_path, socket_dir.clone())?;

    let (handed_end, _client_end) = tcp_pair();
    let err = channel.spawn_agent(handed_end.as_raw_fd(), &vars()).unwrap_err();
    assert_eq!(err, Status::SpawnErr);

    factory_thread.join().unwrap();
    let leftovers: Vec<_> = std::fs::read_dir(&socket_dir)?.collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[test]
fn connect_times_out_without_a_factory() {
    let dir = tempfile::tempdir().unwrap();
    let control_path = dir.path().join("nobody-home.sock");
    let started = std::time::Instant::now();
    let result = FactoryChannel::connect(&control_path, dir.path().join("handoff"));
    assert!(result.is_err());
    // the retry window closes rather than spinning forever
    assert!(started.elapsed() >= protocol::timeouts::FACTORY_CONNECT);
}
