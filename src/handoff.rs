//! Connection handoff to the agent factory over Unix domain sockets.
//!
//! The listener keeps one persistent control stream to the factory. Each
//! spawn gets its own short-lived socket: the listener binds a fresh
//! path, names it on the control stream, then feeds the accepted
//! connection the agent's bootstrap records, the client's descriptor
//! (SCM_RIGHTS), and finally reads back the agent pid.
//!
//! Records are length-prefixed UTF-8: a u32 big-endian byte count, then
//! the bytes. Bootstrap variables travel as NAME=VALUE records closed by
//! the end_of_vars sentinel.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{self, timeouts};
use crate::status::Status;

pub const MAX_RECORD_LEN: usize = 4096;

pub fn send_record(stream: &mut UnixStream, record: &str) -> Result<(), Status> {
    let bytes = record.as_bytes();
    if bytes.len() > MAX_RECORD_LEN {
        return Err(Status::SockWriteErr);
    }
    stream
        .write_all(&(bytes.len() as u32).to_be_bytes())
        .and_then(|_| stream.write_all(bytes))
        .map_err(|_| Status::SockWriteErr)
}

pub fn read_record(stream: &mut UnixStream) -> Result<String, Status> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .map_err(|_| Status::SockReadErr)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Err(Status::HeaderLenErr);
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).map_err(|_| Status::SockReadErr)?;
    String::from_utf8(buf).map_err(|_| Status::BadMsgType)
}

/// Pass one descriptor over the stream with a single marker byte.
pub fn send_fd(stream: &UnixStream, fd: RawFd) -> Result<(), Status> {
    let iov = [IoSlice::new(b"f")];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|_| Status::SockWriteErr)?;
    Ok(())
}

pub fn recv_fd(stream: &UnixStream) -> Result<OwnedFd, Status> {
    let mut marker = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut marker)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(|_| Status::SockReadErr)?;
    for cmsg in msg.cmsgs().map_err(|_| Status::SockReadErr)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(*fd) });
            }
        }
    }
    Err(Status::SockReadErr)
}

/// The listener's handle on the factory process.
pub struct FactoryChannel {
    control: Mutex<UnixStream>,
    socket_dir: PathBuf,
}

impl FactoryChannel {
    /// Dial the factory's control socket, retrying until it appears or
    /// the connect window closes.
    pub fn connect(control_path: &Path, socket_dir: PathBuf) -> Result<Self> {
        let deadline = Instant::now() + timeouts::FACTORY_CONNECT;
        let control = loop {
            match UnixStream::connect(control_path) {
                Ok(s) => break s,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e).with_context(|| {
                            format!("factory control socket {}", control_path.display())
                        });
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        };
        std::fs::create_dir_all(&socket_dir)
            .with_context(|| format!("failed to create {}", socket_dir.display()))?;
        Ok(FactoryChannel {
            control: Mutex::new(control),
            socket_dir,
        })
    }

    /// Hand one accepted client over to the factory. Returns the pid of
    /// the agent now owning the descriptor.
    pub fn spawn_agent(&self, client_fd: RawFd, vars: &[(String, String)]) -> Result<i32, Status> {
        let spawn_path = self.socket_dir.join(format!("agent-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&spawn_path).map_err(|_| Status::SpawnErr)?;
        let _cleanup = SocketFileGuard(&spawn_path);

        let mut control = self.control.lock();
        send_record(&mut control, &spawn_path.to_string_lossy())?;
        let ack = read_record(&mut control)?;
        if ack != protocol::ACK_OK {
            warn!(%ack, "factory refused the spawn socket");
            return Err(Status::SpawnErr);
        }

        let (mut spawn_stream, _) = listener.accept().map_err(|_| Status::SpawnErr)?;
        drop(control); // per-spawn traffic moves to the dedicated socket

        // individual records are best effort; a connection missing one
        // non-essential field still beats no connection at all
        for (name, value) in vars {
            if let Err(st) = send_record(&mut spawn_stream, &format!("{name}={value}")) {
                warn!(name = name.as_str(), %st, "bootstrap record not delivered");
            }
        }
        send_record(&mut spawn_stream, protocol::END_OF_VARS)?;
        let ack = read_record(&mut spawn_stream)?;
        if ack != protocol::ACK_OK {
            return Err(Status::SpawnErr);
        }

        send_fd(&spawn_stream, client_fd)?;

        match read_record(&mut spawn_stream)?.as_str() {
            protocol::CONNECTION_SUCCESSFUL => {}
            protocol::SPAWN_FAILURE => return Err(Status::SpawnErr),
            other => {
                warn!(%other, "unexpected spawn outcome record");
                return Err(Status::SpawnErr);
            }
        }
        let pid: i32 = read_record(&mut spawn_stream)?
            .trim()
            .parse()
            .map_err(|_| Status::SpawnErr)?;
        debug!(pid, "connection handed off");
        Ok(pid)
    }
}

struct SocketFileGuard<'a>(&'a Path);

impl Drop for SocketFileGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}
