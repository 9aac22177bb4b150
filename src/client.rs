//! Client half of the data portal: dial the advertised ports, present
//! the cookie, then follow the driver's headers.

use std::fs::File;
use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::path::Path;
use std::thread;

use tracing::debug;

use crate::crypt::{EncryptSpec, PortalCipher};
use crate::portal::{PortalAd, PortalOutcome};
use crate::protocol::flags;
use crate::status::Status;
use crate::transfer::{self, TransferLimits, TransferTask};

/// Open one portal stream: TCP connect plus the 4-byte cookie preamble.
pub fn dial(ad: &PortalAd) -> Result<TcpStream, Status> {
    let mut stream = TcpStream::connect(ad.tcp_addr()).map_err(|_| Status::SockConnectErr)?;
    stream
        .write_all(&ad.cookie.to_be_bytes())
        .map_err(|_| Status::SockWriteErr)?;
    Ok(stream)
}

fn dial_datagram(ad: &PortalAd) -> Result<UdpSocket, Status> {
    let addr = ad.udp_addr().ok_or(Status::InvalidPortalOpr)?;
    let sock = UdpSocket::bind("0.0.0.0:0").map_err(|_| Status::SockConnectErr)?;
    sock.connect(addr).map_err(|_| Status::SockConnectErr)?;
    sock.send(&ad.cookie.to_be_bytes())
        .map_err(|_| Status::SockWriteErr)?;
    Ok(sock)
}

fn make_cipher(encrypt: &Option<(EncryptSpec, Vec<u8>)>) -> Result<Option<PortalCipher>, Status> {
    match encrypt {
        Some((spec, secret)) => Ok(Some(PortalCipher::new(spec, secret)?)),
        None => Ok(None),
    }
}

fn join_followers(
    handles: Vec<thread::JoinHandle<TransferTask>>,
    expected: Option<u64>,
    flags_word: u32,
) -> PortalOutcome {
    let mut status = Status::Ok;
    let mut bytes = 0u64;
    for handle in handles {
        match handle.join() {
            Ok(task) => {
                bytes += task.bytes_written;
                if status == Status::Ok && task.status != Status::Ok {
                    status = task.status;
                }
            }
            Err(_) => {
                if status == Status::Ok {
                    status = Status::ThreadResourceErr;
                }
            }
        }
    }
    if status == Status::Ok && flags_word & flags::SKIP_LEN_CHECK == 0 {
        if let Some(size) = expected {
            if bytes != size {
                status = Status::CopyLenErr;
            }
        }
    }
    PortalOutcome { status, bytes }
}

/// Upload `path` through the portal. One follower thread per advertised
/// stream; every follower reopens the source so seeks stay independent.
pub fn put_file(
    ad: &PortalAd,
    path: &Path,
    flags_word: u32,
    encrypt: Option<(EncryptSpec, Vec<u8>)>,
    limits: TransferLimits,
) -> PortalOutcome {
    let size = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return PortalOutcome { status: Status::FileOpenErr, bytes: 0 },
    };
    let mut handles = Vec::new();
    for idx in 0..ad.num_threads.max(1) as usize {
        let stream = match dial(ad) {
            Ok(s) => s,
            Err(st) => return join_with_failure(handles, st),
        };
        let src = match File::open(path) {
            Ok(f) => f,
            Err(_) => return join_with_failure(handles, Status::FileOpenErr),
        };
        let cipher = match make_cipher(&encrypt) {
            Ok(c) => c,
            Err(st) => return join_with_failure(handles, st),
        };
        let handle = thread::Builder::new()
            .name(format!("follow-{idx}"))
            .spawn(move || {
                let mut task = TransferTask::new(idx, 0, 0, flags_word);
                transfer::follow_put(&mut task, src, stream, cipher, &limits);
                task
            });
        match handle {
            Ok(h) => handles.push(h),
            Err(_) => return join_with_failure(handles, Status::ThreadResourceErr),
        }
    }
    debug!(streams = handles.len(), size, "put followers running");
    join_followers(handles, Some(size), flags_word)
}

/// Download into `path` through the portal. The file is created up front
/// so every follower can write its ranges in place.
pub fn get_file(
    ad: &PortalAd,
    path: &Path,
    expected_size: Option<u64>,
    flags_word: u32,
    encrypt: Option<(EncryptSpec, Vec<u8>)>,
    limits: TransferLimits,
) -> PortalOutcome {
    if File::create(path).is_err() {
        return PortalOutcome { status: Status::FileOpenErr, bytes: 0 };
    }
    let mut handles = Vec::new();
    for idx in 0..ad.num_threads.max(1) as usize {
        let stream = match dial(ad) {
            Ok(s) => s,
            Err(st) => return join_with_failure(handles, st),
        };
        let dest = match File::options().write(true).open(path) {
            Ok(f) => f,
            Err(_) => return join_with_failure(handles, Status::FileOpenErr),
        };
        let cipher = match make_cipher(&encrypt) {
            Ok(c) => c,
            Err(st) => return join_with_failure(handles, st),
        };
        let handle = thread::Builder::new()
            .name(format!("follow-{idx}"))
            .spawn(move || {
                let mut task = TransferTask::new(idx, 0, 0, flags_word);
                transfer::follow_get(&mut task, stream, dest, cipher, &limits);
                task
            });
        match handle {
            Ok(h) => handles.push(h),
            Err(_) => return join_with_failure(handles, Status::ThreadResourceErr),
        }
    }
    debug!(streams = handles.len(), "get followers running");
    join_followers(handles, expected_size, flags_word)
}

fn join_with_failure(
    handles: Vec<thread::JoinHandle<TransferTask>>,
    status: Status,
) -> PortalOutcome {
    // the driver notices the missing stream and unwinds on its own; we
    // still reap the followers we managed to start
    let partial = join_followers(handles, None, flags::SKIP_LEN_CHECK);
    PortalOutcome {
        status,
        bytes: partial.bytes,
    }
}

/// Upload over the sequenced datagram path. Single stream by design.
pub fn put_file_udp(ad: &PortalAd, path: &Path, offset: u64) -> PortalOutcome {
    let size = match std::fs::metadata(path) {
        Ok(m) => m.len().saturating_sub(offset),
        Err(_) => return PortalOutcome { status: Status::FileOpenErr, bytes: 0 },
    };
    let sock = match dial_datagram(ad) {
        Ok(s) => s,
        Err(st) => return PortalOutcome { status: st, bytes: 0 },
    };
    let src = match File::open(path) {
        Ok(f) => f,
        Err(_) => return PortalOutcome { status: Status::FileOpenErr, bytes: 0 },
    };
    let mut task = TransferTask::new(0, size, offset, 0);
    transfer::send_udp(&mut task, src, &sock, None);
    PortalOutcome {
        status: task.status,
        bytes: task.bytes_written,
    }
}

/// Download over the sequenced datagram path.
pub fn get_file_udp(ad: &PortalAd, path: &Path, size: u64, offset: u64) -> PortalOutcome {
    let sock = match dial_datagram(ad) {
        Ok(s) => s,
        Err(st) => return PortalOutcome { status: st, bytes: 0 },
    };
    let server = match sock.peer_addr() {
        Ok(a) => a,
        Err(_) => return PortalOutcome { status: Status::UdpTransferErr, bytes: 0 },
    };
    let dest = match File::create(path) {
        Ok(f) => f,
        Err(_) => return PortalOutcome { status: Status::FileOpenErr, bytes: 0 },
    };
    let mut task = TransferTask::new(0, size, offset, 0);
    transfer::recv_udp(&mut task, &sock, server, dest);
    PortalOutcome {
        status: task.status,
        bytes: task.bytes_written,
    }
}
