//! Data portal: a short-lived TCP listener (plus optional datagram
//! socket) advertised back to the client, guarded by a random cookie,
//! with one worker thread per connected stream.

use std::fs::File;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsFd;
use std::path::Path;
use std::thread;
use std::time::Instant;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PortRange;
use crate::crypt::{EncryptSpec, PortalCipher};
use crate::protocol::{self, flags, timeouts, MAX_PORTAL_THREADS};
use crate::status::Status;
use crate::transfer::{self, TransferLimits, TransferTask};

/// Advertisement sent to the client so it can dial in. TCP and datagram
/// ports ride together in one packed word, TCP in the low half.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortalAd {
    pub host: String,
    pub packed_port: u32,
    pub cookie: u32,
    pub window_size: u32,
    pub num_threads: u32,
}

impl PortalAd {
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.host, protocol::tcp_port(self.packed_port))
    }

    pub fn udp_addr(&self) -> Option<String> {
        protocol::udp_port(self.packed_port).map(|p| format!("{}:{}", self.host, p))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalOp {
    Put,
    Get,
}

/// What the caller gets back after every worker has been joined.
#[derive(Debug, Clone, Copy)]
pub struct PortalOutcome {
    pub status: Status,
    pub bytes: u64,
}

/// Pick the worker count for a transfer. Datagram and streaming modes
/// are single-threaded by construction; otherwise a zero request means
/// scale with size, and everything is clamped to the configured maximum.
pub fn choose_threads(requested: usize, size: u64, max: usize, flags_word: u32, udp: bool) -> usize {
    if udp || flags_word & flags::STREAMING != 0 {
        return 1;
    }
    let max = max.clamp(1, MAX_PORTAL_THREADS);
    let wanted = if requested == 0 {
        (size / (32 * 1024 * 1024) + 1) as usize
    } else {
        requested
    };
    wanted.clamp(1, max)
}

/// Split `size` into `n` contiguous ranges. The last range absorbs the
/// remainder so every earlier worker moves exactly `size / n` bytes.
pub fn partition(size: u64, n: usize) -> Vec<(u64, u64)> {
    let n = n.max(1) as u64;
    let per = size / n;
    (0..n)
        .map(|i| {
            let len = if i == n - 1 { size - per * i } else { per };
            (per * i, len)
        })
        .collect()
}

fn bind_in_range(host: &str, range: &PortRange) -> Result<TcpListener, Status> {
    if range.is_ephemeral() {
        return TcpListener::bind((host, 0)).map_err(|_| Status::SockConnectErr);
    }
    for port in range.start..=range.end {
        if let Ok(l) = TcpListener::bind((host, port)) {
            return Ok(l);
        }
    }
    Err(Status::SockConnectErr)
}

fn bind_udp_in_range(host: &str, range: &PortRange) -> Result<UdpSocket, Status> {
    if range.is_ephemeral() {
        return UdpSocket::bind((host, 0)).map_err(|_| Status::SockConnectErr);
    }
    for port in range.start..=range.end {
        if let Ok(s) = UdpSocket::bind((host, port)) {
            return Ok(s);
        }
    }
    Err(Status::SockConnectErr)
}

pub struct Portal {
    tcp: TcpListener,
    udp: Option<UdpSocket>,
    cookie: u32,
    num_threads: usize,
    window_size: u32,
    advertise_host: String,
}

impl Portal {
    /// Bind the listener (and the datagram socket when asked for) inside
    /// the configured port range and mint a fresh cookie.
    pub fn setup(
        advertise_host: &str,
        range: &PortRange,
        num_threads: usize,
        window_size: u32,
        use_udp: bool,
    ) -> Result<Portal, Status> {
        let tcp = bind_in_range("0.0.0.0", range)?;
        let udp = if use_udp {
            Some(bind_udp_in_range("0.0.0.0", range)?)
        } else {
            None
        };
        // high bit cleared so the cookie survives signed 32-bit peers
        let cookie = rand::random::<u32>() >> 1;
        info!(
            port = tcp.local_addr().map(|a| a.port()).unwrap_or(0),
            udp = udp.is_some(),
            num_threads,
            "portal bound"
        );
        Ok(Portal {
            tcp,
            udp,
            cookie,
            num_threads: num_threads.max(1),
            window_size,
            advertise_host: advertise_host.to_string(),
        })
    }

    pub fn ad(&self) -> Result<PortalAd, Status> {
        let tcp_port = self
            .tcp
            .local_addr()
            .map_err(|_| Status::SockConnectErr)?
            .port();
        let udp_port = match &self.udp {
            Some(s) => Some(s.local_addr().map_err(|_| Status::SockConnectErr)?.port()),
            None => None,
        };
        Ok(PortalAd {
            host: self.advertise_host.clone(),
            packed_port: protocol::pack_ports(tcp_port, udp_port),
            cookie: self.cookie,
            window_size: self.window_size,
            num_threads: self.num_threads as u32,
        })
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    /// Wait for one stream, then demand the 4-byte cookie before anything
    /// else. A wrong cookie is a hard close, not an error message.
    fn accept_stream(&self, deadline: Instant) -> Result<TcpStream, Status> {
        loop {
            if Instant::now() >= deadline {
                return Err(Status::SockAcceptErr);
            }
            let mut fds = [PollFd::new(self.tcp.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(timeouts::ACCEPT_POLL_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return Err(Status::SockSelectErr),
            }
            let (mut stream, peer) = match self.tcp.accept() {
                Ok(v) => v,
                Err(_) => return Err(Status::SockAcceptErr),
            };
            stream
                .set_read_timeout(Some(timeouts::READ_STARTUP_PACK))
                .map_err(|_| Status::SockAcceptErr)?;
            let mut buf = [0u8; 4];
            if stream.read_exact(&mut buf).is_err() {
                warn!(%peer, "stream closed before presenting a cookie");
                return Err(Status::PortCookieErr);
            }
            if u32::from_be_bytes(buf) != self.cookie {
                warn!(%peer, "cookie mismatch, dropping stream");
                return Err(Status::PortCookieErr);
            }
            stream
                .set_read_timeout(None)
                .map_err(|_| Status::SockAcceptErr)?;
            debug!(%peer, "portal stream admitted");
            return Ok(stream);
        }
    }

    /// Wait for the client's cookie datagram and learn its address.
    fn accept_datagram_peer(sock: &UdpSocket, cookie: u32) -> Result<SocketAddr, Status> {
        sock.set_read_timeout(Some(timeouts::PORTAL_ACCEPT))
            .map_err(|_| Status::UdpTransferErr)?;
        let mut buf = [0u8; 4];
        let (n, from) = sock.recv_from(&mut buf).map_err(|_| Status::SockAcceptErr)?;
        if n != 4 || u32::from_be_bytes(buf) != cookie {
            return Err(Status::PortCookieErr);
        }
        Ok(from)
    }

    /// Accept every stream, carve the byte range across workers, and run
    /// the transfer to completion. The first worker's stream is accepted
    /// first but its thread starts only after all the others, so its file
    /// handle is the last one to close.
    pub fn run(
        self,
        op: PortalOp,
        path: &Path,
        size: u64,
        offset: u64,
        flags_word: u32,
        encrypt: Option<(EncryptSpec, Vec<u8>)>,
        limits: TransferLimits,
    ) -> PortalOutcome {
        if let Some(udp) = &self.udp {
            return self.run_datagram(op, path, size, offset, udp);
        }

        let deadline = Instant::now() + timeouts::PORTAL_ACCEPT;
        let ranges = partition(size, self.num_threads);

        let stream0 = match self.accept_stream(deadline) {
            Ok(s) => s,
            Err(st) => return PortalOutcome { status: st, bytes: 0 },
        };

        let mut handles: Vec<thread::JoinHandle<TransferTask>> = Vec::new();
        let mut failed = Status::Ok;

        for (idx, &(rel_offset, len)) in ranges.iter().enumerate().skip(1) {
            let stream = match self.accept_stream(deadline) {
                Ok(s) => s,
                Err(st) => {
                    failed = st;
                    break;
                }
            };
            match spawn_worker(op, path, stream, len, offset + rel_offset, flags_word, idx, &encrypt, limits) {
                Ok(h) => handles.push(h),
                Err(st) => {
                    failed = st;
                    break;
                }
            }
        }

        if failed == Status::Ok {
            let (rel_offset, len) = ranges[0];
            match spawn_worker(op, path, stream0, len, offset + rel_offset, flags_word, 0, &encrypt, limits) {
                Ok(h) => handles.push(h),
                Err(st) => failed = st,
            }
        }

        let mut total_bytes = 0u64;
        let mut status = failed;
        for handle in handles {
            match handle.join() {
                Ok(task) => {
                    total_bytes += task.bytes_written;
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

        if status == Status::Ok
            && flags_word & flags::SKIP_LEN_CHECK == 0
            && total_bytes != size
        {
            warn!(expected = size, moved = total_bytes, "transfer length mismatch");
            status = Status::CopyLenErr;
        }

        PortalOutcome {
            status,
            bytes: total_bytes,
        }
    }

    fn run_datagram(
        &self,
        op: PortalOp,
        path: &Path,
        size: u64,
        offset: u64,
        udp: &UdpSocket,
    ) -> PortalOutcome {
        let peer = match Portal::accept_datagram_peer(udp, self.cookie) {
            Ok(p) => p,
            Err(st) => return PortalOutcome { status: st, bytes: 0 },
        };
        let mut task = TransferTask::new(0, size, offset, 0);
        match op {
            PortalOp::Put => match File::options().write(true).create(true).open(path) {
                Ok(dest) => transfer::recv_udp(&mut task, udp, peer, dest),
                Err(_) => task.status = Status::FileOpenErr,
            },
            PortalOp::Get => match File::open(path) {
                Ok(src) => transfer::send_udp(&mut task, src, udp, Some(peer)),
                Err(_) => task.status = Status::FileOpenErr,
            },
        }
        if task.status == Status::Ok && task.bytes_written != size {
            task.status = Status::CopyLenErr;
        }
        PortalOutcome {
            status: task.status,
            bytes: task.bytes_written,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    op: PortalOp,
    path: &Path,
    stream: TcpStream,
    size: u64,
    offset: u64,
    flags_word: u32,
    thread_index: usize,
    encrypt: &Option<(EncryptSpec, Vec<u8>)>,
    limits: TransferLimits,
) -> Result<thread::JoinHandle<TransferTask>, Status> {
    // each worker holds its own handle so seek positions never collide
    let file = match op {
        PortalOp::Put => File::options().write(true).create(true).open(path),
        PortalOp::Get => File::open(path),
    }
    .map_err(|_| Status::FileOpenErr)?;

    let cipher = match encrypt {
        Some((spec, secret)) => Some(PortalCipher::new(spec, secret)?),
        None => None,
    };

    thread::Builder::new()
        .name(format!("portal-{thread_index}"))
        .spawn(move || {
            let mut task = TransferTask::new(thread_index, size, offset, flags_word);
            match op {
                PortalOp::Put => transfer::drive_put(&mut task, stream, file, cipher, &limits),
                PortalOp::Get => transfer::drive_get(&mut task, file, stream, cipher, &limits),
            }
            task
        })
        .map_err(|_| Status::ThreadResourceErr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_splits_with_tail_remainder() {
        let ranges = partition(10_485_760, 4);
        assert_eq!(
            ranges,
            vec![
                (0, 2_621_440),
                (2_621_440, 2_621_440),
                (5_242_880, 2_621_440),
                (7_864_320, 2_621_440),
            ]
        );

        let ranges = partition(100, 3);
        assert_eq!(ranges, vec![(0, 33), (33, 33), (66, 34)]);
        assert_eq!(ranges.iter().map(|r| r.1).sum::<u64>(), 100);
    }

    #[test]
    fn partition_single_thread_takes_everything() {
        assert_eq!(partition(7, 1), vec![(0, 7)]);
        assert_eq!(partition(0, 3), vec![(0, 0), (0, 0), (0, 0)]);
    }

    #[test]
    fn thread_choice_honors_mode_and_clamp() {
        assert_eq!(choose_threads(8, 1 << 30, 16, 0, false), 8);
        assert_eq!(choose_threads(64, 1 << 30, 16, 0, false), 16);
        assert_eq!(choose_threads(8, 1 << 30, 4, 0, false), 4);
        // streaming and datagram transfers never split
        assert_eq!(choose_threads(8, 1 << 30, 16, flags::STREAMING, false), 1);
        assert_eq!(choose_threads(8, 1 << 30, 16, 0, true), 1);
        // zero request scales with size
        assert_eq!(choose_threads(0, 10_000, 16, 0, false), 1);
        assert_eq!(choose_threads(0, 200 * 1024 * 1024, 16, 0, false), 7);
    }

    #[test]
    fn ad_packs_both_ports() {
        let range = PortRange { start: 0, end: 0 };
        let portal = Portal::setup("127.0.0.1", &range, 2, 0, true).unwrap();
        let ad = portal.ad().unwrap();
        let tcp = protocol::tcp_port(ad.packed_port);
        let udp = protocol::udp_port(ad.packed_port);
        assert_ne!(tcp, 0);
        assert!(udp.is_some());
        assert_eq!(ad.tcp_addr(), format!("127.0.0.1:{tcp}"));
        assert_eq!(ad.num_threads, 2);
    }

    #[test]
    fn wrong_cookie_is_hard_closed() {
        use std::io::Write;

        let range = PortRange { start: 0, end: 0 };
        let portal = Portal::setup("127.0.0.1", &range, 1, 0, false).unwrap();
        let port = protocol::tcp_port(portal.ad().unwrap().packed_port);
        let bad_cookie = portal.cookie().wrapping_add(1);

        let dialer = std::thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(&bad_cookie.to_be_bytes()).unwrap();
            // server should drop us without a byte of protocol
            let mut buf = [0u8; 1];
            s.read(&mut buf)
        });

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let res = portal.accept_stream(deadline);
        assert_eq!(res.unwrap_err(), Status::PortCookieErr);
        // orderly EOF or reset are both acceptable on the dialing side
        let _ = dialer.join().unwrap();
    }
}
