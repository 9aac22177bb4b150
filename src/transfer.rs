//! Portal transfer workers: per-thread byte movers between two endpoints.
//!
//! The framed TCP path is driven by the portal-owning side: it writes a
//! transfer header (operation, flags, offset, length) ahead of every
//! chunk, and a zero-length DONE header when its range is finished. The
//! connecting side follows headers. Under encryption each buffer travels
//! as `nonce || ciphertext` behind a 4-byte wire-size prefix; bookkeeping
//! always advances by the plaintext length, never the wire length.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::crypt::PortalCipher;
use crate::protocol::{flags, opr, timeouts, UDP_BLOCK_SIZE};
use crate::status::Status;

pub const TRANSFER_HEADER_LEN: usize = 24;

/// Small fixed header ahead of every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub opr: i32,
    pub flags: u32,
    pub offset: u64,
    pub length: u64,
}

impl TransferHeader {
    pub fn done() -> Self {
        TransferHeader {
            opr: opr::DONE,
            flags: 0,
            offset: 0,
            length: 0,
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), Status> {
        let mut buf = [0u8; TRANSFER_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.opr.to_be_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.length.to_be_bytes());
        w.write_all(&buf).map_err(|_| Status::SockWriteErr)
    }

    pub fn read_from(r: &mut impl Read) -> Result<Self, Status> {
        let mut buf = [0u8; TRANSFER_HEADER_LEN];
        r.read_exact(&mut buf).map_err(|_| Status::SockReadErr)?;
        Ok(TransferHeader {
            opr: i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            flags: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            length: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

/// One worker's unit of work. Mutated only by its own thread between
/// spawn and join; frozen and authoritative afterwards.
#[derive(Debug)]
pub struct TransferTask {
    pub thread_index: usize,
    pub size: u64,
    pub offset: u64,
    pub flags: u32,
    pub status: Status,
    pub bytes_written: u64,
}

impl TransferTask {
    pub fn new(thread_index: usize, size: u64, offset: u64, flags: u32) -> Self {
        TransferTask {
            thread_index,
            size,
            offset,
            flags,
            status: Status::Ok,
            bytes_written: 0,
        }
    }

    fn streaming(&self) -> bool {
        self.flags & flags::STREAMING != 0
    }
}

/// Chunk and buffer bounds threaded through every worker.
#[derive(Clone, Copy, Debug)]
pub struct TransferLimits {
    pub chunk_size: usize,
    pub buf_size: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        TransferLimits {
            chunk_size: crate::protocol::DEFAULT_CHUNK_SIZE,
            buf_size: crate::protocol::DEFAULT_BUF_SIZE,
        }
    }
}

fn write_u32_be(w: &mut impl Write, v: u32) -> Result<(), Status> {
    w.write_all(&v.to_be_bytes()).map_err(|_| Status::SockWriteErr)
}

fn read_u32_be(r: &mut impl Read) -> Result<u32, Status> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|_| Status::SockReadErr)?;
    Ok(u32::from_be_bytes(buf))
}

fn seek_to(file: &mut File, offset: u64) -> Result<(), Status> {
    file.seek(SeekFrom::Start(offset)).map_err(|_| Status::SeekErr)?;
    Ok(())
}

/// Send one plaintext buffer to the socket, encrypting if required.
/// Returns the plaintext length that accounting should advance by.
fn send_buffer(
    sock: &mut TcpStream,
    plain: &[u8],
    cipher: Option<&PortalCipher>,
) -> Result<usize, Status> {
    match cipher {
        Some(c) => {
            let wire = c.encrypt_chunk(plain)?;
            // wire size precedes the payload: it differs from the
            // plaintext size and the peer must not confuse the two
            write_u32_be(sock, wire.len() as u32)?;
            sock.write_all(&wire).map_err(|_| Status::SockWriteErr)?;
        }
        None => {
            sock.write_all(plain).map_err(|_| Status::SockWriteErr)?;
        }
    }
    Ok(plain.len())
}

/// Receive one buffer from the socket. `want` is the plaintext byte count
/// expected in the clear path; under encryption the declared wire size
/// governs the read and the plaintext falls out of decryption.
fn recv_buffer(
    sock: &mut TcpStream,
    want: usize,
    cipher: Option<&PortalCipher>,
    scratch: &mut Vec<u8>,
    limits: &TransferLimits,
) -> Result<Vec<u8>, Status> {
    match cipher {
        Some(c) => {
            let wire_len = read_u32_be(sock)? as usize;
            let max_wire = limits.buf_size + PortalCipher::wire_overhead();
            if wire_len == 0 || wire_len > max_wire {
                return Err(Status::CopyLenErr);
            }
            scratch.resize(wire_len, 0);
            sock.read_exact(scratch).map_err(|_| Status::SockReadErr)?;
            c.decrypt_chunk(scratch)
        }
        None => {
            scratch.resize(want, 0);
            sock.read_exact(scratch).map_err(|_| Status::CopyLenErr)?;
            Ok(std::mem::take(scratch))
        }
    }
}

/// Receiving driver (portal side of a PUT): announce each range with a
/// header, read it off the socket, write it to the local file.
pub fn drive_put(
    task: &mut TransferTask,
    mut sock: TcpStream,
    mut dest: File,
    cipher: Option<PortalCipher>,
    limits: &TransferLimits,
) {
    if task.offset != 0 {
        if let Err(st) = seek_to(&mut dest, task.offset) {
            task.status = st;
            return;
        }
    }

    let mut cur_offset = task.offset;
    let mut remaining = task.size;
    let mut scratch = Vec::with_capacity(limits.buf_size);

    while remaining > 0 {
        let this_range = if task.streaming() {
            remaining
        } else {
            remaining.min(limits.chunk_size as u64)
        };
        let header = TransferHeader {
            opr: opr::PUT,
            flags: task.flags,
            offset: cur_offset,
            length: this_range,
        };
        if let Err(st) = header.write_to(&mut sock) {
            task.status = st;
            return;
        }

        let mut range_left = this_range;
        while range_left > 0 {
            let want = range_left.min(limits.buf_size as u64) as usize;
            let plain = match recv_buffer(&mut sock, want, cipher.as_ref(), &mut scratch, limits) {
                Ok(p) => p,
                Err(st) => {
                    task.status = st;
                    return;
                }
            };
            if plain.is_empty() || plain.len() as u64 > range_left {
                task.status = Status::CopyLenErr;
                return;
            }
            if dest.write_all(&plain).is_err() {
                task.status = Status::CopyLenErr;
                return;
            }
            let n = plain.len() as u64;
            task.bytes_written += n;
            range_left -= n;
            remaining -= n;
            cur_offset += n;
        }
    }

    if let Err(st) = TransferHeader::done().write_to(&mut sock) {
        debug!(thread = task.thread_index, %st, "done header not delivered");
    }
}

/// Sending driver (portal side of a GET): announce each range, read it
/// from the local file, push it down the socket.
pub fn drive_get(
    task: &mut TransferTask,
    mut src: File,
    mut sock: TcpStream,
    cipher: Option<PortalCipher>,
    limits: &TransferLimits,
) {
    if task.offset != 0 {
        if let Err(st) = seek_to(&mut src, task.offset) {
            task.status = st;
            return;
        }
    }

    let mut cur_offset = task.offset;
    let mut remaining = task.size;
    let mut buf = vec![0u8; limits.buf_size];

    while remaining > 0 {
        let this_range = if task.streaming() {
            remaining
        } else {
            remaining.min(limits.chunk_size as u64)
        };
        let header = TransferHeader {
            opr: opr::GET,
            flags: task.flags,
            offset: cur_offset,
            length: this_range,
        };
        if let Err(st) = header.write_to(&mut sock) {
            task.status = st;
            return;
        }

        let mut range_left = this_range;
        while range_left > 0 {
            let this_len = range_left.min(limits.buf_size as u64) as usize;
            if src.read_exact(&mut buf[..this_len]).is_err() {
                task.status = Status::CopyLenErr;
                return;
            }
            match send_buffer(&mut sock, &buf[..this_len], cipher.as_ref()) {
                Ok(n) => {
                    task.bytes_written += n as u64;
                    range_left -= n as u64;
                    remaining -= n as u64;
                    cur_offset += n as u64;
                }
                Err(st) => {
                    task.status = st;
                    return;
                }
            }
        }
    }

    if let Err(st) = TransferHeader::done().write_to(&mut sock) {
        debug!(thread = task.thread_index, %st, "done header not delivered");
    }
}

/// Connecting sender (client side of a PUT): follow the peer's headers,
/// reading the named range from the local file and sending it.
pub fn follow_put(
    task: &mut TransferTask,
    mut src: File,
    mut sock: TcpStream,
    cipher: Option<PortalCipher>,
    limits: &TransferLimits,
) {
    let mut buf = vec![0u8; limits.buf_size];

    loop {
        let header = match TransferHeader::read_from(&mut sock) {
            Ok(h) => h,
            Err(st) => {
                task.status = st;
                return;
            }
        };
        if header.opr == opr::DONE {
            return;
        }
        if header.opr != opr::PUT || header.length == 0 {
            task.status = Status::InvalidPortalOpr;
            return;
        }
        if let Err(st) = seek_to(&mut src, header.offset) {
            task.status = st;
            return;
        }

        let mut range_left = header.length;
        while range_left > 0 {
            let this_len = range_left.min(limits.buf_size as u64) as usize;
            if src.read_exact(&mut buf[..this_len]).is_err() {
                task.status = Status::CopyLenErr;
                return;
            }
            match send_buffer(&mut sock, &buf[..this_len], cipher.as_ref()) {
                Ok(n) => {
                    task.bytes_written += n as u64;
                    range_left -= n as u64;
                }
                Err(st) => {
                    task.status = st;
                    return;
                }
            }
        }
    }
}

/// Connecting receiver (client side of a GET): follow headers, writing
/// each range at its announced offset.
pub fn follow_get(
    task: &mut TransferTask,
    mut sock: TcpStream,
    mut dest: File,
    cipher: Option<PortalCipher>,
    limits: &TransferLimits,
) {
    let mut scratch = Vec::with_capacity(limits.buf_size);

    loop {
        let header = match TransferHeader::read_from(&mut sock) {
            Ok(h) => h,
            Err(st) => {
                task.status = st;
                return;
            }
        };
        if header.opr == opr::DONE {
            return;
        }
        if header.opr != opr::GET || header.length == 0 {
            task.status = Status::InvalidPortalOpr;
            return;
        }
        if let Err(st) = seek_to(&mut dest, header.offset) {
            task.status = st;
            return;
        }

        let mut range_left = header.length;
        while range_left > 0 {
            let want = range_left.min(limits.buf_size as u64) as usize;
            let plain = match recv_buffer(&mut sock, want, cipher.as_ref(), &mut scratch, limits) {
                Ok(p) => p,
                Err(st) => {
                    task.status = st;
                    return;
                }
            };
            if plain.is_empty() || plain.len() as u64 > range_left {
                task.status = Status::CopyLenErr;
                return;
            }
            if dest.write_all(&plain).is_err() {
                task.status = Status::CopyLenErr;
                return;
            }
            let n = plain.len() as u64;
            task.bytes_written += n;
            range_left -= n;
        }
    }
}

/// Header-driven socket-to-socket relay: forward each header and its
/// payload verbatim until the DONE header passes through.
pub fn relay(
    task: &mut TransferTask,
    mut from: TcpStream,
    mut to: TcpStream,
    limits: &TransferLimits,
) {
    let mut buf = vec![0u8; limits.buf_size];

    loop {
        let header = match TransferHeader::read_from(&mut from) {
            Ok(h) => h,
            Err(st) => {
                task.status = st;
                return;
            }
        };
        if let Err(st) = header.write_to(&mut to) {
            task.status = st;
            return;
        }
        if header.opr == opr::DONE {
            return;
        }

        let mut range_left = header.length;
        while range_left > 0 {
            let this_len = range_left.min(limits.buf_size as u64) as usize;
            if from.read_exact(&mut buf[..this_len]).is_err() {
                task.status = Status::CopyLenErr;
                return;
            }
            if to.write_all(&buf[..this_len]).is_err() {
                task.status = Status::SockWriteErr;
                return;
            }
            task.bytes_written += this_len as u64;
            range_left -= this_len as u64;
        }
    }
}

/// File-to-file copy for same-host transfers. Same chunk loop and byte
/// accounting as the socket paths, no wire protocol.
pub fn copy_local(
    task: &mut TransferTask,
    mut src: File,
    mut dest: File,
    limits: &TransferLimits,
) {
    if task.offset != 0 {
        if seek_to(&mut src, task.offset).is_err() || seek_to(&mut dest, task.offset).is_err() {
            task.status = Status::SeekErr;
            return;
        }
    }

    let mut remaining = task.size;
    let mut buf = vec![0u8; limits.buf_size];

    while remaining > 0 {
        let this_len = remaining.min(limits.buf_size as u64) as usize;
        if src.read_exact(&mut buf[..this_len]).is_err() {
            task.status = Status::CopyLenErr;
            return;
        }
        if dest.write_all(&buf[..this_len]).is_err() {
            task.status = Status::CopyLenErr;
            return;
        }
        task.bytes_written += this_len as u64;
        remaining -= this_len as u64;
    }
}

const UDP_MAX_ATTEMPTS: u32 = 8;
const UDP_END_SEQ: u32 = u32::MAX;

fn udp_send(sock: &UdpSocket, peer: Option<SocketAddr>, buf: &[u8]) -> Result<(), Status> {
    let sent = match peer {
        Some(addr) => sock.send_to(buf, addr),
        None => sock.send(buf),
    }
    .map_err(|_| Status::SockWriteErr)?;
    if sent != buf.len() {
        return Err(Status::UdpTransferErr);
    }
    Ok(())
}

/// Sequenced block/acknowledge sender over the portal's datagram socket.
/// Stop-and-wait with bounded retransmission; one stream only.
pub fn send_udp(
    task: &mut TransferTask,
    mut src: File,
    sock: &UdpSocket,
    peer: Option<SocketAddr>,
) {
    if task.offset != 0 {
        if let Err(st) = seek_to(&mut src, task.offset) {
            task.status = st;
            return;
        }
    }
    if sock.set_read_timeout(Some(timeouts::UDP_ACK)).is_err() {
        task.status = Status::UdpTransferErr;
        return;
    }

    let mut remaining = task.size;
    let mut seq: u32 = 0;
    let mut dgram = vec![0u8; 4 + UDP_BLOCK_SIZE];
    let mut ack = [0u8; 4];

    while remaining > 0 {
        let this_len = remaining.min(UDP_BLOCK_SIZE as u64) as usize;
        dgram[0..4].copy_from_slice(&seq.to_be_bytes());
        if src.read_exact(&mut dgram[4..4 + this_len]).is_err() {
            task.status = Status::CopyLenErr;
            return;
        }

        let mut acked = false;
        for _ in 0..UDP_MAX_ATTEMPTS {
            if udp_send(sock, peer, &dgram[..4 + this_len]).is_err() {
                continue;
            }
            match sock.recv(&mut ack) {
                Ok(4) if u32::from_be_bytes(ack) == seq => {
                    acked = true;
                    break;
                }
                // stale or short ack: resend
                _ => continue,
            }
        }
        if !acked {
            warn!(seq, "datagram block exhausted retransmissions");
            task.status = Status::UdpTransferErr;
            return;
        }

        task.bytes_written += this_len as u64;
        remaining -= this_len as u64;
        seq += 1;
    }

    // end marker is best effort; the receiver already knows the size
    let end = UDP_END_SEQ.to_be_bytes();
    let _ = udp_send(sock, peer, &end);
}

/// Receiving half of the datagram path: acknowledge every block, ignore
/// out-of-order arrivals, re-acknowledge duplicates. Only datagrams from
/// the admitted peer count; anything else is dropped unacknowledged.
pub fn recv_udp(task: &mut TransferTask, sock: &UdpSocket, peer: SocketAddr, mut dest: File) {
    if task.offset != 0 {
        if let Err(st) = seek_to(&mut dest, task.offset) {
            task.status = st;
            return;
        }
    }
    if sock
        .set_read_timeout(Some(timeouts::UDP_ACK * UDP_MAX_ATTEMPTS))
        .is_err()
    {
        task.status = Status::UdpTransferErr;
        return;
    }

    let mut remaining = task.size;
    let mut expected: u32 = 0;
    let mut dgram = vec![0u8; 4 + UDP_BLOCK_SIZE];

    while remaining > 0 {
        let (n, from) = match sock.recv_from(&mut dgram) {
            Ok(v) => v,
            Err(_) => {
                task.status = Status::UdpTransferErr;
                return;
            }
        };
        if from != peer || n < 4 {
            continue;
        }
        let seq = u32::from_be_bytes(dgram[0..4].try_into().unwrap());
        if seq == UDP_END_SEQ {
            continue;
        }
        if seq > expected {
            // ahead of us; drop and let the sender retransmit
            continue;
        }
        let _ = sock.send_to(&seq.to_be_bytes(), from);
        if seq < expected {
            continue; // duplicate of an already written block
        }

        let payload = &dgram[4..n];
        let this_len = payload.len().min(remaining as usize);
        if dest.write_all(&payload[..this_len]).is_err() {
            task.status = Status::CopyLenErr;
            return;
        }
        task.bytes_written += this_len as u64;
        remaining -= this_len as u64;
        expected += 1;
    }
}
