//! Agent session: owns the handed-off client connection, answers
//! transfer requests by opening a portal and reporting the outcome.
//!
//! Every request is answered twice: first an advertisement (or a setup
//! error) so the client can dial the portal, then a result frame once
//! the workers have been joined.

use std::net::TcpStream;
use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::crypt::{decode_hex, EncryptSpec};
use crate::factory::AgentBootstrap;
use crate::portal::{choose_threads, Portal, PortalAd, PortalOp};
use crate::protocol::{opr, TAG_PORTAL_AD, TAG_REQUEST, TAG_RESULT};
use crate::startup::{read_tagged, send_version_reply, write_tagged};
use crate::status::Status;
use crate::transfer::TransferLimits;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub op: i32,
    pub path: String,
    pub size: u64,
    pub offset: u64,
    pub num_threads: u32,
    pub flags: u32,
    pub use_udp: bool,
    pub encrypt: Option<EncryptSpec>,
}

/// Portal advertisement or the reason there is none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdReply {
    pub status: i32,
    pub ad: Option<PortalAd>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransferResult {
    pub status: i32,
    pub bytes: u64,
}

pub fn send_request(stream: &mut TcpStream, req: &AgentRequest) -> Result<(), Status> {
    let body = bincode::serialize(req).map_err(|_| Status::BadMsgType)?;
    write_tagged(stream, TAG_REQUEST, &body)
}

pub fn read_ad_reply(stream: &mut TcpStream) -> Result<AdReply, Status> {
    let body = read_tagged(stream, TAG_PORTAL_AD)?;
    bincode::deserialize(&body).map_err(|_| Status::BadMsgType)
}

pub fn read_result(stream: &mut TcpStream) -> Result<TransferResult, Status> {
    let body = read_tagged(stream, TAG_RESULT)?;
    bincode::deserialize(&body).map_err(|_| Status::BadMsgType)
}

/// Session entry point for the forked agent. Takes ownership of the
/// descriptor and serves requests until the client hangs up.
pub fn run(fd: RawFd, boot: &AgentBootstrap, cfg: &ServerConfig) -> Result<(), Status> {
    let mut stream = unsafe { TcpStream::from_raw_fd(fd) };
    info!(
        proxy_user = %boot.proxy_user,
        client_user = %boot.client_user,
        "agent session started"
    );
    // first thing the client sees after the handoff
    send_version_reply(&mut stream, Status::Ok)?;

    loop {
        let body = match read_tagged(&mut stream, TAG_REQUEST) {
            Ok(b) => b,
            // client closed the session
            Err(Status::SockReadErr) => return Ok(()),
            Err(st) => return Err(st),
        };
        let req: AgentRequest = match bincode::deserialize(&body) {
            Ok(r) => r,
            Err(_) => {
                reply_setup_error(&mut stream, Status::BadMsgType)?;
                continue;
            }
        };
        handle_request(&mut stream, &req, boot, cfg)?;
    }
}

fn reply_setup_error(stream: &mut TcpStream, status: Status) -> Result<(), Status> {
    let reply = AdReply {
        status: status.code(),
        ad: None,
    };
    let body = bincode::serialize(&reply).map_err(|_| Status::BadMsgType)?;
    write_tagged(stream, TAG_PORTAL_AD, &body)
}

fn handle_request(
    stream: &mut TcpStream,
    req: &AgentRequest,
    boot: &AgentBootstrap,
    cfg: &ServerConfig,
) -> Result<(), Status> {
    let op = match req.op {
        x if x == opr::PUT => PortalOp::Put,
        x if x == opr::GET => PortalOp::Get,
        other => {
            warn!(op = other, "unsupported portal operation requested");
            return reply_setup_error(stream, Status::InvalidPortalOpr);
        }
    };

    let encrypt = match &req.encrypt {
        Some(spec) => match decode_hex(&boot.shared_secret_hex) {
            Some(secret) if !secret.is_empty() => Some((spec.clone(), secret)),
            _ => return reply_setup_error(stream, Status::DecryptErr),
        },
        None => None,
    };

    let threads = choose_threads(
        req.num_threads as usize,
        req.size,
        cfg.max_transfer_threads,
        req.flags,
        req.use_udp,
    );
    let host = stream
        .local_addr()
        .map_err(|_| Status::SockConnectErr)?
        .ip()
        .to_string();

    let portal = match Portal::setup(&host, &cfg.port_range(), threads, cfg.window_size, req.use_udp)
    {
        Ok(p) => p,
        Err(st) => return reply_setup_error(stream, st),
    };
    let ad = match portal.ad() {
        Ok(ad) => ad,
        Err(st) => return reply_setup_error(stream, st),
    };
    let reply = AdReply {
        status: 0,
        ad: Some(ad),
    };
    let body = bincode::serialize(&reply).map_err(|_| Status::BadMsgType)?;
    write_tagged(stream, TAG_PORTAL_AD, &body)?;

    let limits = TransferLimits {
        chunk_size: cfg.chunk_size,
        buf_size: cfg.buf_size,
    };
    let outcome = portal.run(
        op,
        Path::new(&req.path),
        req.size,
        req.offset,
        req.flags,
        encrypt,
        limits,
    );
    debug!(status = %outcome.status, bytes = outcome.bytes, "transfer finished");

    let result = TransferResult {
        status: outcome.status.code(),
        bytes: outcome.bytes,
    };
    let body = bincode::serialize(&result).map_err(|_| Status::BadMsgType)?;
    write_tagged(stream, TAG_RESULT, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::IntoRawFd;
    use std::thread;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn request_frames_round_trip() {
        let (mut a, mut b) = tcp_pair();
        let req = AgentRequest {
            op: opr::GET,
            path: "/data/obj".to_string(),
            size: 1 << 20,
            offset: 4096,
            num_threads: 4,
            flags: 0,
            use_udp: false,
            encrypt: Some(EncryptSpec::default()),
        };
        send_request(&mut a, &req).unwrap();

        let body = read_tagged(&mut b, TAG_REQUEST).unwrap();
        let back: AgentRequest = bincode::deserialize(&body).unwrap();
        assert_eq!(back.path, "/data/obj");
        assert_eq!(back.num_threads, 4);
        assert!(back.encrypt.is_some());
    }

    #[test]
    fn bad_operation_answered_with_setup_error() {
        let (server, mut client) = tcp_pair();
        let cfg = ServerConfig::default();
        let boot = AgentBootstrap {
            proxy_user: "rods".to_string(),
            client_user: "alice".to_string(),
            ..AgentBootstrap::default()
        };

        let session = thread::spawn(move || run(server.into_raw_fd(), &boot, &cfg));
        let hello = crate::startup::read_version_reply(&mut client).unwrap();
        assert_eq!(hello.status, Status::Ok.code());

        let req = AgentRequest {
            op: 42,
            path: "/nope".to_string(),
            size: 0,
            offset: 0,
            num_threads: 1,
            flags: 0,
            use_udp: false,
            encrypt: None,
        };
        send_request(&mut client, &req).unwrap();
        let reply = read_ad_reply(&mut client).unwrap();
        assert_eq!(reply.status, Status::InvalidPortalOpr.code());
        assert!(reply.ad.is_none());

        drop(client);
        assert!(session.join().unwrap().is_ok());
    }

    #[test]
    fn encrypted_request_without_secret_is_refused() {
        let (server, mut client) = tcp_pair();
        let cfg = ServerConfig::default();
        let boot = AgentBootstrap {
            proxy_user: "rods".to_string(),
            client_user: "alice".to_string(),
            ..AgentBootstrap::default()
        };

        let session = thread::spawn(move || run(server.into_raw_fd(), &boot, &cfg));
        let hello = crate::startup::read_version_reply(&mut client).unwrap();
        assert_eq!(hello.status, Status::Ok.code());

        let req = AgentRequest {
            op: opr::GET,
            path: "/data/obj".to_string(),
            size: 100,
            offset: 0,
            num_threads: 1,
            flags: 0,
            use_udp: false,
            encrypt: Some(EncryptSpec::default()),
        };
        send_request(&mut client, &req).unwrap();
        let reply = read_ad_reply(&mut client).unwrap();
        assert_eq!(reply.status, Status::DecryptErr.code());

        drop(client);
        assert!(session.join().unwrap().is_ok());
    }
}
