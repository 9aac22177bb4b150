//! Startup envelope: the first message off every accepted connection.
//!
//! Wire shape: 4-byte big-endian envelope length, 4-byte type tag,
//! 4-byte big-endian body length, then the serialized body. Declared
//! lengths outside a sanity bound are rejected outright rather than read.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::protocol::{MAX_STARTUP_PACK_SIZE, TAG_CONNECT, TAG_VERSION};
use crate::status::Status;

pub const REL_VERSION: &str = "gangway0.3";
pub const API_VERSION: &str = "g1";

/// Parsed startup metadata for one not-yet-started client session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartupPack {
    pub protocol_version: u32,
    pub reconn_flag: u32,
    /// Server-to-server re-entrant connection depth
    pub connect_cnt: u32,
    pub proxy_user: String,
    pub proxy_zone: String,
    pub client_user: String,
    pub client_zone: String,
    pub rel_version: String,
    pub api_version: String,
    /// Requested negotiation option string
    pub option: String,
    /// Client-minted session secret, hex-encoded; forwarded to the
    /// agent so both ends can key the portal cipher
    pub session_token: String,
}

/// Reply sent before closing a rejected connection; also the success
/// acknowledgement an accepted client sees.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionReply {
    pub status: i32,
    pub rel_version: String,
    pub api_version: String,
}

fn write_envelope(w: &mut impl Write, tag: &[u8; 4], body: &[u8]) -> Result<(), Status> {
    let env_len = (4 + 4 + body.len()) as u32;
    let mut head = Vec::with_capacity(12);
    head.extend_from_slice(&env_len.to_be_bytes());
    head.extend_from_slice(tag);
    head.extend_from_slice(&(body.len() as u32).to_be_bytes());
    w.write_all(&head).map_err(|_| Status::SockWriteErr)?;
    w.write_all(body).map_err(|_| Status::SockWriteErr)?;
    w.flush().map_err(|_| Status::SockWriteErr)?;
    Ok(())
}

/// Read one envelope, enforcing the expected tag and the length sanity
/// bound (non-zero, at most twice the maximum struct size).
fn read_envelope(r: &mut impl Read, expect_tag: &[u8; 4]) -> Result<Vec<u8>, Status> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).map_err(|_| Status::SockReadErr)?;
    let env_len = u32::from_be_bytes(len_buf) as usize;
    if env_len < 8 || env_len > 2 * MAX_STARTUP_PACK_SIZE + 8 {
        return Err(Status::HeaderLenErr);
    }

    let mut tag = [0u8; 4];
    r.read_exact(&mut tag).map_err(|_| Status::SockReadErr)?;
    if &tag != expect_tag {
        return Err(Status::BadMsgType);
    }

    let mut body_len_buf = [0u8; 4];
    r.read_exact(&mut body_len_buf)
        .map_err(|_| Status::SockReadErr)?;
    let body_len = u32::from_be_bytes(body_len_buf) as usize;
    if body_len == 0 || body_len > 2 * MAX_STARTUP_PACK_SIZE || body_len != env_len - 8 {
        return Err(Status::HeaderLenErr);
    }

    let mut body = vec![0u8; body_len];
    r.read_exact(&mut body).map_err(|_| Status::SockReadErr)?;
    Ok(body)
}

pub fn write_startup_pack(w: &mut impl Write, pack: &StartupPack) -> Result<(), Status> {
    let body = bincode::serialize(pack).map_err(|_| Status::SockWriteErr)?;
    write_envelope(w, TAG_CONNECT, &body)
}

pub fn read_startup_pack(r: &mut impl Read) -> Result<StartupPack, Status> {
    let body = read_envelope(r, TAG_CONNECT)?;
    bincode::deserialize(&body).map_err(|_| Status::HeaderLenErr)
}

pub fn send_version_reply(w: &mut impl Write, status: Status) -> Result<(), Status> {
    let reply = VersionReply {
        status: status.code(),
        rel_version: REL_VERSION.to_string(),
        api_version: API_VERSION.to_string(),
    };
    let body = bincode::serialize(&reply).map_err(|_| Status::SockWriteErr)?;
    write_envelope(w, TAG_VERSION, &body)
}

pub fn read_version_reply(r: &mut impl Read) -> Result<VersionReply, Status> {
    let body = read_envelope(r, TAG_VERSION)?;
    bincode::deserialize(&body).map_err(|_| Status::HeaderLenErr)
}

/// Generic envelope helpers reused by the agent request protocol.
pub fn write_tagged(w: &mut impl Write, tag: &'static [u8; 4], body: &[u8]) -> Result<(), Status> {
    write_envelope(w, tag, body)
}

pub fn read_tagged(r: &mut impl Read, tag: &'static [u8; 4]) -> Result<Vec<u8>, Status> {
    read_envelope(r, tag)
}
