//! Shared wire constants for the gangway control and portal protocols

// Envelope type tags (4 bytes on the wire, ahead of a bincode body)
pub const TAG_CONNECT: &[u8; 4] = b"GWCN";
pub const TAG_VERSION: &[u8; 4] = b"GWVR";
pub const TAG_REQUEST: &[u8; 4] = b"GWRQ";
pub const TAG_PORTAL_AD: &[u8; 4] = b"GWPA";
pub const TAG_RESULT: &[u8; 4] = b"GWRS";

// Maximum serialized startup-pack body. Declared lengths above twice this
// are treated as garbage input, not a large message.
pub const MAX_STARTUP_PACK_SIZE: usize = 4096;

// Startup option literal answered in place of spawning an agent
pub const HEARTBEAT_LITERAL: &str = "HEARTBEAT";

// Option substring requesting server-side negotiation; stripped from the
// option string and forwarded as its own handoff record
pub const REQ_SVR_NEG: &str = "request_server_negotiation";

// Handoff channel sentinels
pub const ACK_OK: &str = "OK";
pub const END_OF_VARS: &str = "end_of_vars";
pub const CONNECTION_SUCCESSFUL: &str = "connection_successful";
pub const SPAWN_FAILURE: &str = "spawn_failure";

// Transfer header operation codes
pub mod opr {
    pub const PUT: i32 = 1;
    pub const GET: i32 = 2;
    pub const DONE: i32 = 9;
}

// Transfer flag bits
pub mod flags {
    /// Send the whole remaining range under a single header
    pub const STREAMING: u32 = 0x1;
    /// Suppress the aggregate size reconciliation (size unknown up front)
    pub const SKIP_LEN_CHECK: u32 = 0x2;
}

// On-wire chunk ceiling between transfer headers
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;
// Intermediate copy buffer bound
pub const DEFAULT_BUF_SIZE: usize = 4 * 1024 * 1024;
// Hard cap on portal transfer threads regardless of request
pub const MAX_PORTAL_THREADS: usize = 16;
// Payload bytes per reliable-UDP datagram
pub const UDP_BLOCK_SIZE: usize = 8192;

// Centralized timeout constants
pub mod timeouts {
    use std::time::Duration;

    /// Accept-loop poll interval; housekeeping runs on expiry
    pub const ACCEPT_POLL_MS: u16 = 500;

    /// Bounded read of the startup envelope off a fresh connection
    pub const READ_STARTUP_PACK: Duration = Duration::from_secs(5);

    /// Per-stream portal accept wait
    pub const PORTAL_ACCEPT: Duration = Duration::from_secs(60);

    /// Handoff control-channel connect deadline at boot
    pub const FACTORY_CONNECT: Duration = Duration::from_secs(5);

    /// Graceful-shutdown reap deadline before SIGTERM broadcast
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

    /// Cadence for draining the bad-request queue
    pub const BAD_REQ_DRAIN: Duration = Duration::from_secs(60);

    /// Reliable-UDP ack wait before a block is retransmitted
    pub const UDP_ACK: Duration = Duration::from_millis(500);
}

/// Fold a TCP and an optional UDP port into one field: TCP in the low
/// 16 bits, UDP in the high 16.
pub fn pack_ports(tcp: u16, udp: Option<u16>) -> u32 {
    (u32::from(udp.unwrap_or(0)) << 16) | u32::from(tcp)
}

pub fn tcp_port(packed: u32) -> u16 {
    (packed & 0xffff) as u16
}

pub fn udp_port(packed: u32) -> Option<u16> {
    match (packed >> 16) as u16 {
        0 => None,
        p => Some(p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_ports_round_trip() {
        let packed = pack_ports(20199, Some(20200));
        assert_eq!(tcp_port(packed), 20199);
        assert_eq!(udp_port(packed), Some(20200));

        let tcp_only = pack_ports(9031, None);
        assert_eq!(tcp_port(tcp_only), 9031);
        assert_eq!(udp_port(tcp_only), None);
    }

    #[test]
    fn packed_ports_extremes() {
        let packed = pack_ports(u16::MAX, Some(u16::MAX));
        assert_eq!(tcp_port(packed), u16::MAX);
        assert_eq!(udp_port(packed), Some(u16::MAX));
    }
}
