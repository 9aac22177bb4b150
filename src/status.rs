//! Named status codes carried across thread joins and on the wire.
//!
//! Low-level I/O failures are converted into one of these at the boundary
//! and returned up the call chain; version replies carry the raw `i32`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    /// Startup envelope declared an implausible or zero length
    HeaderLenErr = -4000,
    /// Envelope type tag did not match the expected message type
    BadMsgType = -4010,
    /// Agent count at the configured ceiling
    ExceedMaxConnections = -4020,
    /// Server-to-server re-entrant connect count over the limit
    ExceedConnectCnt = -4030,
    SockReadErr = -4100,
    SockWriteErr = -4110,
    SockSelectErr = -4120,
    SockAcceptErr = -4130,
    SockConnectErr = -4140,
    /// Portal stream presented the wrong cookie
    PortCookieErr = -4200,
    /// Thread count or operation type invalid for the portal
    InvalidPortalOpr = -4210,
    /// Reliable-UDP block exhausted its retransmissions
    UdpTransferErr = -4220,
    /// Byte count moved does not match the byte count declared
    CopyLenErr = -4300,
    SeekErr = -4310,
    DecryptErr = -4320,
    FileOpenErr = -4330,
    /// Agent factory reported or implied a failed spawn
    SpawnErr = -4400,
    ThreadResourceErr = -4410,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Status> {
        use Status::*;
        let all = [
            Ok, HeaderLenErr, BadMsgType, ExceedMaxConnections, ExceedConnectCnt, SockReadErr,
            SockWriteErr, SockSelectErr, SockAcceptErr, SockConnectErr, PortCookieErr,
            InvalidPortalOpr, UdpTransferErr, CopyLenErr, SeekErr, DecryptErr, FileOpenErr,
            SpawnErr, ThreadResourceErr,
        ];
        all.into_iter().find(|s| s.code() == code)
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for status in [
            Status::Ok,
            Status::HeaderLenErr,
            Status::ExceedMaxConnections,
            Status::PortCookieErr,
            Status::CopyLenErr,
            Status::SpawnErr,
        ] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(12345), None);
    }

    #[test]
    fn ok_is_zero() {
        assert_eq!(Status::Ok.code(), 0);
        assert!(Status::Ok.is_ok());
        assert!(!Status::CopyLenErr.is_ok());
    }
}
