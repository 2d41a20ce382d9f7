//! Binary frame codec for the tunnel protocol.
//!
//! Every WebSocket message on a tunnel is one frame: a one-byte command code
//! optionally followed by a request header (`idx`, `tag`, both `u16` LE) and
//! a command-specific body. See the wire table in the module's parent docs.

use bytes::{Buf, BufMut, BytesMut};

/// Request-range commands are dispatched through the `RequestTable`; the
/// others are tunnel-level control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Ping,
    Pong,
    ReqData,
    ReqCreated,
    ReqClientClosed,
    ReqClientFinished,
    ReqServerFinished,
    ReqServerClosed,
    ReqRefreshQuota,
}

impl Command {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Command::None,
            1 => Command::Ping,
            2 => Command::Pong,
            3 => Command::ReqData,
            4 => Command::ReqCreated,
            5 => Command::ReqClientClosed,
            6 => Command::ReqClientFinished,
            7 => Command::ReqServerFinished,
            8 => Command::ReqServerClosed,
            9 => Command::ReqRefreshQuota,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Command::None => 0,
            Command::Ping => 1,
            Command::Pong => 2,
            Command::ReqData => 3,
            Command::ReqCreated => 4,
            Command::ReqClientClosed => 5,
            Command::ReqClientFinished => 6,
            Command::ReqServerFinished => 7,
            Command::ReqServerClosed => 8,
            Command::ReqRefreshQuota => 9,
        }
    }

    /// Commands 3..=9 are addressed to a request slot.
    pub fn is_request_range(self) -> bool {
        matches!(self.to_u8(), 3..=9)
    }
}

/// A decoded request-range header: command plus the slot address it targets.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub cmd: Command,
    pub idx: u16,
    pub tag: u16,
}

/// Parses the leading `cmd:u8, idx:u16 LE, tag:u16 LE` of a request-range
/// frame. Returns the header and the remaining payload slice. Returns `None`
/// if the message is shorter than 5 bytes or `cmd` isn't a request-range
/// command.
pub fn parse_request_header(msg: &[u8]) -> Option<(RequestHeader, &[u8])> {
    if msg.len() < 5 {
        return None;
    }
    let cmd = Command::from_u8(msg[0])?;
    if !cmd.is_request_range() {
        return None;
    }
    let idx = u16::from_le_bytes([msg[1], msg[2]]);
    let tag = u16::from_le_bytes([msg[3], msg[4]]);
    Some((RequestHeader { cmd, idx, tag }, &msg[5..]))
}

/// Encodes `cmd:u8, idx:u16 LE, tag:u16 LE [, payload]`.
pub fn encode_request_frame(cmd: Command, idx: u16, tag: u16, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(cmd.to_u8());
    buf.put_u16_le(idx);
    buf.put_u16_le(tag);
    buf.put_slice(payload);
    buf
}

/// Encodes a `Ping` control frame: `cmd:u8, timestamp_ms:f64 LE`.
pub fn encode_ping(now_ms: f64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(Command::Ping.to_u8());
    buf.put_f64_le(now_ms);
    buf
}

/// Encodes a `Pong` by copying a received `Ping` (or any body of the same
/// shape) and rewriting byte 0 to the `Pong` command. A `Pong` body is a
/// byte-for-byte copy of the triggering `Ping` except for the rewritten
/// command byte.
pub fn encode_pong_from(ping_body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::from(ping_body);
    if !buf.is_empty() {
        buf[0] = Command::Pong.to_u8();
    }
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrType {
    Ipv4,
    Domain,
    Ipv6,
}

impl AddrType {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => AddrType::Ipv4,
            1 => AddrType::Domain,
            2 => AddrType::Ipv6,
            _ => return None,
        })
    }
}

/// Parses the address block that follows the `idx, tag` pair of a
/// `ReqCreated` frame and returns the `"<addr>:<port>"` connect target.
///
/// Byte-reversal of IPv4 octets and u16 groups of IPv6 is deliberate wire
/// compatibility with the existing peer and must be preserved exactly,
/// bug-for-bug-compatible-looking as it is.
pub fn parse_addr_block(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let addr_type = AddrType::from_u8(body[0])?;
    let mut rest = &body[1..];
    match addr_type {
        AddrType::Ipv4 => {
            if rest.len() < 6 {
                return None;
            }
            let b = &rest[..4];
            let port = u16::from_le_bytes([rest[4], rest[5]]);
            Some(format!("{}.{}.{}.{}:{}", b[3], b[2], b[1], b[0], port))
        }
        AddrType::Domain => {
            if rest.is_empty() {
                return None;
            }
            let len = rest[0] as usize;
            rest = &rest[1..];
            if rest.len() < len + 2 {
                return None;
            }
            let host = std::str::from_utf8(&rest[..len]).ok()?;
            let port = u16::from_le_bytes([rest[len], rest[len + 1]]);
            Some(format!("{host}:{port}"))
        }
        AddrType::Ipv6 => {
            if rest.len() < 18 {
                return None;
            }
            let mut groups = [0u16; 8];
            let mut cursor = rest;
            for g in groups.iter_mut() {
                *g = cursor.get_u16_le();
            }
            let port = cursor.get_u16_le();
            let text = groups
                .iter()
                .rev()
                .map(|g| format!("{g:x}"))
                .collect::<Vec<_>>()
                .join(":");
            Some(format!("{text}:{port}"))
        }
    }
}
