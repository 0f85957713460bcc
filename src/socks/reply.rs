//! SOCKS5 reply builder
//!
//! Constructs the wire frames the server sends: method selection,
//! authentication result, and command replies.
//!
//! # SOCKS5 Reply Format
//!
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```

use super::consts::*;
use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Server-side bound address echoed in a success reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    /// IPv4 address and port
    V4(Ipv4Addr, u16),
    /// IPv6 address and port
    V6(Ipv6Addr, u16),
    /// Domain name and port, echoed back for domain requests
    Domain(String, u16),
}

impl From<SocketAddr> for BoundAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => BoundAddr::V4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => BoundAddr::V6(*v6.ip(), v6.port()),
        }
    }
}

/// Method selection frame: `{0x05, method}`.
pub fn method_selection(method: u8) -> Bytes {
    Bytes::from(vec![SOCKS5_VERSION, method])
}

/// Username/password sub-negotiation result: `{0x01, status}`.
pub fn auth_result(status: u8) -> Bytes {
    Bytes::from(vec![SOCKS5_AUTH_VERSION, status])
}

/// Unified reject frame: command-not-supported with a zero IPv4 bind address.
pub fn general_failure() -> Bytes {
    Bytes::from(vec![
        SOCKS5_VERSION,
        SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
        SOCKS5_RESERVED,
        SOCKS5_ADDR_TYPE_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ])
}

/// Success reply with the bound address in its own family.
pub fn success(bnd: &BoundAddr) -> Bytes {
    let mut frame = vec![SOCKS5_VERSION, SOCKS5_REPLY_SUCCEEDED, SOCKS5_RESERVED];
    match bnd {
        BoundAddr::V4(ip, port) => {
            frame.push(SOCKS5_ADDR_TYPE_IPV4);
            frame.extend_from_slice(&ip.octets());
            frame.extend_from_slice(&port.to_be_bytes());
        }
        BoundAddr::V6(ip, port) => {
            frame.push(SOCKS5_ADDR_TYPE_IPV6);
            frame.extend_from_slice(&ip.octets());
            frame.extend_from_slice(&port.to_be_bytes());
        }
        BoundAddr::Domain(name, port) => {
            frame.push(SOCKS5_ADDR_TYPE_DOMAIN);
            frame.push(name.len().min(MAX_DOMAIN_LEN) as u8);
            frame.extend_from_slice(&name.as_bytes()[..name.len().min(MAX_DOMAIN_LEN)]);
            frame.extend_from_slice(&port.to_be_bytes());
        }
    }
    Bytes::from(frame)
}
