//! Per-connection SOCKS5 state machine
//!
//! Consumes the client byte stream incrementally and drives the protocol
//! through method negotiation, the optional username/password
//! sub-negotiation, request parsing, and the established relay state.
//! The machine performs no I/O itself; it returns [`Action`]s for the
//! connection driver to apply, and the driver feeds the outcome of the
//! one asynchronous step (name resolution) back in through
//! [`SocksMachine::resolve_succeeded`] / [`SocksMachine::resolve_failed`].
//!
//! Each `on_bytes` call processes as many state transitions as the
//! buffered bytes allow. The loop stops once the state no longer changes,
//! the buffer is empty, or the connection is established or closed, so
//! bytes are consumed exactly once regardless of how the stream is
//! chunked.

use super::addr::{self, AddrClass};
use super::auth::AuthPolicy;
use super::consts::*;
use super::reply::{self, BoundAddr};
use super::types::{SocksCommand, TargetAddr};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Protocol state of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the method negotiation header
    WaitRequest,
    /// Waiting for the username/password sub-negotiation
    WaitValidate,
    /// Waiting for the SOCKS5 command request
    WaitCommand,
    /// Relaying bytes to the tunnel peer
    Established,
}

/// Side effect for the connection driver to apply, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send these bytes to the client
    Reply(Bytes),
    /// Close the write half; the peer finishes the teardown
    Shutdown,
    /// Drop the connection immediately
    ForceClose,
    /// CONNECT accepted: resolve this target, then report back
    Resolve(TargetAddr),
    /// Established payload to forward into the tunnel
    Forward(Bytes),
}

/// Per-connection protocol settings.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Authentication policy for the negotiation and sub-negotiation
    pub auth: AuthPolicy,
    /// Reject targets in private ranges
    pub skip_local: bool,
    /// Advertised UDP association address, if the relay is enabled
    pub association_addr: Option<SocketAddr>,
}

/// What the success reply must echo once the pending CONNECT resolves.
#[derive(Debug)]
enum PendingReply {
    /// Mirror the resolved address in its own family
    Mirror,
    /// Echo the requested domain name and port
    Domain(String, u16),
}

#[derive(Debug)]
struct PendingConnect {
    /// Exact request bytes to consume once the reply is emitted
    consume_len: usize,
    reply: PendingReply,
}

/// Byte-consuming SOCKS5 state machine for a single connection.
#[derive(Debug)]
pub struct SocksMachine {
    state: ConnState,
    cfg: MachineConfig,
    pending: Option<PendingConnect>,
    closed: bool,
}

impl SocksMachine {
    /// Create a machine in the initial `WaitRequest` state.
    pub fn new(cfg: MachineConfig) -> Self {
        SocksMachine {
            state: ConnState::WaitRequest,
            cfg,
            pending: None,
            closed: false,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Whether the machine has requested the connection be torn down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a CONNECT is waiting on name resolution.
    pub fn is_resolving(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed newly arrived bytes and collect the resulting actions.
    pub fn on_bytes(&mut self, buf: &mut BytesMut) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.closed {
            buf.clear();
            return actions;
        }
        loop {
            let before = self.state;
            match self.state {
                ConnState::WaitRequest => self.wait_request(buf, &mut actions),
                ConnState::WaitValidate => self.wait_validate(buf, &mut actions),
                ConnState::WaitCommand => self.wait_command(buf, &mut actions),
                ConnState::Established => {
                    if !buf.is_empty() {
                        actions.push(Action::Forward(buf.split().freeze()));
                    }
                    break;
                }
            }
            if self.closed || self.pending.is_some() {
                break;
            }
            if self.state == before || buf.is_empty() {
                break;
            }
        }
        actions
    }

    /// Resolution of the pending CONNECT succeeded.
    ///
    /// Re-checks the private-range rule against the resolved address,
    /// consumes the request bytes, emits the success reply and switches to
    /// `Established`. Residual bytes are forwarded immediately.
    pub fn resolve_succeeded(&mut self, resolved: SocketAddr, buf: &mut BytesMut) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(pending) = self.pending.take() else {
            return actions;
        };
        if self.cfg.skip_local && addr::is_private(resolved.ip()) {
            warn!("CONNECT resolved to private address {}", resolved);
            self.reject(buf, &mut actions);
            return actions;
        }
        let bnd = match pending.reply {
            PendingReply::Mirror => BoundAddr::from(resolved),
            PendingReply::Domain(name, port) => BoundAddr::Domain(name, port),
        };
        buf.advance(pending.consume_len);
        self.state = ConnState::Established;
        actions.push(Action::Reply(reply::success(&bnd)));
        if !buf.is_empty() {
            actions.push(Action::Forward(buf.split().freeze()));
        }
        actions
    }

    /// Resolution of the pending CONNECT failed or timed out.
    pub fn resolve_failed(&mut self, buf: &mut BytesMut) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.pending.take().is_some() {
            self.reject(buf, &mut actions);
        }
        actions
    }

    /// Unified reject: command-not-supported reply, drain, stay open.
    fn reject(&mut self, buf: &mut BytesMut, out: &mut Vec<Action>) {
        out.push(Action::Reply(reply::general_failure()));
        buf.clear();
    }

    fn wait_request(&mut self, buf: &mut BytesMut, out: &mut Vec<Action>) {
        if buf.len() < 2 {
            return;
        }
        let ver = buf[0];
        let nmethods = buf[1] as usize;
        if ver != SOCKS5_VERSION {
            warn!("invalid VER {:#04x} in method negotiation", ver);
            buf.clear();
            out.push(Action::Shutdown);
            self.closed = true;
            return;
        }
        if buf.len() < 2 + nmethods {
            return;
        }
        let offered = buf[2..2 + nmethods].to_vec();
        buf.advance(2 + nmethods);

        let wanted = self.cfg.auth.required_method();
        if offered.contains(&wanted) {
            out.push(Action::Reply(reply::method_selection(wanted)));
            self.state = if wanted == SOCKS5_AUTH_METHOD_NONE {
                ConnState::WaitCommand
            } else {
                ConnState::WaitValidate
            };
        } else {
            debug!("no acceptable method in {:?}", offered);
            out.push(Action::Reply(reply::method_selection(
                SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
            )));
            buf.clear();
            out.push(Action::ForceClose);
            self.closed = true;
        }
    }

    fn wait_validate(&mut self, buf: &mut BytesMut, out: &mut Vec<Action>) {
        if buf.len() < 2 {
            return;
        }
        let ulen = buf[1] as usize;
        if buf.len() < 2 + ulen + 1 {
            return;
        }
        let plen = buf[2 + ulen] as usize;
        if buf.len() < 2 + ulen + 1 + plen {
            return;
        }
        let username = buf[2..2 + ulen].to_vec();
        let password = buf[2 + ulen + 1..2 + ulen + 1 + plen].to_vec();
        buf.advance(2 + ulen + 1 + plen);

        if self.cfg.auth.verify(&username, &password) {
            debug!("authenticated user {}", String::from_utf8_lossy(&username));
            out.push(Action::Reply(reply::auth_result(SOCKS5_AUTH_SUCCESS)));
            self.state = ConnState::WaitCommand;
        } else {
            warn!(
                "authentication failed for user {}",
                String::from_utf8_lossy(&username)
            );
            out.push(Action::Reply(reply::auth_result(SOCKS5_AUTH_FAILURE)));
            buf.clear();
            out.push(Action::ForceClose);
            self.closed = true;
        }
    }

    fn wait_command(&mut self, buf: &mut BytesMut, out: &mut Vec<Action>) {
        if self.pending.is_some() {
            return;
        }
        if buf.len() < 4 {
            return;
        }
        let ver = buf[0];
        let cmd = buf[1];
        if ver != SOCKS5_VERSION {
            warn!("invalid VER {:#04x} in command", ver);
            buf.clear();
            out.push(Action::Shutdown);
            self.closed = true;
            return;
        }
        match SocksCommand::from_byte(cmd) {
            Some(SocksCommand::Connect) => self.command_connect(buf, out),
            Some(SocksCommand::Bind) => {
                warn!("BIND not supported");
                self.reject(buf, out);
            }
            Some(SocksCommand::UdpAssociate) => self.command_udp_associate(buf, out),
            None => {
                warn!("unknown CMD {:#04x}", cmd);
                self.reject(buf, out);
            }
        }
    }

    fn command_connect(&mut self, buf: &mut BytesMut, out: &mut Vec<Action>) {
        let class = addr::classify(buf);
        match class {
            AddrClass::Incomplete => {}
            AddrClass::Invalid => {
                warn!("CONNECT with invalid ATYP");
                self.reject(buf, out);
            }
            _ => {
                let target = match addr::parse_target(class, buf) {
                    Some(target) => target,
                    None => {
                        self.reject(buf, out);
                        return;
                    }
                };
                if self.cfg.skip_local
                    && target.ip().map(addr::is_private).unwrap_or(false)
                {
                    warn!("CONNECT to private address {}", target);
                    self.reject(buf, out);
                    return;
                }
                let reply = match &target {
                    TargetAddr::Domain(name, port) => PendingReply::Domain(name.clone(), *port),
                    TargetAddr::Ip(_) => PendingReply::Mirror,
                };
                self.pending = Some(PendingConnect {
                    consume_len: addr::encoded_len(class, buf),
                    reply,
                });
                debug!("CONNECT to {}", target);
                out.push(Action::Resolve(target));
            }
        }
    }

    fn command_udp_associate(&mut self, buf: &mut BytesMut, out: &mut Vec<Action>) {
        match addr::classify(buf) {
            AddrClass::Incomplete => {}
            AddrClass::Invalid => {
                warn!("UDP ASSOCIATE with invalid ATYP");
                self.reject(buf, out);
            }
            _ => match self.cfg.association_addr {
                // The advertised association address is IPv4 only.
                Some(SocketAddr::V4(assoc)) => {
                    debug!("UDP ASSOCIATE, advertising {}", assoc);
                    out.push(Action::Reply(reply::success(&BoundAddr::V4(
                        *assoc.ip(),
                        assoc.port(),
                    ))));
                    buf.clear();
                }
                Some(SocketAddr::V6(assoc)) => {
                    warn!("UDP association address {} is not IPv4", assoc);
                    self.reject(buf, out);
                }
                None => {
                    warn!("UDP ASSOCIATE requested but the relay is disabled");
                    self.reject(buf, out);
                }
            },
        }
    }
}
