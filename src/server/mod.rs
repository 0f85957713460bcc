//! SOCKS5 server shell
//!
//! Accepts client connections, admits them through the bounded
//! [`ConnectionQueue`], and drives each connection's state machine,
//! wiring its actions to the resolver gateway and the tunnel.
//!
//! The server owns the status map, the tunnel map and the admission
//! queue. A connection's entries in all three are created on accept (and
//! on CONNECT for the tunnel) and removed together on disconnect,
//! eviction, or fatal protocol error.

pub mod queue;
pub mod tunnel;

use crate::resolver::Resolver;
use crate::socks::auth::AuthPolicy;
use crate::socks::machine::{Action, ConnState, MachineConfig, SocksMachine};
use bytes::BytesMut;
use queue::{ConnId, ConnectionQueue};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use tunnel::TunnelHandle;

/// Read buffer granularity for client connections.
const READ_BUF_SIZE: usize = 8192;

/// Settings for one SOCKS server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Authentication policy applied to every connection
    pub auth: AuthPolicy,
    /// Reject CONNECT/UDP targets in private ranges
    pub skip_local: bool,
    /// Admission queue capacity
    pub max_conn_num: usize,
    /// Tunnel high-water mark in KiB
    pub high_water_kb: u32,
    /// Advertised UDP association address, if the relay is enabled
    pub association_addr: Option<SocketAddr>,
}

struct ServerState {
    queue: ConnectionQueue,
    status: HashMap<ConnId, ConnState>,
    tunnels: HashMap<ConnId, TunnelHandle>,
}

/// SOCKS5 proxy server.
pub struct SocksServer {
    cfg: ServerConfig,
    resolver: Resolver,
    state: Mutex<ServerState>,
    next_id: AtomicU64,
}

impl SocksServer {
    /// Create a server with the given settings and resolver gateway.
    pub fn new(cfg: ServerConfig, resolver: Resolver) -> Self {
        let capacity = cfg.max_conn_num;
        SocksServer {
            cfg,
            resolver,
            state: Mutex::new(ServerState {
                queue: ConnectionQueue::new(capacity),
                status: HashMap::with_capacity(capacity),
                tunnels: HashMap::with_capacity(capacity),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of currently admitted connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().status.len()
    }

    /// Number of established tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.state.lock().unwrap().tunnels.len()
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("SOCKS server listening on {}", listener.local_addr()?);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("SOCKS server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.clone().admit(stream, peer),
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
            }
        }
    }

    /// Admit a freshly accepted connection and spawn its driver.
    fn admit(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let close = Arc::new(Notify::new());
        {
            let mut state = self.state.lock().unwrap();
            if let Some(evicted) = state.queue.insert_or_touch(id, Arc::downgrade(&close)) {
                state.status.remove(&evicted.id);
                state.tunnels.remove(&evicted.id);
                if let Some(handle) = evicted.handle.upgrade() {
                    handle.notify_one();
                }
                warn!(
                    "too many connections, force close #{}; {} live",
                    evicted.id,
                    state.status.len()
                );
            }
            state.status.insert(id, ConnState::WaitRequest);
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("#{} set_nodelay failed: {}", id, e);
        }
        info!("#{} {} connected", id, peer);

        tokio::spawn(async move {
            self.drive_connection(id, stream, close).await;
            let mut state = self.state.lock().unwrap();
            state.status.remove(&id);
            state.tunnels.remove(&id);
            state.queue.erase(id);
            info!("#{} disconnected; {} live", id, state.status.len());
        });
    }

    /// Read loop feeding one connection's state machine.
    async fn drive_connection(&self, id: ConnId, stream: TcpStream, close: Arc<Notify>) {
        let mut machine = SocksMachine::new(MachineConfig {
            auth: self.cfg.auth.clone(),
            skip_local: self.cfg.skip_local,
            association_addr: self.cfg.association_addr,
        });
        let (mut rd, wr) = stream.into_split();
        let mut wr = Some(wr);
        let mut tunnel: Option<TunnelHandle> = None;
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);

        'conn: loop {
            tokio::select! {
                _ = close.notified() => {
                    debug!("#{} force closed", id);
                    break 'conn;
                }
                read = rd.read_buf(&mut buf) => match read {
                    Ok(0) => break 'conn,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("#{} read error: {}", id, e);
                        break 'conn;
                    }
                }
            }
            if !self.has_status(id) {
                // Only reachable through a bookkeeping bug.
                error!("#{} missing status entry, terminating", id);
                break 'conn;
            }

            let mut actions: VecDeque<Action> = machine.on_bytes(&mut buf).into();
            while let Some(action) = actions.pop_front() {
                match action {
                    Action::Reply(bytes) => {
                        let Some(w) = wr.as_mut() else {
                            debug!("#{} reply after establishment dropped", id);
                            continue;
                        };
                        if let Err(e) = w.write_all(&bytes).await {
                            debug!("#{} write failed: {}", id, e);
                            break 'conn;
                        }
                    }
                    Action::Shutdown => {
                        if let Some(w) = wr.as_mut() {
                            let _ = w.shutdown().await;
                        }
                        // Keep reading; the peer's close ends the loop.
                    }
                    Action::ForceClose => break 'conn,
                    Action::Forward(bytes) => {
                        let Some(t) = tunnel.as_ref() else {
                            error!("#{} established without a tunnel", id);
                            break 'conn;
                        };
                        if !t.forward(bytes).await {
                            debug!("#{} tunnel gone", id);
                            break 'conn;
                        }
                    }
                    Action::Resolve(target) => {
                        // The client may vanish or be evicted while the
                        // resolver works; stop without replying in that case.
                        let outcome = {
                            let mut lookup = pin!(self.resolver.resolve_target(&target));
                            loop {
                                tokio::select! {
                                    res = &mut lookup => break Some(res),
                                    _ = close.notified() => break None,
                                    read = rd.read_buf(&mut buf) => match read {
                                        Ok(0) => break None,
                                        Ok(_) => {} // buffered until established
                                        Err(_) => break None,
                                    }
                                }
                            }
                        };
                        let Some(resolved) = outcome else {
                            debug!("#{} disconnected during resolve of {}", id, target);
                            break 'conn;
                        };
                        match resolved {
                            Ok(addr) => {
                                let mut follow_up =
                                    machine.resolve_succeeded(addr, &mut buf).into_iter();
                                if machine.state() == ConnState::Established {
                                    // Success reply first, then the write half
                                    // belongs to the tunnel.
                                    match follow_up.next() {
                                        Some(Action::Reply(bytes)) => {
                                            let Some(mut w) = wr.take() else {
                                                break 'conn;
                                            };
                                            if w.write_all(&bytes).await.is_err() {
                                                break 'conn;
                                            }
                                            let handle = tunnel::spawn(
                                                addr,
                                                w,
                                                self.cfg.high_water_kb,
                                            );
                                            self.register_tunnel(id, handle.clone());
                                            tunnel = Some(handle);
                                        }
                                        _ => {
                                            error!("#{} established without a reply", id);
                                            break 'conn;
                                        }
                                    }
                                }
                                actions.extend(follow_up);
                            }
                            Err(e) => {
                                warn!("#{} {}", id, e);
                                actions.extend(machine.resolve_failed(&mut buf));
                            }
                        }
                    }
                }
            }
            self.set_status(id, machine.state());
        }
    }

    fn has_status(&self, id: ConnId) -> bool {
        self.state.lock().unwrap().status.contains_key(&id)
    }

    fn set_status(&self, id: ConnId, status: ConnState) {
        if let Some(entry) = self.state.lock().unwrap().status.get_mut(&id) {
            *entry = status;
        }
    }

    fn register_tunnel(&self, id: ConnId, handle: TunnelHandle) {
        let mut state = self.state.lock().unwrap();
        state.tunnels.insert(id, handle);
        if let Some(entry) = state.status.get_mut(&id) {
            *entry = ConnState::Established;
        }
    }
}
