//! UDP ASSOCIATE relay
//!
//! Binds the association socket advertised by the SOCKS server and
//! relays datagrams for clients. Each originating client endpoint gets a
//! backing outbound socket; the SOCKS UDP header of the first datagram is
//! kept as a prefix filter and prepended to everything sent back. Idle
//! mappings are expired by a periodic sweeper.
//!
//! Inbound datagram format:
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | variable |    2     | variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! Fragmented datagrams (`FRAG != 0`) are dropped.

use crate::resolver::Resolver;
use crate::socks::addr;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Datagram buffer size
const UDP_BUF_SIZE: usize = 65536;

/// Default idle timeout for a mapping
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Interval between expiry sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Resolve timeout for datagram targets in seconds
const UDP_RESOLVE_TIMEOUT_SECS: f64 = 10.0;

/// Outbound relay state for one client endpoint.
struct UdpMapping {
    outbound: Arc<UdpSocket>,
    last_activity: Instant,
    task: JoinHandle<()>,
}

impl Drop for UdpMapping {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// UDP datagram relay for SOCKS5 UDP ASSOCIATE.
pub struct UdpAssociation {
    socket: Arc<UdpSocket>,
    mappings: Arc<Mutex<HashMap<SocketAddr, UdpMapping>>>,
    resolver: Resolver,
    skip_local: bool,
    idle_timeout: Duration,
}

impl UdpAssociation {
    /// Wrap a bound association socket.
    pub fn new(socket: UdpSocket, skip_local: bool, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(UdpAssociation {
            socket: Arc::new(socket),
            mappings: Arc::new(Mutex::new(HashMap::new())),
            resolver: Resolver::from_secs_f64(UDP_RESOLVE_TIMEOUT_SECS),
            skip_local,
            idle_timeout,
        })
    }

    /// Local address of the association socket.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of live client mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().unwrap().len()
    }

    /// Receive and relay datagrams until the shutdown signal fires.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(
            "UDP association on {} (idle timeout {:?})",
            self.local_addr()?,
            self.idle_timeout
        );
        let sweeper = tokio::spawn(self.clone().sweep_loop());
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("UDP association shutting down");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                    Err(e) => warn!("association recv failed: {}", e),
                }
            }
        }
        sweeper.abort();
        self.mappings.lock().unwrap().clear();
        Ok(())
    }

    /// Validate, resolve, and forward one inbound datagram.
    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) {
        if datagram.len() < 4 {
            return;
        }
        if datagram[..3] != [0x00, 0x00, 0x00] {
            debug!("datagram from {} with non-zero RSV/FRAG dropped", src);
            return;
        }
        let class = addr::classify(datagram);
        let target = match addr::parse_target(class, datagram) {
            Some(target) => target,
            None => {
                warn!("invalid UDP request format from {}", src);
                return;
            }
        };
        let head_len = addr::encoded_len(class, datagram);
        let payload = &datagram[head_len..];

        let resolved = match self.resolver.resolve_target(&target).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("dropping datagram from {}: {}", src, e);
                return;
            }
        };
        if self.skip_local && addr::is_private(resolved.ip()) {
            warn!("datagram from {} to private address {} blocked", src, resolved);
            return;
        }

        let outbound = match self.mapping_for(src, &datagram[..head_len]).await {
            Some(socket) => socket,
            None => return,
        };
        match outbound.send_to(payload, resolved).await {
            Ok(sent) => debug!("{} bytes from {} relayed to {}", sent, src, resolved),
            Err(e) => warn!("relay to {} failed: {}", resolved, e),
        }
        self.touch(src);
    }

    /// Look up or create the outbound socket for `src`.
    ///
    /// The head prefix of the first datagram is captured for the lifetime
    /// of the mapping and prepended to every returned datagram.
    async fn mapping_for(&self, src: SocketAddr, head: &[u8]) -> Option<Arc<UdpSocket>> {
        let existing = {
            self.mappings
                .lock()
                .unwrap()
                .get(&src)
                .map(|mapping| mapping.outbound.clone())
        };
        if let Some(socket) = existing {
            return Some(socket);
        }
        let outbound = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!("binding outbound socket for {} failed: {}", src, e);
                return None;
            }
        };
        let task = tokio::spawn(relay_back(
            outbound.clone(),
            self.socket.clone(),
            src,
            Bytes::copy_from_slice(head),
            self.mappings.clone(),
        ));
        let mut mappings = self.mappings.lock().unwrap();
        mappings.insert(
            src,
            UdpMapping {
                outbound: outbound.clone(),
                last_activity: Instant::now(),
                task,
            },
        );
        info!("new UDP mapping for {} ({} total)", src, mappings.len());
        Some(outbound)
    }

    fn touch(&self, src: SocketAddr) {
        if let Some(mapping) = self.mappings.lock().unwrap().get_mut(&src) {
            mapping.last_activity = Instant::now();
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }

    /// Remove mappings idle longer than the timeout.
    fn sweep(&self) {
        let mut mappings = self.mappings.lock().unwrap();
        let before = mappings.len();
        mappings.retain(|src, mapping| {
            let idle = mapping.last_activity.elapsed();
            if idle > self.idle_timeout {
                info!("UDP mapping for {} expired after {:?} idle", src, idle);
                false
            } else {
                true
            }
        });
        let expired = before - mappings.len();
        if expired > 0 {
            info!("cleaned up {} UDP mappings, {} remaining", expired, mappings.len());
        }
    }
}

/// Pump replies from the outbound socket back to the client endpoint,
/// prepending the stored head.
async fn relay_back(
    outbound: Arc<UdpSocket>,
    association: Arc<UdpSocket>,
    src: SocketAddr,
    head: Bytes,
    mappings: Arc<Mutex<HashMap<SocketAddr, UdpMapping>>>,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        match outbound.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let mut msg = BytesMut::with_capacity(head.len() + len);
                msg.extend_from_slice(&head);
                msg.extend_from_slice(&buf[..len]);
                match association.send_to(&msg, src).await {
                    Ok(sent) => debug!("{} bytes from {} sent back to {}", sent, from, src),
                    Err(e) => warn!("send back to {} failed: {}", src, e),
                }
                if let Some(mapping) = mappings.lock().unwrap().get_mut(&src) {
                    mapping.last_activity = Instant::now();
                }
            }
            Err(e) => {
                debug!("outbound socket for {} closed: {}", src, e);
                break;
            }
        }
    }
}
