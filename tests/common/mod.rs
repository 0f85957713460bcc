//! Test utilities for socksd integration tests
//!
//! Spawns real listeners on loopback: echo targets, SOCKS server
//! instances, and small helpers for driving the client side of the
//! protocol.

use socksd::resolver::Resolver;
use socksd::server::{ServerConfig, SocksServer};
use socksd::socks::AuthPolicy;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Start a TCP echo server and return its address.
pub async fn start_tcp_echo(host: &str) -> SocketAddr {
    let listener = TcpListener::bind((host, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Server settings accepting anonymous clients.
pub fn no_auth_config() -> ServerConfig {
    ServerConfig {
        auth: AuthPolicy::NoAuth,
        skip_local: false,
        max_conn_num: 16,
        high_water_kb: 64,
        association_addr: None,
    }
}

/// Server settings requiring `user`/`pass` credentials.
pub fn password_config() -> ServerConfig {
    ServerConfig {
        auth: AuthPolicy::Static {
            username: "user".to_string(),
            password: "pass".to_string(),
        },
        skip_local: false,
        max_conn_num: 16,
        high_water_kb: 64,
        association_addr: None,
    }
}

/// Start a SOCKS server on an ephemeral loopback port.
pub async fn start_socks_server(
    cfg: ServerConfig,
) -> (Arc<SocksServer>, SocketAddr, broadcast::Sender<bool>) {
    let server = Arc::new(SocksServer::new(cfg, Resolver::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.clone().run(listener, shutdown_rx));
    (server, addr, shutdown_tx)
}

/// Run the no-auth method negotiation and assert the selection reply.
pub async fn negotiate_no_auth(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

/// Build a CONNECT request for an IPv4 target.
pub fn connect_request_ipv4(target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = target else {
        panic!("expected an IPv4 target");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    request
}

/// Build a CONNECT request for a domain target.
pub fn connect_request_domain(host: &str, port: u16) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}
