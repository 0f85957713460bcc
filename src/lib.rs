//! # socksd - SOCKS5 Proxy Server
//!
//! socksd is a Rust SOCKS5 proxy server built around a per-connection
//! state machine. It negotiates the protocol with clients, authenticates
//! them, resolves and dials remote destinations, and relays bytes in both
//! directions under coupled flow control. A UDP ASSOCIATE relay shares
//! the address codec and lifetime machinery.
//!
//! ## Features
//!
//! - **Incremental protocol parsing**: the state machine consumes bytes
//!   as they arrive, regardless of chunking
//! - **Bounded admission**: a FIFO connection queue force-closes the
//!   oldest connection when capacity is reached
//! - **Coupled backpressure**: tunnels pause the fast side when the slow
//!   side's queue passes the configured high-water mark
//! - **UDP ASSOCIATE**: per-client outbound sockets with idle expiry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksd::config::load_or_init;
//! use socksd::resolver::Resolver;
//! use socksd::server::{ServerConfig, SocksServer};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_or_init("config.json")?;
//!     let socks = &config.socks_server;
//!     let server = Arc::new(SocksServer::new(
//!         ServerConfig {
//!             auth: socks.authentication.policy(None),
//!             skip_local: socks.ignore_local,
//!             max_conn_num: socks.max_conn_num as usize,
//!             high_water_kb: socks.high_water_mark,
//!             association_addr: None,
//!         },
//!         Resolver::from_secs_f64(config.dns_timeout_seconds),
//!     ));
//!     let listener = TcpListener::bind(("0.0.0.0", socks.port)).await?;
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!     server.run(listener, shutdown_rx).await
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod resolver;
pub mod server;
pub mod socks;
pub mod udp;

// Re-export commonly used items
pub use config::{load_or_init, Config};
pub use error::{ResolveError, SocksdError};
pub use resolver::Resolver;
pub use server::{ServerConfig, SocksServer};
pub use udp::UdpAssociation;

/// Version of the socksd library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
