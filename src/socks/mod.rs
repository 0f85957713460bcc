//! SOCKS5 protocol implementation
//!
//! Wire-level pieces shared by the TCP server and the UDP relay: the
//! address codec, reply builders, authentication policy, and the
//! per-connection state machine.

pub mod addr;
pub mod auth;
pub mod consts;
pub mod machine;
pub mod reply;
pub mod types;

pub use addr::AddrClass;
pub use auth::{AuthPolicy, DynamicAuth};
pub use machine::{Action, ConnState, MachineConfig, SocksMachine};
pub use reply::BoundAddr;
pub use types::{SocksCommand, TargetAddr};
