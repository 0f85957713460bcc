//! Asynchronous name-resolution gateway
//!
//! Wraps the runtime resolver with a per-request timeout. Every call
//! produces exactly one outcome: a resolved address carrying the
//! caller-supplied port, or a [`ResolveError`]. Timeout, an empty answer,
//! and a lookup failure all surface through the same error branch.

use crate::error::ResolveError;
use crate::socks::TargetAddr;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{debug, warn};

/// Default per-request resolve timeout in seconds
pub const DEFAULT_DNS_TIMEOUT_SECS: f64 = 10.0;

/// Name resolver with a per-request timeout.
#[derive(Debug, Clone)]
pub struct Resolver {
    timeout: Duration,
}

impl Resolver {
    /// Create a resolver with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Resolver { timeout }
    }

    /// Create a resolver from a timeout in (possibly fractional) seconds.
    pub fn from_secs_f64(secs: f64) -> Self {
        Resolver {
            timeout: Duration::from_secs_f64(secs),
        }
    }

    /// The configured per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve `host` and return the first address with `port` attached.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, ResolveError> {
        debug!("resolving {}:{} (timeout {:?})", host, port, self.timeout);
        let lookup = lookup_host((host, port));
        match tokio::time::timeout(self.timeout, lookup).await {
            Err(_) => {
                warn!("resolving {} timed out", host);
                Err(ResolveError::TimedOut {
                    host: host.to_string(),
                })
            }
            Ok(Err(source)) => Err(ResolveError::Lookup {
                host: host.to_string(),
                source,
            }),
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(addr) => {
                    debug!("{} resolved to {}", host, addr);
                    Ok(addr)
                }
                None => Err(ResolveError::Empty {
                    host: host.to_string(),
                }),
            },
        }
    }

    /// Resolve a SOCKS target. IP literals pass through untouched.
    pub async fn resolve_target(&self, target: &TargetAddr) -> Result<SocketAddr, ResolveError> {
        match target {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(host, port) => self.resolve(host, *port).await,
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::from_secs_f64(DEFAULT_DNS_TIMEOUT_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_default_timeout() {
        let resolver = Resolver::default();
        assert_eq!(resolver.timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_resolve_target_ip_literal_passes_through() {
        // Zero timeout: an IP literal must still succeed because the
        // resolver is never consulted.
        let resolver = Resolver::new(Duration::from_secs(0));
        let target = TargetAddr::ipv4(Ipv4Addr::new(192, 0, 2, 1), 8080);
        let addr = resolver.resolve_target(&target).await.unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_resolve_keeps_caller_port() {
        let resolver = Resolver::default();
        let addr = resolver.resolve("localhost", 4242).await.unwrap();
        assert_eq!(addr.port(), 4242);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_resolve_failure_is_single_error() {
        let resolver = Resolver::default();
        let result = resolver
            .resolve("this-host-does-not-exist-4242.invalid", 80)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_resolve_zero_timeout_times_out() {
        // A zero-length budget forces the timeout branch even against a
        // fast resolver; the outcome must be exactly one error.
        let resolver = Resolver::new(Duration::from_nanos(1));
        let result = resolver
            .resolve("this-host-does-not-exist-4242.invalid", 80)
            .await;
        match result {
            Err(ResolveError::TimedOut { host }) => {
                assert_eq!(host, "this-host-does-not-exist-4242.invalid");
            }
            Err(_) => {} // lookup may fail before the timer on some systems
            Ok(addr) => panic!("unexpected resolution: {}", addr),
        }
    }
}
