//! Configuration module for socksd
//!
//! Loads the JSON configuration file. Missing keys fall back to the
//! built-in defaults, and a missing file is written back with the full
//! default configuration.

use crate::socks::auth::{AuthPolicy, DynamicAuth};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_dns_timeout_seconds() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_socks_port() -> u16 {
    2333
}

fn default_high_water_mark() -> u32 {
    1024
}

fn default_max_conn_num() -> u32 {
    163
}

fn default_association_hostname() -> String {
    "localhost".to_string()
}

fn default_association_port() -> u16 {
    11451
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Logger verbosity (trace, debug, info, warn, error)
    pub log_level: String,

    /// Per-request DNS resolve timeout in seconds
    pub dns_timeout_seconds: f64,

    /// SOCKS server configuration
    pub socks_server: SocksServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            dns_timeout_seconds: default_dns_timeout_seconds(),
            socks_server: SocksServerConfig::default(),
        }
    }
}

/// SOCKS server section
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct SocksServerConfig {
    /// Run the SOCKS server
    pub enable: bool,

    /// SOCKS listen port
    pub port: u16,

    /// Authentication settings
    pub authentication: AuthConfig,

    /// UDP ASSOCIATE settings
    pub udp_association: UdpAssociationConfig,

    /// Tunnel high-water mark in KiB
    pub high_water_mark: u32,

    /// Connection admission capacity
    pub max_conn_num: u32,

    /// Reject CONNECT/UDP targets in private ranges
    pub ignore_local: bool,
}

impl Default for SocksServerConfig {
    fn default() -> Self {
        SocksServerConfig {
            enable: default_true(),
            port: default_socks_port(),
            authentication: AuthConfig::default(),
            udp_association: UdpAssociationConfig::default(),
            high_water_mark: default_high_water_mark(),
            max_conn_num: default_max_conn_num(),
            ignore_local: default_true(),
        }
    }
}

/// Authentication section
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    /// Accept only the no-authentication method
    pub no_auth: bool,

    /// Check credentials through the dynamic-password provider
    pub use_dynamic_password: bool,

    /// Static username
    pub username: String,

    /// Static password
    pub password: String,
}

impl AuthConfig {
    /// Build the authentication policy for the server.
    ///
    /// `dynamic` is the externally supplied dynamic-password provider.
    /// If dynamic passwords are configured without a provider, the static
    /// credentials are used instead.
    pub fn policy(&self, dynamic: Option<Arc<dyn DynamicAuth>>) -> AuthPolicy {
        if self.no_auth {
            return AuthPolicy::NoAuth;
        }
        if self.use_dynamic_password {
            match dynamic {
                Some(provider) => return AuthPolicy::Dynamic(provider),
                None => {
                    warn!("dynamic passwords configured without a provider, using static credentials");
                }
            }
        }
        AuthPolicy::Static {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// UDP ASSOCIATE section
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct UdpAssociationConfig {
    /// Run the UDP relay
    pub enable: bool,

    /// Public hostname advertised to clients, resolved at startup
    pub hostname: String,

    /// Public port, advertised and bound literally
    pub port: u16,
}

impl Default for UdpAssociationConfig {
    fn default() -> Self {
        UdpAssociationConfig {
            enable: default_true(),
            hostname: default_association_hostname(),
            port: default_association_port(),
        }
    }
}

/// Load configuration from a JSON file, writing defaults back if absent.
pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Config> {
    match std::fs::read_to_string(path.as_ref()) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let config = Config::default();
            let rendered =
                serde_json::to_string_pretty(&config).context("Failed to render default config")?;
            std::fs::write(path.as_ref(), rendered)
                .with_context(|| format!("Failed to write default config: {:?}", path.as_ref()))?;
            Ok(config)
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))
        }
    }
}

/// Parse configuration from a JSON string
pub fn parse_config(content: &str) -> Result<Config> {
    serde_json::from_str(content).with_context(|| "Failed to parse configuration")
}
