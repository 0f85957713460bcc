//! Error types for socksd
//!
//! This module defines the custom error types used throughout the server.

use std::io;
use thiserror::Error;

/// Main error type for socksd operations
#[derive(Error, Debug)]
pub enum SocksdError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Name resolution error
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// SOCKS5 protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Failure modes of the resolver gateway.
///
/// All of them surface to the state machine as the single failure branch;
/// the distinction only matters for logging.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The resolver did not answer within the configured timeout
    #[error("resolving {host} timed out")]
    TimedOut {
        /// Hostname being resolved
        host: String,
    },

    /// The resolver answered with no usable address
    #[error("no address found for {host}")]
    Empty {
        /// Hostname being resolved
        host: String,
    },

    /// The underlying lookup failed
    #[error("resolving {host} failed: {source}")]
    Lookup {
        /// Hostname being resolved
        host: String,
        /// Error reported by the resolver
        source: io::Error,
    },
}
