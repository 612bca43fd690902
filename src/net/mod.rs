//! Network primitives
//!
//! This module provides the endpoint type used to name remote peers and the
//! non-blocking TCP socket wrappers the HTTP layer is built on.

pub mod socket;

pub use socket::{poll_fd, PollEvents, TcpListenerSocket, TcpSocket};

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address resolution failed for {0}")]
    Resolve(String),

    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error("socket is not connected")]
    NotConnected,
}

/// A remote peer identified by host and port.
///
/// Endpoints are immutable values, cheap to clone. Name resolution is
/// deferred until a connection attempt actually starts; `resolve()` may
/// yield several candidate addresses which are tried in turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host name (or address literal) and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Get the host name
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve the endpoint into its candidate socket addresses
    pub fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::Resolve(self.to_string()))?
            .collect();

        if addrs.is_empty() {
            return Err(Error::Resolve(self.to_string()));
        }

        Ok(addrs)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}
