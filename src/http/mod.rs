//! HTTP/1.x protocol engine
//!
//! This module implements HTTP/1.x message framing and the connection state
//! machine on top of the non-blocking socket layer:
//!
//! - `MessageHeader` holds the parsed or to-be-sent header fields
//! - `HeaderParser` and `ChunkParser` are incremental byte-level parsers
//! - `HttpBuffer` frames message bodies (content-length or chunked)
//! - `Connection` drives one transport through handshake, send and receive
//!   for both the client and server roles
//! - `Client` sequences pipelined exchanges over one connection
//! - `Server`/`Acceptor` dispatch incoming requests to registered servlets
//!
//! # Examples
//!
//! ```no_run
//! use platinum::http::{Client, Method};
//! use platinum::net::Endpoint;
//!
//! let mut client = Client::new(Endpoint::new("localhost", 8080));
//! client.request_mut().set_method(Method::Get);
//! client.request_mut().set_url("/");
//! client.send(true).unwrap();
//! let reply = client.receive().unwrap();
//! assert_eq!(reply.status().code(), 200);
//! ```

pub mod body;
pub mod chunked;
pub mod client;
pub mod connection;
pub mod headers;
pub mod message;
pub mod parser;
pub mod server;
pub mod tls;

pub use body::HttpBuffer;
pub use chunked::ChunkParser;
pub use client::{Client, ClientState};
pub use connection::{ConnState, Connection};
pub use headers::MessageHeader;
pub use message::{MessageProgress, Method, Reply, Request, Status, Version};
pub use parser::HeaderParser;
pub use server::{Acceptor, Authorizer, Responder, Server, ServerHandle, Service, Servlet};
pub use tls::{TlsConfig, TlsStream};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid HTTP message: {0}")]
    InvalidMessage(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("timeout")]
    Timeout,

    #[error("request too large")]
    RequestTooLarge,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Net(#[from] crate::net::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid operation: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// Protocol-level errors leave the connection answerable with a 400;
    /// transport-level errors do not.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::InvalidMessage(_) | Error::RequestTooLarge)
    }
}

/// Maximum number of header fields per message
pub const MAX_HEADERS: usize = 64;

/// Maximum accumulated start-line plus header bytes per message
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Maximum accepted size of a single chunk
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Internal body buffer size
pub const BUFFER_SIZE: usize = 4096;

/// Server identification sent when a reply lacks a `Server` header
pub const SERVER_NAME: &str = "Platinum 1.0";

/// User agent sent when a request lacks a `User-Agent` header
pub const USER_AGENT: &str = "Pt-Http-client";
