//! Platinum - asynchronous HTTP/1.x connection engine
//!
//! This crate provides a readiness-driven HTTP/1.x implementation: a
//! non-blocking socket layer, a small selector/event-loop reactor, byte-level
//! message framing, a connection state machine shared by the client and
//! server roles, a pipelining-aware client, and a servlet-style server.

pub mod http;
pub mod net;
pub mod reactor;
