//! Client exchange sequencer
//!
//! `Client` lets an application issue any number of requests and matching
//! receives over a single keep-alive `Connection`, including pipelining:
//! request N+1 may be sent before reply N has been read. The outstanding
//! count tracks how many replies are still owed.

use super::{Connection, Error, MessageProgress, Reply, Request, Result};
use crate::net::Endpoint;
use crate::http::tls::TlsConfig;
use std::time::Duration;
use tracing::debug;

/// Sequencer state for one client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Nothing in flight and no replies owed
    Idle,
    /// A send is in progress
    OnRequest,
    /// At least one request sent, its reply not yet started
    OnRequestComplete,
    /// A receive is in progress
    OnReply,
    /// A reply completed while more are still owed
    OnReplyComplete,
}

/// An HTTP client session over one connection
pub struct Client {
    connection: Connection,
    request: Request,
    reply: Reply,
    state: ClientState,
    request_count: usize,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        Client::with_connection(Connection::client(endpoint))
    }

    pub fn new_tls(endpoint: Endpoint, config: TlsConfig) -> Self {
        Client::with_connection(Connection::client_tls(endpoint, config))
    }

    fn with_connection(connection: Connection) -> Self {
        Client {
            connection,
            request: Request::new(),
            reply: Reply::new(),
            state: ClientState::Idle,
            request_count: 0,
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.connection.set_timeout(timeout);
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Requests sent whose replies have not been fully read
    pub fn request_count(&self) -> usize {
        self.request_count
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// The request being built for the next send
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// The most recently received reply
    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Blocking send of the current request state.
    ///
    /// With `finished == false` the request headers plus the buffered body
    /// fragment go out chunked and the message stays open for further
    /// `send` calls; with `finished == true` the message is completed and
    /// one more reply becomes owed.
    pub fn send(&mut self, finished: bool) -> Result<()> {
        self.request.set_finished(finished);
        self.state = ClientState::OnRequest;
        self.connection.send_request(&mut self.request)?;
        if finished {
            self.complete_send();
        }
        Ok(())
    }

    /// Start a non-blocking send step
    pub fn begin_send(&mut self, finished: bool) -> Result<()> {
        self.request.set_finished(finished);
        self.state = ClientState::OnRequest;
        self.connection.begin_send_request(&mut self.request)
    }

    /// Finish a non-blocking send step after readiness.
    ///
    /// `finished()` is set once the complete message has been flushed.
    pub fn end_send(&mut self) -> Result<MessageProgress> {
        let flushed = self.connection.end_send_request(&mut self.request)?;
        let mut progress = MessageProgress::default();
        if flushed && self.request.is_finished() && !self.request.is_sending() {
            progress.set_finished();
            self.complete_send();
        }
        Ok(progress)
    }

    fn complete_send(&mut self) {
        self.request_count += 1;
        self.request.clear();
        self.state = ClientState::OnRequestComplete;
        debug!(outstanding = self.request_count, "request sent");
    }

    /// Blocking receive of the next owed reply.
    ///
    /// Convenience contract: when no reply is owed yet, the current request
    /// state is finalized and flushed first, so `receive()` without a prior
    /// `send()` transmits whatever request was built so far.
    pub fn receive(&mut self) -> Result<&Reply> {
        if self.request_count == 0 {
            self.send(true)?;
        }
        self.reply.clear();
        self.state = ClientState::OnReply;
        match self.connection.receive_reply(&mut self.reply) {
            Ok(()) => {
                self.complete_receive();
                Ok(&self.reply)
            }
            Err(e) => {
                self.cancel();
                Err(e)
            }
        }
    }

    /// Start a non-blocking receive step.
    ///
    /// Unlike the blocking `receive`, this refuses to run when no reply is
    /// owed; callers under an event loop must send explicitly first. A
    /// pipelined reply already buffered may finish within this call, so the
    /// returned progress must be honored like an `end_receive` result.
    pub fn begin_receive(&mut self) -> Result<MessageProgress> {
        if self.request_count == 0 {
            return Err(Error::InvalidState("no outstanding request"));
        }
        if self.state != ClientState::OnReply {
            self.reply.clear();
            self.state = ClientState::OnReply;
        }
        let progress = self.connection.begin_receive_reply(&mut self.reply)?;
        if progress.finished() {
            self.complete_receive();
        }
        Ok(progress)
    }

    /// Finish a non-blocking receive step after readiness
    pub fn end_receive(&mut self) -> Result<MessageProgress> {
        let progress = self.connection.end_receive_reply(&mut self.reply)?;
        if progress.finished() {
            self.complete_receive();
        }
        Ok(progress)
    }

    fn complete_receive(&mut self) {
        self.request_count = self.request_count.saturating_sub(1);
        self.state = if self.request_count == 0 {
            ClientState::Idle
        } else {
            ClientState::OnReplyComplete
        };
        debug!(outstanding = self.request_count, "reply received");
    }

    /// Tear down the session regardless of in-flight state
    pub fn cancel(&mut self) {
        self.connection.cancel();
        self.request.clear();
        self.state = ClientState::Idle;
        self.request_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Server accepting one connection, reading `n` requests and answering
    /// each with the given bodies.
    fn pipelined_server(bodies: Vec<&'static str>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut data = Vec::new();
            let mut buf = [0u8; 1024];
            let mut served = 0;
            while served < bodies.len() {
                let n = stream.read(&mut buf).unwrap();
                assert!(n > 0);
                data.extend_from_slice(&buf[..n]);
                // Requests here have no body, so each header block is one
                // request.
                while let Some(pos) = find_blank_line(&data) {
                    data.drain(..pos + 4);
                    let body = bodies[served];
                    stream
                        .write_all(
                            format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                                body.len(),
                                body
                            )
                            .as_bytes(),
                        )
                        .unwrap();
                    served += 1;
                    if served == bodies.len() {
                        break;
                    }
                }
            }
            thread::sleep(Duration::from_millis(200));
        });
        addr
    }

    fn find_blank_line(data: &[u8]) -> Option<usize> {
        data.windows(4).position(|w| w == b"\r\n\r\n")
    }

    #[test]
    fn test_single_exchange() {
        let addr = pipelined_server(vec!["hello"]);
        let mut client = Client::new(Endpoint::from(addr));
        client.set_timeout(Some(TIMEOUT));

        client.request_mut().set_method(Method::Get);
        client.request_mut().set_url("/foo");
        client.send(true).unwrap();
        assert_eq!(client.request_count(), 1);
        assert_eq!(client.state(), ClientState::OnRequestComplete);

        let reply = client.receive().unwrap();
        assert_eq!(reply.status().code(), 200);
        assert_eq!(reply.body(), b"hello");
        assert_eq!(client.request_count(), 0);
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[test]
    fn test_pipelined_counter_invariant() {
        let addr = pipelined_server(vec!["one", "two", "three"]);
        let mut client = Client::new(Endpoint::from(addr));
        client.set_timeout(Some(TIMEOUT));

        for _ in 0..3 {
            client.request_mut().set_method(Method::Get);
            client.request_mut().set_url("/");
            client.send(true).unwrap();
        }
        assert_eq!(client.request_count(), 3);

        let mut bodies = Vec::new();
        for expected_remaining in [2usize, 1, 0] {
            let reply = client.receive().unwrap();
            bodies.push(String::from_utf8_lossy(reply.body()).to_string());
            assert_eq!(client.request_count(), expected_remaining);
            if expected_remaining > 0 {
                assert_eq!(client.state(), ClientState::OnReplyComplete);
            } else {
                assert_eq!(client.state(), ClientState::Idle);
            }
        }
        assert_eq!(bodies, ["one", "two", "three"]);
    }

    #[test]
    fn test_receive_flushes_unsent_request() {
        let addr = pipelined_server(vec!["implicit"]);
        let mut client = Client::new(Endpoint::from(addr));
        client.set_timeout(Some(TIMEOUT));

        client.request_mut().set_method(Method::Get);
        client.request_mut().set_url("/implicit");
        // No explicit send.
        let reply = client.receive().unwrap();
        assert_eq!(reply.body(), b"implicit");
        assert_eq!(client.request_count(), 0);
    }

    #[test]
    fn test_begin_receive_requires_outstanding_request() {
        let mut client = Client::new(Endpoint::new("localhost", 1));
        assert!(matches!(
            client.begin_receive(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_cancel_resets_session() {
        let addr = pipelined_server(vec!["x"]);
        let mut client = Client::new(Endpoint::from(addr));
        client.set_timeout(Some(TIMEOUT));

        client.request_mut().set_method(Method::Get);
        client.send(true).unwrap();
        assert_eq!(client.request_count(), 1);

        client.cancel();
        assert_eq!(client.request_count(), 0);
        assert_eq!(client.state(), ClientState::Idle);
        assert!(!client.is_connected());

        client.cancel();
        assert_eq!(client.state(), ClientState::Idle);
    }
}
