//! Connection state machine
//!
//! `Connection` drives one physical transport through the full exchange
//! lifecycle for both roles: optional TLS handshake, request/reply send,
//! reply/request receive, keep-alive or close. Every operation comes in a
//! begin/end pair that never blocks; the `end*` methods are called after
//! the owner observed readiness. Blocking wrappers (`send_request`,
//! `receive_reply`, ...) layer a poll loop on top for simple callers.
//!
//! Send and receive are strictly ordered within one connection; pipelining
//! works by writing request N+1 into the socket buffer before reply N has
//! been read, not by concurrent I/O.

use super::body::RawSource;
use super::chunked::{write_chunk, write_last_chunk};
use super::tls::{HandshakeStatus, TlsConfig, TlsStream};
use super::{
    Error, HeaderParser, HttpBuffer, MessageHeader, MessageProgress, Reply, Request, Result,
    BUFFER_SIZE, SERVER_NAME, USER_AGENT,
};
use crate::net::{poll_fd, Endpoint, PollEvents, TcpSocket};
use crate::reactor::Interest;
use std::os::fd::RawFd;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Connection lifecycle states, shared by both roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No transport, or a client connect still in flight
    NotConnected,
    /// Server side accepted, no bytes exchanged yet
    Accepted,
    /// Transport established, exchanges may run
    Connected,
    /// Client-side TLS handshake starting
    TlsHandshake,
    /// Server-side TLS handshake starting
    TlsNotAccepted,
    /// Client handshake waiting for writability
    TlsHandshakeWrite,
    /// Client handshake waiting for readability
    TlsHandshakeRead,
    /// Server handshake waiting for writability
    TlsAcceptWrite,
    /// Server handshake waiting for readability
    TlsAcceptRead,
    /// Pipelined request bytes still unflushed when a receive began
    RequestOutputPending,
    /// Pipelined reply bytes still unflushed when a receive began
    ReplyOutputPending,
}

enum Transport {
    None,
    Plain(TcpSocket),
    Tls(TlsStream),
}

impl Transport {
    fn write_some(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        match self {
            Transport::None => Err(Error::InvalidState("write on closed transport")),
            Transport::Plain(socket) => Ok(socket.write(buf)?),
            Transport::Tls(tls) => tls.write(buf),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Transport::None => None,
            Transport::Plain(socket) => socket.raw_fd(),
            Transport::Tls(tls) => tls.socket().and_then(|s| s.raw_fd()),
        }
    }

    fn pending(&self) -> usize {
        match self {
            Transport::Tls(tls) => tls.pending(),
            _ => 0,
        }
    }

    fn close(&mut self) {
        match std::mem::replace(self, Transport::None) {
            Transport::None => {}
            Transport::Plain(mut socket) => socket.close(),
            Transport::Tls(mut tls) => tls.shutdown(),
        }
    }
}

impl RawSource for Transport {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self {
            Transport::None => Err(Error::InvalidState("read on closed transport")),
            Transport::Plain(socket) => Ok(socket.read(buf)?),
            Transport::Tls(tls) => tls.read(buf),
        }
    }
}

/// One HTTP/1.x connection, client or server role
pub struct Connection {
    state: ConnState,
    transport: Transport,
    endpoint: Option<Endpoint>,
    tls_config: Option<TlsConfig>,
    parser: HeaderParser,
    buffer: HttpBuffer,
    /// Raw bytes read past what the parser consumed
    staged: Vec<u8>,
    /// Serialized bytes not yet written to the transport
    output: Vec<u8>,
    /// Chunked-write memo: header sent, terminator still owed
    chunked: bool,
    /// Header of the current outgoing message has been serialized
    message_serialized: bool,
    /// A receive is in progress and the parser grammar is set
    receiving: bool,
    /// Headers of the incoming message are done, body framing is active
    body_begun: bool,
    /// Sticky timeout mark, surfaced by the next `end*` call
    on_timeout: bool,
    /// Server-side keep-alive, AND-ed across request and reply headers
    keep_alive: bool,
    timeout: Option<Duration>,
}

impl Connection {
    /// Client connection to an endpoint; nothing happens until the first
    /// send.
    pub fn client(endpoint: Endpoint) -> Self {
        Connection::build(ConnState::NotConnected, Transport::None, Some(endpoint), None)
    }

    /// Client connection with TLS
    pub fn client_tls(endpoint: Endpoint, config: TlsConfig) -> Self {
        Connection::build(
            ConnState::NotConnected,
            Transport::None,
            Some(endpoint),
            Some(config),
        )
    }

    /// Server connection over a freshly accepted socket
    pub fn accepted(socket: TcpSocket) -> Self {
        Connection::build(ConnState::Accepted, Transport::Plain(socket), None, None)
    }

    /// Server connection with TLS; the handshake runs before the first
    /// request is read.
    pub fn accepted_tls(socket: TcpSocket, config: &TlsConfig) -> Result<Self> {
        let tls = TlsStream::accept(config, socket)?;
        Ok(Connection::build(
            ConnState::TlsNotAccepted,
            Transport::Tls(tls),
            None,
            None,
        ))
    }

    fn build(
        state: ConnState,
        transport: Transport,
        endpoint: Option<Endpoint>,
        tls_config: Option<TlsConfig>,
    ) -> Self {
        Connection {
            state,
            transport,
            endpoint,
            tls_config,
            parser: HeaderParser::new(false),
            buffer: HttpBuffer::new(),
            staged: Vec::new(),
            output: Vec::new(),
            chunked: false,
            message_serialized: false,
            receiving: false,
            body_begun: false,
            on_timeout: false,
            keep_alive: true,
            timeout: None,
        }
    }

    /// Timeout applied by the blocking wrappers and readiness waits
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.transport, Transport::None)
    }

    /// Server-side keep-alive decision so far
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Revoke keep-alive for the rest of this connection
    pub fn revoke_keep_alive(&mut self) {
        self.keep_alive = false;
    }

    /// Raw fd for selector registration
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.transport.raw_fd()
    }

    /// Mark that a wait timed out; the next `end*` call reports it
    pub fn timeout_fired(&mut self) {
        self.on_timeout = true;
    }

    /// The readiness this connection is waiting for
    pub fn wants(&self) -> Interest {
        match self.state {
            ConnState::NotConnected => Interest::WRITABLE,
            ConnState::TlsHandshakeRead | ConnState::TlsAcceptRead => Interest::READABLE,
            ConnState::TlsHandshakeWrite | ConnState::TlsAcceptWrite => Interest::WRITABLE,
            ConnState::TlsHandshake | ConnState::TlsNotAccepted => Interest::BOTH,
            ConnState::RequestOutputPending | ConnState::ReplyOutputPending => {
                if self.receiving {
                    Interest::BOTH
                } else {
                    Interest::WRITABLE
                }
            }
            ConnState::Accepted | ConnState::Connected => {
                if !self.output.is_empty() && self.receiving {
                    Interest::BOTH
                } else if !self.output.is_empty() {
                    Interest::WRITABLE
                } else {
                    Interest::READABLE
                }
            }
        }
    }

    /// Tear down transport, parsers and pending output. Idempotent; this
    /// is also the only way to clear a latched timeout.
    pub fn cancel(&mut self) {
        debug!(state = ?self.state, "connection cancelled");
        self.transport.close();
        self.state = ConnState::NotConnected;
        self.parser.reset(false);
        self.buffer.reset();
        self.staged.clear();
        self.output.clear();
        self.chunked = false;
        self.message_serialized = false;
        self.receiving = false;
        self.body_begun = false;
        self.on_timeout = false;
        self.keep_alive = true;
    }

    // ---- client send path ----

    /// Start (or continue) sending a request.
    ///
    /// From `NotConnected` this issues the non-blocking connect; once the
    /// transport is up the request is serialized into the output buffer and
    /// flushed as far as the socket allows.
    pub fn begin_send_request(&mut self, request: &mut Request) -> Result<()> {
        // A request that is not mid-send starts a new message; the memo
        // from the previous message no longer applies.
        if !request.is_sending() {
            self.message_serialized = false;
        }
        if self.state == ConnState::NotConnected && !self.is_connected() {
            let endpoint = self
                .endpoint
                .as_ref()
                .ok_or(Error::InvalidState("client connection without endpoint"))?;
            trace!(%endpoint, "connecting");
            let socket = TcpSocket::begin_connect(endpoint)?;
            self.transport = Transport::Plain(socket);
        }
        self.drive_send(request)?;
        Ok(())
    }

    /// Collect the result of a send step after readiness.
    ///
    /// Returns true once the transport is established and everything
    /// serialized so far has been flushed. For a streaming (unfinished)
    /// request the message itself completes only when the caller marks it
    /// finished and a final step writes the chunk terminator.
    pub fn end_send_request(&mut self, request: &mut Request) -> Result<bool> {
        self.check_timeout()?;
        self.drive_send(request)
    }

    fn drive_send(&mut self, request: &mut Request) -> Result<bool> {
        self.advance_transport(false)?;
        if self.state != ConnState::Connected {
            return Ok(false);
        }

        self.serialize_request(request)?;
        self.flush_output()?;

        // The memo stays set after the flush; only a new message clears
        // it. Flushing merely marks this one as no longer in flight.
        let done = self.output.is_empty();
        if done && self.message_serialized && !self.chunked {
            request.set_sending(false);
        }
        Ok(done)
    }

    /// Blocking send of a finished request
    pub fn send_request(&mut self, request: &mut Request) -> Result<()> {
        self.begin_send_request(request)?;
        loop {
            if self.end_send_request(request)? && self.state == ConnState::Connected {
                return Ok(());
            }
            self.wait_ready()?;
        }
    }

    // ---- client receive path ----

    /// Start receiving a reply.
    ///
    /// Unflushed pipelined request bytes are completed first; the parser is
    /// reset to the status-line grammar when this is the first step of a
    /// new reply. Bytes already staged may complete the whole message here,
    /// so the returned progress must be honored like an `end` result.
    pub fn begin_receive_reply(&mut self, reply: &mut Reply) -> Result<MessageProgress> {
        if !self.output.is_empty() && self.state == ConnState::Connected {
            self.state = ConnState::RequestOutputPending;
        }
        if !self.receiving {
            self.parser.reset(true);
            self.receiving = true;
            self.body_begun = false;
            reply.set_receiving(true);
        }
        self.end_receive_reply(reply)
    }

    /// Advance reply reception after readiness.
    ///
    /// A protocol error on this path is connection-terminal: the transport
    /// is torn down before the error is surfaced.
    pub fn end_receive_reply(&mut self, reply: &mut Reply) -> Result<MessageProgress> {
        self.check_timeout()?;

        if self.state == ConnState::RequestOutputPending {
            self.flush_output()?;
            if !self.output.is_empty() {
                return Ok(MessageProgress::default());
            }
            self.state = ConnState::Connected;
        }

        match self.receive_step(|parser, buffer| {
            parser.fill_reply(reply);
            buffer.begin_body(reply.header(), reply.version())
        }) {
            Ok(progress) => {
                if progress.body() {
                    let body = self.buffer.take();
                    reply.write_body(&body);
                }
                if progress.finished() {
                    reply.set_finished(true);
                    reply.set_receiving(false);
                    let keep = self.buffer.keep_alive();
                    if !keep {
                        self.cancel();
                    }
                }
                Ok(progress)
            }
            Err(e) => {
                if e.is_protocol() {
                    self.cancel();
                }
                Err(e)
            }
        }
    }

    /// Blocking receive of a full reply
    pub fn receive_reply(&mut self, reply: &mut Reply) -> Result<()> {
        let mut progress = self.begin_receive_reply(reply)?;
        loop {
            if progress.finished() {
                return Ok(());
            }
            self.wait_ready()?;
            progress = self.end_receive_reply(reply)?;
        }
    }

    // ---- server receive path ----

    /// Start receiving a request; runs the accept-side TLS handshake first
    /// when one is configured.
    ///
    /// A pipelined request already staged may complete entirely within this
    /// call, so the returned progress must be honored like an `end` result.
    pub fn begin_receive_request(&mut self, request: &mut Request) -> Result<MessageProgress> {
        if self.state == ConnState::Accepted {
            self.state = ConnState::Connected;
        }
        if !self.output.is_empty() && self.state == ConnState::Connected {
            self.state = ConnState::ReplyOutputPending;
        }
        if !self.receiving && self.handshake_done() {
            self.parser.reset(false);
            self.receiving = true;
            self.body_begun = false;
            request.set_receiving(true);
        }
        self.end_receive_request(request)
    }

    /// Advance request reception after readiness.
    ///
    /// A protocol error here leaves the transport open so the owner can
    /// still answer with a 400; keep-alive is revoked instead.
    pub fn end_receive_request(&mut self, request: &mut Request) -> Result<MessageProgress> {
        self.check_timeout()?;
        self.advance_transport(true)?;
        if self.state == ConnState::ReplyOutputPending {
            self.flush_output()?;
            if !self.output.is_empty() {
                return Ok(MessageProgress::default());
            }
            self.state = ConnState::Connected;
        }
        if self.state != ConnState::Connected {
            return Ok(MessageProgress::default());
        }
        if !self.receiving {
            self.parser.reset(false);
            self.receiving = true;
            self.body_begun = false;
            request.set_receiving(true);
        }

        match self.receive_step(|parser, buffer| {
            parser.fill_request(request);
            buffer.begin_body(request.header(), request.version())
        }) {
            Ok(progress) => {
                if progress.body() {
                    let body = self.buffer.take();
                    request.write_body(&body);
                }
                if progress.finished() {
                    request.set_finished(true);
                    request.set_receiving(false);
                    self.keep_alive = self.keep_alive && self.buffer.keep_alive();
                }
                Ok(progress)
            }
            Err(e) => {
                if e.is_protocol() {
                    self.keep_alive = false;
                }
                Err(e)
            }
        }
    }

    /// Blocking receive of a full request
    pub fn receive_request(&mut self, request: &mut Request) -> Result<()> {
        let mut progress = self.begin_receive_request(request)?;
        loop {
            if progress.finished() {
                return Ok(());
            }
            self.wait_ready()?;
            progress = self.end_receive_request(request)?;
        }
    }

    // ---- server send path ----

    /// Start (or continue) sending a reply
    pub fn begin_send_reply(&mut self, reply: &mut Reply) -> Result<()> {
        if !reply.is_sending() {
            self.message_serialized = false;
        }
        self.drive_send_reply(reply)?;
        Ok(())
    }

    /// Collect the result of a reply send step after readiness
    pub fn end_send_reply(&mut self, reply: &mut Reply) -> Result<bool> {
        self.check_timeout()?;
        self.drive_send_reply(reply)
    }

    fn drive_send_reply(&mut self, reply: &mut Reply) -> Result<bool> {
        self.advance_transport(true)?;
        if self.state == ConnState::Accepted {
            self.state = ConnState::Connected;
        }
        if self.state != ConnState::Connected {
            return Ok(false);
        }

        self.serialize_reply(reply)?;
        self.flush_output()?;

        let done = self.output.is_empty();
        if done && self.message_serialized && !self.chunked {
            reply.set_sending(false);
        }
        Ok(done)
    }

    /// Blocking send of a finished reply
    pub fn send_reply(&mut self, reply: &mut Reply) -> Result<()> {
        self.begin_send_reply(reply)?;
        loop {
            if self.end_send_reply(reply)? && self.state == ConnState::Connected {
                return Ok(());
            }
            self.wait_ready()?;
        }
    }

    // ---- shared internals ----

    fn check_timeout(&self) -> Result<()> {
        if self.on_timeout {
            Err(Error::Timeout)
        } else {
            Ok(())
        }
    }

    fn handshake_done(&self) -> bool {
        matches!(self.state, ConnState::Connected)
    }

    /// Advance connect and TLS handshake until `Connected` or suspension
    fn advance_transport(&mut self, server_side: bool) -> Result<()> {
        loop {
            match self.state {
                ConnState::NotConnected => {
                    let connected = match &mut self.transport {
                        Transport::Plain(socket) if socket.is_connecting() => {
                            socket.end_connect()?
                        }
                        Transport::Plain(socket) => socket.is_connected(),
                        Transport::None => return Ok(()),
                        Transport::Tls(_) => true,
                    };
                    if !connected {
                        return Ok(());
                    }
                    if self.tls_config.is_some() {
                        self.start_client_handshake()?;
                    } else {
                        self.state = ConnState::Connected;
                    }
                }

                ConnState::TlsHandshake
                | ConnState::TlsHandshakeRead
                | ConnState::TlsHandshakeWrite => {
                    if !self.handshake_step(false)? {
                        return Ok(());
                    }
                }

                ConnState::TlsNotAccepted | ConnState::TlsAcceptRead | ConnState::TlsAcceptWrite => {
                    if !self.handshake_step(true)? {
                        return Ok(());
                    }
                }

                ConnState::Accepted => {
                    if server_side {
                        self.state = ConnState::Connected;
                    }
                    return Ok(());
                }

                _ => return Ok(()),
            }
        }
    }

    fn start_client_handshake(&mut self) -> Result<()> {
        let config = self
            .tls_config
            .as_ref()
            .ok_or(Error::InvalidState("tls handshake without config"))?;
        let socket = match std::mem::replace(&mut self.transport, Transport::None) {
            Transport::Plain(socket) => socket,
            other => {
                self.transport = other;
                return Err(Error::InvalidState("handshake on non-plain transport"));
            }
        };
        let tls = TlsStream::connect(config, socket)?;
        self.transport = Transport::Tls(tls);
        self.state = ConnState::TlsHandshake;
        Ok(())
    }

    /// One handshake step; true once the handshake completed
    fn handshake_step(&mut self, accept_side: bool) -> Result<bool> {
        let tls = match &mut self.transport {
            Transport::Tls(tls) => tls,
            _ => return Err(Error::InvalidState("handshake without tls transport")),
        };
        match tls.handshake_step() {
            Ok(HandshakeStatus::Done) => {
                debug!("tls handshake complete");
                self.state = ConnState::Connected;
                Ok(true)
            }
            Ok(HandshakeStatus::WantRead) => {
                self.state = if accept_side {
                    ConnState::TlsAcceptRead
                } else {
                    ConnState::TlsHandshakeRead
                };
                Ok(false)
            }
            Ok(HandshakeStatus::WantWrite) => {
                self.state = if accept_side {
                    ConnState::TlsAcceptWrite
                } else {
                    ConnState::TlsHandshakeWrite
                };
                Ok(false)
            }
            Err(e) => {
                self.cancel();
                Err(e)
            }
        }
    }

    /// Append all header fields plus the terminating blank line
    fn write_header_block(&mut self, header: &MessageHeader) {
        for (name, value) in header.iter() {
            self.output
                .extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        self.output.extend_from_slice(b"\r\n");
    }

    /// Write buffered output as far as the socket allows
    fn flush_output(&mut self) -> Result<()> {
        while !self.output.is_empty() {
            match self.transport.write_some(&self.output) {
                Ok(Some(n)) => {
                    self.output.drain(..n);
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.cancel();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Serialize a request into the output buffer.
    ///
    /// The first call for a message writes the start line and header block
    /// exactly once, with defaults injected for absent fields. A message
    /// finished on first serialization is content-length framed; otherwise
    /// the chunked memo flips and every call emits one chunk until the
    /// terminator.
    fn serialize_request(&mut self, request: &mut Request) -> Result<()> {
        if self.chunked {
            let body = request.take_body();
            write_chunk(&mut self.output, &body);
            if request.is_finished() {
                write_last_chunk(&mut self.output);
                self.chunked = false;
            }
            return Ok(());
        }
        if self.message_serialized {
            return Ok(());
        }

        let finished = request.is_finished();
        let body_len = request.body().len();

        let header = request.header_mut();
        if !header.contains("Connection") {
            header.set("Connection", "keep-alive");
        }
        if !header.contains("Date") {
            header.set("Date", httpdate::fmt_http_date(SystemTime::now()));
        }
        if !header.contains("Host") {
            if let Some(endpoint) = &self.endpoint {
                header.set("Host", endpoint.to_string());
            }
        }
        if !header.contains("User-Agent") {
            header.set("User-Agent", USER_AGENT);
        }

        if finished {
            header.remove("Transfer-Encoding");
            header.set("Content-Length", body_len.to_string());
        } else {
            header.remove("Content-Length");
            header.set("Transfer-Encoding", "chunked");
        }

        let mut url = request.url().to_string();
        if !request.qparams().is_empty() {
            url = format!("{}?{}", url, request.qparams());
        }
        self.output.extend_from_slice(
            format!("{} {} {}\r\n", request.method(), url, request.version()).as_bytes(),
        );
        self.write_header_block(request.header());

        let body = request.take_body();
        if finished {
            self.output.extend_from_slice(&body);
        } else {
            write_chunk(&mut self.output, &body);
            self.chunked = true;
        }

        self.message_serialized = true;
        request.set_sending(true);
        trace!(method = %request.method(), url = %request.url(), "request serialized");
        Ok(())
    }

    /// Serialize a reply; the `Connection` default is the AND of the
    /// connection-level keep-alive and this reply's own header.
    fn serialize_reply(&mut self, reply: &mut Reply) -> Result<()> {
        if self.chunked {
            let body = reply.take_body();
            write_chunk(&mut self.output, &body);
            if reply.is_finished() {
                write_last_chunk(&mut self.output);
                self.chunked = false;
            }
            return Ok(());
        }
        if self.message_serialized {
            return Ok(());
        }

        let version = reply.version();
        let keep = self.keep_alive && reply.header().is_keep_alive(version);
        self.keep_alive = keep;

        let finished = reply.is_finished();
        let body_len = reply.body().len();

        let header = reply.header_mut();
        if !header.contains("Connection") {
            header.set("Connection", if keep { "keep-alive" } else { "close" });
        }
        if !header.contains("Date") {
            header.set("Date", httpdate::fmt_http_date(SystemTime::now()));
        }
        if !header.contains("Server") {
            header.set("Server", SERVER_NAME);
        }

        if finished {
            header.remove("Transfer-Encoding");
            header.set("Content-Length", body_len.to_string());
        } else {
            header.remove("Content-Length");
            header.set("Transfer-Encoding", "chunked");
        }

        self.output.extend_from_slice(
            format!("{} {} {}\r\n", reply.version(), reply.status().code(), reply.reason())
                .as_bytes(),
        );
        self.write_header_block(reply.header());

        let body = reply.take_body();
        if finished {
            self.output.extend_from_slice(&body);
        } else {
            write_chunk(&mut self.output, &body);
            self.chunked = true;
        }

        self.message_serialized = true;
        reply.set_sending(true);
        trace!(status = reply.status().code(), "reply serialized");
        Ok(())
    }

    /// One incremental receive step: headers, then body, then completion.
    ///
    /// `fill` moves the parsed header block into the caller's message the
    /// moment the blank line is consumed, and hands it to the body framing
    /// layer.
    fn receive_step<F>(&mut self, mut fill: F) -> Result<MessageProgress>
    where
        F: FnMut(&mut HeaderParser, &mut HttpBuffer) -> Result<()>,
    {
        let mut progress = MessageProgress::default();

        if !self.body_begun {
            loop {
                if !self.staged.is_empty() {
                    let consumed = self.parser.advance(&self.staged)?;
                    self.staged.drain(..consumed);
                    if self.parser.end() {
                        break;
                    }
                }
                let mut tmp = [0u8; BUFFER_SIZE];
                match self.transport.read_some(&mut tmp)? {
                    None => return Ok(progress),
                    Some(0) => {
                        self.cancel();
                        return Err(Error::ConnectionLost);
                    }
                    Some(n) => self.staged.extend_from_slice(&tmp[..n]),
                }
            }

            fill(&mut self.parser, &mut self.buffer)?;
            progress.set_header();
            self.body_begun = true;
        }

        let produced = self
            .buffer
            .import(&mut self.staged, &mut self.transport, 0)?;
        if produced > 0 {
            progress.set_body();
        }

        if self.buffer.is_end() {
            progress.set_finished();
            self.receiving = false;
            self.body_begun = false;
        }
        Ok(progress)
    }

    /// Wait for the readiness the connection currently needs.
    ///
    /// On timeout the sticky mark is set so the next `end*` call raises
    /// `Timeout`.
    pub fn wait_ready(&mut self) -> Result<()> {
        if self.transport.pending() > 0 {
            return Ok(());
        }
        let fd = self
            .transport
            .raw_fd()
            .ok_or(Error::InvalidState("wait on closed transport"))?;
        let events = match self.wants() {
            i if i == Interest::READABLE => PollEvents::Read,
            i if i == Interest::WRITABLE => PollEvents::Write,
            _ => PollEvents::Both,
        };
        if !poll_fd(fd, events, self.timeout).map_err(Error::Net)? {
            self.on_timeout = true;
        }
        Ok(())
    }
}
