//! Server-side dispatch
//!
//! `Server` accepts connections and distributes them round-robin across
//! worker `ServerThread`s, each running its own event loop. An `Acceptor`
//! owns one connection: it matches each incoming request to a registered
//! `Servlet` by URL prefix, optionally runs an `Authorizer`, feeds request
//! progress to a `Responder` obtained from the servlet's `Service`, and
//! serializes the reply back out, looping while keep-alive holds.
//!
//! The servlet registry is read on every request and written rarely, so it
//! sits behind a read/write lock; `remove_servlet` additionally blocks
//! until no connection still references the removed servlet.

use super::tls::TlsConfig;
use super::{Connection, Error, MessageProgress, Reply, Request, Result, Status};
use crate::net::{TcpListenerSocket, TcpSocket};
use crate::reactor::{EventLoop, Interest, LoopEvent, Token, Waker};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Handles the lifecycle of one request and produces its reply
pub trait Responder: Send {
    /// Request headers have arrived
    fn on_request(&mut self, _request: &Request) -> Result<()> {
        Ok(())
    }

    /// A fragment of the request body has arrived
    fn on_body(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    /// The request is complete; fill in the reply.
    ///
    /// Leaving the reply unfinished makes it a streamed (chunked) reply;
    /// `on_reply_continue` is then called for each further fragment.
    fn on_complete(&mut self, request: &Request, reply: &mut Reply) -> Result<()>;

    /// A streamed reply fragment has been sent; supply the next one, or
    /// mark the reply finished. The default finishes immediately.
    fn on_reply_continue(&mut self, reply: &mut Reply) -> Result<()> {
        reply.set_finished(true);
        Ok(())
    }
}

/// Creates one `Responder` per incoming request
pub trait Service: Send + Sync {
    fn create_responder(&self) -> Box<dyn Responder>;
}

/// Decides whether a request may reach its servlet; a denial becomes a 401
pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: &Request) -> bool;
}

/// A URL prefix bound to a service
pub struct Servlet {
    pattern: String,
    service: Arc<dyn Service>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl Servlet {
    pub fn new(pattern: impl Into<String>, service: Arc<dyn Service>) -> Self {
        Servlet {
            pattern: pattern.into(),
            service,
            authorizer: None,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

struct ServletEntry {
    pattern: String,
    service: Arc<dyn Service>,
    authorizer: Option<Arc<dyn Authorizer>>,
    active: AtomicUsize,
}

/// Shared servlet registry; the lookup path takes the read lock once per
/// request.
pub struct ServletRegistry {
    servlets: RwLock<Vec<Arc<ServletEntry>>>,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl ServletRegistry {
    fn new() -> Self {
        ServletRegistry {
            servlets: RwLock::new(Vec::new()),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        }
    }

    fn add(&self, servlet: Servlet) {
        let mut servlets = match self.servlets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        servlets.push(Arc::new(ServletEntry {
            pattern: servlet.pattern,
            service: servlet.service,
            authorizer: servlet.authorizer,
            active: AtomicUsize::new(0),
        }));
    }

    /// Remove a servlet and block until no connection references it
    fn remove(&self, pattern: &str) -> bool {
        let entry = {
            let mut servlets = match self.servlets.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match servlets.iter().position(|e| e.pattern == pattern) {
                Some(pos) => servlets.remove(pos),
                None => return false,
            }
        };

        let mut guard = match self.idle_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while entry.active.load(Ordering::Acquire) > 0 {
            guard = match self.idle_cv.wait_timeout(guard, Duration::from_millis(50)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Longest-prefix match; the returned guard pins the servlet until
    /// dropped.
    fn lookup(self: &Arc<Self>, url: &str) -> Option<ServletRef> {
        let servlets = match self.servlets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = servlets
            .iter()
            .filter(|e| url.starts_with(&e.pattern))
            .max_by_key(|e| e.pattern.len())?
            .clone();
        entry.active.fetch_add(1, Ordering::AcqRel);
        Some(ServletRef {
            entry,
            registry: Arc::clone(self),
        })
    }
}

/// Guard pinning one servlet for the duration of one request
struct ServletRef {
    entry: Arc<ServletEntry>,
    registry: Arc<ServletRegistry>,
}

impl ServletRef {
    fn service(&self) -> &Arc<dyn Service> {
        &self.entry.service
    }

    fn authorizer(&self) -> Option<&Arc<dyn Authorizer>> {
        self.entry.authorizer.as_ref()
    }
}

impl Drop for ServletRef {
    fn drop(&mut self) {
        self.entry.active.fetch_sub(1, Ordering::AcqRel);
        self.registry.idle_cv.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptorState {
    ReceivingRequest,
    SendingReply,
}

/// Drives all exchanges on one accepted connection
pub struct Acceptor {
    connection: Connection,
    request: Request,
    reply: Reply,
    registry: Arc<ServletRegistry>,
    servlet: Option<ServletRef>,
    responder: Option<Box<dyn Responder>>,
    /// Reply decided before the responder ran (404, 401, 400)
    pending_status: Option<Status>,
    state: AcceptorState,
    finished: bool,
}

impl Acceptor {
    pub fn new(connection: Connection, registry: Arc<ServletRegistry>) -> Self {
        Acceptor {
            connection,
            request: Request::new(),
            reply: Reply::new(),
            registry,
            servlet: None,
            responder: None,
            pending_status: None,
            state: AcceptorState::ReceivingRequest,
            finished: true,
        }
    }

    /// Begin the first receive; must run before the acceptor is polled.
    /// Bytes already buffered may carry a whole request, so progress from
    /// the initial step is handled here as well.
    pub fn start(&mut self) {
        self.finished = false;
        let result = match self.connection.begin_receive_request(&mut self.request) {
            Ok(progress) => self.handle_request_progress(progress),
            Err(e) => Err(e),
        };
        self.complete_step(result);
    }

    /// The exchange loop has ended and the owner can reap this acceptor
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn wants(&self) -> Interest {
        self.connection.wants()
    }

    pub fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.connection.raw_fd()
    }

    /// A timer armed by the owner fired before readiness
    pub fn timeout_fired(&mut self) {
        self.connection.timeout_fired();
    }

    /// Advance after the owner observed readiness.
    ///
    /// Protocol errors discovered while a reply can still be written turn
    /// into a 400 with `Connection: close`; transport errors end the loop.
    pub fn on_ready(&mut self) {
        if self.finished {
            return;
        }
        let result = self.step();
        self.complete_step(result);
    }

    fn complete_step(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_protocol() && self.connection.is_connected() => {
                warn!(error = %e, "bad request");
                self.reply_with_status(Status::BAD_REQUEST);
            }
            Err(e) => self.fail(e),
        }
    }

    fn step(&mut self) -> Result<()> {
        match self.state {
            AcceptorState::ReceivingRequest => {
                let progress = self.connection.end_receive_request(&mut self.request)?;
                self.handle_request_progress(progress)
            }
            AcceptorState::SendingReply => self.drive_reply(),
        }
    }

    fn handle_request_progress(&mut self, progress: MessageProgress) -> Result<()> {
        if progress.header() {
            self.dispatch()?;
        }
        if progress.body() {
            let body = self.request.take_body();
            if let Some(responder) = self.responder.as_mut() {
                responder.on_body(&body)?;
            }
        }
        if progress.finished() {
            self.build_reply()?;
        }
        Ok(())
    }

    /// Locate and authorize the servlet once headers are in
    fn dispatch(&mut self) -> Result<()> {
        let servlet = self.registry.lookup(self.request.url());
        match servlet {
            None => {
                debug!(url = %self.request.url(), "no servlet");
                self.pending_status = Some(Status::NOT_FOUND);
            }
            Some(servlet) => {
                if let Some(authorizer) = servlet.authorizer() {
                    if !authorizer.authorize(&self.request) {
                        debug!(url = %self.request.url(), "authorization denied");
                        self.pending_status = Some(Status::UNAUTHORIZED);
                        return Ok(());
                    }
                }
                let mut responder = servlet.service().create_responder();
                responder.on_request(&self.request)?;
                self.responder = Some(responder);
                self.servlet = Some(servlet);
            }
        }
        Ok(())
    }

    fn build_reply(&mut self) -> Result<()> {
        match self.pending_status.take() {
            Some(status) => {
                self.reply.set_status(status);
                self.reply.write_body(status.reason_phrase().as_bytes());
                self.reply.set_finished(true);
            }
            None => match self.responder.as_mut() {
                Some(responder) => {
                    // The responder decides whether the reply is complete
                    // or streamed across further fragments.
                    responder.on_complete(&self.request, &mut self.reply)?;
                }
                None => {
                    self.reply.set_status(Status::INTERNAL_SERVER_ERROR);
                    self.reply.set_finished(true);
                }
            },
        }
        self.state = AcceptorState::SendingReply;
        self.connection.begin_send_reply(&mut self.reply)?;
        self.drive_reply()
    }

    /// Push reply bytes out as far as the socket allows, pulling further
    /// fragments from the responder while the reply is streamed.
    fn drive_reply(&mut self) -> Result<()> {
        loop {
            let flushed = self.connection.end_send_reply(&mut self.reply)?;
            if !flushed {
                return Ok(());
            }
            if !self.reply.is_sending() {
                return self.on_reply_sent();
            }
            match self.responder.as_mut() {
                Some(responder) => responder.on_reply_continue(&mut self.reply)?,
                None => self.reply.set_finished(true),
            }
        }
    }

    /// Immediate status reply outside the normal dispatch path
    fn reply_with_status(&mut self, status: Status) {
        self.connection.revoke_keep_alive();
        self.reply.clear();
        self.reply.set_status(status);
        self.reply.write_body(status.reason_phrase().as_bytes());
        self.reply.set_finished(true);
        self.state = AcceptorState::SendingReply;
        let sent = self
            .connection
            .begin_send_reply(&mut self.reply)
            .and_then(|_| self.connection.end_send_reply(&mut self.reply));
        match sent {
            Ok(true) if !self.reply.is_sending() => {
                self.connection.cancel();
                self.finished = true;
            }
            Ok(_) => {}
            Err(e) => self.fail(e),
        }
    }

    /// Loop to the next exchange or close, based on keep-alive.
    ///
    /// A pipelined request already staged in the input buffer may complete
    /// inside the begin step; its progress is handled right away so it is
    /// not lost waiting for readiness that never comes.
    fn on_reply_sent(&mut self) -> Result<()> {
        self.servlet = None;
        self.responder = None;
        if self.connection.keep_alive() {
            self.request.clear();
            self.reply.clear();
            self.state = AcceptorState::ReceivingRequest;
            let progress = self.connection.begin_receive_request(&mut self.request)?;
            self.handle_request_progress(progress)?;
        } else {
            self.connection.cancel();
            self.finished = true;
        }
        Ok(())
    }

    fn fail(&mut self, e: Error) {
        match e {
            Error::ConnectionLost => debug!("peer closed connection"),
            e => debug!(error = %e, "connection failed"),
        }
        self.connection.cancel();
        self.finished = true;
    }

    /// Blocking exchange loop, for callers without an event loop
    pub fn run(&mut self) -> Result<()> {
        self.start();
        while !self.finished {
            self.connection.wait_ready()?;
            self.on_ready();
        }
        Ok(())
    }
}

enum LoopCommand {
    Register(Acceptor),
    Stop,
}

/// One worker: an event loop on its own OS thread, fed accepted
/// connections through a channel.
struct ServerThread {
    sender: Sender<LoopCommand>,
    waker: Waker,
    handle: Option<JoinHandle<()>>,
}

impl ServerThread {
    fn spawn(index: usize, timeout: Option<Duration>) -> Result<Self> {
        let (sender, receiver) = channel();
        let event_loop = EventLoop::new().map_err(Error::Io)?;
        let waker = event_loop.waker();
        let handle = thread::Builder::new()
            .name(format!("platinum-server-{}", index))
            .spawn(move || run_loop(event_loop, receiver, timeout))
            .map_err(Error::Io)?;
        Ok(ServerThread {
            sender,
            waker,
            handle: Some(handle),
        })
    }

    fn dispatch(&self, acceptor: Acceptor) {
        if self.sender.send(LoopCommand::Register(acceptor)).is_ok() {
            self.waker.wake();
        }
    }

    fn shutdown(&mut self) {
        let _ = self.sender.send(LoopCommand::Stop);
        self.waker.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Event-loop body shared by worker threads
fn run_loop(mut event_loop: EventLoop, receiver: Receiver<LoopCommand>, timeout: Option<Duration>) {
    let mut acceptors: HashMap<usize, Acceptor> = HashMap::new();
    let mut next_token = 1usize;

    loop {
        let events = match event_loop.run_once(Some(Duration::from_millis(100))) {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "event loop failed");
                return;
            }
        };

        for event in events {
            match event {
                LoopEvent::Woken => {}
                LoopEvent::Ready(ready) => {
                    advance(&mut event_loop, &mut acceptors, ready.token.0, timeout);
                }
                LoopEvent::Timeout(token) => {
                    if let Some(acceptor) = acceptors.get_mut(&token.0) {
                        acceptor.timeout_fired();
                    }
                    advance(&mut event_loop, &mut acceptors, token.0, timeout);
                }
            }
        }

        // Drain the command channel after every pass; a wake may have
        // arrived while events were being handled.
        loop {
            match receiver.try_recv() {
                Ok(LoopCommand::Register(mut acceptor)) => {
                    acceptor.start();
                    let token = Token(next_token);
                    next_token += 1;
                    if register(&mut event_loop, &mut acceptor, token, timeout) {
                        acceptors.insert(token.0, acceptor);
                    }
                }
                Ok(LoopCommand::Stop) => return,
                Err(std::sync::mpsc::TryRecvError::Empty) => break,
                Err(std::sync::mpsc::TryRecvError::Disconnected) => return,
            }
        }
    }
}

fn register(
    event_loop: &mut EventLoop,
    acceptor: &mut Acceptor,
    token: Token,
    timeout: Option<Duration>,
) -> bool {
    if acceptor.finished() {
        return false;
    }
    let fd = match acceptor.raw_fd() {
        Some(fd) => fd,
        None => return false,
    };
    if let Err(e) = event_loop.register(fd, token, acceptor.wants()) {
        error!(error = %e, "register failed");
        return false;
    }
    if let Some(timeout) = timeout {
        event_loop.set_timer(token, timeout);
    }
    true
}

fn advance(
    event_loop: &mut EventLoop,
    acceptors: &mut HashMap<usize, Acceptor>,
    token: usize,
    timeout: Option<Duration>,
) {
    let Some(acceptor) = acceptors.get_mut(&token) else {
        return;
    };
    let fd_before = acceptor.raw_fd();
    acceptor.on_ready();

    if acceptor.finished() {
        if let Some(fd) = fd_before {
            let _ = event_loop.deregister(fd);
        }
        event_loop.clear_timer(Token(token));
        acceptors.remove(&token);
        return;
    }

    if let Some(fd) = acceptor.raw_fd() {
        if let Err(e) = event_loop.reregister(fd, Token(token), acceptor.wants()) {
            error!(error = %e, "reregister failed");
            acceptors.remove(&token);
            return;
        }
    }
    if let Some(timeout) = timeout {
        event_loop.set_timer(Token(token), timeout);
    }
}

/// Remote control for a running server
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    waker: Waker,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// An HTTP server: listener, servlet registry and worker pool
pub struct Server {
    listener: TcpListenerSocket,
    registry: Arc<ServletRegistry>,
    tls_config: Option<TlsConfig>,
    event_loop: EventLoop,
    workers: Vec<ServerThread>,
    next_worker: usize,
    stop: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

const LISTENER_TOKEN: Token = Token(0);

impl Server {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListenerSocket::bind(addr).map_err(Error::Net)?;
        let event_loop = EventLoop::new().map_err(Error::Io)?;
        Ok(Server {
            listener,
            registry: Arc::new(ServletRegistry::new()),
            tls_config: None,
            event_loop,
            workers: Vec::new(),
            next_worker: 0,
            stop: Arc::new(AtomicBool::new(false)),
            timeout: None,
        })
    }

    pub fn bind_tls(addr: SocketAddr, config: TlsConfig) -> Result<Self> {
        let mut server = Server::bind(addr)?;
        server.tls_config = Some(config);
        Ok(server)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::Net)
    }

    /// Per-connection idle timeout
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Spawn `n` worker threads; accepted connections are spread over them
    /// and this thread's own loop round-robin.
    pub fn set_threads(&mut self, n: usize) -> Result<()> {
        while self.workers.len() < n {
            let worker = ServerThread::spawn(self.workers.len() + 1, self.timeout)?;
            self.workers.push(worker);
        }
        Ok(())
    }

    pub fn add_servlet(&self, servlet: Servlet) {
        info!(pattern = servlet.pattern(), "servlet added");
        self.registry.add(servlet);
    }

    /// Remove a servlet, blocking until no in-flight request references it.
    /// Returns false when no servlet with that pattern exists.
    pub fn remove_servlet(&self, pattern: &str) -> bool {
        let removed = self.registry.remove(pattern);
        if removed {
            info!(pattern, "servlet removed");
        }
        removed
    }

    /// Control handle usable from other threads while `run` is blocking
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: Arc::clone(&self.stop),
            waker: self.event_loop.waker(),
        }
    }

    /// Accept and serve until the handle stops the server
    pub fn run(&mut self) -> Result<()> {
        self.event_loop
            .register(self.listener.raw_fd(), LISTENER_TOKEN, Interest::READABLE)
            .map_err(Error::Io)?;
        info!(addr = %self.local_addr()?, "server running");

        let mut acceptors: HashMap<usize, Acceptor> = HashMap::new();
        let mut next_token = 1usize;

        while !self.stop.load(Ordering::Acquire) {
            let events = self
                .event_loop
                .run_once(Some(Duration::from_millis(100)))
                .map_err(Error::Io)?;

            for event in events {
                match event {
                    LoopEvent::Woken => {}
                    LoopEvent::Ready(ready) if ready.token == LISTENER_TOKEN => {
                        self.accept_pending(&mut acceptors, &mut next_token)?;
                    }
                    LoopEvent::Ready(ready) => {
                        advance(
                            &mut self.event_loop,
                            &mut acceptors,
                            ready.token.0,
                            self.timeout,
                        );
                    }
                    LoopEvent::Timeout(token) => {
                        if let Some(acceptor) = acceptors.get_mut(&token.0) {
                            acceptor.timeout_fired();
                        }
                        advance(&mut self.event_loop, &mut acceptors, token.0, self.timeout);
                    }
                }
            }
        }

        for worker in &mut self.workers {
            worker.shutdown();
        }
        Ok(())
    }

    fn accept_pending(
        &mut self,
        acceptors: &mut HashMap<usize, Acceptor>,
        next_token: &mut usize,
    ) -> Result<()> {
        while let Some(socket) = self.listener.accept().map_err(Error::Net)? {
            let connection = self.make_connection(socket)?;
            let mut acceptor = Acceptor::new(connection, Arc::clone(&self.registry));

            // Rotation includes this thread's own loop as the last slot.
            let slot = if self.workers.is_empty() {
                self.workers.len()
            } else {
                let slot = self.next_worker % (self.workers.len() + 1);
                self.next_worker = self.next_worker.wrapping_add(1);
                slot
            };

            if slot < self.workers.len() {
                self.workers[slot].dispatch(acceptor);
            } else {
                acceptor.start();
                let token = Token(*next_token);
                *next_token += 1;
                if register(&mut self.event_loop, &mut acceptor, token, self.timeout) {
                    acceptors.insert(token.0, acceptor);
                }
            }
        }
        Ok(())
    }

    fn make_connection(&self, socket: TcpSocket) -> Result<Connection> {
        let mut connection = match &self.tls_config {
            Some(config) => Connection::accepted_tls(socket, config)?,
            None => Connection::accepted(socket),
        };
        connection.set_timeout(self.timeout);
        Ok(connection)
    }
}
