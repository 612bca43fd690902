//! Non-blocking TCP sockets
//!
//! Sockets here never block: reads and writes report would-block as
//! `Ok(None)`, connect is split into a begin/end pair, and a single-fd
//! `poll(2)` readiness check is the suspension primitive for blocking-mode
//! callers.

use super::{Endpoint, Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// Readiness to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Single-fd readiness check built on `poll(2)`.
///
/// Returns true when the fd became ready, false when the timeout expired.
pub fn poll_fd(fd: RawFd, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);

    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(result > 0)
}

/// A non-blocking TCP socket.
///
/// Created either by `begin_connect` (client side, connect in flight) or by
/// `TcpListenerSocket::accept` (server side, already connected).
pub struct TcpSocket {
    socket: Option<Socket>,
    candidates: Vec<SocketAddr>,
    connecting: bool,
    connected: bool,
    eof: bool,
}

impl TcpSocket {
    /// Start a non-blocking connect to the endpoint.
    ///
    /// Resolution happens here; the first candidate address is tried
    /// immediately and the rest are kept for retry in `end_connect`. The
    /// caller waits for writability before calling `end_connect`.
    pub fn begin_connect(endpoint: &Endpoint) -> Result<Self> {
        let candidates = endpoint.resolve()?;

        let mut socket = TcpSocket {
            socket: None,
            candidates,
            connecting: false,
            connected: false,
            eof: false,
        };
        socket.start_next_candidate(None)?;
        Ok(socket)
    }

    /// Wrap an already-connected socket (the accept path)
    pub fn from_accepted(socket: Socket) -> Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(TcpSocket {
            socket: Some(socket),
            candidates: Vec::new(),
            connecting: false,
            connected: true,
            eof: false,
        })
    }

    fn start_next_candidate(&mut self, last_error: Option<io::Error>) -> Result<()> {
        let mut last_error = last_error;

        while !self.candidates.is_empty() {
            let addr = self.candidates.remove(0);
            let domain = Domain::for_address(addr);

            let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
                Ok(s) => s,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            if let Err(e) = socket.set_nonblocking(true) {
                last_error = Some(e);
                continue;
            }

            match socket.connect(&addr.into()) {
                Ok(()) => {
                    self.socket = Some(socket);
                    self.connecting = false;
                    self.connected = true;
                    return Ok(());
                }
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                    self.socket = Some(socket);
                    self.connecting = true;
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            }
        }

        Err(Error::Connect(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address")
        })))
    }

    /// Collect the result of a pending connect after the socket became
    /// writable.
    ///
    /// Returns true once connected. A false return means the failed
    /// candidate was replaced by the next one and the caller should wait
    /// for writability again. When no candidates remain the last error is
    /// surfaced.
    pub fn end_connect(&mut self) -> Result<bool> {
        if self.connected {
            return Ok(true);
        }
        if !self.connecting {
            return Err(Error::NotConnected);
        }

        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        match socket.take_error()? {
            None => {
                self.connecting = false;
                self.connected = true;
                Ok(true)
            }
            Some(err) => {
                self.socket = None;
                self.connecting = false;
                self.start_next_candidate(Some(err))?;
                Ok(self.connected)
            }
        }
    }

    /// Blocking connect: begin, then wait for writability until done
    pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self> {
        let mut socket = TcpSocket::begin_connect(endpoint)?;

        loop {
            if socket.connected {
                return Ok(socket);
            }
            if !socket.poll(PollEvents::Write, timeout)? {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )));
            }
            socket.end_connect()?;
        }
    }

    /// Non-blocking read. `Ok(None)` means would-block, `Ok(Some(0))`
    /// means the peer closed its side (`is_eof()` becomes true).
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let socket = self.socket.as_mut().ok_or(Error::NotConnected)?;
        loop {
            match Read::read(socket, buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(Some(0));
                }
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Non-blocking write. `Ok(None)` means would-block.
    pub fn write(&mut self, buf: &[u8]) -> Result<Option<usize>> {
        let socket = self.socket.as_mut().ok_or(Error::NotConnected)?;
        loop {
            match Write::write(socket, buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Wait for readiness on this socket
    pub fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        poll_fd(socket.as_raw_fd(), events, timeout)
    }

    /// Check whether the socket is connected and still open
    pub fn is_connected(&self) -> bool {
        self.connected && self.socket.is_some()
    }

    /// Check whether a connect is still in flight
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Check whether the peer has closed its side
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Get the local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        socket
            .local_addr()?
            .as_socket()
            .ok_or(Error::NotConnected)
    }

    /// Get the raw fd for selector registration
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Close the socket. Idempotent.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.connecting = false;
        self.connected = false;
    }
}

// Raw pass-through I/O, used by the TLS layer which needs `Read`/`Write`
// with would-block errors left intact.
impl Read for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.as_mut() {
            Some(socket) => {
                let n = Read::read(socket, buf)?;
                if n == 0 {
                    self.eof = true;
                }
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        }
    }
}

impl Write for TcpSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.socket.as_mut() {
            Some(socket) => Write::write(socket, buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A non-blocking listening socket
pub struct TcpListenerSocket {
    socket: Socket,
}

impl TcpListenerSocket {
    /// Bind and listen on the given address
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        Ok(TcpListenerSocket { socket })
    }

    /// Non-blocking accept. `Ok(None)` means no connection is pending.
    pub fn accept(&self) -> Result<Option<TcpSocket>> {
        loop {
            match self.socket.accept() {
                Ok((socket, _addr)) => return Ok(Some(TcpSocket::from_accepted(socket)?)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Wait for an incoming connection
    pub fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.socket.as_raw_fd(), PollEvents::Read, timeout)
    }

    /// Get the bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or(Error::NotConnected)
    }

    /// Get the raw fd for selector registration
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
