//! Readiness selectors
//!
//! A selector turns "this fd became readable/writable" into dispatched
//! events. Two backends are provided: epoll on linux and a portable
//! `poll(2)` table. Callers only see the `Selector` trait; the backend is
//! chosen at build time by `new_selector`.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Opaque registration key, chosen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// The readiness a registration is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// One readiness notification
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// OS readiness demultiplexer
pub trait Selector: Send {
    /// Register interest in an fd
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Change the interest of an already-registered fd
    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Remove an fd from the selector
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait for readiness, appending events. Returns the number of events.
    fn select(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Create the platform's preferred selector
pub fn new_selector() -> io::Result<Box<dyn Selector>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(EpollSelector::new()?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(Box::new(PollSelector::new()))
    }
}

/// Whole milliseconds, rounded up so a wait never ends before the
/// requested duration has fully elapsed.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
        None => -1,
    }
}

/// Level-triggered epoll backend
#[cfg(target_os = "linux")]
pub struct EpollSelector {
    epfd: RawFd,
}

#[cfg(target_os = "linux")]
impl EpollSelector {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollSelector { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut events = 0u32;
        if interest.readable {
            events |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            events |= libc::EPOLLOUT as u32;
        }

        let mut ev = libc::epoll_event {
            events,
            u64: token.0 as u64,
        };

        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Selector for EpollSelector {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn select(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        const MAX_EVENTS: usize = 64;
        let mut buf: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };

        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    buf.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout_ms(timeout),
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break rc as usize;
        };

        for ev in buf.iter().take(n) {
            let hup_or_err =
                ev.events & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0;
            events.push(Event {
                token: Token(ev.u64 as usize),
                readable: ev.events & libc::EPOLLIN as u32 != 0 || hup_or_err,
                writable: ev.events & libc::EPOLLOUT as u32 != 0 || hup_or_err,
            });
        }
        Ok(n)
    }
}

#[cfg(target_os = "linux")]
impl Drop for EpollSelector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Portable `poll(2)` backend over a registration table
pub struct PollSelector {
    registrations: Vec<(RawFd, Token, Interest)>,
}

impl PollSelector {
    pub fn new() -> Self {
        PollSelector {
            registrations: Vec::new(),
        }
    }
}

impl Default for PollSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for PollSelector {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.registrations.iter().any(|(f, _, _)| *f == fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already registered",
            ));
        }
        self.registrations.push((fd, token, interest));
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        for reg in &mut self.registrations {
            if reg.0 == fd {
                reg.1 = token;
                reg.2 = interest;
                return Ok(());
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "fd not registered",
        ))
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let before = self.registrations.len();
        self.registrations.retain(|(f, _, _)| *f != fd);
        if self.registrations.len() == before {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fd not registered",
            ));
        }
        Ok(())
    }

    fn select(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut pfds: Vec<libc::pollfd> = self
            .registrations
            .iter()
            .map(|(fd, _, interest)| {
                let mut ev: libc::c_short = 0;
                if interest.readable {
                    ev |= libc::POLLIN;
                }
                if interest.writable {
                    ev |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd: *fd,
                    events: ev,
                    revents: 0,
                }
            })
            .collect();

        let rc = loop {
            let rc = unsafe {
                libc::poll(
                    pfds.as_mut_ptr(),
                    pfds.len() as libc::nfds_t,
                    timeout_ms(timeout),
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break rc as usize;
        };

        if rc > 0 {
            for (pfd, (_, token, _)) in pfds.iter().zip(self.registrations.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                let hup_or_err = pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0;
                events.push(Event {
                    token: *token,
                    readable: pfd.revents & libc::POLLIN != 0 || hup_or_err,
                    writable: pfd.revents & libc::POLLOUT != 0 || hup_or_err,
                });
            }
        }
        Ok(rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn check_selector(mut selector: Box<dyn Selector>) {
        let (mut client, server) = connected_pair();
        server.set_nonblocking(true).unwrap();

        selector
            .register(server.as_raw_fd(), Token(7), Interest::READABLE)
            .unwrap();

        // Nothing written yet: a zero-timeout select reports nothing.
        let mut events = Vec::new();
        selector
            .select(&mut events, Some(Duration::from_millis(0)))
            .unwrap();
        assert!(events.is_empty());

        client.write_all(b"x").unwrap();
        let mut events = Vec::new();
        selector
            .select(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, Token(7));
        assert!(events[0].readable);

        selector.deregister(server.as_raw_fd()).unwrap();
        let mut events = Vec::new();
        selector
            .select(&mut events, Some(Duration::from_millis(0)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_timeout_ms_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(5))), 5);
        assert_eq!(timeout_ms(Some(Duration::from_micros(5_300))), 6);
        assert_eq!(timeout_ms(Some(Duration::from_nanos(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
    }

    #[test]
    fn test_poll_selector() {
        check_selector(Box::new(PollSelector::new()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_epoll_selector() {
        check_selector(Box::new(EpollSelector::new().unwrap()));
    }

    #[test]
    fn test_reregister_changes_interest() {
        let (client, server) = connected_pair();
        drop(client);
        let mut selector = PollSelector::new();
        selector
            .register(server.as_raw_fd(), Token(1), Interest::WRITABLE)
            .unwrap();
        selector
            .reregister(server.as_raw_fd(), Token(2), Interest::READABLE)
            .unwrap();

        let mut events = Vec::new();
        selector
            .select(&mut events, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(events[0].token, Token(2));
    }
}
