//! Event loop
//!
//! One `EventLoop` per thread: it owns a selector, a timer queue and a
//! self-pipe waker, and drives one blocking wait-and-dispatch step at a
//! time. Cross-thread interaction is limited to `Waker::wake`, which makes
//! the loop's next `run_once` return with a `Woken` event.

pub mod selector;

pub use selector::{new_selector, Event, Interest, Selector, Token};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token reserved for the loop's internal wake pipe
const WAKE_TOKEN: Token = Token(usize::MAX);

/// One dispatch from `run_once`
#[derive(Debug, Clone, Copy)]
pub enum LoopEvent {
    /// An fd registration became ready
    Ready(Event),
    /// A timer armed with `set_timer` expired
    Timeout(Token),
    /// Another thread called `Waker::wake`
    Woken,
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    token: Token,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.token.0.cmp(&other.token.0))
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct WakeFd {
    fd: RawFd,
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Cross-thread wakeup handle for an `EventLoop`
#[derive(Clone)]
pub struct Waker {
    write_end: Arc<WakeFd>,
}

// The pipe write end is only ever written, never reconfigured.
unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    /// Wake the owning loop. Safe to call from any thread; coalesces.
    pub fn wake(&self) {
        let byte = 1u8;
        unsafe {
            // A full pipe already guarantees a pending wakeup.
            libc::write(self.write_end.fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// A readiness-driven event loop with timers and cross-thread wakeup
pub struct EventLoop {
    selector: Box<dyn Selector>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    active_timers: HashMap<usize, u64>,
    next_generation: u64,
    wake_read: WakeFd,
    waker: Waker,
}

impl EventLoop {
    /// Create a loop over the platform's preferred selector
    pub fn new() -> io::Result<Self> {
        let mut selector = new_selector()?;

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                let fd_flags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC);
            }
        }

        selector.register(fds[0], WAKE_TOKEN, Interest::READABLE)?;

        Ok(EventLoop {
            selector,
            timers: BinaryHeap::new(),
            active_timers: HashMap::new(),
            next_generation: 0,
            wake_read: WakeFd { fd: fds[0] },
            waker: Waker {
                write_end: Arc::new(WakeFd { fd: fds[1] }),
            },
        })
    }

    /// Get a cloneable handle that wakes this loop from another thread
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Register interest in an fd
    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.selector.register(fd, token, interest)
    }

    /// Change the interest of a registered fd
    pub fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.selector.reregister(fd, token, interest)
    }

    /// Remove an fd
    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.selector.deregister(fd)
    }

    /// Arm (or re-arm) the timer for a token. One timer per token; arming
    /// again replaces the previous deadline.
    pub fn set_timer(&mut self, token: Token, after: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.active_timers.insert(token.0, generation);
        self.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + after,
            token,
            generation,
        }));
    }

    /// Disarm the timer for a token
    pub fn clear_timer(&mut self, token: Token) {
        self.active_timers.remove(&token.0);
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        // Drop stale heap entries whose timer was re-armed or cleared.
        while let Some(Reverse(entry)) = self.timers.peek() {
            match self.active_timers.get(&entry.token.0) {
                Some(generation) if *generation == entry.generation => {
                    return Some(entry.deadline);
                }
                _ => {
                    self.timers.pop();
                }
            }
        }
        None
    }

    fn collect_expired(&mut self, now: Instant, out: &mut Vec<LoopEvent>) {
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            if let Some(Reverse(entry)) = self.timers.pop() {
                self.active_timers.remove(&entry.token.0);
                out.push(LoopEvent::Timeout(entry.token));
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_read.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// One blocking wait-and-dispatch step.
    ///
    /// Waits at most `max_wait` (or until the nearest timer deadline,
    /// whichever is sooner) and returns the batch of events observed.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> io::Result<Vec<LoopEvent>> {
        let now = Instant::now();
        let mut timeout = max_wait;
        if let Some(deadline) = self.next_deadline() {
            let until = deadline.saturating_duration_since(now);
            timeout = Some(match timeout {
                Some(t) => t.min(until),
                None => until,
            });
        }

        let mut raw = Vec::new();
        self.selector.select(&mut raw, timeout)?;

        let mut out = Vec::new();
        for event in raw {
            if event.token == WAKE_TOKEN {
                self.drain_wake_pipe();
                out.push(LoopEvent::Woken);
            } else {
                out.push(LoopEvent::Ready(event));
            }
        }

        self.collect_expired(Instant::now(), &mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::thread;

    #[test]
    fn test_wake_from_other_thread() {
        let mut event_loop = EventLoop::new().unwrap();
        let waker = event_loop.waker();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let events = event_loop.run_once(Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(events.as_slice(), [LoopEvent::Woken]));

        handle.join().unwrap();
    }

    #[test]
    fn test_timer_fires() {
        let mut event_loop = EventLoop::new().unwrap();
        event_loop.set_timer(Token(3), Duration::from_millis(20));

        let start = Instant::now();
        loop {
            let events = event_loop.run_once(Some(Duration::from_secs(5))).unwrap();
            if let Some(LoopEvent::Timeout(token)) = events.first() {
                assert_eq!(*token, Token(3));
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(5));
        }
    }

    #[test]
    fn test_timer_surfaces_within_one_wait() {
        // A deadline shorter than max_wait must be delivered by the same
        // run_once call, not deferred to a later pass.
        let mut event_loop = EventLoop::new().unwrap();
        event_loop.set_timer(Token(6), Duration::from_millis(60));

        let events = event_loop
            .run_once(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(matches!(events.as_slice(), [LoopEvent::Timeout(Token(6))]));
    }

    #[test]
    fn test_cleared_timer_does_not_fire() {
        let mut event_loop = EventLoop::new().unwrap();
        event_loop.set_timer(Token(4), Duration::from_millis(10));
        event_loop.clear_timer(Token(4));

        let events = event_loop
            .run_once(Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let mut event_loop = EventLoop::new().unwrap();
        event_loop.set_timer(Token(5), Duration::from_millis(10));
        event_loop.set_timer(Token(5), Duration::from_millis(60));

        let events = event_loop
            .run_once(Some(Duration::from_millis(30)))
            .unwrap();
        assert!(events.is_empty());

        let events = event_loop
            .run_once(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(matches!(events.as_slice(), [LoopEvent::Timeout(Token(5))]));
    }

    #[test]
    fn test_readiness_dispatch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut event_loop = EventLoop::new().unwrap();
        event_loop
            .register(server.as_raw_fd(), Token(9), Interest::READABLE)
            .unwrap();

        client.write_all(b"ping").unwrap();

        let events = event_loop.run_once(Some(Duration::from_secs(5))).unwrap();
        match events.as_slice() {
            [LoopEvent::Ready(event)] => {
                assert_eq!(event.token, Token(9));
                assert!(event.readable);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }
}
