//! Suspension values yielded by cooperative steps.
//!
//! Every operation that may block returns [`Poll<T>`]: either the final
//! value, or a [`PollNeeded`] describing the blocking point as a file
//! descriptor plus an interest mask. The value is plain data; it carries no
//! reference to any event loop.

use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::Error;

/// Readiness directions a suspended step is waiting for.
///
/// Masks describe what the *transport* needs, which for a TLS session may
/// be the opposite of the logical operation (a read that must first write
/// handshake records, or vice versa).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);

    pub fn is_readable(self) -> bool {
        self.0 & Interest::READABLE.0 != 0
    }
    pub fn is_writable(self) -> bool {
        self.0 & Interest::WRITABLE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// A blocking point: resume the suspended step once `fd` offers the
/// readiness described by `interest`.
#[derive(Debug, Clone)]
pub struct PollNeeded {
    fd: RawFd,
    interest: Interest,
}

impl PollNeeded {
    pub(crate) fn new(fd: RawFd, interest: Interest) -> PollNeeded {
        PollNeeded { fd, interest }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Block the calling thread until the readiness holds.
    ///
    /// Returns `false` if the timeout expired first. Uses `poll(2)`, which
    /// does not suffer from file-descriptor-number limits.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = 0 as libc::c_short;
        if self.interest.is_readable() {
            events |= libc::POLLIN;
        }
        if self.interest.is_writable() {
            events |= libc::POLLOUT;
        }
        loop {
            let ms: libc::c_int = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(false);
                    }
                    // round up so the final wait doesn't spin
                    let left = (d - now).as_millis() as i64 + 1;
                    left.min(i32::MAX as i64) as libc::c_int
                }
                None => -1,
            };
            let mut pfd = libc::pollfd {
                fd: self.fd,
                events,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if rc > 0 {
                return Ok(true);
            }
            // timed out this round; the loop re-checks the deadline
        }
    }
}

/// Result of one cooperative step.
#[derive(Debug)]
pub enum Async<T> {
    /// The step finished.
    Ready(T),
    /// The step would block; resume after the described readiness.
    NotReady(PollNeeded),
}

impl<T> Async<T> {
    pub fn is_ready(&self) -> bool {
        match *self {
            Async::Ready(..) => true,
            Async::NotReady(..) => false,
        }
    }
}

/// Shorthand for what every cooperative step returns.
pub type Poll<T> = Result<Async<T>, Error>;

/// Unwrap a [`Poll`] expression, propagating errors and suspensions.
///
/// Useful when composing cooperative steps into larger ones outside the
/// crate; the suspension value bubbles out unchanged.
#[macro_export]
macro_rules! try_ready {
    ($e:expr) => {
        match $e? {
            $crate::Async::Ready(v) => v,
            $crate::Async::NotReady(p) => return Ok($crate::Async::NotReady(p)),
        }
    };
}
