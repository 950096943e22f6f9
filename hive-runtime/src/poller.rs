//! Event-readiness multiplexer for the scheduler's idle wait.
//!
//! One epoll instance watches three kinds of source, each reported back as
//! the [`Token`] it was registered under:
//!
//! - a `timerfd` per armed timer (level-triggered until acknowledged),
//! - socket fds registered one-shot by the TCP collaborator,
//! - an `eventfd` [`Waker`] that other threads (the I/O worker, a
//!   [`ShutdownHandle`](crate::ShutdownHandle)) write to interrupt a wait.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

/// Key under which a source is registered; an index into the kernel's
/// source table.
pub(crate) type Token = usize;

const WAKE_TOKEN: u64 = u64::MAX;

/// Maximum number of epoll events to process per poll call.
const MAX_EVENTS: usize = 64;

/// Readiness a socket waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Readable,
    Writable,
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn owned(fd: libc::c_int) -> io::Result<OwnedFd> {
    let fd = cvt(fd)?;
    // SAFETY: `fd` was just returned by a successful syscall and nothing
    // else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::from(d.subsec_nanos()),
    }
}

/// Milliseconds for `epoll_wait`, rounded up so a short timeout never
/// degenerates into a busy poll.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    let Some(d) = timeout else {
        return -1;
    };
    let ms = d.as_nanos().div_ceil(1_000_000);
    libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
}

// ── Waker ───────────────────────────────────────────────────────────────────

/// Cross-thread handle that interrupts [`Poller::poll`].
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers.
        let fd = owned(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        Ok(Waker { fd })
    }

    /// Make the current or next poll return promptly.
    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: writes eight bytes from a live local. A full counter
        // (EAGAIN) already guarantees a pending wakeup.
        unsafe {
            libc::write(self.fd.as_raw_fd(), (&raw const one).cast(), 8);
        }
    }

    fn drain(&self) {
        let mut count: u64 = 0;
        // SAFETY: reads eight bytes into a live local.
        unsafe {
            libc::read(self.fd.as_raw_fd(), (&raw mut count).cast(), 8);
        }
    }
}

// ── Timer handle ────────────────────────────────────────────────────────────

/// A `timerfd` owned by one timer-table entry.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    fd: OwnedFd,
}

// ── Poller ──────────────────────────────────────────────────────────────────

/// The scheduler's epoll instance.
#[derive(Debug)]
pub(crate) struct Poller {
    epfd: OwnedFd,
    waker: Arc<Waker>,
    buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers.
        let epfd = owned(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let waker = Arc::new(Waker::new()?);
        let poller = Poller {
            epfd,
            waker,
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        };
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.waker.fd.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKE_TOKEN,
        )?;
        Ok(poller)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: data };
        // SAFETY: `ev` is a live local; the kernel copies it.
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &raw mut ev) })?;
        Ok(())
    }

    /// Shared waker for other threads.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Arm a timer that becomes ready after `delay` and then every
    /// `interval`.
    pub(crate) fn add_timer(
        &self,
        token: Token,
        delay: Duration,
        interval: Option<Duration>,
    ) -> io::Result<TimerHandle> {
        // SAFETY: plain syscall, no pointers.
        let fd = owned(unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        })?;
        // An all-zero it_value disarms the timer.
        let spec = libc::itimerspec {
            it_value: timespec(delay.max(Duration::from_nanos(1))),
            it_interval: timespec(interval.unwrap_or(Duration::ZERO)),
        };
        // SAFETY: `spec` is a live local; the old-value pointer may be null.
        cvt(unsafe {
            libc::timerfd_settime(fd.as_raw_fd(), 0, &raw const spec, std::ptr::null_mut())
        })?;
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd.as_raw_fd(),
            libc::EPOLLIN as u32,
            token as u64,
        )?;
        Ok(TimerHandle { fd })
    }

    /// Stop watching a timer. Dropping the handle closes the `timerfd`.
    pub(crate) fn remove_timer(&self, handle: TimerHandle) {
        let _ = self.ctl(libc::EPOLL_CTL_DEL, handle.fd.as_raw_fd(), 0, 0);
    }

    /// Consume a timer's expirations; 0 when it has not fired.
    pub(crate) fn ack_timer(&self, handle: &TimerHandle) -> u64 {
        let mut expirations: u64 = 0;
        // SAFETY: reads eight bytes into a live local.
        let n = unsafe {
            libc::read(
                handle.fd.as_raw_fd(),
                (&raw mut expirations).cast(),
                8,
            )
        };
        if n == 8 {
            expirations
        } else {
            0
        }
    }

    /// Watch `fd` for one readiness event of `interest`.
    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let events = match interest {
            Interest::Readable => libc::EPOLLIN | libc::EPOLLRDHUP,
            Interest::Writable => libc::EPOLLOUT,
        } | libc::EPOLLONESHOT;
        #[expect(clippy::cast_sign_loss, reason = "epoll flag bits")]
        let events = events as u32;
        match self.ctl(libc::EPOLL_CTL_ADD, fd, events, token as u64) {
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, events, token as u64)
            }
            other => other,
        }
    }

    /// Stop watching `fd`. Unknown or closed fds are ignored.
    pub(crate) fn deregister(&self, fd: RawFd) {
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0);
    }

    /// Wait up to `timeout` (forever when `None`) and append the tokens of
    /// ready sources to `out`. Wakeups are consumed, not reported.
    pub(crate) fn poll(&mut self, out: &mut Vec<Token>, timeout: Option<Duration>) -> io::Result<()> {
        let max = libc::c_int::try_from(self.buf.len()).unwrap_or(libc::c_int::MAX);
        // SAFETY: `buf` holds `max` initialised events.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                max,
                timeout_ms(timeout),
            )
        };
        let n = match cvt(n) {
            Ok(n) => n.unsigned_abs() as usize,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };
        for ev in &self.buf[..n] {
            let data = ev.u64;
            if data == WAKE_TOKEN {
                self.waker.drain();
                trace!("poller woken");
                continue;
            }
            #[expect(
                clippy::cast_possible_truncation,
                reason = "tokens are stored from usize"
            )]
            out.push(data as Token);
        }
        Ok(())
    }
}
