//! Thin wrapper around the OS readiness primitive.
//!
//! The backend is `epoll` plus an `eventfd` used as the wakeup channel. The
//! rest of the crate only relies on the abstract contract: register an fd
//! under a stable key, change its interest set, wait for readiness triples,
//! and interrupt a concurrent wait from another thread.

use crate::error::IoError;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::trace;

/// Readiness interest or readiness result for one registered descriptor.
///
/// The same shape serves both directions of the API: `add`/`modify` read it
/// as an interest mask, `wait` produces it as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Stable key of the source this event belongs to.
    pub key: usize,
    pub readable: bool,
    pub writable: bool,
}

impl Event {
    pub fn none(key: usize) -> Event {
        Event {
            key,
            readable: false,
            writable: false,
        }
    }

    pub fn readable(key: usize) -> Event {
        Event {
            key,
            readable: true,
            writable: false,
        }
    }

    pub fn writable(key: usize) -> Event {
        Event {
            key,
            readable: false,
            writable: true,
        }
    }
}

/// Key reserved for the eventfd wakeup channel. Slab keys grow from zero so
/// the two can never collide.
const NOTIFY_KEY: usize = usize::MAX;

/// Upper bound on events drained per `wait` call.
const EVENT_CAPACITY: usize = 64;

pub(crate) struct Poller {
    epoll: OwnedFd,
    notifier: OwnedFd,
}

impl Poller {
    pub(crate) fn new() -> Result<Poller, IoError> {
        let epoll = syscall(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // Safety: epoll_create1 returned a freshly opened descriptor.
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let notifier = syscall(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
        // Safety: eventfd returned a freshly opened descriptor.
        let notifier = unsafe { OwnedFd::from_raw_fd(notifier) };

        let poller = Poller { epoll, notifier };
        poller.ctl(
            libc::EPOLL_CTL_ADD,
            poller.notifier.as_raw_fd(),
            Event::readable(NOTIFY_KEY),
        )?;
        Ok(poller)
    }

    /// Register `fd` under the key carried by `event`. The initial interest
    /// is usually empty; `modify` arms directions as continuations park.
    pub(crate) fn add(&self, fd: RawFd, event: Event) -> Result<(), IoError> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, event)
    }

    /// Replace the interest set for an already registered `fd`.
    pub(crate) fn modify(&self, fd: RawFd, event: Event) -> Result<(), IoError> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, event)
    }

    /// Unregister `fd`.
    pub(crate) fn delete(&self, fd: RawFd) -> Result<(), IoError> {
        syscall(unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Block until at least one registered descriptor is ready, the timeout
    /// elapses, or another thread calls [`notify`](Self::notify).
    ///
    /// `None` waits without bound; `Some(Duration::ZERO)` polls and returns
    /// immediately. Fills `events` with readiness triples and returns how
    /// many were produced. A wakeup or an interrupting signal surfaces as a
    /// spurious `Ok(0)`, never as an error.
    pub(crate) fn wait(
        &self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> Result<usize, IoError> {
        let mut buf = [libc::epoll_event { events: 0, u64: 0 }; EVENT_CAPACITY];
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                buf.as_mut_ptr(),
                buf.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            return match IoError::last_os_error() {
                IoError::Interrupted => Ok(0),
                err => Err(err),
            };
        }

        events.clear();
        for raw in &buf[..n as usize] {
            let key = raw.u64 as usize;
            if key == NOTIFY_KEY {
                self.drain_notifier();
                continue;
            }
            // Hangup surfaces as readability (the next read observes EOF);
            // errors surface on the write side as well so a parked writer
            // sees the failure from its next I/O call.
            events.push(Event {
                key,
                readable: raw.events
                    & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLHUP | libc::EPOLLERR) as u32
                    != 0,
                writable: raw.events & (libc::EPOLLOUT | libc::EPOLLERR) as u32 != 0,
            });
        }
        trace!(events = events.len(), "poller woke");
        Ok(events.len())
    }

    /// Interrupt a concurrent `wait` on another thread. Concurrent calls
    /// coalesce into a single wakeup.
    pub(crate) fn notify(&self) -> Result<(), IoError> {
        let increment = 1u64.to_ne_bytes();
        let res = unsafe {
            libc::write(
                self.notifier.as_raw_fd(),
                increment.as_ptr().cast(),
                increment.len(),
            )
        };
        if res < 0 {
            match IoError::last_os_error() {
                // The counter is already nonzero; the pending wakeup covers us.
                IoError::WouldBlock => {}
                err => return Err(err),
            }
        }
        Ok(())
    }

    fn drain_notifier(&self) {
        let mut counter = [0u8; 8];
        unsafe {
            libc::read(
                self.notifier.as_raw_fd(),
                counter.as_mut_ptr().cast(),
                counter.len(),
            )
        };
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, event: Event) -> Result<(), IoError> {
        let mut mask = 0u32;
        if event.readable {
            mask |= libc::EPOLLIN as u32;
        }
        if event.writable {
            mask |= libc::EPOLLOUT as u32;
        }
        let mut raw = libc::epoll_event {
            events: mask,
            u64: event.key as u64,
        };
        syscall(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut raw) })?;
        Ok(())
    }
}

fn syscall(res: libc::c_int) -> Result<libc::c_int, IoError> {
    if res < 0 {
        Err(IoError::last_os_error())
    } else {
        Ok(res)
    }
}

/// epoll timeouts are whole milliseconds; round up so a sub-millisecond
/// sleep cannot degenerate into a zero-timeout spin.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let millis = t.as_nanos().div_ceil(1_000_000);
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
