//! Shared helpers for unit and scenario tests.

use crate::executor::Execute;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

/// Spy waker: counts how many times it has been woken.
struct CountingWake(Arc<AtomicUsize>);

impl Wake for CountingWake {
    fn wake(self: Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observer half of a [`counting_waker`].
pub(crate) struct WakeCount(Arc<AtomicUsize>);

impl WakeCount {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) fn counting_waker() -> (Waker, WakeCount) {
    let count = Arc::new(AtomicUsize::new(0));
    let waker = Waker::from(Arc::new(CountingWake(count.clone())));
    (waker, WakeCount(count))
}

/// Executor that delivers wakes inline, with no queue behind it. Enough to
/// drive reactor-level tests where the waker itself records the resumption.
pub(crate) struct DirectExecutor;

impl Execute for DirectExecutor {
    fn execute(&self, handles: Vec<Waker>) {
        for waker in handles {
            waker.wake();
        }
    }
}

/// A nonblocking pipe as (reader, writer).
pub(crate) fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    assert_eq!(res, 0, "pipe2 failed");
    // Safety: pipe2 returned two freshly opened descriptors.
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// A nonblocking unix stream socket pair.
pub(crate) fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(res, 0, "socketpair failed");
    // Safety: socketpair returned two freshly opened descriptors.
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}
