//! Registered I/O objects and their parked-continuation slots.

use crate::reactor::poller::Event;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::task::Waker;

/// One side (read or write) of a source's wait state.
///
/// Holds at most one parked continuation. While the slot is occupied the
/// poller is armed for this direction on the owning descriptor; once the
/// reactor consumes the waker the slot is empty and the interest goes stale
/// until the next `update_io`.
#[derive(Debug, Default)]
pub(crate) struct Direction {
    waker: Option<Waker>,
}

impl Direction {
    /// Exchange the parked continuation with empty.
    pub(crate) fn take_handle(&mut self) -> Option<Waker> {
        self.waker.take()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waker.is_none()
    }

    fn set(&mut self, waker: &Waker) -> bool {
        if self.waker.is_some() {
            return false;
        }
        self.waker = Some(waker.clone());
        true
    }
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) read: Direction,
    pub(crate) write: Direction,
}

/// A registered I/O object: a file descriptor plus its wait state, owned by
/// the reactor and addressed by a stable slab key.
///
/// The reactor does not own the descriptor itself; closing it remains the
/// caller's job, after `remove_io`.
#[derive(Debug)]
pub struct Source {
    raw: RawFd,
    key: usize,
    pub(crate) state: Mutex<State>,
}

impl Source {
    pub(crate) fn new(raw: RawFd, key: usize) -> Source {
        Source {
            raw,
            key,
            state: Mutex::new(State::default()),
        }
    }

    /// The registered file descriptor.
    pub fn raw(&self) -> RawFd {
        self.raw
    }

    /// The stable key this source is registered under.
    pub fn key(&self) -> usize {
        self.key
    }

    /// Park a continuation waiting for readability. Fails if a continuation
    /// is already parked there.
    pub(crate) fn set_readable(&self, waker: &Waker) -> bool {
        self.state.lock().read.set(waker)
    }

    /// Park a continuation waiting for writability. Fails if a continuation
    /// is already parked there.
    pub(crate) fn set_writable(&self, waker: &Waker) -> bool {
        self.state.lock().write.set(waker)
    }

    /// Snapshot the interest mask implied by the current wait state.
    pub(crate) fn interest(&self) -> Event {
        let state = self.state.lock();
        let mut event = Event::none(self.key);
        if !state.read.is_empty() {
            event.readable = true;
        }
        if !state.write.is_empty() {
            event.writable = true;
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::counting_waker;

    #[test]
    fn direction_holds_at_most_one_waker() {
        let source = Source::new(0, 3);
        let (waker, _count) = counting_waker();

        assert!(source.set_readable(&waker));
        assert!(!source.set_readable(&waker));

        let taken = source.state.lock().read.take_handle();
        assert!(taken.is_some());
        assert!(source.set_readable(&waker));
    }

    #[test]
    fn interest_tracks_wait_state() {
        let source = Source::new(0, 9);
        let (waker, _count) = counting_waker();

        assert_eq!(source.interest(), Event::none(9));

        source.set_writable(&waker);
        assert_eq!(source.interest(), Event::writable(9));

        source.set_readable(&waker);
        let both = source.interest();
        assert!(both.readable && both.writable);

        source.state.lock().write.take_handle();
        assert_eq!(source.interest(), Event::readable(9));
    }
}
