//! The event-demultiplexing core.
//!
//! The reactor bridges OS readiness and timer expirations to suspended task
//! continuations. One *turn* (`ReactorLock::react`) drains pending timer
//! operations, computes a sleep bound, waits on the poller, collects the
//! continuations made ready by the events, and hands the batch to an
//! executor. The reactor never resumes a task itself.

use crate::error::IoError;
use crate::executor::Execute;
use parking_lot::{Mutex, MutexGuard};
use slab::Slab;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Waker;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub(crate) mod poller;
pub(crate) mod source;
pub(crate) mod timer;

pub use poller::Event;
pub use source::Source;

use poller::Poller;
use timer::Timers;

static REACTOR: OnceLock<Reactor> = OnceLock::new();

pub struct Reactor {
    poller: Poller,

    /// Bumped once per turn. Debugging and ordering aid only.
    ticker: AtomicUsize,

    /// Registry of live sources, addressed by stable slab keys.
    sources: Mutex<Slab<Arc<Source>>>,

    /// Event buffer for the current turn. Its guard doubles as the turn
    /// lock: whoever holds it is the driver.
    events: Mutex<Vec<Event>>,

    timers: Timers,
}

impl Reactor {
    fn new() -> Result<Reactor, IoError> {
        Ok(Reactor {
            poller: Poller::new()?,
            ticker: AtomicUsize::new(0),
            sources: Mutex::new(Slab::new()),
            events: Mutex::new(Vec::new()),
            timers: Timers::default(),
        })
    }

    /// The process-wide reactor, created on first use.
    pub fn get() -> &'static Reactor {
        REACTOR.get_or_init(|| Reactor::new().expect("failed to initialize the reactor"))
    }

    /// Number of turns completed or in progress since startup.
    pub fn ticker(&self) -> usize {
        self.ticker.load(Ordering::Relaxed)
    }

    /// Register a file descriptor and hand back its source.
    ///
    /// The descriptor stays owned by the caller; it must outlive the source
    /// and be deregistered with [`remove_io`](Self::remove_io) before close.
    pub fn insert_io(&self, raw: RawFd) -> Result<Arc<Source>, IoError> {
        let mut sources = self.sources.lock();
        let entry = sources.vacant_entry();
        let key = entry.key();
        let source = Arc::new(Source::new(raw, key));
        entry.insert(source.clone());
        drop(sources);

        if let Err(err) = self.poller.add(raw, Event::none(key)) {
            let removed = self.sources.lock().try_remove(key);
            debug_assert!(removed.is_some());
            return Err(err);
        }
        debug!(fd = raw, key, "registered I/O source");
        Ok(source)
    }

    /// Deregister a source. Outstanding parked continuations are dropped
    /// with the source entry; callers must not park concurrently with
    /// removal.
    ///
    /// # Panics
    ///
    /// Panics if the source is not in the registry — removing an unknown
    /// key is a contract violation, not a recoverable state.
    pub fn remove_io(&self, source: &Source) -> Result<(), IoError> {
        let mut sources = self.sources.lock();
        sources
            .try_remove(source.key())
            .expect("removed an I/O source that is not registered");
        debug!(fd = source.raw(), key = source.key(), "removed I/O source");
        self.poller.delete(source.raw())
    }

    /// Re-sync the poller's interest mask with the source's wait state:
    /// a direction is armed iff a continuation is parked there.
    pub fn update_io(&self, source: &Source) -> Result<(), IoError> {
        let sources = self.sources.lock();
        let source = sources
            .get(source.key())
            .expect("updated an I/O source that is not registered");
        self.poller.modify(source.raw(), source.interest())
    }

    /// Schedule `waker` to be resumed once `when` has passed. Returns the
    /// timer's id; `(when, id)` identifies the entry for removal.
    pub fn insert_timer(&self, when: Instant, waker: &Waker) -> u64 {
        let id = self.timers.insert(when, waker);
        // An in-flight wait may be sleeping past the new deadline.
        self.notify();
        id
    }

    /// Cancel a pending timer. Applied on the next turn; if the entry is
    /// still pending its continuation is dropped without being resumed.
    pub fn remove_timer(&self, when: Instant, id: u64) {
        self.timers.remove(when, id);
    }

    /// Wake the driver out of its poller wait.
    ///
    /// # Panics
    ///
    /// Panics if the wakeup channel fails; there is no way to run the
    /// engine without one.
    pub fn notify(&self) {
        self.poller.notify().expect("poller notify failed");
    }

    /// Become the driver: blocks until the current turn (if any) finishes.
    pub fn lock(&self) -> ReactorLock<'_> {
        ReactorLock {
            reactor: self,
            events: self.events.lock(),
        }
    }

    /// Become the driver only if no turn is in progress.
    pub fn try_lock(&self) -> Option<ReactorLock<'_>> {
        self.events.try_lock().map(|events| ReactorLock {
            reactor: self,
            events,
        })
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("ticker", &self.ticker())
            .field("sources", &self.sources.lock().len())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to one reactor turn. At most one exists at a time.
pub struct ReactorLock<'a> {
    reactor: &'a Reactor,
    events: MutexGuard<'a, Vec<Event>>,
}

impl ReactorLock<'_> {
    /// Run one turn: drain timers, wait for readiness up to the computed
    /// bound, collect ready continuations, and hand them to `executor`.
    ///
    /// `timeout` caps how long the turn may sleep; the earliest pending
    /// timer tightens it further. With no bound from either side the wait
    /// is unbounded and relies on [`Reactor::notify`] to be interrupted.
    pub fn react(
        &mut self,
        timeout: Option<Duration>,
        executor: &dyn Execute,
    ) -> Result<(), IoError> {
        let mut handles = Vec::new();

        let next_timer = self.reactor.timers.process(&mut handles);
        let wait_timeout = match (timeout, next_timer) {
            (Some(timeout), Some(next_timer)) => Some(timeout.min(next_timer)),
            (Some(timeout), None) => Some(timeout),
            (None, next_timer) => next_timer,
        };

        let tick = self.reactor.ticker.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(tick, ?wait_timeout, "reactor turn");

        let res = match self.reactor.poller.wait(&mut self.events, wait_timeout) {
            Ok(0) => {
                // The wait had budget and used it up (or was interrupted):
                // timers may have matured in the meantime.
                if wait_timeout != Some(Duration::ZERO) {
                    self.reactor.timers.process(&mut handles);
                }
                Ok(())
            }
            Ok(_) => {
                let sources = self.reactor.sources.lock();
                for event in self.events.iter() {
                    // The source may have raced a `remove_io`; its parked
                    // continuations are already gone then.
                    let Some(source) = sources.get(event.key) else {
                        continue;
                    };
                    let mut state = source.state.lock();
                    // When one event reports both directions, the write
                    // side wins and the read side waits for a later turn
                    // (after interest is re-synced). Deliberate, inherited
                    // behavior; each wake consumes at most one continuation
                    // per direction.
                    if event.writable {
                        if let Some(waker) = state.write.take_handle() {
                            handles.push(waker);
                        }
                    } else if event.readable {
                        if let Some(waker) = state.read.take_handle() {
                            handles.push(waker);
                        }
                    }
                }
                Ok(())
            }
            Err(err) => Err(err),
        };

        // Resumption never happens under reactor locks: the executor only
        // enqueues the handles, and the sources/timers locks are released.
        executor.execute(handles);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{DirectExecutor, counting_waker, pipe, socketpair};
    use static_assertions::assert_impl_all;
    use std::os::fd::AsRawFd;

    assert_impl_all!(Reactor: Send, Sync);
    assert_impl_all!(Source: Send, Sync);

    #[test]
    fn insert_then_remove_restores_registry_state() {
        let reactor = Reactor::get();
        let (reader, _writer) = pipe();

        let source = reactor.insert_io(reader.as_raw_fd()).unwrap();
        let key = source.key();
        assert!(reactor.sources.lock().contains(key));

        reactor.remove_io(&source).unwrap();
        assert!(!reactor.sources.lock().contains(key));

        // The fd can be registered again from scratch.
        let source = reactor.insert_io(reader.as_raw_fd()).unwrap();
        reactor.remove_io(&source).unwrap();
    }

    #[test]
    fn update_io_is_idempotent() {
        let reactor = Reactor::get();
        let (reader, _writer) = pipe();
        let source = reactor.insert_io(reader.as_raw_fd()).unwrap();
        let (waker, _count) = counting_waker();

        assert!(source.set_readable(&waker));
        reactor.update_io(&source).unwrap();
        reactor.update_io(&source).unwrap();

        reactor.remove_io(&source).unwrap();
    }

    #[test]
    fn readiness_wakes_the_parked_continuation() {
        let reactor = Reactor::get();
        let (reader, writer) = pipe();
        let source = reactor.insert_io(reader.as_raw_fd()).unwrap();

        let (waker, count) = counting_waker();
        assert!(source.set_readable(&waker));
        reactor.update_io(&source).unwrap();

        let payload = b"ping";
        unsafe { libc::write(writer.as_raw_fd(), payload.as_ptr().cast(), payload.len()) };

        // Bounded in case another test's turn already drained the event.
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.get() == 0 && Instant::now() < deadline {
            reactor
                .lock()
                .react(Some(Duration::from_millis(50)), &DirectExecutor)
                .unwrap();
        }

        assert_eq!(count.get(), 1);
        assert!(source.state.lock().read.is_empty());
        reactor.remove_io(&source).unwrap();
    }

    #[test]
    fn combined_event_prefers_the_write_side() {
        let reactor = Reactor::get();
        let (local, remote) = socketpair();
        let source = reactor.insert_io(local.as_raw_fd()).unwrap();

        let (read_waker, read_count) = counting_waker();
        let (write_waker, write_count) = counting_waker();
        assert!(source.set_readable(&read_waker));
        assert!(source.set_writable(&write_waker));
        reactor.update_io(&source).unwrap();

        // Make the socket readable as well; its buffer is empty so it is
        // already writable, producing a single combined event.
        let payload = b"x";
        unsafe { libc::write(remote.as_raw_fd(), payload.as_ptr().cast(), payload.len()) };

        let deadline = Instant::now() + Duration::from_secs(5);
        while write_count.get() == 0 && Instant::now() < deadline {
            reactor
                .lock()
                .react(Some(Duration::from_millis(50)), &DirectExecutor)
                .unwrap();
        }

        assert_eq!(write_count.get(), 1);
        assert_eq!(read_count.get(), 0);
        assert!(!source.state.lock().read.is_empty());

        // Once interest is re-synced to the read side only, the reader
        // gets its turn.
        reactor.update_io(&source).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while read_count.get() == 0 && Instant::now() < deadline {
            reactor
                .lock()
                .react(Some(Duration::from_millis(50)), &DirectExecutor)
                .unwrap();
        }
        assert_eq!(read_count.get(), 1);

        reactor.remove_io(&source).unwrap();
    }

    #[test]
    fn zero_timeout_turn_does_not_block() {
        let reactor = Reactor::get();
        let start = Instant::now();
        reactor
            .lock()
            .react(Some(Duration::ZERO), &DirectExecutor)
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn notify_interrupts_a_sleeping_turn() {
        let reactor = Reactor::get();
        let handle = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(10));
            Reactor::get().notify();
        });

        let start = Instant::now();
        reactor
            .lock()
            .react(Some(Duration::from_secs(10)), &DirectExecutor)
            .unwrap();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let reactor = Reactor::get();
        let (waker, count) = counting_waker();
        let when = Instant::now() + Duration::from_millis(100);
        let id = reactor.insert_timer(when, &waker);
        reactor.remove_timer(when, id);

        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            reactor
                .lock()
                .react(Some(Duration::from_millis(20)), &DirectExecutor)
                .unwrap();
        }
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn matured_timer_reaches_the_executor() {
        let reactor = Reactor::get();
        let (waker, count) = counting_waker();
        reactor.insert_timer(Instant::now() + Duration::from_millis(10), &waker);

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.get() == 0 && Instant::now() < deadline {
            reactor
                .lock()
                .react(Some(Duration::from_millis(50)), &DirectExecutor)
                .unwrap();
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn try_lock_yields_to_the_current_driver() {
        let reactor = Reactor::get();
        let turn = reactor.lock();
        assert!(reactor.try_lock().is_none());
        drop(turn);

        // Another test may be driving a turn right now; it will let go.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut acquired = false;
        while !acquired && Instant::now() < deadline {
            acquired = reactor.try_lock().is_some();
        }
        assert!(acquired);
    }

    #[test]
    fn ticker_advances_once_per_turn() {
        let reactor = Reactor::get();
        let before = reactor.ticker();
        reactor
            .lock()
            .react(Some(Duration::ZERO), &DirectExecutor)
            .unwrap();
        assert!(reactor.ticker() > before);
    }
}
