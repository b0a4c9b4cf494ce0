//! The awaitable surface: readiness on a source's two directions, timer
//! sleeps, and a cooperative yield.

use crate::error::IoError;
use crate::reactor::{Reactor, Source};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Wait until `source` is ready for reading.
///
/// Resolves once the reactor observes readability; the caller then performs
/// the actual (nonblocking) read and re-awaits if it gets `WouldBlock`.
pub fn readable(source: &Arc<Source>) -> Readable<'_> {
    Readable {
        source,
        armed: false,
    }
}

/// Wait until `source` is ready for writing.
pub fn writable(source: &Arc<Source>) -> Writable<'_> {
    Writable {
        source,
        armed: false,
    }
}

/// Suspend the current task for at least `duration`.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        when: Instant::now() + duration,
        id: None,
    }
}

/// Let other ready tasks run before this one continues.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Readable<'a> {
    source: &'a Arc<Source>,
    armed: bool,
}

impl Future for Readable<'_> {
    type Output = Result<(), IoError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.armed {
            // Our waker leaves the slot only when the reactor consumed it,
            // i.e. the direction became ready.
            if self.source.state.lock().read.is_empty() {
                self.armed = false;
                return Poll::Ready(Ok(()));
            }
            return Poll::Pending;
        }

        if !self.source.set_readable(cx.waker()) {
            panic!("another task is already waiting for this source to become readable");
        }
        // Arm the poller for the direction we just parked in.
        if let Err(err) = Reactor::get().update_io(self.source) {
            self.source.state.lock().read.take_handle();
            return Poll::Ready(Err(err));
        }
        self.armed = true;
        Poll::Pending
    }
}

impl Drop for Readable<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.source.state.lock().read.take_handle();
            let _ = Reactor::get().update_io(self.source);
        }
    }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Writable<'a> {
    source: &'a Arc<Source>,
    armed: bool,
}

impl Future for Writable<'_> {
    type Output = Result<(), IoError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.armed {
            if self.source.state.lock().write.is_empty() {
                self.armed = false;
                return Poll::Ready(Ok(()));
            }
            return Poll::Pending;
        }

        if !self.source.set_writable(cx.waker()) {
            panic!("another task is already waiting for this source to become writable");
        }
        if let Err(err) = Reactor::get().update_io(self.source) {
            self.source.state.lock().write.take_handle();
            return Poll::Ready(Err(err));
        }
        self.armed = true;
        Poll::Pending
    }
}

impl Drop for Writable<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.source.state.lock().write.take_handle();
            let _ = Reactor::get().update_io(self.source);
        }
    }
}

/// Timer future. Registers itself lazily on first poll; dropping it before
/// the deadline cancels the timer, so the continuation is never resumed.
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct Sleep {
    when: Instant,
    id: Option<u64>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.when {
            return Poll::Ready(());
        }
        if self.id.is_none() {
            self.id = Some(Reactor::get().insert_timer(self.when, cx.waker()));
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            // A no-op if the timer already fired; the entry is gone then.
            Reactor::get().remove_timer(self.when, id);
        }
    }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
