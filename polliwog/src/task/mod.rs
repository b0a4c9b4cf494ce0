//! The suspendable unit of work.
//!
//! A [`Task`] is an `Arc`-backed record pairing a pinned future with the
//! schedule function of the executor that owns it. Waking the task's
//! [`Waker`] reschedules the record; polling happens only when an executor
//! runs it. Completion is observed exclusively through [`OnFinish`], which
//! hands the future's output to a hook exactly once.

use parking_lot::Mutex;
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A spawned task: the root continuation of one suspendable computation.
///
/// The future slot empties when the task completes; a wake arriving after
/// that reschedules a hollow record whose `run` is a no-op.
pub(crate) struct Task {
    future: Mutex<Option<BoxFuture>>,
    schedule: Box<dyn Fn(Arc<Task>) + Send + Sync>,
}

impl Task {
    pub(crate) fn new<F, S>(future: F, schedule: S) -> Arc<Task>
    where
        F: Future<Output = ()> + Send + 'static,
        S: Fn(Arc<Task>) + Send + Sync + 'static,
    {
        Arc::new(Task {
            future: Mutex::new(Some(Box::pin(future))),
            schedule: Box::new(schedule),
        })
    }

    /// Hand the task to its executor's queue.
    pub(crate) fn schedule(self: Arc<Task>) {
        (self.schedule)(self.clone());
    }

    /// Poll the task once. On completion the future is dropped in place, so
    /// no continuation for it can exist afterwards.
    pub(crate) fn run(self: Arc<Task>) {
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_ready() {
            *slot = None;
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        (self.schedule)(self.clone());
    }

    fn wake_by_ref(self: &Arc<Self>) {
        (self.schedule)(self.clone());
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("completed", &self.future.lock().is_none())
            .finish_non_exhaustive()
    }
}

/// Adapter invoking `hook` with the inner future's output when it
/// completes. The hook is consumed by the call, so it fires exactly once
/// per task, and only on completion.
#[pin_project]
pub(crate) struct OnFinish<F, C>
where
    F: Future,
    C: FnOnce(F::Output),
{
    #[pin]
    future: F,
    hook: Option<C>,
}

impl<F, C> OnFinish<F, C>
where
    F: Future,
    C: FnOnce(F::Output),
{
    pub(crate) fn new(future: F, hook: C) -> OnFinish<F, C> {
        OnFinish {
            future,
            hook: Some(hook),
        }
    }
}

impl<F, C> Future for OnFinish<F, C>
where
    F: Future,
    C: FnOnce(F::Output),
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match this.future.poll(cx) {
            Poll::Ready(output) => {
                let hook = this.hook.take().expect("completion hook already fired");
                hook(output);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::counting_waker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn waking_reschedules_through_the_executor_hook() {
        let scheduled = Arc::new(AtomicUsize::new(0));
        let observed = scheduled.clone();
        let task = Task::new(async {}, move |_task| {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        Waker::from(task.clone()).wake_by_ref();
        Waker::from(task.clone()).wake();
        assert_eq!(scheduled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn completed_task_ignores_further_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = hits.clone();
        let task = Task::new(
            async move {
                observed.fetch_add(1, Ordering::SeqCst);
            },
            |_task| {},
        );

        task.clone().run();
        task.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_fires_exactly_once_with_the_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut wrapped = Box::pin(OnFinish::new(async { 7 }, move |value| {
            sink.lock().push(value);
        }));

        let (waker, _count) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(wrapped.as_mut().poll(&mut cx).is_ready());
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn hook_does_not_fire_before_completion() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let mut wrapped = Box::pin(OnFinish::new(std::future::pending::<()>(), move |()| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        let (waker, _count) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(wrapped.as_mut().poll(&mut cx).is_pending());
        assert!(wrapped.as_mut().poll(&mut cx).is_pending());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
