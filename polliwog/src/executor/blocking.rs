//! Elastic thread pool for offloading synchronous calls.
//!
//! Tasks must never block a reactor driver or a worker on a synchronous
//! call; they hand the callable here instead. The pool grows while its
//! backlog outpaces the idle workers and shrinks by letting workers time
//! out, so an idle program carries no blocking threads at all.

use crate::runtime::ThreadNameFn;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send>;

/// Grow while the backlog exceeds this many jobs per idle worker.
const BACKLOG_PER_IDLE_WORKER: usize = 5;

#[derive(Clone)]
pub(crate) struct BlockingPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,

    /// Signals queued work to idle workers.
    queue_cv: Condvar,

    /// Signals a drained queue to `wait_empty`.
    empty_cv: Condvar,

    thread_limit: usize,
    idle_timeout: Duration,
    thread_name: ThreadNameFn,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    idle: usize,
    threads: usize,
}

impl BlockingPool {
    pub(crate) fn new(
        thread_limit: usize,
        idle_timeout: Duration,
        thread_name: ThreadNameFn,
    ) -> BlockingPool {
        BlockingPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                queue_cv: Condvar::new(),
                empty_cv: Condvar::new(),
                thread_limit,
                idle_timeout,
                thread_name,
            }),
        }
    }

    /// Offload `f` to the pool. The callable runs at most once, on some
    /// pool thread; the returned future resolves with its output wherever
    /// the awaiting task is resumed next — the pool makes no affinity
    /// guarantees.
    pub(crate) fn spawn<F, R>(&self, f: F) -> BlockingTask<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        BlockingTask {
            pool: self.clone(),
            job: Some(Box::new(f)),
            shared: Arc::new(TaskShared {
                state: Mutex::new(TaskState {
                    result: None,
                    waker: None,
                }),
            }),
        }
    }

    fn execute(&self, job: Job) {
        let mut state = self.inner.state.lock();
        state.queue.push_back(job);
        self.inner.queue_cv.notify_one();
        PoolInner::grow(&self.inner, &mut state);
    }

    /// Block until every queued job has been picked up by a worker.
    pub(crate) fn wait_empty(&self) {
        let mut state = self.inner.state.lock();
        while !state.queue.is_empty() {
            self.inner.empty_cv.wait(&mut state);
        }
    }
}

impl PoolInner {
    fn grow(inner: &Arc<PoolInner>, state: &mut PoolState) {
        while state.queue.len() > state.idle * BACKLOG_PER_IDLE_WORKER
            && state.threads < inner.thread_limit
        {
            state.threads += 1;
            state.idle += 1;
            inner.queue_cv.notify_all();
            debug!(threads = state.threads, "growing blocking pool");

            let worker = inner.clone();
            thread::Builder::new()
                .name((inner.thread_name)())
                .spawn(move || worker.worker_loop())
                .expect("failed to spawn blocking pool thread");
        }
    }

    fn worker_loop(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            state.idle -= 1;
            loop {
                let Some(job) = state.queue.pop_front() else {
                    break;
                };
                PoolInner::grow(&self, &mut state);
                if state.queue.is_empty() {
                    self.empty_cv.notify_all();
                }
                MutexGuard::unlocked(&mut state, job);
            }
            state.idle += 1;

            let timed_out = self
                .queue_cv
                .wait_for(&mut state, self.idle_timeout)
                .timed_out();
            if timed_out && state.queue.is_empty() {
                state.idle -= 1;
                state.threads -= 1;
                break;
            }
        }
    }
}

/// Awaitable handle for one offloaded callable.
pub struct BlockingTask<R> {
    pool: BlockingPool,
    job: Option<Box<dyn FnOnce() -> R + Send>>,
    shared: Arc<TaskShared<R>>,
}

struct TaskShared<R> {
    state: Mutex<TaskState<R>>,
}

struct TaskState<R> {
    result: Option<R>,
    waker: Option<Waker>,
}

impl<R> Future for BlockingTask<R>
where
    R: Send + 'static,
{
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();
        {
            let mut state = this.shared.state.lock();
            if let Some(value) = state.result.take() {
                return Poll::Ready(value);
            }
            // Register before submitting so the completion can never slip
            // between the check above and the suspension.
            state.waker = Some(cx.waker().clone());
        }

        if let Some(job) = this.job.take() {
            let shared = this.shared.clone();
            this.pool.execute(Box::new(move || {
                let value = job();
                let mut state = shared.state.lock();
                state.result = Some(value);
                let waker = state.waker.take();
                drop(state);
                if let Some(waker) = waker {
                    waker.wake();
                }
            }));
        }
        Poll::Pending
    }
}

impl<R> std::fmt::Debug for BlockingTask<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingTask")
            .field("submitted", &self.job.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::default_thread_name_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn test_pool(limit: usize) -> BlockingPool {
        BlockingPool::new(limit, Duration::from_millis(500), default_thread_name_fn())
    }

    #[test]
    fn jobs_run_and_wake_the_registered_waker() {
        let pool = test_pool(4);
        let ran = Arc::new(AtomicUsize::new(0));
        let (waker, count) = crate::test_utils::counting_waker();

        let mut task = Box::pin(pool.spawn({
            let ran = ran.clone();
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
                17
            }
        }));

        let mut cx = Context::from_waker(&waker);
        assert!(task.as_mut().poll(&mut cx).is_pending());

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.get() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.get(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(task.as_mut().poll(&mut cx), Poll::Ready(17));
    }

    #[test]
    fn pool_grows_under_backlog() {
        let pool = test_pool(8);
        let gate = Arc::new(AtomicUsize::new(0));

        // Each job parks until released, forcing the backlog heuristic to
        // add threads beyond the first.
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let (waker, _count) = crate::test_utils::counting_waker();
            let mut task = Box::pin(pool.spawn(move || {
                while gate.load(Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }));
            let mut cx = Context::from_waker(&waker);
            assert!(task.as_mut().poll(&mut cx).is_pending());
            tasks.push(task);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut peak = 0;
        while Instant::now() < deadline {
            peak = peak.max(pool.inner.state.lock().threads);
            if peak > 1 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        gate.store(1, Ordering::SeqCst);
        assert!(peak > 1, "pool never grew past one thread");

        pool.wait_empty();
    }

    #[test]
    fn idle_workers_terminate() {
        let pool = BlockingPool::new(4, Duration::from_millis(20), default_thread_name_fn());
        let (waker, count) = crate::test_utils::counting_waker();
        let mut task = Box::pin(pool.spawn(|| ()));
        let mut cx = Context::from_waker(&waker);
        assert!(task.as_mut().poll(&mut cx).is_pending());

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if count.get() > 0 && pool.inner.state.lock().threads == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.inner.state.lock().threads, 0);
    }
}
