//! Work-stealing multi-thread executor.
//!
//! N workers each own a LIFO deque; a shared injector receives work pushed
//! from outside the pool and overflow. A worker looks for its next task in
//! its own deque first (hot cache), then batch-steals from the injector,
//! then raids its siblings in a shuffled order so the search pattern is
//! different on every worker.

use crate::executor::{BlockingPool, BlockingTask, Execute};
use crate::reactor::Reactor;
use crate::runtime::RuntimeConfig;
use crate::task::{OnFinish, Task};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::future::Future;
use std::iter;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Waker;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// How many passes over the injector and the sibling queues a worker makes
/// before giving up and parking.
const MAX_STEAL_RETRIES: usize = 4;

thread_local! {
    /// Set while the current thread is one of the pool's workers, so
    /// schedules from inside the pool land on the local deque.
    static CURRENT: RefCell<Option<Rc<WorkerContext>>> = const { RefCell::new(None) };
}

/// Handle to a running worker pool. Cheap to clone; workers are joined by
/// [`shutdown`](StealingExecutor::shutdown).
#[derive(Clone, Debug)]
pub struct StealingExecutor {
    shared: Arc<Shared>,
}

struct Shared {
    /// Externally pushed and overflow work.
    injector: Injector<Arc<Task>>,

    /// Every worker's steal handle, used by the park check.
    stealers: Vec<Stealer<Arc<Task>>>,

    /// Outstanding detached tasks. `block` cannot return while nonzero.
    spawn_count: AtomicUsize,

    /// Parked-worker accounting; the condvar wakes them on new injector
    /// work and on shutdown.
    idle: Mutex<usize>,
    unparked: Condvar,

    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,

    blocking: OnceLock<BlockingPool>,
    cfg: RuntimeConfig,
}

struct WorkerContext {
    shared: Arc<Shared>,
    local: WorkerQueue<Arc<Task>>,
    stealers: Vec<Stealer<Arc<Task>>>,
}

impl StealingExecutor {
    /// Start a pool with `worker_threads` workers.
    ///
    /// # Panics
    ///
    /// Panics if `worker_threads` is zero.
    #[track_caller]
    pub fn new(worker_threads: usize) -> StealingExecutor {
        assert!(worker_threads > 0, "worker threads cannot be set to 0");
        StealingExecutor::with_config(RuntimeConfig {
            worker_threads,
            ..RuntimeConfig::default()
        })
    }

    pub(crate) fn with_config(cfg: RuntimeConfig) -> StealingExecutor {
        let queues: Vec<WorkerQueue<Arc<Task>>> =
            (0..cfg.worker_threads).map(|_| WorkerQueue::new_lifo()).collect();
        let stealers: Vec<Stealer<Arc<Task>>> = queues.iter().map(|q| q.stealer()).collect();

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: stealers.clone(),
            spawn_count: AtomicUsize::new(0),
            idle: Mutex::new(0),
            unparked: Condvar::new(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            blocking: OnceLock::new(),
            cfg,
        });

        for (index, local) in queues.into_iter().enumerate() {
            // Each worker raids its siblings in its own shuffled order to
            // spread contention.
            let mut siblings: Vec<Stealer<Arc<Task>>> = stealers
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, s)| s.clone())
                .collect();
            fastrand::shuffle(&mut siblings);

            let worker_shared = shared.clone();
            let mut builder = thread::Builder::new().name((shared.cfg.thread_name)());
            if let Some(stack_size) = shared.cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }
            let handle = builder
                .spawn(move || {
                    let ctx = Rc::new(WorkerContext {
                        shared: worker_shared,
                        local,
                        stealers: siblings,
                    });
                    ctx.run();
                })
                .expect("failed to spawn worker thread");
            shared.workers.lock().push(handle);
        }

        StealingExecutor { shared }
    }

    /// Spawn a task whose completion is tracked only through the executor's
    /// spawn count. Workers start on it immediately; no `block` is needed.
    pub fn spawn_detach<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.spawn_count.fetch_add(1, Ordering::Acquire);
        let counter = self.shared.clone();
        let schedule = self.shared.clone();
        let task = Task::new(
            OnFinish::new(future, move |()| {
                counter.spawn_count.fetch_sub(1, Ordering::Release);
                Reactor::get().notify();
            }),
            move |task| schedule.schedule(task),
        );
        task.schedule();
    }

    /// Submit `future` to the pool and drive the reactor from the calling
    /// thread until the root has produced its value and the detached spawn
    /// count is zero.
    pub fn block<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = self.shared.clone();
        let output = Arc::new(Mutex::new(None));
        let slot = output.clone();
        let schedule = shared.clone();
        let root = Task::new(
            OnFinish::new(future, move |value| {
                *slot.lock() = Some(value);
                Reactor::get().notify();
            }),
            move |task| schedule.schedule(task),
        );
        root.schedule();

        let reactor = Reactor::get();
        loop {
            if output.lock().is_some() && shared.spawn_count.load(Ordering::Acquire) == 0 {
                break;
            }
            if let Err(err) = reactor.lock().react(None, self) {
                panic!("reactor turn failed: {err}");
            }
        }

        let value = output.lock().take();
        value.expect("root task completed without producing a value")
    }

    /// Offload a synchronous callable to the blocking pool and await its
    /// output without stalling any worker.
    pub fn block_spawn<F, R>(&self, f: F) -> BlockingTask<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.shared.blocking_pool().spawn(f)
    }

    /// Stop the workers and join them. Queued tasks that never ran are
    /// dropped. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _idle = self.shared.idle.lock();
            self.shared.unparked.notify_all();
        }

        let workers: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }

        loop {
            match self.shared.injector.steal() {
                Steal::Success(task) => drop(task),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        debug!("stealing executor shut down");
    }

    #[cfg(test)]
    pub(crate) fn spawn_count(&self) -> usize {
        self.shared.spawn_count.load(Ordering::Acquire)
    }
}

impl Execute for StealingExecutor {
    fn execute(&self, handles: Vec<Waker>) {
        for waker in handles {
            waker.wake();
        }
    }
}

impl Shared {
    fn schedule(&self, task: Arc<Task>) {
        CURRENT.with(|current| match current.borrow().as_ref() {
            // A worker scheduling onto its own pool keeps the task local:
            // LIFO pop means the freshly woken task is still hot, and the
            // deque tail stays open for siblings to steal.
            Some(ctx) if std::ptr::eq(Arc::as_ptr(&ctx.shared), self) => ctx.local.push(task),
            _ => {
                self.injector.push(task);
                self.unpark_one();
            }
        });
    }

    fn unpark_one(&self) {
        let _idle = self.idle.lock();
        self.unparked.notify_one();
    }

    fn blocking_pool(&self) -> &BlockingPool {
        self.blocking.get_or_init(|| {
            BlockingPool::new(
                self.cfg.max_blocking_threads,
                self.cfg.blocking_idle_timeout,
                self.cfg.thread_name.clone(),
            )
        })
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(pool) = self.blocking.get() {
            pool.wait_empty();
        }
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StealingExecutor")
            .field("workers", &self.stealers.len())
            .field("spawned", &self.spawn_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    fn run(self: Rc<WorkerContext>) {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
        debug!("worker started");

        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            match self.find_task() {
                Some(task) => task.run(),
                None => self.park(),
            }
        }

        CURRENT.with(|current| *current.borrow_mut() = None);
        debug!("worker stopped");
    }

    fn find_task(&self) -> Option<Arc<Task>> {
        // Own deque first: freshly pushed tasks are the hottest, and LIFO
        // keeps them on this core.
        self.local.pop().or_else(|| {
            iter::repeat_with(|| {
                // Injector work is claimed in batches so one synchronized
                // grab covers several future iterations.
                self.shared
                    .injector
                    .steal_batch_and_pop(&self.local)
                    .or_else(|| self.stealers.iter().map(|s| s.steal()).collect())
            })
            .take(MAX_STEAL_RETRIES)
            .find(|steal| !steal.is_retry())
            .and_then(|steal| steal.success())
        })
    }

    /// Sleep until new injector work or shutdown. The final re-check runs
    /// under the idle lock, which every unpark also takes: a push can never
    /// slip between the check and the wait.
    fn park(&self) {
        let shared = &self.shared;
        let mut idle = shared.idle.lock();
        if shared.shutdown.load(Ordering::Acquire)
            || !shared.injector.is_empty()
            || shared.stealers.iter().any(|s| !s.is_empty())
        {
            return;
        }
        *idle += 1;
        shared.unparked.wait(&mut idle);
        *idle -= 1;
    }
}
