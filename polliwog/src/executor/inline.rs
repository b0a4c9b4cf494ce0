//! Single-threaded cooperative executor.

use crate::executor::{BlockingPool, BlockingTask, Execute};
use crate::reactor::Reactor;
use crate::runtime::RuntimeConfig;
use crate::task::{OnFinish, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Waker;
use std::thread::{self, ThreadId};

/// Runs tasks on the thread that calls [`block`](InlineExecutor::block),
/// interleaving queue drains with reactor turns. Handles are cheap clones
/// sharing one run queue.
#[derive(Clone, Debug)]
pub struct InlineExecutor {
    shared: Arc<Shared>,
}

struct Shared {
    /// Ready continuations, resumed only inside `block`.
    queue: Mutex<VecDeque<Arc<Task>>>,

    /// Outstanding detached tasks. `block` cannot return while nonzero.
    spawn_count: AtomicUsize,

    /// Thread currently inside `block`, if any. Wakes arriving from other
    /// threads must rouse it out of the poller wait.
    driver: Mutex<Option<ThreadId>>,

    blocking: OnceLock<BlockingPool>,
    cfg: RuntimeConfig,
}

impl InlineExecutor {
    pub fn new() -> InlineExecutor {
        InlineExecutor::with_config(RuntimeConfig::default())
    }

    pub(crate) fn with_config(cfg: RuntimeConfig) -> InlineExecutor {
        InlineExecutor {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                spawn_count: AtomicUsize::new(0),
                driver: Mutex::new(None),
                blocking: OnceLock::new(),
                cfg,
            }),
        }
    }

    /// Spawn a task whose completion is tracked only through the executor's
    /// spawn count. [`block`](Self::block) will not return before every
    /// detached task has completed.
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

    /// Drive `future` to completion, along with every task spawned on this
    /// executor. Returns only once the root has produced its value, the
    /// detached spawn count is zero, and the run queue is empty.
    pub fn block<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = self.shared.clone();
        {
            let mut driver = shared.driver.lock();
            assert!(
                driver.is_none(),
                "this executor is already blocking on a task"
            );
            *driver = Some(thread::current().id());
        }

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
            loop {
                let task = shared.queue.lock().pop_front();
                match task {
                    Some(task) => task.run(),
                    None => break,
                }
            }

            if output.lock().is_some()
                && shared.spawn_count.load(Ordering::Acquire) == 0
                && shared.queue.lock().is_empty()
            {
                break;
            }

            if let Err(err) = reactor.lock().react(None, self) {
                panic!("reactor turn failed: {err}");
            }
        }

        *shared.driver.lock() = None;
        let value = output.lock().take();
        value.expect("root task completed without producing a value")
    }

    /// Offload a synchronous callable to the blocking pool and await its
    /// output without stalling this executor.
    pub fn block_spawn<F, R>(&self, f: F) -> BlockingTask<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.shared.blocking_pool().spawn(f)
    }

    #[cfg(test)]
    pub(crate) fn spawn_count(&self) -> usize {
        self.shared.spawn_count.load(Ordering::Acquire)
    }
}

impl Default for InlineExecutor {
    fn default() -> Self {
        InlineExecutor::new()
    }
}

impl Execute for InlineExecutor {
    fn execute(&self, handles: Vec<Waker>) {
        for waker in handles {
            waker.wake();
        }
    }
}

impl Shared {
    fn schedule(&self, task: Arc<Task>) {
        self.queue.lock().push_back(task);

        // A wake from a blocking-pool thread (or any foreign thread) has to
        // rouse the driver out of its poller wait; a wake from the driver
        // itself is drained by the loop it is already running.
        let driver = self.driver.lock();
        if let Some(id) = *driver
            && id != thread::current().id()
        {
            Reactor::get().notify();
        }
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
        // Offloaded work that was queued must at least be picked up before
        // the executor goes away.
        if let Some(pool) = self.blocking.get() {
            pool.wait_empty();
        }
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineExecutor")
            .field("queued", &self.queue.lock().len())
            .field("spawned", &self.spawn_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
