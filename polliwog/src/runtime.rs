//! Runtime facade: builder, validated configuration, and the handle that
//! ties an executor flavor to the reactor.

use crate::executor::{BlockingTask, InlineExecutor, StealingExecutor};
use anyhow::{Result, anyhow};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const MAX_BLOCKING_THREADS: usize = 512;

/// Blocking-pool workers exit after sitting idle this long.
const BLOCKING_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) type ThreadNameFn = Arc<dyn Fn() -> String + Send + Sync + 'static>;

pub(crate) fn default_thread_name_fn() -> ThreadNameFn {
    let counter = Arc::new(AtomicUsize::new(0));
    Arc::new(move || {
        let prev = counter.fetch_add(1, Ordering::Relaxed);
        format!("polliwog-worker-{}", prev)
    })
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Inline,
    Stealing,
}

/// Configures and creates a [`Runtime`].
pub struct Builder {
    /// Runtime flavor.
    kind: Kind,

    /// Number of worker threads. Only meaningful for the stealing flavor.
    ///
    /// Defaults to one worker per CPU core.
    worker_threads: Option<usize>,

    /// Hard cap on blocking-pool threads.
    max_blocking_threads: usize,

    /// Idle time after which a blocking-pool worker exits.
    blocking_idle_timeout: Duration,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("kind", &self.kind)
            .field("worker_threads", &self.worker_threads)
            .field("max_blocking_threads", &self.max_blocking_threads)
            .field("blocking_idle_timeout", &self.blocking_idle_timeout)
            .field("thread_stack_size", &self.thread_stack_size)
            .finish_non_exhaustive()
    }
}

impl Builder {
    fn new(kind: Kind) -> Builder {
        Builder {
            kind,
            worker_threads: None,
            max_blocking_threads: MAX_BLOCKING_THREADS,
            blocking_idle_timeout: BLOCKING_IDLE_TIMEOUT,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    /// Returns a new builder with the inline (single-threaded, cooperative)
    /// flavor selected.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new_inline() -> Builder {
        Builder::new(Kind::Inline)
    }

    /// Returns a new builder with the work-stealing flavor selected.
    pub fn new_stealing() -> Builder {
        Builder::new(Kind::Stealing)
    }

    /// Sets the number of worker threads for the stealing flavor.
    ///
    /// # Panics
    ///
    /// Panics if `val` is zero.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Builder {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Caps how many threads the blocking pool may grow to.
    pub fn max_blocking_threads(mut self, val: usize) -> Builder {
        self.max_blocking_threads = val;
        self
    }

    /// Sets how long a blocking-pool worker may sit idle before exiting.
    pub fn blocking_idle_timeout(mut self, val: Duration) -> Builder {
        self.blocking_idle_timeout = val;
        self
    }

    /// Sets the name of threads spawned by the runtime.
    ///
    /// The default name is "polliwog-worker-{N}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Builder {
        let val = val.into();
        self.thread_name = Arc::new(move || val.clone());
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// runtime.
    pub fn thread_name_fn<F>(mut self, f: F) -> Builder
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = Arc::new(f);
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies a minimal stack size.
    pub fn thread_stack_size(mut self, val: usize) -> Builder {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured `Runtime`.
    ///
    /// The returned `Runtime` instance is ready to spawn tasks.
    pub fn try_build(self) -> Result<Runtime> {
        let kind = self.kind;
        let cfg: RuntimeConfig = self.try_into()?;
        let flavor = match kind {
            Kind::Inline => Flavor::Inline(InlineExecutor::with_config(cfg)),
            Kind::Stealing => Flavor::Stealing(StealingExecutor::with_config(cfg)),
        };
        Ok(Runtime { flavor })
    }
}

/// Validated snapshot of a [`Builder`], consumed by the executors.
#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) kind: Kind,
    pub(crate) worker_threads: usize,
    pub(crate) max_blocking_threads: usize,
    pub(crate) blocking_idle_timeout: Duration,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.max_blocking_threads == 0 {
            return Err(anyhow!("max_blocking_threads must be greater than 0"));
        }
        if self.blocking_idle_timeout.is_zero() {
            return Err(anyhow!("blocking_idle_timeout must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            kind: Kind::Stealing,
            worker_threads: thread::available_parallelism().map_or(1, |n| n.get()),
            max_blocking_threads: MAX_BLOCKING_THREADS,
            blocking_idle_timeout: BLOCKING_IDLE_TIMEOUT,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<RuntimeConfig> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = RuntimeConfig {
            kind: builder.kind,
            worker_threads,
            max_blocking_threads: builder.max_blocking_threads,
            blocking_idle_timeout: builder.blocking_idle_timeout,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("kind", &self.kind)
            .field("worker_threads", &self.worker_threads)
            .field("max_blocking_threads", &self.max_blocking_threads)
            .field("blocking_idle_timeout", &self.blocking_idle_timeout)
            .field("thread_name", &"<function>")
            .field("thread_stack_size", &self.thread_stack_size)
            .finish()
    }
}

#[derive(Debug)]
enum Flavor {
    Inline(InlineExecutor),
    Stealing(StealingExecutor),
}

/// A handle to one configured executor flavor plus the shared reactor.
#[derive(Debug)]
pub struct Runtime {
    flavor: Flavor,
}

impl Runtime {
    /// Drive `future` to completion on this runtime, along with everything
    /// it spawns. See the executor flavors for the exact quiescence rules.
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.flavor {
            Flavor::Inline(executor) => executor.block(future),
            Flavor::Stealing(executor) => executor.block(future),
        }
    }

    /// Spawn a detached task; its completion is observable only through
    /// [`block_on`](Self::block_on) refusing to return before it finishes.
    pub fn spawn_detach<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.flavor {
            Flavor::Inline(executor) => executor.spawn_detach(future),
            Flavor::Stealing(executor) => executor.spawn_detach(future),
        }
    }

    /// Offload a synchronous callable to the blocking pool.
    pub fn block_spawn<F, R>(&self, f: F) -> BlockingTask<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match &self.flavor {
            Flavor::Inline(executor) => executor.block_spawn(f),
            Flavor::Stealing(executor) => executor.block_spawn(f),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        match &self.flavor {
            Flavor::Inline(_) => {}
            Flavor::Stealing(executor) => executor.shutdown(),
        }
    }
}

// Test-only helpers
#[cfg(test)]
impl Runtime {
    pub(crate) fn expect_inline(&self) -> InlineExecutor {
        match &self.flavor {
            Flavor::Inline(executor) => executor.clone(),
            _ => panic!("runtime is not using the inline flavor"),
        }
    }

    pub(crate) fn expect_stealing(&self) -> StealingExecutor {
        match &self.flavor {
            Flavor::Stealing(executor) => executor.clone(),
            _ => panic!("runtime is not using the stealing flavor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Runtime: Send, Sync);
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    #[test]
    fn inline_runtime_blocks_on_a_value() {
        let runtime = Builder::new_inline().try_build().unwrap();
        assert_eq!(runtime.block_on(async { 40 + 2 }), 42);
    }

    #[rstest]
    #[case::one(1)]
    #[case::four(4)]
    fn stealing_runtime_blocks_on_a_value(#[case] workers: usize) {
        let runtime = Builder::new_stealing()
            .worker_threads(workers)
            .try_build()
            .unwrap();
        assert_eq!(runtime.block_on(async { 40 + 2 }), 42);
    }

    #[test]
    fn zero_blocking_cap_is_rejected() {
        let res = Builder::new_inline().max_blocking_threads(0).try_build();
        assert!(res.is_err());
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let res = Builder::new_inline()
            .blocking_idle_timeout(Duration::ZERO)
            .try_build();
        assert!(res.is_err());
    }

    #[test]
    #[should_panic(expected = "worker threads")]
    fn zero_worker_threads_panics() {
        let _ = Builder::new_stealing().worker_threads(0);
    }

    #[test]
    fn worker_threads_are_named() {
        let runtime = Builder::new_stealing()
            .worker_threads(1)
            .thread_name("renamed-worker")
            .try_build()
            .unwrap();
        let name = runtime.block_on(async {
            thread::current().name().map(str::to_owned)
        });
        assert_eq!(name.as_deref(), Some("renamed-worker"));
    }
}
