use std::fmt::Debug;
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{ConfigError, ProtocolViolation};

type FaultHandler = Arc<dyn Fn(ProtocolViolation) + Send + Sync>;

/// Runtime settings shared by [`Executor`](crate::Executor) and
/// [`Scheduler`](crate::Scheduler).
///
/// Transforms and task bodies are invoked on a rayon pool: the global one by
/// default, or a dedicated pool set up with [`Config::threads`] or
/// [`Config::pool`].
///
/// # Example
///
/// ```rust
/// use concur::Config;
///
/// let config = Config::new()
///     .threads(4)
///     .unwrap()
///     .on_fault(|fault| eprintln!("{fault}"));
/// ```
#[derive(Clone, Default)]
pub struct Config {
    pool: Option<Arc<ThreadPool>>,
    on_fault: Option<FaultHandler>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs work on a dedicated pool with `threads` workers. Zero is
    /// rejected; use the default global pool for automatic sizing.
    pub fn threads(self, threads: usize) -> Result<Self, ConfigError> {
        if threads == 0 {
            return Err(ConfigError::NoWorkers);
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("concur-worker-{i}"))
            .build()?;

        Ok(self.pool(Arc::new(pool)))
    }

    /// Runs work on an existing pool.
    pub fn pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Installs the side channel for protocol violations. Without one,
    /// violations are logged at `error` level.
    pub fn on_fault<F>(mut self, handler: F) -> Self
    where
        F: Fn(ProtocolViolation) + Send + Sync + 'static,
    {
        self.on_fault = Some(Arc::new(handler));
        self
    }

    /// Queues `job` on the configured pool. Jobs queued from the same thread
    /// start in the order they were queued.
    pub(crate) fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.pool {
            Some(pool) => pool.spawn_fifo(job),
            None => rayon::spawn_fifo(job),
        }
    }

    /// Reports a violation out of band, never on the caller's stack.
    pub(crate) fn report(&self, violation: ProtocolViolation) {
        match self.on_fault.clone() {
            Some(handler) => self.spawn(move || handler(violation)),
            None => self.spawn(move || {
                tracing::error!(unit = %violation.unit, calls = violation.calls, "{violation}");
            }),
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("threads", &self.pool.as_ref().map(|p| p.current_num_threads()))
            .field("on_fault", &self.on_fault.is_some())
            .finish()
    }
}
