//! Bounded-concurrency iteration over an [`OrderedView`].
//!
//! The executor keeps a cursor into the view and a count of transforms in
//! flight. Entries are dispatched strictly in view order while the count is
//! under the [`Limit`]. Each completion records its output under the entry's
//! original key and, unless an error has been recorded, tops the in-flight
//! set back up.
//!
//! The first error stops new dispatch and delivers the final outcome right
//! away, carrying a snapshot of what had completed. Transforms already in
//! flight are not interrupted; whatever they report afterwards is ignored.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::collection::{Collected, OrderedView, Slots};
use crate::completion::{Completion, Signal};
use crate::config::Config;
use crate::core::{Key, panic_message};
use crate::error::RunError;
use crate::handle::{Finish, Outcome, RunHandle};

/// Maximum number of transforms in flight at once.
///
/// `Bounded(0)` is what an unspecified limit means: nothing is scheduled and
/// the run completes immediately with an empty result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unbounded,
    Bounded(usize),
}

impl Limit {
    /// One entry at a time.
    pub const SERIES: Limit = Limit::Bounded(1);

    pub fn schedules_nothing(self) -> bool {
        matches!(self, Limit::Bounded(0))
    }

    fn admits(self, in_flight: usize) -> bool {
        match self {
            Limit::Unbounded => true,
            Limit::Bounded(limit) => in_flight < limit,
        }
    }
}

impl From<usize> for Limit {
    fn from(value: usize) -> Self {
        Limit::Bounded(value)
    }
}

impl From<Option<usize>> for Limit {
    fn from(value: Option<usize>) -> Self {
        Limit::Bounded(value.unwrap_or(0))
    }
}

impl From<f64> for Limit {
    fn from(value: f64) -> Self {
        if value == f64::INFINITY {
            Limit::Unbounded
        } else if value.is_nan() || value < 1.0 {
            Limit::Bounded(0)
        } else {
            Limit::Bounded(value as usize)
        }
    }
}

type Transform<C, V, T> = Arc<dyn Fn(&C, V, &Key, Completion<T>) + Send + Sync>;

/// Runs a transform over every entry of a view with a concurrency cap.
///
/// The context `C` is passed by reference to every transform invocation.
///
/// # Example
///
/// ```rust
/// use concur::{Executor, Limit, OrderedView};
///
/// let handle = Executor::new().run(
///     OrderedView::sequence([1, 2, 3]),
///     Limit::Bounded(2),
///     |_, n: i32, _, done| done.ok(n * 10),
/// );
///
/// let results = handle.wait().unwrap();
/// assert_eq!(results.get(2usize), Some(&30));
/// ```
pub struct Executor<C = ()> {
    context: Arc<C>,
    config: Config,
}

impl Executor<()> {
    pub fn new() -> Self {
        Self::with_context(())
    }
}

impl Default for Executor<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Executor<C>
where
    C: Send + Sync + 'static,
{
    pub fn with_context(context: C) -> Self {
        Self {
            context: Arc::new(context),
            config: Config::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a run and returns its completion channel.
    pub fn run<V, T, F>(
        &self,
        view: impl Into<OrderedView<V>>,
        limit: impl Into<Limit>,
        transform: F,
    ) -> RunHandle<Collected<T>>
    where
        V: Send + 'static,
        T: Send + 'static,
        F: Fn(&C, V, &Key, Completion<T>) + Send + Sync + 'static,
    {
        let (finish, handle) = RunHandle::channel();
        self.start(view.into(), limit.into(), Arc::new(transform), finish);
        handle
    }

    /// Starts a run and calls `on_done` exactly once with its outcome.
    pub fn run_with<V, T, F, D>(
        &self,
        view: impl Into<OrderedView<V>>,
        limit: impl Into<Limit>,
        transform: F,
        on_done: D,
    ) where
        V: Send + 'static,
        T: Send + 'static,
        F: Fn(&C, V, &Key, Completion<T>) + Send + Sync + 'static,
        D: FnOnce(Outcome<Collected<T>>) + Send + 'static,
    {
        self.start(view.into(), limit.into(), Arc::new(transform), Box::new(on_done));
    }

    pub(crate) fn start<V, T>(
        &self,
        view: OrderedView<V>,
        limit: Limit,
        transform: Transform<C, V, T>,
        finish: Finish<Collected<T>>,
    ) where
        V: Send + 'static,
        T: Send + 'static,
    {
        let (shape, entries) = view.into_parts();
        let span = tracing::debug_span!("executor.run", entries = entries.len(), limit = ?limit);

        if entries.is_empty() || limit.schedules_nothing() {
            tracing::debug!(parent: &span, "nothing to schedule");
            let empty = Collected::empty(shape);
            self.config.spawn(move || finish(Ok(empty)));
            return;
        }

        let total = entries.len();
        let pending = entries
            .into_iter()
            .enumerate()
            .map(|(position, (key, value))| (position, key, value))
            .collect();

        let run = Arc::new(Run {
            context: self.context.clone(),
            transform,
            config: self.config.clone(),
            span,
            state: Mutex::new(ExecutionState {
                limit,
                pending,
                started: 0,
                completed: 0,
                results: Slots::new(shape, total),
                error: false,
                finish: Some(finish),
            }),
        });

        let mut state = run.lock();
        let batch = state.next_batch();
        Run::dispatch(&run, batch);
    }
}

/// Bookkeeping for one run. Mutated only from completion callbacks, always
/// under the run's lock.
pub(crate) struct ExecutionState<V, T> {
    limit: Limit,
    /// Entries not dispatched yet, in view order, with their position.
    pending: VecDeque<(usize, Key, V)>,
    started: usize,
    completed: usize,
    results: Slots<T>,
    /// Set once the first error is recorded; no new dispatch after that.
    error: bool,
    /// Present until the final outcome is delivered.
    finish: Option<Finish<Collected<T>>>,
}

impl<V, T> ExecutionState<V, T> {
    fn in_flight(&self) -> usize {
        self.started - self.completed
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight() == 0
    }

    /// Pops as many pending entries as the limit admits.
    fn next_batch(&mut self) -> Vec<(usize, Key, V)> {
        let mut batch = Vec::new();

        if self.error || self.finish.is_none() {
            return batch;
        }

        while self.limit.admits(self.in_flight()) {
            match self.pending.pop_front() {
                Some(entry) => {
                    self.started += 1;
                    batch.push(entry);
                }
                None => break,
            }
        }

        batch
    }
}

struct Run<C, V, T> {
    context: Arc<C>,
    transform: Transform<C, V, T>,
    config: Config,
    span: tracing::Span,
    state: Mutex<ExecutionState<V, T>>,
}

impl<C, V, T> Run<C, V, T>
where
    C: Send + Sync + 'static,
    V: Send + 'static,
    T: Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, ExecutionState<V, T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `batch` on the pool. Called with the state lock held, so
    /// batches from concurrent completions reach the pool in view order.
    fn dispatch(run: &Arc<Self>, batch: Vec<(usize, Key, V)>) {
        for (position, key, value) in batch {
            tracing::debug!(parent: &run.span, %key, "dispatch");

            let completion = {
                let run = Arc::clone(run);
                let key = key.clone();
                Completion::new(format!("entry {key}"), run.config.clone(), move |signal| {
                    Run::settle(&run, position, key, signal)
                })
            };

            let job = Arc::clone(run);
            run.config
                .spawn(move || job.invoke(value, key, completion));
        }
    }

    fn invoke(&self, value: V, key: Key, completion: Completion<T>) {
        let span = tracing::trace_span!(parent: &self.span, "transform", %key);
        let _enter = span.enter();

        let guard = completion.clone();
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.transform)(&self.context, value, &key, completion)
        }));

        if let Err(panic) = result {
            let message = panic_message(panic.as_ref());
            let failure = anyhow::anyhow!("entry {key} panicked: {message}");

            if !guard.complete_if_pending(Err(failure)) {
                // Already completed, so the panic came after that, possibly
                // from the final callback run on this stack.
                tracing::error!(parent: &self.span, %key, "panic after completion: {message}");
            }
        }
    }

    fn settle(run: &Arc<Self>, position: usize, key: Key, signal: Signal<T>) {
        let mut deliver = None;

        {
            let mut state = run.lock();
            state.completed += 1;

            if state.finish.is_none() {
                tracing::debug!(parent: &run.span, %key, "completion after finish ignored");
                return;
            }

            let batch = match signal {
                Signal::Completed(Ok(value)) => {
                    tracing::debug!(parent: &run.span, %key, "completed");
                    state.results.record(position, key, value);

                    if state.is_drained() {
                        let results = state.results.take();
                        deliver = state.finish.take().map(|finish| (finish, Ok(results)));
                        Vec::new()
                    } else {
                        state.next_batch()
                    }
                }
                Signal::Completed(Err(error)) => {
                    tracing::debug!(parent: &run.span, %key, "failed, short-circuiting");
                    state.error = true;
                    let partial = state.results.take();
                    deliver = state
                        .finish
                        .take()
                        .map(|finish| (finish, Err(RunError::Failed { error, partial })));
                    Vec::new()
                }
                Signal::Dropped => {
                    tracing::debug!(parent: &run.span, %key, "completion dropped");
                    state.error = true;
                    let unit = format!("entry {key}");
                    deliver = state
                        .finish
                        .take()
                        .map(|finish| (finish, Err(RunError::Abandoned { unit })));
                    Vec::new()
                }
            };

            Run::dispatch(run, batch);
        }

        if let Some((finish, outcome)) = deliver {
            tracing::debug!(parent: &run.span, "finished");
            finish(outcome);
        }
    }
}
