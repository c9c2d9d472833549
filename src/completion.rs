use std::any::Any;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::Config;
use crate::core::Dynamic;
use crate::error::ProtocolViolation;

/// What a unit of work eventually tells its engine.
pub(crate) enum Signal<T> {
    Completed(anyhow::Result<T>),
    /// Every handle to the completion was dropped before it was invoked.
    Dropped,
}

type Sink<T> = Box<dyn FnOnce(Signal<T>) + Send>;

struct Inner<T> {
    unit: String,
    calls: AtomicUsize,
    sink: Mutex<Option<Sink<T>>>,
    config: Config,
}

impl<T> Inner<T> {
    fn take_sink(&self) -> Option<Sink<T>> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let sink = self
            .sink
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(sink) = sink {
            sink(Signal::Dropped);
        }
    }
}

/// The completion parameter handed to every transform and task body.
///
/// It must be invoked exactly once, either right away or later from any
/// thread. Clones share the same once-guard: a second invocation through any
/// of them changes nothing in the run and is reported as a
/// [`ProtocolViolation`] through the configured fault sink. Dropping every
/// clone without invoking it abandons the run.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Completion<T> {
    pub(crate) fn new<F>(unit: String, config: Config, sink: F) -> Self
    where
        F: FnOnce(Signal<T>) + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                unit,
                calls: AtomicUsize::new(0),
                sink: Mutex::new(Some(Box::new(sink))),
                config,
            }),
        }
    }

    pub fn complete(&self, outcome: anyhow::Result<T>) {
        let calls = self.inner.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if calls == 1 {
            if let Some(sink) = self.inner.take_sink() {
                sink(Signal::Completed(outcome));
            }
        } else {
            self.inner.config.report(ProtocolViolation {
                unit: self.inner.unit.clone(),
                calls,
            });
        }
    }

    pub fn ok(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(&self, error: impl Into<anyhow::Error>) {
        self.complete(Err(error.into()));
    }

    pub fn is_completed(&self) -> bool {
        self.inner.calls.load(Ordering::SeqCst) > 0
    }

    /// The unit of work this completion belongs to, e.g. `entry 2`.
    pub fn unit(&self) -> &str {
        &self.inner.unit
    }

    /// Completes only if nobody has yet. Returns whether this call won.
    pub(crate) fn complete_if_pending(&self, outcome: anyhow::Result<T>) -> bool {
        let won = self
            .inner
            .calls
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if won {
            if let Some(sink) = self.inner.take_sink() {
                sink(Signal::Completed(outcome));
            }
        }

        won
    }

    /// Builds a completion accepting `U` that forwards into this one through
    /// `f`. The new completion carries its own once-guard.
    ///
    /// Dropping the new completion unused only releases its handle on this
    /// one, so a caller still holding a clone can settle it, e.g. with a
    /// panic caught around the code that dropped it.
    pub(crate) fn adapt<U, F>(self, f: F) -> Completion<U>
    where
        T: 'static,
        U: 'static,
        F: FnOnce(U) -> T + Send + 'static,
    {
        let unit = self.inner.unit.clone();
        let config = self.inner.config.clone();

        Completion::new(unit, config, move |signal| match signal {
            Signal::Completed(outcome) => {
                self.complete_if_pending(outcome.map(f));
            }
            Signal::Dropped => drop(self),
        })
    }
}

impl Completion<Dynamic> {
    /// Completes a task with a value of any type.
    pub fn value<V>(&self, value: V)
    where
        V: Any + Send + Sync,
    {
        self.ok(Arc::new(value));
    }
}

impl<T> Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("unit", &self.inner.unit)
            .field("calls", &self.inner.calls.load(Ordering::SeqCst))
            .finish()
    }
}
