use std::fmt::{Debug, Display, Formatter};

use thiserror::Error;

/// Raised while building a [`DependencyGraph`](crate::DependencyGraph), before
/// any task has a chance to run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Dependency cycle detected between tasks: {}", .tasks.join(" -> "))]
    Cycle { tasks: Vec<String> },

    #[error("Task '{0}' is declared more than once")]
    DuplicateTask(String),

    #[error("Final selection refers to unknown task '{0}'")]
    UnknownSelection(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("A dedicated pool needs at least one worker")]
    NoWorkers,
}

/// A completion parameter was invoked more times than the contract allows.
///
/// This never travels through a run's own result. It is handed to the fault
/// sink configured with [`Config::on_fault`](crate::Config::on_fault).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Completion for {unit} was called {calls} times")]
pub struct ProtocolViolation {
    /// Which unit of work misbehaved, e.g. `entry 2` or `task 'fetch'`.
    pub unit: String,
    /// How many times the completion has been invoked so far.
    pub calls: usize,
}

/// Why a run finished without a complete result.
pub enum RunError<R> {
    /// A transform or task reported a failure. `partial` is the result as it
    /// stood when the failure was recorded.
    Failed { error: anyhow::Error, partial: R },
    /// A completion parameter was dropped without ever being invoked, so the
    /// run could not finish.
    Abandoned { unit: String },
}

impl<R> RunError<R> {
    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            RunError::Failed { error, .. } => Some(error),
            RunError::Abandoned { .. } => None,
        }
    }

    pub fn partial(&self) -> Option<&R> {
        match self {
            RunError::Failed { partial, .. } => Some(partial),
            RunError::Abandoned { .. } => None,
        }
    }

    pub fn into_partial(self) -> Option<R> {
        match self {
            RunError::Failed { partial, .. } => Some(partial),
            RunError::Abandoned { .. } => None,
        }
    }

    pub fn map_partial<U>(self, f: impl FnOnce(R) -> U) -> RunError<U> {
        match self {
            RunError::Failed { error, partial } => RunError::Failed {
                error,
                partial: f(partial),
            },
            RunError::Abandoned { unit } => RunError::Abandoned { unit },
        }
    }
}

impl<R> Debug for RunError<R>
where
    R: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Failed { error, partial } => f
                .debug_struct("Failed")
                .field("error", error)
                .field("partial", partial)
                .finish(),
            RunError::Abandoned { unit } => {
                f.debug_struct("Abandoned").field("unit", unit).finish()
            }
        }
    }
}

impl<R> Display for RunError<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Failed { error, .. } => write!(f, "Run failed: {error:#}"),
            RunError::Abandoned { unit } => {
                write!(f, "Run abandoned: completion for {unit} was dropped")
            }
        }
    }
}

impl<R> std::error::Error for RunError<R>
where
    R: Debug,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Failed { error, .. } => {
                let source: &(dyn std::error::Error + 'static) = error.as_ref();
                Some(source)
            }
            RunError::Abandoned { .. } => None,
        }
    }
}
