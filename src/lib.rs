#![forbid(unsafe_code)]
//! Bounded-concurrency iteration over collections and dependency-graph task
//! scheduling.
//!
//! Two engines make up the crate:
//!
//! * [`Executor`] drives the entries of an [`OrderedView`] through a
//!   transform, with at most [`Limit`] transforms in flight, short-circuiting
//!   on the first error. The pick family ([`Executor::pick`],
//!   [`Executor::pick_series`], [`Executor::pick_limit`]) is built on it.
//! * [`Scheduler`] runs a [`DependencyGraph`] of named tasks, starting each
//!   task once all of its dependencies are done.
//!
//! Transforms and task bodies receive a [`Completion`] which must be invoked
//! exactly once, right away or later from any thread. Every run returns a
//! [`RunHandle`] and also has a callback form.
//!
//! # Example
//!
//! ```rust
//! use concur::{Executor, OrderedView};
//!
//! let odd = Executor::new()
//!     .pick_series(OrderedView::sequence([1, 2, 3]), |_, n: i32, _, done| {
//!         done.ok(n % 2 == 1)
//!     })
//!     .wait()
//!     .unwrap();
//!
//! assert_eq!(odd.values().copied().collect::<Vec<_>>(), vec![1, 3]);
//! ```

mod collection;
mod completion;
mod config;
mod core;
mod error;
mod executor;
mod graph;
mod handle;
#[cfg(feature = "logging")]
pub mod logging;
mod pick;
mod scheduler;

pub use crate::collection::{Collected, Keyed, OrderedView};
pub use crate::completion::Completion;
pub use crate::config::Config;
pub use crate::core::{Dynamic, Key, Shape};
pub use crate::error::{ConfigError, GraphError, ProtocolViolation, RunError};
pub use crate::executor::{Executor, Limit};
pub use crate::graph::{Blueprint, DependencyGraph, Inputs, TaskDef};
pub use crate::handle::{Outcome, RunHandle};
pub use crate::pick::Truthy;
pub use crate::scheduler::{Results, Scheduler, TaskExecution};
