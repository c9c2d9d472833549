//! Running a [`DependencyGraph`] as its prerequisites resolve.
//!
//! Every task starts as soon as all of its dependencies have finished, with no
//! cap on how many run at once. Tasks that become runnable together are
//! dispatched in declaration order. The first failure stops new dispatch and
//! delivers the results gathered so far; tasks already running are left to
//! finish and their outcomes are ignored.

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use petgraph::graph::NodeIndex;

use crate::completion::{Completion, Signal};
use crate::config::Config;
use crate::core::{Dynamic, panic_message};
use crate::error::{GraphError, RunError};
use crate::graph::{DependencyGraph, Inputs, Lookup};
use crate::handle::{Finish, Outcome, RunHandle};

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    /// When the task was dispatched.
    pub start: Instant,
    /// Time from dispatch until its completion parameter was invoked.
    pub duration: Duration,
}

/// Values of the tasks that finished during a run.
#[derive(Clone)]
pub struct Results {
    lookup: Arc<Lookup>,
    values: Vec<Option<Dynamic>>,
    executions: Vec<Option<TaskExecution>>,
}

impl Results {
    fn new(lookup: Arc<Lookup>) -> Self {
        let len = lookup.names.len();
        Self {
            lookup,
            values: vec![None; len],
            executions: vec![None; len],
        }
    }

    /// The value of `name` downcast to `T`, if it finished with one.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.value(name)?.downcast_ref()
    }

    pub fn value(&self, name: &str) -> Option<&Dynamic> {
        let position = self.lookup.position(name)?;
        self.values[position].as_ref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.value(name).is_some()
    }

    /// Number of finished tasks.
    pub fn len(&self) -> usize {
        self.values.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the finished tasks, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.lookup
            .names
            .iter()
            .zip(&self.values)
            .filter(|(_, value)| value.is_some())
            .map(|(name, _)| &**name)
    }

    pub fn execution(&self, name: &str) -> Option<&TaskExecution> {
        let position = self.lookup.position(name)?;
        self.executions[position].as_ref()
    }

    fn select(&self, positions: &[usize]) -> Inputs {
        let names = positions
            .iter()
            .map(|&position| self.lookup.names[position].clone())
            .collect();
        let values = positions
            .iter()
            .map(|&position| self.values[position].clone())
            .collect();

        Inputs::new(names, values)
    }
}

impl Debug for Results {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Results")
            .field("finished", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

/// Runs dependency graphs.
///
/// # Example
///
/// ```rust
/// use concur::{Blueprint, Scheduler};
///
/// let mut blueprint: Blueprint = Blueprint::new();
/// blueprint.task("a").call(|_, _| Ok(2u32));
/// blueprint.task("b").call(|_, _| Ok(3u32));
/// blueprint
///     .task("product")
///     .depends_on(["a", "b"])
///     .call(|_, inputs| Ok(inputs.get::<u32>(0)? * inputs.get::<u32>(1)?));
///
/// let graph = blueprint.build().unwrap();
/// let results = Scheduler::new().run(&graph).wait().unwrap();
/// assert_eq!(results.get::<u32>("product"), Some(&6));
/// ```
pub struct Scheduler<C = ()> {
    context: Arc<C>,
    config: Config,
}

impl Scheduler<()> {
    pub fn new() -> Self {
        Self::with_context(())
    }
}

impl Default for Scheduler<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Scheduler<C>
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

    /// Starts a run and returns its completion channel.
    pub fn run(&self, graph: &DependencyGraph<C>) -> RunHandle<Results> {
        let (finish, handle) = RunHandle::channel();
        self.start(graph, finish);
        handle
    }

    /// Starts a run and calls `on_done` exactly once with its outcome.
    pub fn run_with<D>(&self, graph: &DependencyGraph<C>, on_done: D)
    where
        D: FnOnce(Outcome<Results>) + Send + 'static,
    {
        self.start(graph, Box::new(on_done));
    }

    /// Starts a run that ends in `handler`, which receives the error (if any)
    /// followed by the values of `names`, in that order.
    ///
    /// Values of tasks that had not finished when the run ended are missing.
    pub fn run_select<I, H>(
        &self,
        graph: &DependencyGraph<C>,
        names: I,
        handler: H,
    ) -> Result<(), GraphError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        H: FnOnce(Option<anyhow::Error>, Inputs) + Send + 'static,
    {
        let positions = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                graph
                    .lookup()
                    .position(name)
                    .ok_or_else(|| GraphError::UnknownSelection(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let lookup = graph.lookup().clone();
        self.start(
            graph,
            Box::new(move |outcome: Outcome<Results>| match outcome {
                Ok(results) => handler(None, results.select(&positions)),
                Err(RunError::Failed { error, partial }) => {
                    handler(Some(error), partial.select(&positions))
                }
                Err(RunError::Abandoned { unit }) => handler(
                    Some(anyhow!("Completion for {unit} was dropped")),
                    Results::new(lookup).select(&positions),
                ),
            }),
        );

        Ok(())
    }

    fn start(&self, graph: &DependencyGraph<C>, finish: Finish<Results>) {
        let total = graph.len();
        let span = tracing::debug_span!("scheduler.run", tasks = total);

        if total == 0 {
            tracing::debug!(parent: &span, "nothing to schedule");
            let empty = Results::new(graph.lookup().clone());
            self.config.spawn(move || finish(Ok(empty)));
            return;
        }

        // Map each task to the tasks that depend on it.
        let mut dependents = vec![Vec::new(); total];
        for edge in graph.graph().raw_edges() {
            dependents[edge.source().index()].push(edge.target());
        }
        for list in &mut dependents {
            list.sort();
        }

        let remaining = graph
            .graph()
            .node_indices()
            .map(|index| graph.graph()[index].dependencies.len())
            .collect();

        let run = Arc::new(Run {
            graph: graph.clone(),
            context: self.context.clone(),
            config: self.config.clone(),
            span,
            dependents,
            state: Mutex::new(SchedulerState {
                remaining,
                started: vec![None; total],
                completed: 0,
                results: Results::new(graph.lookup().clone()),
                finish: Some(finish),
            }),
        });

        let mut state = run.lock();
        let runnable = graph
            .graph()
            .node_indices()
            .filter(|index| state.remaining[index.index()] == 0)
            .collect();
        let batch = run.prepare(&mut state, runnable);
        Run::dispatch(&run, batch);
    }
}

struct SchedulerState {
    /// Unfinished dependencies per task.
    remaining: Vec<usize>,
    started: Vec<Option<Instant>>,
    completed: usize,
    results: Results,
    /// Present until the final outcome is delivered.
    finish: Option<Finish<Results>>,
}

struct Run<C> {
    graph: DependencyGraph<C>,
    context: Arc<C>,
    config: Config,
    span: tracing::Span,
    dependents: Vec<Vec<NodeIndex>>,
    state: Mutex<SchedulerState>,
}

impl<C> Run<C>
where
    C: Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self, index: NodeIndex) -> &str {
        &self.graph.graph()[index].name
    }

    /// Marks `runnable` as started and gathers their inputs.
    fn prepare(
        &self,
        state: &mut SchedulerState,
        runnable: Vec<NodeIndex>,
    ) -> Vec<(NodeIndex, Inputs)> {
        let now = Instant::now();

        runnable
            .into_iter()
            .map(|index| {
                state.started[index.index()] = Some(now);

                let positions: Vec<usize> = self.graph.graph()[index]
                    .dependencies
                    .iter()
                    .map(|dependency| dependency.index())
                    .collect();

                (index, state.results.select(&positions))
            })
            .collect()
    }

    /// Queues `batch` on the pool. Called with the state lock held, so tasks
    /// readied by concurrent completions reach the pool in a consistent order.
    fn dispatch(run: &Arc<Self>, batch: Vec<(NodeIndex, Inputs)>) {
        for (index, inputs) in batch {
            let name = run.name(index);
            tracing::debug!(parent: &run.span, task = name, "dispatch");

            let completion = {
                let run = Arc::clone(run);
                Completion::new(format!("task '{name}'"), run.config.clone(), move |signal| {
                    Run::settle(&run, index, signal)
                })
            };

            let job = Arc::clone(run);
            run.config.spawn(move || job.invoke(index, inputs, completion));
        }
    }

    fn invoke(&self, index: NodeIndex, inputs: Inputs, completion: Completion<Dynamic>) {
        let task = &self.graph.graph()[index];
        let span = tracing::trace_span!(parent: &self.span, "task", name = &*task.name);
        let _enter = span.enter();

        let guard = completion.clone();
        let result = catch_unwind(AssertUnwindSafe(|| {
            (task.body)(&self.context, inputs, completion)
        }));

        if let Err(panic) = result {
            let message = panic_message(panic.as_ref());
            let failure = anyhow!("task '{}' panicked: {message}", task.name);

            if !guard.complete_if_pending(Err(failure)) {
                // Already completed, so the panic came after that, possibly
                // from the final callback run on this stack.
                tracing::error!(parent: &self.span, task = &*task.name, "panic after completion: {message}");
            }
        }
    }

    fn settle(run: &Arc<Self>, index: NodeIndex, signal: Signal<Dynamic>) {
        let name = run.name(index);
        let position = index.index();
        let mut deliver = None;

        {
            let mut state = run.lock();
            state.completed += 1;

            if state.finish.is_none() {
                tracing::debug!(parent: &run.span, task = name, "completion after finish ignored");
                return;
            }

            let batch = match signal {
                Signal::Completed(Ok(value)) => {
                    tracing::debug!(parent: &run.span, task = name, "completed");

                    if let Some(start) = state.started[position] {
                        state.results.executions[position] = Some(TaskExecution {
                            start,
                            duration: start.elapsed(),
                        });
                    }
                    state.results.values[position] = Some(value);

                    if state.completed == run.dependents.len() {
                        let results = state.results.clone();
                        deliver = state.finish.take().map(|finish| (finish, Ok(results)));
                        Vec::new()
                    } else {
                        let mut runnable = Vec::new();
                        for &dependent in &run.dependents[position] {
                            let remaining = &mut state.remaining[dependent.index()];
                            *remaining -= 1;
                            if *remaining == 0 {
                                runnable.push(dependent);
                            }
                        }
                        run.prepare(&mut state, runnable)
                    }
                }
                Signal::Completed(Err(error)) => {
                    tracing::debug!(parent: &run.span, task = name, "failed, short-circuiting");
                    let partial = state.results.clone();
                    deliver = state
                        .finish
                        .take()
                        .map(|finish| (finish, Err(RunError::Failed { error, partial })));
                    Vec::new()
                }
                Signal::Dropped => {
                    tracing::debug!(parent: &run.span, task = name, "completion dropped");
                    let unit = format!("task '{name}'");
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
