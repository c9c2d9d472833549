//! Declaring and validating a graph of named, interdependent tasks.
//!
//! Tasks are declared on a [`Blueprint`] with an explicit, ordered list of
//! dependency names. [`Blueprint::build`] resolves every name and rejects
//! cycles before anything runs; the resulting [`DependencyGraph`] is
//! immutable and can be handed to a [`Scheduler`](crate::Scheduler) any
//! number of times.
//!
//! Task outputs are type-erased into [`Dynamic`] and recovered through
//! [`Inputs`] by downcasting.

use std::any::{Any, type_name};
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use anyhow::anyhow;
use petgraph::Graph;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;

use crate::completion::Completion;
use crate::core::{ArcStr, Dynamic};
use crate::error::GraphError;

pub(crate) type Body<C> = Arc<dyn Fn(&C, Inputs, Completion<Dynamic>) + Send + Sync>;

pub(crate) struct TaskNode<C> {
    pub(crate) name: ArcStr,
    /// Declared order; this is the order values are injected in.
    pub(crate) dependencies: Vec<NodeIndex>,
    pub(crate) body: Body<C>,
}

struct Declared<C> {
    name: ArcStr,
    dependencies: Vec<ArcStr>,
    body: Body<C>,
}

/// Task names of a graph and their positions, shared with every run's
/// results.
#[derive(Debug)]
pub(crate) struct Lookup {
    pub(crate) names: Vec<ArcStr>,
    positions: HashMap<ArcStr, usize>,
}

impl Lookup {
    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }
}

/// Collects task declarations.
///
/// # Example
///
/// ```rust
/// use concur::Blueprint;
///
/// let mut blueprint: Blueprint = Blueprint::new();
/// blueprint.task("a").call(|_, _| Ok(1u32));
/// blueprint
///     .task("b")
///     .depends_on(["a"])
///     .call(|_, inputs| Ok(*inputs.get::<u32>(0)? + 1));
///
/// let graph = blueprint.build().unwrap();
/// assert_eq!(graph.len(), 2);
/// ```
pub struct Blueprint<C = ()> {
    tasks: Vec<Declared<C>>,
}

impl<C> Blueprint<C>
where
    C: 'static,
{
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Starts declaring a task called `name`.
    pub fn task(&mut self, name: impl Into<String>) -> TaskDef<'_, C> {
        TaskDef {
            blueprint: self,
            name: ArcStr::from(name.into()),
            dependencies: Vec::new(),
        }
    }

    /// Resolves every dependency name and checks the graph is acyclic.
    pub fn build(self) -> Result<DependencyGraph<C>, GraphError> {
        let mut graph = Graph::with_capacity(self.tasks.len(), 0);
        let mut positions = HashMap::with_capacity(self.tasks.len());

        for (position, task) in self.tasks.iter().enumerate() {
            if positions.insert(task.name.clone(), position).is_some() {
                return Err(GraphError::DuplicateTask(task.name.to_string()));
            }
        }

        let mut edges = Vec::new();
        for (position, task) in self.tasks.iter().enumerate() {
            for dependency in &task.dependencies {
                match positions.get(dependency) {
                    Some(&source) => edges.push((source, position)),
                    None => {
                        return Err(GraphError::UnknownDependency {
                            task: task.name.to_string(),
                            dependency: dependency.to_string(),
                        });
                    }
                }
            }
        }

        let names = self.tasks.iter().map(|task| task.name.clone()).collect();

        for task in self.tasks {
            let dependencies = task
                .dependencies
                .iter()
                .filter_map(|dependency| positions.get(dependency))
                .map(|&position| NodeIndex::new(position))
                .collect();

            graph.add_node(TaskNode {
                name: task.name,
                dependencies,
                body: task.body,
            });
        }

        for (source, target) in edges {
            graph.add_edge(NodeIndex::new(source), NodeIndex::new(target), ());
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(GraphError::Cycle {
                tasks: cycle_through(&graph, cycle.node_id()),
            });
        }

        Ok(DependencyGraph {
            inner: Arc::new(GraphInner {
                graph,
                lookup: Arc::new(Lookup { names, positions }),
            }),
        })
    }
}

impl<C: 'static> Default for Blueprint<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Names the tasks on one dependency cycle through `start`, starting and
/// ending with it.
fn cycle_through<C>(graph: &Graph<TaskNode<C>, ()>, start: NodeIndex) -> Vec<String> {
    let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    'search: while let Some(current) = queue.pop_front() {
        for &next in &graph[current].dependencies {
            if next == start {
                parents.insert(start, current);
                break 'search;
            }
            if !parents.contains_key(&next) {
                parents.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    let mut path = vec![start];
    let mut current = start;
    while let Some(&parent) = parents.get(&current) {
        if parent == start {
            break;
        }
        path.push(parent);
        current = parent;
    }

    // Collected walking back from `start`; flip it so each step reads
    // "depends on".
    path.reverse();
    path.insert(0, start);

    path.into_iter()
        .map(|index| graph[index].name.to_string())
        .collect()
}

/// A single task declaration in progress.
pub struct TaskDef<'a, C> {
    blueprint: &'a mut Blueprint<C>,
    name: ArcStr,
    dependencies: Vec<ArcStr>,
}

impl<'a, C> TaskDef<'a, C>
where
    C: 'static,
{
    /// Appends dependency names. Their values are injected in this order.
    pub fn depends_on<I>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(|name| ArcStr::from(name.into())));
        self
    }

    /// Finishes the declaration with a body that reports through its
    /// completion parameter, possibly later and from another thread.
    pub fn run<F>(self, body: F)
    where
        F: Fn(&C, Inputs, Completion<Dynamic>) + Send + Sync + 'static,
    {
        self.blueprint.tasks.push(Declared {
            name: self.name,
            dependencies: self.dependencies,
            body: Arc::new(body),
        });
    }

    /// Finishes the declaration with a body that returns its result directly.
    pub fn call<T, F>(self, body: F)
    where
        T: Any + Send + Sync,
        F: Fn(&C, Inputs) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.run(move |context, inputs, done| {
            done.complete(body(context, inputs).map(|value| Arc::new(value) as Dynamic));
        });
    }
}

struct GraphInner<C> {
    /// Edges point from a dependency to the task that needs it. Node indices
    /// follow declaration order.
    graph: Graph<TaskNode<C>, ()>,
    lookup: Arc<Lookup>,
}

/// A validated, immutable task graph.
pub struct DependencyGraph<C = ()> {
    inner: Arc<GraphInner<C>>,
}

impl<C> Clone for DependencyGraph<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> DependencyGraph<C> {
    pub fn len(&self) -> usize {
        self.inner.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lookup.position(name).is_some()
    }

    /// Task names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.lookup.names.iter().map(|name| &**name)
    }

    /// Dependency names of `name`, in declared order.
    pub fn dependencies(&self, name: &str) -> Option<Vec<&str>> {
        let position = self.inner.lookup.position(name)?;
        let task = &self.inner.graph[NodeIndex::new(position)];

        Some(
            task.dependencies
                .iter()
                .map(|&index| &*self.inner.graph[index].name)
                .collect(),
        )
    }

    pub(crate) fn graph(&self) -> &Graph<TaskNode<C>, ()> {
        &self.inner.graph
    }

    pub(crate) fn lookup(&self) -> &Arc<Lookup> {
        &self.inner.lookup
    }
}

impl<C> Debug for DependencyGraph<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.inner.lookup.names)
            .finish()
    }
}

/// Renders the graph as a Mermaid flowchart.
impl<C> Display for DependencyGraph<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let graph = &self.inner.graph;
        writeln!(f, "graph LR")?;

        for index in graph.node_indices() {
            let name = graph[index].name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in graph.raw_edges() {
            writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
        }

        Ok(())
    }
}

/// Dependency values handed to a task body, positionally in declared order.
///
/// In a final selection handler some values may be missing, when the named
/// task had not finished by the time the run ended.
#[derive(Clone)]
pub struct Inputs {
    names: Vec<ArcStr>,
    values: Vec<Option<Dynamic>>,
}

impl Inputs {
    pub(crate) fn new(names: Vec<ArcStr>, values: Vec<Option<Dynamic>>) -> Self {
        Self { names, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Name of the task that produced input `index`.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|name| &**name)
    }

    /// The raw value at `index`, if that task has finished.
    pub fn value(&self, index: usize) -> Option<&Dynamic> {
        self.values.get(index)?.as_ref()
    }

    /// Downcasts input `index` to `T`.
    pub fn get<T: Any>(&self, index: usize) -> anyhow::Result<&T> {
        let name = self
            .name(index)
            .ok_or_else(|| anyhow!("Input {index} is out of range ({} inputs)", self.len()))?;

        let value = self
            .value(index)
            .ok_or_else(|| anyhow!("Task '{name}' did not produce a value"))?;

        value
            .downcast_ref::<T>()
            .ok_or_else(|| anyhow!("Task '{name}' did not produce a {}", type_name::<T>()))
    }

    /// Like [`Inputs::get`], looking the input up by task name.
    pub fn named<T: Any>(&self, name: &str) -> anyhow::Result<&T> {
        let index = self
            .names
            .iter()
            .position(|candidate| &**candidate == name)
            .ok_or_else(|| anyhow!("Task '{name}' is not among the inputs"))?;

        self.get(index)
    }
}

impl Debug for Inputs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.names
                    .iter()
                    .zip(&self.values)
                    .map(|(name, value)| (name, value.is_some())),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(blueprint: &mut Blueprint, name: &str, dependencies: &[&str]) {
        blueprint
            .task(name)
            .depends_on(dependencies.iter().copied())
            .call(|_, _| Ok(()));
    }

    #[test]
    fn test_build_keeps_declared_order() {
        let mut blueprint: Blueprint = Blueprint::new();
        noop(&mut blueprint, "d", &["c", "b"]);
        noop(&mut blueprint, "b", &["a"]);
        noop(&mut blueprint, "c", &["a"]);
        noop(&mut blueprint, "a", &[]);

        let graph = blueprint.build().unwrap();
        assert_eq!(graph.names().collect::<Vec<_>>(), vec!["d", "b", "c", "a"]);
        assert_eq!(graph.dependencies("d"), Some(vec!["c", "b"]));
        assert_eq!(graph.dependencies("a"), Some(vec![]));
        assert!(graph.contains("c"));
        assert!(!graph.contains("z"));
    }

    #[test]
    fn test_unknown_dependency() {
        let mut blueprint: Blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &[]);
        noop(&mut blueprint, "b", &["a", "z"]);

        let err = blueprint.build().unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                task: "b".into(),
                dependency: "z".into(),
            }
        );
        assert_eq!(err.to_string(), "Task 'b' depends on unknown task 'z'");
    }

    #[test]
    fn test_cycle_detected() {
        let mut blueprint: Blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &["b"]);
        noop(&mut blueprint, "b", &["a"]);

        match blueprint.build().unwrap_err() {
            GraphError::Cycle { tasks } => {
                assert_eq!(tasks.len(), 3);
                assert_eq!(tasks.first(), tasks.last());
                assert!(tasks.contains(&"a".to_string()));
                assert!(tasks.contains(&"b".to_string()));
            }
            other => panic!("expected a cycle, got {other}"),
        }
    }

    #[test]
    fn test_longer_cycle_lists_its_members() {
        let mut blueprint: Blueprint = Blueprint::new();
        noop(&mut blueprint, "root", &[]);
        noop(&mut blueprint, "a", &["root", "c"]);
        noop(&mut blueprint, "b", &["a"]);
        noop(&mut blueprint, "c", &["b"]);

        match blueprint.build().unwrap_err() {
            GraphError::Cycle { tasks } => {
                assert_eq!(tasks.len(), 4);
                assert!(!tasks.contains(&"root".to_string()));
            }
            other => panic!("expected a cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut blueprint: Blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &["a"]);

        let err = blueprint.build().unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                tasks: vec!["a".into(), "a".into()],
            }
        );
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected between tasks: a -> a"
        );
    }

    #[test]
    fn test_duplicate_task() {
        let mut blueprint: Blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &[]);
        noop(&mut blueprint, "a", &[]);

        assert_eq!(
            blueprint.build().unwrap_err(),
            GraphError::DuplicateTask("a".into())
        );
    }

    #[test]
    fn test_empty_blueprint() {
        let graph = Blueprint::<()>::new().build().unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.to_string(), "graph LR\n");
    }

    #[test]
    fn test_display_mermaid() {
        let mut blueprint: Blueprint = Blueprint::new();
        noop(&mut blueprint, "a", &[]);
        noop(&mut blueprint, "say \"hi\"", &["a"]);

        let graph = blueprint.build().unwrap();
        assert_eq!(
            graph.to_string(),
            "graph LR\n    0[\"a\"]\n    1[\"say \\\"hi\\\"\"]\n    0 --> 1\n"
        );
    }

    #[test]
    fn test_inputs_access() {
        let inputs = Inputs::new(
            vec!["a".into(), "b".into(), "c".into()],
            vec![Some(Arc::new(1u32) as Dynamic), Some(Arc::new("two")), None],
        );

        assert_eq!(inputs.len(), 3);
        assert_eq!(*inputs.get::<u32>(0).unwrap(), 1);
        assert_eq!(*inputs.named::<&str>("b").unwrap(), "two");
        assert_eq!(inputs.name(2), Some("c"));
        assert!(inputs.value(2).is_none());

        let wrong = inputs.get::<String>(0).unwrap_err();
        assert!(wrong.to_string().contains("did not produce a alloc::string::String"));
        assert!(inputs.get::<u32>(2).unwrap_err().to_string().contains("'c'"));
        assert!(inputs.get::<u32>(5).is_err());
        assert!(inputs.named::<u32>("z").is_err());
    }
}
