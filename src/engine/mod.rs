mod planner;
mod step;
mod task;
mod value;

use std::sync::Arc;

use futures::future::BoxFuture;
use petgraph::Graph;

use crate::StepContext;
use crate::budget::TimeoutBudget;
use crate::core::{ArcStr, Dynamic};
use crate::error::{ExecError, StepError};

pub use crate::engine::planner::GraphPlanner;
pub use crate::engine::task::{Task, TaskGraph, TaskId, TaskKind};
pub use crate::engine::value::{StepId, Value, ValueId};

pub(crate) use crate::engine::step::{AsyncStep, ComputeStep, GuardedStep, StreamStep};

/// Result of invoking a step.
pub enum Execution {
    /// The step finished on the calling worker.
    Ready(Result<Dynamic, ExecError>),
    /// The step produced a computation that completes later. It is raced
    /// against `budget`, or against the request budget when `None`.
    Pending {
        future: BoxFuture<'static, Result<Dynamic, ExecError>>,
        budget: Option<TimeoutBudget>,
    },
}

impl Execution {
    /// Erases the output of a step body, attributing a failure to `step`.
    pub(crate) fn from_body<R>(step: &ArcStr, result: anyhow::Result<R>) -> Self
    where
        R: Send + Sync + 'static,
    {
        Execution::Ready(erase(step, result))
    }
}

pub(crate) fn erase<R>(step: &ArcStr, result: anyhow::Result<R>) -> Result<Dynamic, ExecError>
where
    R: Send + Sync + 'static,
{
    match result {
        Ok(output) => Ok(Arc::new(output)),
        Err(err) => Err(ExecError::Step(step.clone(), StepError::from(err))),
    }
}

/// An atomic computation producing exactly one value.
///
/// Most steps come from the typed [`Blueprint`](crate::Blueprint) API; this
/// trait is the type-erased form the planner and the executor work with.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Values consumed by this step, in the order `execute` receives them.
    /// A value may be listed more than once.
    fn inputs(&self) -> Vec<ValueId>;

    /// Whether invoking this step suspends on a pending computation.
    fn is_async(&self) -> bool {
        false
    }

    fn output_type_name(&self) -> &'static str {
        "?"
    }

    fn execute(&self, context: &StepContext, inputs: &[Dynamic]) -> Execution;
}

pub struct StepNode {
    pub(crate) name: ArcStr,
    pub(crate) step: Box<dyn Step>,
}

impl StepNode {
    pub fn name(&self) -> &ArcStr {
        &self.name
    }

    pub fn step(&self) -> &dyn Step {
        self.step.as_ref()
    }
}

/// Arena of steps with an edge from every input to its consumer.
#[derive(Default)]
pub struct StepGraph {
    pub(crate) graph: Graph<StepNode, ()>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step. Inputs naming steps not yet in the graph are kept as
    /// declared and rejected by the planner.
    pub fn add(&mut self, step: impl Step + 'static) -> StepId {
        self.add_boxed(Box::new(step))
    }

    pub(crate) fn add_boxed(&mut self, step: Box<dyn Step>) -> StepId {
        let inputs = step.inputs();
        let name = ArcStr::from(step.name());
        let index = self.graph.add_node(StepNode { name, step });

        for input in inputs {
            if input.0.index() < self.graph.node_count() {
                self.graph.update_edge(input.0, index, ());
            }
        }

        StepId(index)
    }

    pub fn get(&self, id: StepId) -> Option<&StepNode> {
        self.graph.node_weight(id.0)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub(crate) fn name(&self, id: StepId) -> ArcStr {
        match self.get(id) {
            Some(node) => node.name.clone(),
            None => ArcStr::from(format!("#{}", id.index())),
        }
    }
}

// Things that can be used as a dependency handle
pub trait Handle: Copy + Send + Sync {
    type Output<'a>;

    fn id(&self) -> ValueId;
    fn downcast<'a>(&self, output: &'a Dynamic) -> Self::Output<'a>;
}

/// A collection of [`Value`]s that can be used as the dependencies of a step.
///
/// Implemented for `()`, a single [`Value<T>`], `Vec<Value<T>>` and tuples of
/// up to twelve values. It lets the blueprint extract the dependency ids and
/// hand the step body its inputs as references of the right types.
pub trait Dependencies {
    /// The resolved inputs. For a tuple of [`Value<T>`]s, this is a tuple of
    /// `&'a T`s.
    type Output<'a>;

    fn values(&self) -> Vec<ValueId>;

    /// Resolves type-erased outputs, given in the order of
    /// [`Dependencies::values`], into the concrete `Output` type.
    ///
    /// # Panics
    /// Panics if the outputs cannot be downcast to their expected types,
    /// which means the step graph was wired incorrectly.
    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a>;
}

impl Dependencies for () {
    type Output<'a> = ();

    fn values(&self) -> Vec<ValueId> {
        vec![]
    }

    fn resolve<'a>(&self, _: &'a [Dynamic]) -> Self::Output<'a> {}
}

impl<H> Dependencies for H
where
    H: Handle,
{
    type Output<'a> = H::Output<'a>;

    fn values(&self) -> Vec<ValueId> {
        vec![Handle::id(self)]
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        self.downcast(&outputs[0])
    }
}

impl<H> Dependencies for Vec<H>
where
    H: Handle,
{
    type Output<'a> = Vec<H::Output<'a>>;

    fn values(&self) -> Vec<ValueId> {
        self.iter().map(|h| h.id()).collect()
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
        self.iter()
            .zip(outputs)
            .map(|(handle, output)| handle.downcast(output))
            .collect()
    }
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($D),*> Dependencies for ($($D,)*)
        where
            $($D: Handle),* {
            type Output<'a> = ($($D::Output<'a>,)*);

            fn values(&self) -> Vec<ValueId> {
                let ($($D,)*) = self;
                vec![$(Handle::id($D),)*]
            }

            fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Self::Output<'a> {
                let ($($D,)*) = self;
                let mut iter = outputs.iter();

                ($($D.downcast(iter.next().expect("Missing dependency output")),)*)
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);
impl_deps!(A, B, C, D, E, F, G, H, I);
impl_deps!(A, B, C, D, E, F, G, H, I, J);
impl_deps!(A, B, C, D, E, F, G, H, I, J, K);
impl_deps!(A, B, C, D, E, F, G, H, I, J, K, L);
