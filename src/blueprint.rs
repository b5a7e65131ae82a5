use std::any::type_name;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::StepContext;
use crate::core::ArcStr;
use crate::engine::{
    AsyncStep, ComputeStep, Dependencies, GraphPlanner, GuardedStep, Step, StepGraph, StepId,
    StreamStep, TaskGraph, Value,
};
use crate::error::PlanError;

/// The blueprint of a query program.
///
/// `Blueprint` is used to define the step graph of a program. You add steps
/// to it and wire them together using the [`Value`] handles they return.
///
/// Once configured, [`Blueprint::compile`] plans the graph into a
/// [`Program`] which can be executed any number of times.
///
/// # Example
///
/// ```rust
/// use tasuki::Blueprint;
///
/// let mut blueprint = Blueprint::new();
///
/// let a = blueprint.step().name("a").run(|_| Ok(20u32));
/// let b = blueprint.step().name("b").run(|_| Ok(22u32));
/// let sum = blueprint
///     .step()
///     .name("sum")
///     .depends_on((a, b))
///     .run(|_, (a, b)| Ok(a + b));
///
/// let program = blueprint.compile(sum).unwrap();
/// assert_eq!(program.plan().joins().count(), 1);
/// ```
#[derive(Default)]
pub struct Blueprint {
    pub(crate) graph: StepGraph,
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry point of the step builder.
    pub fn step(&mut self) -> StepDef<'_> {
        StepDef {
            blueprint: self,
            name: None,
            timeout: None,
        }
    }

    /// Plans the steps `terminal` transitively depends on. Steps the terminal
    /// does not reach are left out of the program.
    pub fn compile<T>(self, terminal: Value<T>) -> Result<Program<T>, PlanError> {
        let plan = GraphPlanner::plan(&self.graph, terminal.source())?;

        Ok(Program {
            inner: Arc::new(Compiled {
                steps: self.graph,
                plan,
            }),
            _phantom: PhantomData,
        })
    }

    pub fn steps(&self) -> &StepGraph {
        &self.graph
    }

    fn add<S>(&mut self, step: S, timeout: Option<(Duration, Duration)>) -> StepId
    where
        S: Step + 'static,
    {
        match timeout {
            Some((min, max)) => self.graph.add(GuardedStep {
                inner: Arc::new(step),
                min,
                max,
            }),
            None => self.graph.add(step),
        }
    }
}

fn label<F>(name: Option<Cow<'static, str>>) -> ArcStr {
    match name {
        Some(name) => ArcStr::from(name.as_ref()),
        None => ArcStr::from(type_name::<F>()),
    }
}

pub struct StepDef<'a> {
    blueprint: &'a mut Blueprint,
    name: Option<Cow<'static, str>>,
    timeout: Option<(Duration, Duration)>,
}

impl<'a> StepDef<'a> {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Runs the step inside a child budget of at least `min` and at most
    /// `max`. The step fails with [`ExecError::Expired`](crate::ExecError)
    /// without running when less than `min` is left.
    pub fn timeout(mut self, min: Duration, max: Duration) -> Self {
        self.timeout = Some((min, max));
        self
    }

    pub fn depends_on<D>(self, dependencies: D) -> StepBinder<'a, D>
    where
        D: Dependencies,
    {
        StepBinder {
            blueprint: self.blueprint,
            name: self.name,
            timeout: self.timeout,
            dependencies,
        }
    }

    pub fn run<F, R>(self, callback: F) -> Value<R>
    where
        F: Fn(&StepContext) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let step = ComputeStep {
            name: label::<F>(self.name),
            dependencies: (),
            callback: move |ctx: &StepContext, _: ()| callback(ctx),
            _phantom: PhantomData,
        };

        Value::new(self.blueprint.add(step, self.timeout).value())
    }

    pub fn run_async<F, Fut, R>(self, callback: F) -> Value<R>
    where
        F: Fn(&StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + Sync + 'static,
    {
        let step = AsyncStep {
            name: label::<F>(self.name),
            dependencies: (),
            callback: move |ctx: &StepContext, _: ()| callback(ctx),
            _phantom: PhantomData,
        };

        Value::new(self.blueprint.add(step, self.timeout).value())
    }
}

pub struct StepBinder<'a, D> {
    blueprint: &'a mut Blueprint,
    name: Option<Cow<'static, str>>,
    timeout: Option<(Duration, Duration)>,
    dependencies: D,
}

impl<'a, D> StepBinder<'a, D>
where
    D: Dependencies + Send + Sync + 'static,
{
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// See [`StepDef::timeout`].
    pub fn timeout(mut self, min: Duration, max: Duration) -> Self {
        self.timeout = Some((min, max));
        self
    }

    pub fn run<F, R>(self, callback: F) -> Value<R>
    where
        F: for<'b> Fn(&StepContext, D::Output<'b>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let step = ComputeStep {
            name: label::<F>(self.name),
            dependencies: self.dependencies,
            callback,
            _phantom: PhantomData,
        };

        Value::new(self.blueprint.add(step, self.timeout).value())
    }

    /// Like [`StepBinder::run`], for bodies producing a sequence. The items
    /// are collected before the value is published, so consumers always see
    /// the whole `Vec`.
    pub fn stream<F, I, T>(self, callback: F) -> Value<Vec<T>>
    where
        F: for<'b> Fn(&StepContext, D::Output<'b>) -> anyhow::Result<I> + Send + Sync + 'static,
        I: IntoIterator<Item = T> + 'static,
        T: Send + Sync + 'static,
    {
        let step = StreamStep {
            name: label::<F>(self.name),
            dependencies: self.dependencies,
            callback,
            _phantom: PhantomData,
        };

        Value::new(self.blueprint.add(step, self.timeout).value())
    }

    /// Adds a step completing later. The step suspends its task until the
    /// future resolves, and the future is dropped if the budget runs out
    /// first.
    pub fn run_async<F, Fut, R>(self, callback: F) -> Value<R>
    where
        F: for<'b> Fn(&StepContext, D::Output<'b>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + Sync + 'static,
    {
        let step = AsyncStep {
            name: label::<F>(self.name),
            dependencies: self.dependencies,
            callback,
            _phantom: PhantomData,
        };

        Value::new(self.blueprint.add(step, self.timeout).value())
    }
}

/// Steps of a program together with their plan.
pub(crate) struct Compiled {
    pub steps: StepGraph,
    pub plan: TaskGraph,
}

/// A planned program producing a `T`.
///
/// Programs are immutable. Cloning one is cheap, and every clone can be
/// executed by any number of concurrent requests.
pub struct Program<T> {
    inner: Arc<Compiled>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Program<T> {
    pub fn plan(&self) -> &TaskGraph {
        &self.inner.plan
    }

    pub fn steps(&self) -> &StepGraph {
        &self.inner.steps
    }

    /// Handle to the value the program produces.
    pub fn terminal(&self) -> Value<T> {
        Value::new(self.inner.plan.terminal().value())
    }

    pub(crate) fn compiled(&self) -> &Arc<Compiled> {
        &self.inner
    }
}

impl<T> Clone for Program<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> fmt::Display for Program<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.plan.write_mermaid(f, &self.inner.steps, |_| None)
    }
}

impl<T> fmt::Debug for Program<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("steps", &self.inner.steps.len())
            .field("tasks", &self.inner.plan.len())
            .field("terminal", &self.inner.plan.terminal())
            .finish()
    }
}
