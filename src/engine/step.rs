use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::StepContext;
use crate::core::{ArcStr, Dynamic};
use crate::engine::{Dependencies, Execution, Step, ValueId, erase};
use crate::error::ExecError;

/// Synchronous closure over resolved inputs.
pub(crate) struct ComputeStep<R, D, F> {
    pub name: ArcStr,
    pub dependencies: D,
    pub callback: F,
    pub _phantom: PhantomData<fn() -> R>,
}

impl<R, D, F> Step for ComputeStep<R, D, F>
where
    R: Send + Sync + 'static,
    D: Dependencies + Send + Sync,
    F: for<'a> Fn(&StepContext, D::Output<'a>) -> anyhow::Result<R> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<ValueId> {
        self.dependencies.values()
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<R>()
    }

    fn execute(&self, context: &StepContext, inputs: &[Dynamic]) -> Execution {
        let inputs = self.dependencies.resolve(inputs);
        Execution::from_body(&self.name, (self.callback)(context, inputs))
    }
}

/// Synchronous closure returning an iterator, drained into a `Vec` before the
/// value is published.
pub(crate) struct StreamStep<T, I, D, F> {
    pub name: ArcStr,
    pub dependencies: D,
    pub callback: F,
    pub _phantom: PhantomData<fn() -> (T, I)>,
}

impl<T, I, D, F> Step for StreamStep<T, I, D, F>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = T>,
    D: Dependencies + Send + Sync,
    F: for<'a> Fn(&StepContext, D::Output<'a>) -> anyhow::Result<I> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<ValueId> {
        self.dependencies.values()
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<Vec<T>>()
    }

    fn execute(&self, context: &StepContext, inputs: &[Dynamic]) -> Execution {
        let inputs = self.dependencies.resolve(inputs);
        let items = (self.callback)(context, inputs).map(|iter| iter.into_iter().collect::<Vec<T>>());
        Execution::from_body(&self.name, items)
    }
}

/// Closure returning a future. The inputs are only borrowed while the closure
/// runs, so the future has to own whatever it needs from them.
pub(crate) struct AsyncStep<R, Fut, D, F> {
    pub name: ArcStr,
    pub dependencies: D,
    pub callback: F,
    pub _phantom: PhantomData<fn() -> (R, Fut)>,
}

impl<R, Fut, D, F> Step for AsyncStep<R, Fut, D, F>
where
    R: Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    D: Dependencies + Send + Sync,
    F: for<'a> Fn(&StepContext, D::Output<'a>) -> Fut + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<ValueId> {
        self.dependencies.values()
    }

    fn is_async(&self) -> bool {
        true
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<R>()
    }

    fn execute(&self, context: &StepContext, inputs: &[Dynamic]) -> Execution {
        let inputs = self.dependencies.resolve(inputs);
        let future = (self.callback)(context, inputs);
        let name = self.name.clone();

        Execution::Pending {
            future: future.map(move |result| erase(&name, result)).boxed(),
            budget: None,
        }
    }
}

/// Runs another step inside a child budget of at least `min` and at most
/// `max`, carved out of the budget the step would otherwise run under.
///
/// A guarded step always suspends. Synchronous bodies are handed to the pool
/// so the task can race them against the child budget.
pub(crate) struct GuardedStep {
    pub inner: Arc<dyn Step>,
    pub min: Duration,
    pub max: Duration,
}

impl Step for GuardedStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn inputs(&self) -> Vec<ValueId> {
        self.inner.inputs()
    }

    fn is_async(&self) -> bool {
        true
    }

    fn output_type_name(&self) -> &'static str {
        self.inner.output_type_name()
    }

    fn execute(&self, context: &StepContext, inputs: &[Dynamic]) -> Execution {
        let child = match context.budget().create_bounded_timeout(self.min, self.max) {
            Ok(child) => child,
            Err(err) => return Execution::Ready(Err(ExecError::from(err))),
        };
        let context = context.with_budget(child.clone());

        if self.inner.is_async() {
            return match self.inner.execute(&context, inputs) {
                Execution::Ready(result) => Execution::Ready(result),
                // A nested guard already raced against a child of ours.
                Execution::Pending { future, budget } => Execution::Pending {
                    future,
                    budget: Some(budget.unwrap_or(child)),
                },
            };
        }

        let inner = self.inner.clone();
        let inputs = inputs.to_vec();
        let executor = context.executor().clone();
        let future = executor.dispatch(context, move |context| match inner.execute(context, &inputs) {
            Execution::Ready(result) => result,
            Execution::Pending { future, .. } => futures::executor::block_on(future),
        });

        Execution::Pending {
            future,
            budget: Some(child),
        }
    }
}
