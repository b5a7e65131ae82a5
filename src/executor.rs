mod diagnostics;
mod run;

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::budget::TimeoutBudget;
use crate::core::{ArcStr, Dynamic, ExecutorConfig, StepContext};
use crate::engine::{TaskId, erase};
use crate::error::{ExecError, StepError, TasukiError};
use crate::scope::{ExecutionScope, ScopedContext};
use crate::Program;

pub use diagnostics::{Diagnostics, TaskExecution};

use run::RunState;

/// Runs compiled programs on a bounded worker pool.
///
/// Synchronous steps run on a rayon pool. Timers and the futures of async
/// steps are driven by a single-threaded Tokio runtime on a dedicated thread,
/// so workers never block waiting for either. Cloning is cheap and shares the
/// same pool.
#[derive(Clone)]
pub struct TracingExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    pool: rayon::ThreadPool,
    timers: TimerService,
    config: ExecutorConfig,
}

/// The thread driving timers and async steps. Stops once the executor is
/// dropped; futures still pending on it are dropped with it.
struct TimerService {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TimerService {
    fn start(name: &str) -> Result<Self, TasukiError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let handle = runtime.handle().clone();
        let (shutdown, signal) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = signal.await;
                });
                tracing::debug!("timer thread stopped");
            })?;

        Ok(Self {
            handle,
            shutdown: Some(shutdown),
        })
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A unit of work on the pool, with everything its wrapper needs.
pub(crate) struct Unit {
    pub name: ArcStr,
    pub task: Option<TaskId>,
    pub scope: Arc<ScopedContext>,
    pub budget: TimeoutBudget,
    pub diagnostics: Arc<Diagnostics>,
    pub parent: tracing::Span,
}

impl Unit {
    /// Enters the scope and a span for the unit, refuses to start when the
    /// budget is spent and records how long the work took. `work` receives
    /// the span and the verdict of the budget check. Refused units are not
    /// timed.
    fn run<F>(self, work: F)
    where
        F: FnOnce(&tracing::Span, Result<(), ExecError>),
    {
        let _scope = ExecutionScope::enter(self.scope.clone());
        let span = tracing::info_span!(parent: &self.parent, "task", name = %self.name);
        let _enter = span.enter();

        let gate = match self.budget.verify() {
            Ok(_) => Ok(()),
            Err(_) => {
                let failure = self.budget.failure();
                if failure.is_timeout() {
                    self.diagnostics.record_timeout();
                    tracing::warn!("budget spent before the task could start");
                }
                Err(failure)
            }
        };

        let ran = gate.is_ok();
        let start = Instant::now();
        work(&span, gate);

        if let (true, Some(task)) = (ran, self.task) {
            self.diagnostics
                .record_execution(task, start, start.elapsed());
        }
    }
}

pub(crate) fn panic_error(step: &ArcStr, panic: Box<dyn Any + Send>) -> ExecError {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Step panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Step panicked: {s}")
    } else {
        String::from("Step panicked with unknown payload")
    };

    ExecError::Step(step.clone(), StepError::new(anyhow::anyhow!(msg)))
}

impl TracingExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self, TasukiError> {
        let prefix = config.worker_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()?;

        let timers = TimerService::start(&config.timer_name)?;

        tracing::debug!(
            workers = config.workers,
            timer = %config.timer_name,
            "executor started"
        );

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                pool,
                timers,
                config,
            }),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// A fresh root budget of the configured default length.
    pub fn budget(&self) -> TimeoutBudget {
        TimeoutBudget::new(self.inner.config.default_budget())
    }

    /// Starts one request of `program` and returns a handle to its result.
    ///
    /// The request runs in a new context layered over `scope`, with the
    /// budget, the request [`Diagnostics`] and this executor bound into it.
    /// When `budget` runs out before the program finishes, the request
    /// completes with [`ExecError::Expired`] and the budget is cancelled,
    /// dropping every async step still in flight.
    pub fn execute<T>(
        &self,
        program: &Program<T>,
        budget: TimeoutBudget,
        scope: Arc<ScopedContext>,
    ) -> Completion<T> {
        let diagnostics = Arc::new(Diagnostics::default());
        let scope = scope
            .child()
            .bind(budget.clone())
            .bind_shared(diagnostics.clone())
            .bind(self.clone())
            .build();

        let span = tracing::info_span!("request", id = scope.id());
        let (sender, receiver) = oneshot::channel();

        RunState::new(
            program.compiled().clone(),
            self.clone(),
            budget.clone(),
            scope.clone(),
            diagnostics.clone(),
            span,
            sender,
        )
        .start();

        Completion {
            receiver,
            budget,
            diagnostics,
            scope,
            _phantom: PhantomData,
        }
    }

    /// Runs `work` once on the pool inside `scope` and races it against
    /// `budget`. The work is refused when the budget is already spent, and
    /// its result is dropped when the budget runs out or is cancelled first.
    pub fn submit<F, R>(&self, scope: Arc<ScopedContext>, budget: TimeoutBudget, work: F) -> Completion<R>
    where
        F: FnOnce(&StepContext) -> anyhow::Result<R> + Send + 'static,
        R: Send + Sync + 'static,
    {
        let name = ArcStr::from("submit");
        let diagnostics = scope.get::<Diagnostics>().unwrap_or_default();
        let (sender, receiver) = oneshot::channel();

        let span = tracing::info_span!("task", name = %name);
        let context = StepContext {
            step: name.clone(),
            scope: scope.clone(),
            budget: budget.clone(),
            executor: self.clone(),
            span: span.clone(),
        };

        let pooled = self.dispatch(context, move |context| erase(&context.step, work(context)));

        let race = {
            let budget = budget.clone();
            let diagnostics = diagnostics.clone();

            async move {
                let result = budget.race(pooled).await.and_then(|result| result);
                if let Err(err) = &result {
                    if err.is_timeout() {
                        diagnostics.record_timeout();
                        tracing::warn!("{err}");
                    }
                }

                let _ = sender.send(result);
            }
        };

        self.spawn_timer(ExecutionScope::scope_future(scope.clone(), race.instrument(span)));

        Completion {
            receiver,
            budget,
            diagnostics,
            scope,
            _phantom: PhantomData,
        }
    }

    /// Starts the future built by `factory` on the timer thread inside
    /// `scope` and races it against `budget`. The future is dropped if the
    /// budget runs out or is cancelled first.
    pub fn submit_async<F, Fut, R>(
        &self,
        scope: Arc<ScopedContext>,
        budget: TimeoutBudget,
        factory: F,
    ) -> Completion<R>
    where
        F: FnOnce(&StepContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Send + Sync + 'static,
    {
        let name = ArcStr::from("submit_async");
        let diagnostics = scope.get::<Diagnostics>().unwrap_or_default();
        let (sender, receiver) = oneshot::channel();

        let span = tracing::info_span!("task", name = %name);
        let context = StepContext {
            step: name.clone(),
            scope: scope.clone(),
            budget: budget.clone(),
            executor: self.clone(),
            span: span.clone(),
        };

        let race = {
            let budget = budget.clone();
            let diagnostics = diagnostics.clone();

            async move {
                let work = AssertUnwindSafe(async move { factory(&context).await }).catch_unwind();
                let result = match budget.race(work).await {
                    Ok(Ok(result)) => erase(&name, result),
                    Ok(Err(panic)) => Err(panic_error(&name, panic)),
                    Err(err) => {
                        if err.is_timeout() {
                            diagnostics.record_timeout();
                            tracing::warn!("{err}");
                        }
                        Err(err)
                    }
                };

                let _ = sender.send(result);
            }
        };

        self.spawn_timer(ExecutionScope::scope_future(scope.clone(), race.instrument(span)));

        Completion {
            receiver,
            budget,
            diagnostics,
            scope,
            _phantom: PhantomData,
        }
    }

    /// Runs `work` on the pool inside the scope and span of `context` and
    /// returns a future of its result. The work does not start once the
    /// budget of `context` is spent. Callers race the future against that
    /// budget and count the timeout themselves.
    pub(crate) fn dispatch<F>(
        &self,
        context: StepContext,
        work: F,
    ) -> BoxFuture<'static, Result<Dynamic, ExecError>>
    where
        F: FnOnce(&StepContext) -> Result<Dynamic, ExecError> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        self.inner.pool.spawn(move || {
            let _scope = ExecutionScope::enter(context.scope.clone());
            let _enter = context.span.enter();

            let result = match context.budget.verify() {
                Ok(_) => catch_unwind(AssertUnwindSafe(|| work(&context)))
                    .unwrap_or_else(|panic| Err(panic_error(&context.step, panic))),
                Err(_) => Err(context.budget.failure()),
            };

            let _ = sender.send(result);
        });

        receiver
            .map(|received| received.unwrap_or_else(|_| Err(ExecError::Shutdown)))
            .boxed()
    }

    pub(crate) fn spawn_unit<F>(&self, unit: Unit, work: F)
    where
        F: FnOnce(&tracing::Span, Result<(), ExecError>) + Send + 'static,
    {
        self.inner.pool.spawn(move || unit.run(work));
    }

    pub(crate) fn spawn_timer<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.timers.handle.spawn(future);
    }
}

impl std::fmt::Debug for TracingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingExecutor")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Handle to the eventual result of a request or a submitted unit of work.
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<Dynamic, ExecError>>,
    budget: TimeoutBudget,
    diagnostics: Arc<Diagnostics>,
    scope: Arc<ScopedContext>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Completion<T>
where
    T: Send + Sync + 'static,
{
    /// Resolves once the work finished, failed, timed out or was cancelled.
    /// Needs no particular async runtime.
    pub async fn wait(self) -> Result<Arc<T>, ExecError> {
        let output = self.receiver.await.map_err(|_| ExecError::Shutdown)??;

        Ok(output
            .downcast::<T>()
            .expect("Type mismatch in program output"))
    }

    /// Blocks the calling thread until [`Completion::wait`] resolves. Must not
    /// be called from a pool worker.
    pub fn wait_blocking(self) -> Result<Arc<T>, ExecError> {
        futures::executor::block_on(self.wait())
    }

    /// Cancels the budget of the work, which completes with
    /// [`ExecError::Cancelled`] unless it already finished.
    pub fn cancel(&self) {
        self.budget.cancel();
    }

    pub fn budget(&self) -> &TimeoutBudget {
        &self.budget
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// The context the work runs in. For requests this is the context created
    /// for the request, whose id identifies it.
    pub fn scope(&self) -> &Arc<ScopedContext> {
        &self.scope
    }
}
