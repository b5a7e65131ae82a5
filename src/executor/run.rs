//! Per-request execution of a planned task graph.
//!
//! A request owns one [`RunState`]: a value slot per step, a countdown per
//! join and the channel its result is delivered on. The task graph itself is
//! shared with every other request of the same program and never mutated.
//!
//! Tasks signal each other directly. A run task finishing dispatches its
//! successors; a join only fires when its countdown reaches zero, on the
//! thread of whichever prior signalled last. Failures travel the same edges
//! as successes, so every task downstream of a failure is skipped and the
//! failure reaches the end of the graph.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Notify, oneshot};
use tracing::Instrument;

use crate::blueprint::Compiled;
use crate::budget::TimeoutBudget;
use crate::core::{ArcStr, Dynamic, StepContext};
use crate::engine::{Execution, StepId, TaskId, TaskKind, ValueId};
use crate::error::{ExecError, StepError};
use crate::executor::{Diagnostics, TracingExecutor, Unit, panic_error};
use crate::scope::{ExecutionScope, ScopedContext};

type Signal = Result<(), ExecError>;
type Output = Result<Dynamic, ExecError>;

pub(crate) struct RunState {
    program: Arc<Compiled>,
    executor: TracingExecutor,
    budget: TimeoutBudget,
    scope: Arc<ScopedContext>,
    diagnostics: Arc<Diagnostics>,
    span: tracing::Span,
    slots: Vec<OnceLock<Dynamic>>,
    countdowns: Vec<AtomicUsize>,
    failures: Vec<OnceLock<ExecError>>,
    done: Mutex<Option<oneshot::Sender<Output>>>,
    finished: Notify,
}

impl RunState {
    pub(crate) fn new(
        program: Arc<Compiled>,
        executor: TracingExecutor,
        budget: TimeoutBudget,
        scope: Arc<ScopedContext>,
        diagnostics: Arc<Diagnostics>,
        span: tracing::Span,
        done: oneshot::Sender<Output>,
    ) -> Arc<Self> {
        let plan = &program.plan;

        let slots = (0..program.steps.len()).map(|_| OnceLock::new()).collect();
        let countdowns = plan
            .tasks()
            .map(|(_, task)| match &task.kind {
                TaskKind::Join { priors } => AtomicUsize::new(priors.len()),
                _ => AtomicUsize::new(0),
            })
            .collect();
        let failures = (0..plan.len()).map(|_| OnceLock::new()).collect();

        Arc::new(Self {
            program,
            executor,
            budget,
            scope,
            diagnostics,
            span,
            slots,
            countdowns,
            failures,
            done: Mutex::new(Some(done)),
            finished: Notify::new(),
        })
    }

    /// Arms the watchdog and fires the fork task.
    pub(crate) fn start(self: &Arc<Self>) {
        let watchdog = self.clone();
        self.executor.spawn_timer(async move {
            tokio::select! {
                _ = watchdog.finished.notified() => {}
                _ = watchdog.budget.expired() => {
                    let failure = watchdog.budget.failure();
                    if failure.is_timeout() {
                        watchdog.diagnostics.record_timeout();
                    }
                    watchdog.finish(Err(failure));
                    // Drops every async step still racing against the budget.
                    watchdog.budget.cancel();
                }
            }
        });

        let _enter = self.span.enter();
        tracing::debug!(tasks = self.program.plan.len(), "request started");
        self.dispatch(self.program.plan.root(), Ok(()));
    }

    fn dispatch(self: &Arc<Self>, task: TaskId, signal: Signal) {
        match &self.program.plan.task(task).kind {
            TaskKind::Fork => self.advance(task, signal),
            TaskKind::Join { .. } => self.join(task, signal),
            TaskKind::Run { .. } => match signal {
                // Skipped, the failure is passed on as is.
                Err(err) => self.advance(task, Err(err)),
                Ok(()) => {
                    let state = self.clone();
                    self.executor.spawn_unit(self.unit(task), move |span, gate| match gate {
                        Ok(()) => state.run(task, span),
                        Err(err) => state.fail(task, err),
                    });
                }
            },
        }
    }

    fn join(self: &Arc<Self>, task: TaskId, signal: Signal) {
        if let Err(err) = signal {
            // Only the first failure is kept.
            let _ = self.failures[task.0].set(err);
        }

        if self.countdowns[task.0].fetch_sub(1, Ordering::AcqRel) == 1 {
            self.diagnostics.record_join();

            let signal = match self.failures[task.0].get() {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
            self.advance(task, signal);
        }
    }

    fn advance(self: &Arc<Self>, task: TaskId, signal: Signal) {
        let next = &self.program.plan.task(task).next;
        if next.is_empty() {
            return self.complete(signal);
        }

        for &next in next {
            self.dispatch(next, signal.clone());
        }
    }

    fn run(self: &Arc<Self>, task: TaskId, span: &tracing::Span) {
        let mut table = HashMap::new();
        for &value in &self.program.plan.task(task).inputs {
            match self.slots[value.index()].get() {
                Some(output) => {
                    table.insert(value, output.clone());
                }
                None => return self.fail(task, self.missing(value)),
            }
        }

        self.run_from(task, 0, table, span);
    }

    /// Executes the steps of `task` from position `start` on, until the task
    /// finishes, fails or suspends on an async step.
    fn run_from(
        self: &Arc<Self>,
        task: TaskId,
        start: usize,
        mut table: HashMap<ValueId, Dynamic>,
        span: &tracing::Span,
    ) {
        let steps = self.program.plan.task(task).steps();

        for (offset, &id) in steps.iter().enumerate().skip(start) {
            let Some(node) = self.program.steps.get(id) else {
                return self.fail(task, self.missing(id.value()));
            };

            let inputs = node
                .step
                .inputs()
                .into_iter()
                .map(|value| table.get(&value).cloned().ok_or(value))
                .collect::<Result<Vec<_>, _>>();

            let inputs = match inputs {
                Ok(inputs) => inputs,
                Err(value) => return self.fail(task, self.missing(value)),
            };

            let context = self.context(node.name.clone(), span);
            let execution = catch_unwind(AssertUnwindSafe(|| node.step.execute(&context, &inputs)))
                .unwrap_or_else(|panic| Execution::Ready(Err(panic_error(&node.name, panic))));

            match execution {
                Execution::Ready(Ok(output)) => self.publish(id, output, &mut table),
                Execution::Ready(Err(err)) => {
                    if err.is_timeout() {
                        self.diagnostics.record_timeout();
                    }
                    return self.fail(task, err);
                }
                Execution::Pending { future, budget } => {
                    let budget = budget.unwrap_or_else(|| self.budget.clone());
                    return self.suspend(task, offset, table, future, budget, span);
                }
            }
        }

        self.advance(task, Ok(()));
    }

    /// Hands a pending step to the timer thread. The remaining steps of the
    /// task continue on the pool once the step completes or loses its race.
    fn suspend(
        self: &Arc<Self>,
        task: TaskId,
        offset: usize,
        table: HashMap<ValueId, Dynamic>,
        future: BoxFuture<'static, Output>,
        budget: TimeoutBudget,
        span: &tracing::Span,
    ) {
        let state = self.clone();
        let name = self.step_name(task, offset);

        let race = async move {
            let output = match budget.race(AssertUnwindSafe(future).catch_unwind()).await {
                Ok(Ok(output)) => output,
                Ok(Err(panic)) => Err(panic_error(&name, panic)),
                Err(err) => Err(err),
            };

            // Pool work handed back by a guard may have been refused by its
            // own budget check rather than by the race.
            if let Err(err) = &output {
                if err.is_timeout() {
                    state.diagnostics.record_timeout();
                }
            }

            let resume = state.clone();
            state.executor.spawn_unit(state.unit(task), move |span, gate| {
                resume.resume(task, offset, table, gate.and(output), span)
            });
        };

        self.executor.spawn_timer(ExecutionScope::scope_future(
            self.scope.clone(),
            race.instrument(span.clone()),
        ));
    }

    fn resume(
        self: &Arc<Self>,
        task: TaskId,
        offset: usize,
        mut table: HashMap<ValueId, Dynamic>,
        output: Output,
        span: &tracing::Span,
    ) {
        match output {
            Ok(output) => {
                let id = self.program.plan.task(task).steps()[offset];
                self.publish(id, output, &mut table);
                self.run_from(task, offset + 1, table, span);
            }
            Err(err) => self.fail(task, err),
        }
    }

    fn publish(&self, id: StepId, output: Dynamic, table: &mut HashMap<ValueId, Dynamic>) {
        let _ = self.slots[id.index()].set(output.clone());
        table.insert(id.value(), output);
    }

    fn fail(self: &Arc<Self>, task: TaskId, err: ExecError) {
        self.diagnostics.record_failure();

        match &err {
            ExecError::Expired(_) => tracing::warn!(%task, "{err}"),
            ExecError::Cancelled | ExecError::Shutdown => tracing::debug!(%task, "{err}"),
            ExecError::Step(..) => tracing::error!(%task, "{err}"),
        }

        self.advance(task, Err(err));
    }

    fn complete(&self, signal: Signal) {
        let terminal = self.program.plan.terminal();
        let output = signal.and_then(|()| {
            self.slots[terminal.index()]
                .get()
                .cloned()
                .ok_or_else(|| self.missing(terminal.value()))
        });

        self.finish(output);
    }

    /// Delivers the result of the request. Only the first call has an effect.
    fn finish(&self, output: Output) {
        let Some(done) = self.done.lock().unwrap().take() else {
            return;
        };

        let _enter = self.span.enter();
        match &output {
            Ok(_) => tracing::info!(joins = self.diagnostics.joins_fired(), "request completed"),
            Err(err) if err.is_timeout() => tracing::warn!("request timed out: {err}"),
            Err(err) => tracing::error!("request failed: {err}"),
        }

        let _ = done.send(output);
        self.finished.notify_one();
    }

    fn unit(&self, task: TaskId) -> Unit {
        let name = self
            .program
            .plan
            .task(task)
            .steps()
            .iter()
            .map(|&step| self.program.steps.name(step).to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Unit {
            name: ArcStr::from(name),
            task: Some(task),
            scope: self.scope.clone(),
            budget: self.budget.clone(),
            diagnostics: self.diagnostics.clone(),
            parent: self.span.clone(),
        }
    }

    fn context(&self, step: ArcStr, span: &tracing::Span) -> StepContext {
        StepContext {
            step,
            scope: self.scope.clone(),
            budget: self.budget.clone(),
            executor: self.executor.clone(),
            span: span.clone(),
        }
    }

    fn step_name(&self, task: TaskId, offset: usize) -> ArcStr {
        match self.program.plan.task(task).steps().get(offset) {
            Some(&step) => self.program.steps.name(step),
            None => ArcStr::from("?"),
        }
    }

    fn missing(&self, value: ValueId) -> ExecError {
        ExecError::Step(
            self.program.steps.name(value.source()),
            StepError::new(anyhow::anyhow!("value was never published")),
        )
    }
}
