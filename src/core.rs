use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::TimeoutBudget;
use crate::error::TasukiError;
use crate::executor::{Diagnostics, TracingExecutor};
use crate::scope::ScopedContext;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// Configuration of a [`TracingExecutor`](crate::TracingExecutor).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use tasuki::ExecutorConfig;
///
/// let config = ExecutorConfig::from_json(r#"{ "workers": 2 }"#).unwrap();
/// assert_eq!(config.workers, 2);
/// assert_eq!(config.worker_name, "tasuki-worker");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Size of the worker pool running synchronous steps.
    pub workers: usize,
    /// Prefix of worker thread names, suffixed with the worker index.
    pub worker_name: String,
    /// Name of the thread driving timers and asynchronous steps.
    pub timer_name: String,
    /// Budget used by [`TracingExecutor::budget`](crate::TracingExecutor::budget)
    /// when the caller does not supply one, in milliseconds.
    pub default_budget_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            worker_name: String::from("tasuki-worker"),
            timer_name: String::from("tasuki-timer"),
            default_budget_ms: 30_000,
        }
    }
}

impl ExecutorConfig {
    pub fn from_json(json: &str) -> Result<Self, TasukiError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn default_budget(&self) -> Duration {
        Duration::from_millis(self.default_budget_ms)
    }
}

/// The context passed to every step execution.
///
/// `StepContext` gives a step access to the request it runs for: the scoped
/// context with its capabilities and singletons, the budget the step runs
/// under and the executor, for steps that launch sub-operations of their own.
#[derive(Clone)]
pub struct StepContext {
    pub(crate) step: ArcStr,
    pub(crate) scope: Arc<ScopedContext>,
    pub(crate) budget: TimeoutBudget,
    pub(crate) executor: TracingExecutor,
    /// Tracing span assigned to the task running this step.
    pub(crate) span: tracing::Span,
}

impl StepContext {
    /// Name of the step being executed.
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn scope(&self) -> &Arc<ScopedContext> {
        &self.scope
    }

    /// Budget the step runs under. Guarded steps see their own child budget
    /// here, every other step sees the request budget.
    pub fn budget(&self) -> &TimeoutBudget {
        &self.budget
    }

    pub fn executor(&self) -> &TracingExecutor {
        &self.executor
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Metrics of the request, when the step runs as part of one.
    pub fn diagnostics(&self) -> Option<Arc<Diagnostics>> {
        self.scope.get::<Diagnostics>()
    }

    pub(crate) fn with_budget(&self, budget: TimeoutBudget) -> Self {
        Self {
            budget,
            ..self.clone()
        }
    }
}
