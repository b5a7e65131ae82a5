use std::sync::Arc;
use std::time::Duration;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

use crate::core::ArcStr;

/// Error raised by the body of a step, shared between every downstream task
/// the failure is forwarded to.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct StepError(#[from] pub(crate) Arc<anyhow::Error>);

impl StepError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        StepError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum TasukiError {
    #[error("Failed to build the worker pool:\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to build the timer runtime:\n{0}")]
    Timer(#[from] std::io::Error),

    #[error("Invalid executor configuration:\n{0}")]
    Config(#[from] serde_json::Error),

    #[error("Error while planning the program:\n{0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[cfg(feature = "logging")]
    #[error("Failed to install the tracing subscriber:\n{0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}

/// A malformed step graph reached the planner. These indicate a defect in
/// whatever produced the graph and are never recovered from at runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Cycle detected in step graph at step '{0}'")]
    Cycle(ArcStr),

    #[error("Step '{0}' consumes its own output")]
    SelfInput(ArcStr),

    #[error("Step '{step}' depends on unknown step #{input}")]
    UnknownStep { step: ArcStr, input: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BudgetError {
    #[error("{}", expired_message(.budget, .minimum))]
    Expired {
        budget: Duration,
        minimum: Option<Duration>,
    },

    #[error("Minimum ({min:?}) must not exceed maximum ({max:?})")]
    InvalidBounds { min: Duration, max: Duration },
}

fn expired_message(budget: &Duration, minimum: &Option<Duration>) -> String {
    match minimum {
        Some(minimum) => format!("Less than the minimum {minimum:?} remaining in a {budget:?} budget"),
        None => format!("Timeout after {budget:?}"),
    }
}

impl BudgetError {
    pub fn is_expired(&self) -> bool {
        matches!(self, BudgetError::Expired { .. })
    }
}

/// Failure of a request or of one of its tasks. Cheap to clone, since a
/// single failure is delivered to every task downstream of it.
#[derive(Debug, Error, Clone)]
pub enum ExecError {
    #[error("Step '{0}':\n{1}")]
    Step(ArcStr, StepError),

    #[error(transparent)]
    Expired(#[from] BudgetError),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Executor has shut down")]
    Shutdown,
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Expired(err) if err.is_expired())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Not inside an execution scope")]
    OutOfScope,
}
