#![forbid(unsafe_code)]
//! Static fork/join planning and budgeted execution of query programs.
//!
//! A program is a graph of [`Step`]s, each producing one value from the
//! values of the steps it depends on. [`Blueprint`] builds such a graph and
//! compiles it into a [`Program`]: the [`GraphPlanner`] partitions the steps
//! into straight-line run tasks synchronised by join tasks, once, ahead of
//! any request.
//!
//! A [`TracingExecutor`] then runs requests of the program on a bounded
//! worker pool. Every request carries a [`TimeoutBudget`] and executes inside
//! its own [`ScopedContext`], which follows the request across threads and
//! across the suspensions of async steps.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tasuki::{Blueprint, ExecutorConfig, ScopedContext, TimeoutBudget, TracingExecutor};
//!
//! let mut blueprint = Blueprint::new();
//! let a = blueprint.step().name("a").run(|_| Ok(2u64));
//! let b = blueprint.step().name("b").run(|_| Ok(3u64));
//! let product = blueprint
//!     .step()
//!     .name("product")
//!     .depends_on((a, b))
//!     .run(|_, (a, b): (&u64, &u64)| Ok(a * b));
//!
//! let program = blueprint.compile(product).unwrap();
//! let executor = TracingExecutor::new(ExecutorConfig::default()).unwrap();
//!
//! let budget = TimeoutBudget::new(Duration::from_secs(1));
//! let completion = executor.execute(&program, budget, ScopedContext::new());
//! assert_eq!(*completion.wait_blocking().unwrap(), 6);
//! ```

mod blueprint;
mod budget;
mod core;
mod engine;
mod error;
mod executor;
mod scope;
mod utils;

pub use crate::blueprint::{Blueprint, Program, StepBinder, StepDef};
pub use crate::budget::{ManualTicker, SystemTicker, Ticker, TimeoutBudget};
pub use crate::core::{ExecutorConfig, StepContext};
pub use crate::engine::{
    Dependencies, Execution, GraphPlanner, Handle, Step, StepGraph, StepId, StepNode, Task,
    TaskGraph, TaskId, TaskKind, Value, ValueId,
};
pub use crate::error::*;
pub use crate::executor::{Completion, Diagnostics, TaskExecution, TracingExecutor};
pub use crate::scope::{ExecutionScope, ScopeBuilder, ScopeGuard, ScopedContext, Scoped};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
