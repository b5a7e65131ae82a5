//! Hierarchical, monotonic timeout budgets.
//!
//! A [`TimeoutBudget`] is created per request and handed down to every unit
//! of work the request spawns. Nested operations carve child budgets out of
//! it with [`TimeoutBudget::create_timeout`] or
//! [`TimeoutBudget::create_bounded_timeout`]:
//!
//! * the child's clock starts at zero when the child is created, so nested
//!   timing is measured from when the nested operation actually begins;
//! * the child's ceiling is clamped by the parent's remaining ticks, so no
//!   child can outlive its parent.
//!
//! Ticks are signed nanoseconds. Remaining ticks go negative once a budget
//! has expired and never come back.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{BudgetError, ExecError};

/// A monotonic source of nanoseconds from an arbitrary origin.
pub trait Ticker: Send + Sync + Debug {
    fn read(&self) -> u64;
}

/// Ticker backed by the monotonic system clock.
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Ticker that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTicker {
    nanos: AtomicU64,
}

impl ManualTicker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Ticker for ManualTicker {
    fn read(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Reads a shared ticker relative to the moment it was created.
#[derive(Debug, Clone)]
struct RelativeTicker {
    source: Arc<dyn Ticker>,
    base: u64,
}

impl RelativeTicker {
    fn new(source: Arc<dyn Ticker>) -> Self {
        let base = source.read();
        Self { source, base }
    }

    fn read(&self) -> i64 {
        self.source.read().saturating_sub(self.base) as i64
    }

    fn child(&self) -> Self {
        Self::new(self.source.clone())
    }
}

/// Cancellation flag chained to the flags of every ancestor budget. The
/// notifier is shared by the whole tree, waiters re-check their own chain.
#[derive(Debug)]
struct Cancellation {
    parent: Option<Arc<Cancellation>>,
    flag: AtomicBool,
    notify: Arc<Notify>,
}

impl Cancellation {
    fn root() -> Self {
        Self {
            parent: None,
            flag: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
        }
    }

    fn child(parent: &Arc<Cancellation>) -> Self {
        Self {
            parent: Some(parent.clone()),
            flag: AtomicBool::new(false),
            notify: parent.notify.clone(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|parent| parent.is_cancelled())
    }

    fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn cancelled(&self) {
        loop {
            // Registered before the check, so a cancel in between is not lost.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct Inner {
    ticks: i64,
    budget: Duration,
    ticker: RelativeTicker,
    cancel: Arc<Cancellation>,
}

/// A hierarchical deadline. Cloning shares the same budget.
#[derive(Clone)]
pub struct TimeoutBudget {
    inner: Arc<Inner>,
}

fn to_ticks(duration: Duration) -> i64 {
    duration.as_nanos().min(i64::MAX as u128) as i64
}

fn to_duration(ticks: i64) -> Duration {
    Duration::from_nanos(ticks.max(0) as u64)
}

impl TimeoutBudget {
    /// Creates a root budget measured on the system clock.
    pub fn new(budget: Duration) -> Self {
        Self::with_ticker(budget, Arc::new(SystemTicker::default()))
    }

    /// Creates a root budget measured on the given ticker, starting now.
    pub fn with_ticker(budget: Duration, ticker: Arc<dyn Ticker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ticks: to_ticks(budget),
                budget,
                ticker: RelativeTicker::new(ticker),
                cancel: Arc::new(Cancellation::root()),
            }),
        }
    }

    fn child(&self, ticks: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                ticks,
                budget: to_duration(ticks),
                ticker: self.inner.ticker.child(),
                cancel: Arc::new(Cancellation::child(&self.inner.cancel)),
            }),
        }
    }

    /// The full duration of this budget.
    pub fn budget(&self) -> Duration {
        self.inner.budget
    }

    /// The full number of ticks of this budget, fixed at creation.
    pub fn total_ticks(&self) -> i64 {
        self.inner.ticks
    }

    pub fn elapsed_ticks(&self) -> i64 {
        self.inner.ticker.read()
    }

    /// Ticks left before expiry. Negative once expired, at most zero once
    /// cancelled.
    pub fn remaining_ticks(&self) -> i64 {
        let remaining = self.inner.ticks.saturating_sub(self.elapsed_ticks());
        if self.is_cancelled() {
            remaining.min(0)
        } else {
            remaining
        }
    }

    pub fn remaining(&self) -> Duration {
        to_duration(self.remaining_ticks())
    }

    /// Returns `true` while there is time left.
    pub fn check(&self) -> bool {
        self.remaining_ticks() > 0
    }

    /// Fails with [`BudgetError::Expired`] when no time is left.
    pub fn verify(&self) -> Result<Duration, BudgetError> {
        let remaining = self.remaining_ticks();
        if remaining <= 0 {
            return Err(self.expiry_error());
        }
        Ok(to_duration(remaining))
    }

    /// Fails with [`BudgetError::Expired`] when less than `minimum` is left.
    pub fn verify_min(&self, minimum: Duration) -> Result<Duration, BudgetError> {
        let remaining = self.remaining_ticks();
        if remaining < to_ticks(minimum) {
            return Err(BudgetError::Expired {
                budget: self.inner.budget,
                minimum: Some(minimum),
            });
        }
        Ok(to_duration(remaining))
    }

    /// `min(remaining, maximum)` in ticks.
    pub fn compute_maximum(&self, maximum: Duration) -> i64 {
        self.remaining_ticks().min(to_ticks(maximum))
    }

    /// `min(remaining, maximum)` in ticks, failing when that is less than
    /// `minimum`.
    pub fn compute_bounded(&self, minimum: Duration, maximum: Duration) -> Result<i64, BudgetError> {
        if minimum > maximum {
            return Err(BudgetError::InvalidBounds {
                min: minimum,
                max: maximum,
            });
        }

        let remaining = self.remaining_ticks();
        if remaining < to_ticks(minimum) {
            return Err(BudgetError::Expired {
                budget: self.inner.budget,
                minimum: Some(minimum),
            });
        }

        Ok(remaining.min(to_ticks(maximum)))
    }

    /// Child budget of at most `maximum`, clamped by what is left here.
    pub fn create_timeout(&self, maximum: Duration) -> TimeoutBudget {
        self.child(self.compute_maximum(maximum))
    }

    /// Child budget of at most `maximum`, failing unless at least `minimum`
    /// is left here.
    pub fn create_bounded_timeout(
        &self,
        minimum: Duration,
        maximum: Duration,
    ) -> Result<TimeoutBudget, BudgetError> {
        Ok(self.child(self.compute_bounded(minimum, maximum)?))
    }

    /// Child budget bounded by whatever is left of `other`.
    pub fn create_timeout_from(&self, other: &TimeoutBudget) -> TimeoutBudget {
        self.child(self.remaining_ticks().min(other.remaining_ticks()))
    }

    /// Cancels this budget and every budget derived from it.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once this budget or one of its ancestors is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Resolves once this budget runs out or is cancelled.
    pub async fn expired(&self) {
        loop {
            let remaining = self.remaining_ticks();
            if remaining <= 0 {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(to_duration(remaining)) => continue,
                _ = self.cancelled() => return,
            }
        }
    }

    /// Races `future` against this budget. Whichever finishes first wins; the
    /// loser is dropped, which cancels the in-flight future or the scheduled
    /// expiry timer.
    ///
    /// Must be polled inside a Tokio runtime with the time driver enabled.
    pub async fn race<F>(&self, future: F) -> Result<F::Output, ExecError>
    where
        F: Future,
    {
        let remaining = match self.verify() {
            Ok(remaining) => remaining,
            Err(_) => return Err(self.failure()),
        };

        tokio::select! {
            biased;
            output = future => Ok(output),
            _ = self.cancelled() => Err(ExecError::Cancelled),
            _ = tokio::time::sleep(remaining) => Err(self.expiry_error().into()),
        }
    }

    /// The failure reported by work refused or interrupted by this budget.
    pub fn failure(&self) -> ExecError {
        if self.is_cancelled() {
            ExecError::Cancelled
        } else {
            self.expiry_error().into()
        }
    }

    fn expiry_error(&self) -> BudgetError {
        BudgetError::Expired {
            budget: self.inner.budget,
            minimum: None,
        }
    }
}

impl Debug for TimeoutBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutBudget")
            .field("budget", &self.inner.budget)
            .field("remaining_ticks", &self.remaining_ticks())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
