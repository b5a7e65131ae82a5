use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::Program;
use crate::engine::TaskId;

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    /// Time spent on workers, excluding time suspended on async steps.
    pub duration: Duration,
}

/// Execution metrics of a single request.
///
/// Bound into the request's [`ScopedContext`](crate::ScopedContext), so steps
/// can reach it through [`StepContext::diagnostics`](crate::StepContext::diagnostics).
#[derive(Debug, Default)]
pub struct Diagnostics {
    execution_times: Mutex<HashMap<TaskId, TaskExecution>>,
    tasks_run: AtomicUsize,
    timeouts: AtomicUsize,
    failures: AtomicUsize,
    joins_fired: AtomicUsize,
}

impl Diagnostics {
    pub(crate) fn record_execution(&self, task: TaskId, start: Instant, duration: Duration) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);

        let mut times = self.execution_times.lock().unwrap();
        times
            .entry(task)
            .and_modify(|exec| exec.duration += duration)
            .or_insert(TaskExecution { start, duration });
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_join(&self) {
        self.joins_fired.fetch_add(1, Ordering::Relaxed);
    }

    /// Start and accumulated duration of every run task that got to run.
    pub fn execution_times(&self) -> HashMap<TaskId, TaskExecution> {
        self.execution_times.lock().unwrap().clone()
    }

    /// Units of work executed on the pool, counting every resumption after an
    /// async step separately.
    pub fn tasks_run(&self) -> usize {
        self.tasks_run.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn joins_fired(&self) -> usize {
        self.joins_fired.load(Ordering::Relaxed)
    }

    /// Renders the plan of `program` as a Mermaid diagram, color-coded by the
    /// time each run task took in this request.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Did not run
    pub fn render_mermaid<T>(&self, program: &Program<T>) -> String {
        use std::fmt::Write;

        let times = self.execution_times();
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // No tasks ran
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let plan = program.plan();
        let annotate = |id: TaskId| {
            if !plan.task(id).steps().is_empty() {
                return Some(match times.get(&id) {
                    Some(exec) => {
                        let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);

                        // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
                        let (r, g) = if t < 0.5 {
                            ((255.0 * t * 2.0) as u8, 255)
                        } else {
                            (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                        };

                        (format!("{:.2?}", exec.duration), format!("#{r:02X}{g:02X}00"))
                    }
                    None => (String::from("Skipped"), String::from("#ADD8E6")),
                });
            }
            None
        };

        let mut f = String::new();
        let _ = plan.write_mermaid(&mut f, program.steps(), annotate);
        let _ = writeln!(f, "    %% timeouts: {}, failures: {}", self.timeouts(), self.failures());
        f
    }
}
