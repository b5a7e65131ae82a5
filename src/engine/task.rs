use std::collections::{BTreeSet, HashSet};
use std::fmt::{self, Write};

use crate::engine::{StepGraph, StepId, ValueId};

/// Position of a task in its [`TaskGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Entry point of a request. Starts every task without predecessors.
    Fork,
    /// Straight-line sequence of steps executed in order.
    Run { steps: Vec<StepId> },
    /// Synchronization point firing once every prior has signalled.
    Join { priors: BTreeSet<TaskId> },
}

#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TaskKind,
    /// Tasks started when this one finishes.
    pub next: BTreeSet<TaskId>,
    /// Values computed on every path up to and including this task.
    pub available: HashSet<ValueId>,
    /// Values this task or anything after it still reads from upstream.
    pub inputs: HashSet<ValueId>,
}

impl Task {
    pub(crate) fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            next: BTreeSet::new(),
            available: HashSet::new(),
            inputs: HashSet::new(),
        }
    }

    pub fn steps(&self) -> &[StepId] {
        match &self.kind {
            TaskKind::Run { steps } => steps,
            _ => &[],
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, TaskKind::Join { .. })
    }
}

/// The planned form of a step graph, immutable and shared by every request
/// executing the same program.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub(crate) tasks: Vec<Task>,
    pub(crate) root: TaskId,
    pub(crate) sink: TaskId,
    pub(crate) terminal: StepId,
}

impl TaskGraph {
    pub fn root(&self) -> TaskId {
        self.root
    }

    /// The run task holding the terminal step.
    pub fn sink(&self) -> TaskId {
        self.sink
    }

    pub fn terminal(&self) -> StepId {
        self.terminal
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.tasks.iter().enumerate().map(|(i, task)| (TaskId(i), task))
    }

    pub fn runs(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.tasks()
            .filter(|(_, task)| matches!(task.kind, TaskKind::Run { .. }))
    }

    pub fn joins(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.tasks().filter(|(_, task)| task.is_join())
    }

    /// Renders the plan as a Mermaid flowchart. `annotate` may attach an extra
    /// label line and a fill colour to a task.
    pub(crate) fn write_mermaid<W, A>(&self, w: &mut W, steps: &StepGraph, annotate: A) -> fmt::Result
    where
        W: Write,
        A: Fn(TaskId) -> Option<(String, String)>,
    {
        writeln!(w, "graph LR")?;

        for (id, task) in self.tasks() {
            let label = match &task.kind {
                TaskKind::Fork => String::from("Fork"),
                TaskKind::Join { .. } => String::from("Join"),
                TaskKind::Run { steps: list } => list
                    .iter()
                    .map(|&step| steps.name(step).replace('"', "\\\""))
                    .collect::<Vec<_>>()
                    .join(", "),
            };

            match annotate(id) {
                Some((extra, colour)) => {
                    writeln!(w, "    {id}[\"{label}\\n{extra}\"]")?;
                    writeln!(w, "    style {id} fill:{colour}")?;
                }
                None => writeln!(w, "    {id}[\"{label}\"]")?,
            }
        }

        for (id, task) in self.tasks() {
            for next in &task.next {
                writeln!(w, "    {id} --> {next}")?;
            }
        }

        Ok(())
    }
}
