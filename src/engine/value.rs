use std::fmt;
use std::marker::PhantomData;

use petgraph::graph::NodeIndex;

/// Position of a step in its [`StepGraph`](crate::StepGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(pub(crate) NodeIndex);

impl StepId {
    pub(crate) fn new(index: usize) -> Self {
        Self(NodeIndex::new(index))
    }

    pub fn index(&self) -> usize {
        self.0.index()
    }

    /// The value this step produces.
    pub fn value(&self) -> ValueId {
        ValueId(self.0)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0.index())
    }
}

/// Untyped identity of a computed value. Two ids are equal only when they
/// name the output of the same step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub(crate) NodeIndex);

impl ValueId {
    pub(crate) fn new(index: usize) -> Self {
        Self(NodeIndex::new(index))
    }

    /// The step producing this value.
    pub fn source(&self) -> StepId {
        StepId(self.0)
    }

    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// A type-safe reference to the output of a step.
///
/// A `Value<T>` is a lightweight, copyable token standing for a result of
/// type `T` that does not exist yet. Passing it to
/// [`StepDef::depends_on`](crate::StepDef::depends_on) declares a data
/// dependency; the planner guarantees the producing step has finished before
/// any consumer runs.
///
/// # Diamond Dependencies
///
/// If steps B and C both consume the value of A and D consumes both B and C,
/// A runs *once* per request and its result is shared.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Value<T> {
    pub(crate) id: ValueId,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Value<T> {
    pub(crate) fn new(id: ValueId) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    /// The step producing this value.
    pub fn source(&self) -> StepId {
        self.id.source()
    }
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Value<T> {}

impl<T> super::Handle for Value<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = &'a T;

    fn id(&self) -> ValueId {
        self.id
    }

    fn downcast<'a>(&self, output: &'a super::Dynamic) -> Self::Output<'a> {
        output
            .downcast_ref::<T>()
            .expect("Type mismatch in dependency resolution")
    }
}
