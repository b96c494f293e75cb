use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use crate::engine::{Status, Task, mode};
use crate::error::TaskError;
use crate::value::Value;

/// Deferred handle to the result of a [`Task`].
///
/// Passing an output as an argument to another task is what makes that task
/// depend on the owner. Nothing runs until [`LazyOutput::resolve`] is called.
#[derive(Clone)]
pub struct LazyOutput {
    owner: Task,
}

impl LazyOutput {
    pub(crate) fn new(owner: Task) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> &Task {
        &self.owner
    }

    /// `true` once the owner completed successfully.
    pub fn exists(&self) -> bool {
        self.owner.status() == Status::Completed
    }

    /// The computed value, if any, without triggering execution.
    pub fn value(&self) -> Option<Value> {
        self.owner.value()
    }

    /// Runs the owner and everything it depends on, then returns its result.
    ///
    /// Repeated calls return the memoized result or error. Fails with
    /// [`TaskError::ResolveInTask`] from inside a task body.
    pub fn resolve(&self) -> Result<Value, TaskError> {
        if mode::in_task() {
            return Err(TaskError::ResolveInTask);
        }
        self.owner.run()
    }
}

impl PartialEq for LazyOutput {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner
    }
}

impl Eq for LazyOutput {}

impl PartialOrd for LazyOutput {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LazyOutput {
    fn cmp(&self, other: &Self) -> Ordering {
        self.owner.signature().cmp(&other.owner.signature())
    }
}

impl Hash for LazyOutput {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
    }
}

impl Debug for LazyOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LazyOutput({}#{})", self.owner.name(), self.owner.signature())
    }
}
