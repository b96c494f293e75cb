use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::context::Context;
use crate::engine::{Inputs, LazyOutput};
use crate::error::TaskError;
use crate::persistence::OutputPersistence;
use crate::signature::Signature;
use crate::value::Value;

/// Type-erased task body.
pub(crate) type Body = Arc<dyn Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync>;

/// Lifecycle of a task. Every task starts out pending and settles in exactly
/// one terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    DepFailed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::DepFailed)
    }
}

pub(crate) enum TaskState {
    Pending,
    Running,
    Completed(Value),
    Failed(TaskError),
    DepFailed(TaskError),
}

impl TaskState {
    fn status(&self) -> Status {
        match self {
            TaskState::Pending => Status::Pending,
            TaskState::Running => Status::Running,
            TaskState::Completed(_) => Status::Completed,
            TaskState::Failed(_) => Status::Failed,
            TaskState::DepFailed(_) => Status::DepFailed,
        }
    }
}

pub(crate) struct TaskInner {
    pub(crate) name: String,
    pub(crate) version: u32,
    pub(crate) body: Body,
    /// Parameters that take part in the signature.
    pub(crate) params: BTreeMap<String, Value>,
    /// Parameters passed to the body but left out of the signature.
    pub(crate) ignored: BTreeMap<String, Value>,
    pub(crate) context: Context,
    pub(crate) persist: bool,
    pub(crate) persistence: Option<Arc<OutputPersistence>>,
    pub(crate) signature: Signature,
    pub(crate) state: Mutex<TaskState>,
    /// Held while the task is being run, so a task body executes at most once.
    pub(crate) run: Mutex<()>,
}

/// A single unit of work with bound parameters, a captured context and a
/// stable signature.
///
/// Tasks are cheap handles; clones share the same state. Equality and hashing
/// go through the signature only.
#[derive(Clone)]
pub struct Task(pub(crate) Arc<TaskInner>);

impl Task {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn version(&self) -> u32 {
        self.0.version
    }

    pub fn signature(&self) -> Signature {
        self.0.signature
    }

    pub fn status(&self) -> Status {
        self.state().status()
    }

    /// The error this task settled with, if it failed.
    pub fn error(&self) -> Option<TaskError> {
        match &*self.state() {
            TaskState::Failed(err) | TaskState::DepFailed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// The result, once the task has completed.
    pub fn value(&self) -> Option<Value> {
        match &*self.state() {
            TaskState::Completed(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The context captured when the task was created.
    pub fn context(&self) -> &Context {
        &self.0.context
    }

    /// Parameters that make up the task's identity.
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.0.params
    }

    /// Parameters excluded from the identity.
    pub fn ignored_params(&self) -> &BTreeMap<String, Value> {
        &self.0.ignored
    }

    pub fn persist(&self) -> bool {
        self.0.persist
    }

    /// A handle to this task's result.
    pub fn output(&self) -> LazyOutput {
        LazyOutput::new(self.clone())
    }

    /// Upstream tasks referenced anywhere in the parameter tree, in parameter
    /// order and without repetitions.
    pub fn dependencies(&self) -> Vec<Task> {
        let mut seen = HashSet::new();
        let mut deps = Vec::new();

        for value in self.0.params.values().chain(self.0.ignored.values()) {
            value.visit_outputs(&mut |output| {
                let owner = output.owner();
                if seen.insert(owner.signature()) {
                    deps.push(owner.clone());
                }
            });
        }

        deps
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, TaskState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        *self.state() = state;
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.signature() == other.signature()
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.signature().hash(state);
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.0.name)
            .field("version", &self.0.version)
            .field("signature", &self.0.signature)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
