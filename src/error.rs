use std::fmt::{Debug, Display};
use std::sync::Arc;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

/// The error a task body returned, shared between everyone who resolves the
/// task. The message is the body's own message, unchanged.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct ExecutionError(pub(crate) Arc<anyhow::Error>);

impl ExecutionError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The error exactly as the body produced it.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Returns `true` when both handles point at the same cached error.
    pub fn same(&self, other: &ExecutionError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(e: anyhow::Error) -> Self {
        ExecutionError(Arc::new(e))
    }
}

/// Errors raised while resolving a task.
///
/// When a dependency fails, the dependent task reports the upstream error
/// value itself, so callers can match on the original failure no matter how
/// deep in the graph it happened.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Task {task} failed due to dependency failure")]
    DependencyFailed { task: String },

    #[error("resolve() cannot be called inside a task")]
    ResolveInTask,

    #[error("Dependency cycle detected at task {task}")]
    Cycle { task: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Task {task} panicked: {message}")]
    Panic { task: String, message: String },
}

impl TaskError {
    /// Downcasts the error returned by a task body.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Execution(err) => err.inner().downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Errors raised while creating a task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("task() cannot be called inside a task")]
    Reentrant,

    #[error("Required injectable parameter '{0}' not found in context")]
    MissingInjected(String),

    #[error("missing a required argument: '{0}'")]
    MissingArgument(String),

    #[error("got an unexpected keyword argument '{0}'")]
    UnexpectedArgument(String),

    #[error("got multiple values for argument '{0}'")]
    DuplicateArgument(String),

    #[error("takes {expected} positional arguments but {got} were given")]
    TooManyArguments { expected: usize, got: usize },

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Record '{record}' declares field '{field}' more than once")]
    DuplicateField { record: String, field: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Context has no attribute '{0}'")]
    KeyNotFound(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Value is not serializable: {0}")]
    NotSerializable(String),

    #[error("Malformed input: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, Clone)]
pub enum PersistenceError {
    #[error("Task {task} requires persistence but no backend is configured")]
    NotConfigured { task: String },

    #[error("No cached output under key '{0}'")]
    NotFound(String),

    #[error("Cached output under key '{key}' is corrupt: {source}")]
    Corrupt {
        key: String,
        source: SerializationError,
    },

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("Persistence backend failure:\n{0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Io(Arc::new(e))
    }
}

/// Errors raised by the typed accessors of [`Inputs`](crate::Inputs).
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Task input '{0}' is not bound")]
    Missing(String),

    #[error("Task input '{name}' expected {expected}, found {found}")]
    Mismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}
