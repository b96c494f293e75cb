//! Optional result caching keyed by task signature.
//!
//! An [`OutputPersistence`] pairs a [`Backend`] that stores bytes with a
//! [`Serializer`] that produces them. It becomes active for the calling
//! thread through [`set_persistence`], and tasks declared with
//! `persist(true)` capture whatever is active when they are created.

mod backend;
mod serializer;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

pub use backend::{Backend, FileSystemBackend, InMemoryBackend};
pub use serializer::{CborSerializer, JsonSerializer, Serializer};

use crate::error::PersistenceError;
use crate::value::Value;

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<OutputPersistence>>> = const { RefCell::new(Vec::new()) };
}

/// A storage backend together with the format values are stored in.
pub struct OutputPersistence {
    backend: Box<dyn Backend>,
    serializer: Box<dyn Serializer>,
}

impl OutputPersistence {
    pub fn new(backend: impl Backend + 'static, serializer: impl Serializer + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            serializer: Box::new(serializer),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.backend.exists(key)
    }

    /// Stores `value` under `key`. Nothing is written when the value cannot
    /// be serialized.
    pub fn save(&self, value: &Value, key: &str) -> Result<(), PersistenceError> {
        let bytes = self.serializer.serialize(value)?;
        self.backend.save(key, &bytes)
    }

    pub fn load(&self, key: &str) -> Result<Value, PersistenceError> {
        let bytes = self.backend.load(key)?;
        self.serializer
            .deserialize(&bytes)
            .map_err(|source| PersistenceError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    pub fn invalidate(&self, key: Option<&str>) -> Result<(), PersistenceError> {
        self.backend.invalidate(key)
    }
}

/// Makes `persistence` the active store on this thread until the guard is
/// dropped.
pub fn set_persistence(persistence: Arc<OutputPersistence>) -> PersistenceGuard {
    let depth = ACTIVE.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(persistence);
        stack.len()
    });

    PersistenceGuard {
        depth,
        _not_send: PhantomData,
    }
}

/// The store active on this thread, if any.
pub fn current() -> Option<Arc<OutputPersistence>> {
    ACTIVE.with(|stack| stack.borrow().last().cloned())
}

#[must_use = "the store is deactivated as soon as the guard is dropped"]
pub struct PersistenceGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for PersistenceGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| stack.borrow_mut().truncate(self.depth - 1));
    }
}
