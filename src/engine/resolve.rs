//! The resolution engine.
//!
//! Resolving a task resolves every output in its parameter tree first, then
//! calls the body inside the task's captured context and memoizes the
//! outcome. Each task moves through its state machine once:
//!
//! ```text
//! PENDING -> RUNNING -> COMPLETED | FAILED | DEP_FAILED
//! ```
//!
//! Events are emitted on the resolving thread in program order, so a
//! dependency's whole lifecycle is reported before its dependent finishes.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::PoisonError;

use crate::engine::task::TaskState;
use crate::engine::{Inputs, Task, mode};
use crate::error::{ExecutionError, PersistenceError, TaskError};
use crate::events::{self, EventType};
use crate::utils::panic_message;
use crate::value::{Field, Value};

impl Task {
    /// Runs the task, if it has not settled yet, and returns its result.
    ///
    /// Fails with [`TaskError::ResolveInTask`] from inside a task body.
    pub fn resolve(&self) -> Result<Value, TaskError> {
        if mode::in_task() {
            return Err(TaskError::ResolveInTask);
        }
        self.run()
    }

    pub(crate) fn run(&self) -> Result<Value, TaskError> {
        if let Some(settled) = self.settled() {
            return settled;
        }

        let Some(_active) = mode::activate(self.signature()) else {
            return Err(TaskError::Cycle {
                task: self.name().to_string(),
            });
        };

        let _running = self.0.run.lock().unwrap_or_else(PoisonError::into_inner);

        // Somebody else may have finished the task while we waited.
        if let Some(settled) = self.settled() {
            return settled;
        }

        let span = tracing::debug_span!("task", name = self.name(), signature = %self.signature());
        let _enter = span.enter();

        let is_root = !mode::resolving_deps();
        self.set_state(TaskState::Running);
        tracing::debug!(root = is_root, "running");

        if is_root {
            events::emit(EventType::RootStarted, self);
        }
        events::emit(EventType::TaskStarted, self);

        match self.run_to_completion() {
            Ok(value) => {
                self.set_state(TaskState::Completed(value.clone()));
                tracing::debug!("completed");

                events::emit(EventType::TaskFinished, self);
                if is_root {
                    events::emit(EventType::RootFinished, self);
                }
                Ok(value)
            }
            Err(err) => {
                let already_failed = {
                    let mut state = self.state();
                    let failed = matches!(*state, TaskState::Failed(_) | TaskState::DepFailed(_));
                    if !failed {
                        *state = TaskState::Failed(err.clone());
                    }
                    failed
                };

                if !already_failed {
                    tracing::debug!(error = %err, "failed");
                    events::emit(EventType::TaskFailed, self);
                    if !mode::resolving_deps() {
                        events::emit(EventType::RootFailed, self);
                    }
                }
                Err(err)
            }
        }
    }

    /// The memoized outcome of a task that already settled.
    fn settled(&self) -> Option<Result<Value, TaskError>> {
        match &*self.state() {
            TaskState::Completed(value) => Some(Ok(value.clone())),
            TaskState::Failed(err) => Some(Err(err.clone())),
            TaskState::DepFailed(_) => Some(Err(TaskError::DependencyFailed {
                task: self.name().to_string(),
            })),
            TaskState::Pending | TaskState::Running => None,
        }
    }

    fn run_to_completion(&self) -> Result<Value, TaskError> {
        let persistence = match (self.0.persist, &self.0.persistence) {
            (false, _) => None,
            (true, Some(persistence)) => Some(persistence),
            (true, None) => {
                return Err(PersistenceError::NotConfigured {
                    task: self.name().to_string(),
                }
                .into());
            }
        };

        let key = self.signature().key();

        if let Some(persistence) = persistence {
            match persistence.load(&key) {
                Ok(value) => {
                    tracing::debug!(%key, "loaded from cache");
                    return Ok(value);
                }
                Err(PersistenceError::NotFound(_)) => {}
                Err(PersistenceError::Corrupt { source, .. }) => {
                    tracing::warn!(%key, "discarding corrupt cache entry: {source}");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let inputs = self.resolve_dependencies()?;
        let value = self.execute(&inputs)?;

        if let Some(persistence) = persistence {
            persistence.save(&value, &key)?;
            tracing::debug!(%key, "stored in cache");
        }

        Ok(value)
    }

    fn resolve_dependencies(&self) -> Result<Inputs, TaskError> {
        let _phase = mode::enter_resolution_phase();

        let mut inputs = BTreeMap::new();
        for (name, value) in self.0.params.iter().chain(&self.0.ignored) {
            inputs.insert(name.clone(), self.resolve_value(value)?);
        }
        Ok(Inputs(inputs))
    }

    /// Replaces every output in `value` with the value it resolves to.
    fn resolve_value(&self, value: &Value) -> Result<Value, TaskError> {
        let resolved = match value {
            Value::Output(output) => match output.owner().run() {
                Ok(value) => value,
                Err(_) if mode::in_task() => Value::Null,
                Err(err) => {
                    self.set_state(TaskState::DepFailed(err.clone()));
                    tracing::debug!(dependency = output.owner().name(), "dependency failed");
                    events::emit(EventType::TaskDepFailed, self);
                    return Err(err);
                }
            },
            Value::List(items) => Value::List(self.resolve_all(items)?),
            Value::Tuple(items) => Value::Tuple(self.resolve_all(items)?),
            Value::Set(items) => Value::Set(
                items
                    .iter()
                    .map(|item| self.resolve_value(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| Ok((self.resolve_value(k)?, self.resolve_value(v)?)))
                    .collect::<Result<_, TaskError>>()?,
            ),
            Value::Record(record) => {
                let fields = record
                    .fields()
                    .iter()
                    .map(|field| {
                        Ok(Field {
                            name: field.name.clone(),
                            value: self.resolve_value(&field.value)?,
                            ignored: field.ignored,
                        })
                    })
                    .collect::<Result<Vec<_>, TaskError>>()?;
                Value::Record(record.with_fields(fields))
            }
            scalar => scalar.clone(),
        };
        Ok(resolved)
    }

    fn resolve_all(&self, items: &[Value]) -> Result<Vec<Value>, TaskError> {
        items.iter().map(|item| self.resolve_value(item)).collect()
    }

    fn execute(&self, inputs: &Inputs) -> Result<Value, TaskError> {
        let _context = self.0.context.enter();
        let _phase = mode::enter_exec_phase();

        match catch_unwind(AssertUnwindSafe(|| (self.0.body)(inputs))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ExecutionError::new(err).into()),
            Err(panic) => Err(TaskError::Panic {
                task: self.name().to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }
}
