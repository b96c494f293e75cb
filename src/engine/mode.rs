//! Per-thread execution mode.
//!
//! The engine tracks two flags for the calling thread: whether a task body is
//! currently running, and whether the engine is resolving dependencies of
//! some task. They decide which operations are legal and which task counts as
//! the root of a resolution. A third piece of state, the set of tasks being
//! resolved right now, catches dependency cycles.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::marker::PhantomData;

use crate::signature::Signature;

thread_local! {
    static IN_TASK: Cell<bool> = const { Cell::new(false) };
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
    static ACTIVE: RefCell<HashSet<Signature>> = RefCell::new(HashSet::new());
}

/// Whether a task body is executing on this thread.
pub fn in_task() -> bool {
    IN_TASK.with(Cell::get)
}

/// Whether the engine is resolving dependencies on this thread.
pub(crate) fn resolving_deps() -> bool {
    RESOLVING.with(Cell::get)
}

/// Restores both flags to what they were when the phase was entered.
pub(crate) struct Phase {
    in_task: bool,
    resolving: bool,
    _not_send: PhantomData<*const ()>,
}

impl Phase {
    fn enter(in_task: bool, resolving: bool) -> Self {
        Phase {
            in_task: IN_TASK.with(|c| c.replace(in_task)),
            resolving: RESOLVING.with(|c| c.replace(resolving)),
            _not_send: PhantomData,
        }
    }
}

impl Drop for Phase {
    fn drop(&mut self) {
        IN_TASK.with(|c| c.set(self.in_task));
        RESOLVING.with(|c| c.set(self.resolving));
    }
}

/// Dependencies are being resolved; the in-task flag is left as is.
pub(crate) fn enter_resolution_phase() -> Phase {
    Phase::enter(in_task(), true)
}

/// A task body is about to run.
pub(crate) fn enter_exec_phase() -> Phase {
    Phase::enter(true, false)
}

/// Marks a task as being resolved on this thread.
pub(crate) struct ActiveGuard {
    signature: Signature,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|set| set.borrow_mut().remove(&self.signature));
    }
}

/// Returns `None` when a task with this signature is already being resolved
/// further up this thread's call chain.
pub(crate) fn activate(signature: Signature) -> Option<ActiveGuard> {
    let fresh = ACTIVE.with(|set| set.borrow_mut().insert(signature));
    fresh.then(|| ActiveGuard {
        signature,
        _not_send: PhantomData,
    })
}
