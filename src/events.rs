//! Lifecycle notifications.
//!
//! The engine emits an [`Event`] at every state transition of a task. Events
//! go to the [`EventBus`] installed on the emitting thread with
//! [`EventBus::install`], or to the process-wide [`EventBus::global`] table
//! when none is installed. Delivery is synchronous and follows registration
//! order.
//!
//! A panicking listener is logged and skipped; the remaining listeners still
//! see the event and the task being resolved is unaffected.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use crate::engine::Task;
use crate::utils::panic_message;

static GLOBAL: LazyLock<Arc<EventBus>> = LazyLock::new(|| Arc::new(EventBus::new()));

thread_local! {
    static INSTALLED: RefCell<Vec<Arc<EventBus>>> = const { RefCell::new(Vec::new()) };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// The task `resolve()` was called on started running.
    RootStarted,
    TaskStarted,
    /// A task gave up because one of its dependencies failed.
    TaskDepFailed,
    TaskFinished,
    TaskFailed,
    RootFinished,
    RootFailed,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::RootStarted,
        EventType::TaskStarted,
        EventType::TaskDepFailed,
        EventType::TaskFinished,
        EventType::TaskFailed,
        EventType::RootFinished,
        EventType::RootFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RootStarted => "ROOT_STARTED",
            EventType::TaskStarted => "TASK_STARTED",
            EventType::TaskDepFailed => "TASK_DEP_FAILED",
            EventType::TaskFinished => "TASK_FINISHED",
            EventType::TaskFailed => "TASK_FAILED",
            EventType::RootFinished => "ROOT_FINISHED",
            EventType::RootFailed => "ROOT_FAILED",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventType,
    pub task: Task,
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// A table of listeners keyed by event type.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventType, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus, created on first use.
    pub fn global() -> &'static Arc<EventBus> {
        &GLOBAL
    }

    /// Registers `listener` for events of type `kind`.
    pub fn listen<F>(&self, kind: EventType, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Routes events emitted on this thread to this bus until the guard is
    /// dropped.
    pub fn install(self: &Arc<Self>) -> BusGuard {
        let depth = INSTALLED.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(self.clone());
            stack.len()
        });

        BusGuard {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Delivers `event` to every listener registered for its type.
    pub fn emit(&self, event: &Event) {
        // Listeners may register more listeners, so the lock is not held
        // while they run.
        let listeners = match self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind)
        {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                tracing::error!(
                    event = %event.kind,
                    task = event.task.name(),
                    "listener panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    pub fn listener_count(&self, kind: EventType) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Keeps a bus installed on the current thread.
#[must_use = "the bus is uninstalled as soon as the guard is dropped"]
pub struct BusGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        INSTALLED.with(|stack| stack.borrow_mut().truncate(self.depth - 1));
    }
}

/// Registers `listener` on the process-wide bus.
pub fn listen<F>(kind: EventType, listener: F)
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    EventBus::global().listen(kind, listener);
}

/// The bus events emitted on this thread are delivered to.
pub fn current() -> Arc<EventBus> {
    INSTALLED
        .with(|stack| stack.borrow().last().cloned())
        .unwrap_or_else(|| EventBus::global().clone())
}

pub(crate) fn emit(kind: EventType, task: &Task) {
    let event = Event {
        kind,
        task: task.clone(),
    };
    tracing::trace!(event = %kind, task = task.name(), "emit");
    current().emit(&event);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::engine::{Arguments, TaskDef, create_task};
    use crate::value::Value;

    fn task() -> Task {
        let f = TaskDef::new("noop").run(|_| Ok(Value::Null));
        create_task(&f, Arguments::new()).unwrap()
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let seen = seen.clone();
            bus.listen(EventType::TaskStarted, move |_| seen.lock().unwrap().push(id));
        }

        let _guard = bus.install();
        emit(EventType::TaskStarted, &task());
        emit(EventType::TaskFinished, &task());

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(bus.listener_count(EventType::TaskStarted), 3);
        assert_eq!(bus.listener_count(EventType::TaskFinished), 0);
    }

    #[test]
    fn test_panicking_listener_is_skipped() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(0));

        bus.listen(EventType::RootStarted, |_| panic!("listener bug"));
        let counter = seen.clone();
        bus.listen(EventType::RootStarted, move |_| *counter.lock().unwrap() += 1);

        let _guard = bus.install();
        emit(EventType::RootStarted, &task());

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_install_is_scoped() {
        let outer = Arc::new(EventBus::new());
        let inner = Arc::new(EventBus::new());

        let _outer = outer.install();
        {
            let _inner = inner.install();
            assert!(Arc::ptr_eq(&current(), &inner));
        }
        assert!(Arc::ptr_eq(&current(), &outer));
    }

    #[test]
    fn test_names() {
        let names: Vec<_> = EventType::ALL.iter().map(|kind| kind.to_string()).collect();
        assert_eq!(names[0], "ROOT_STARTED");
        assert_eq!(names[6], "ROOT_FAILED");
    }
}
