use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tsumugi::{
    Arguments, ConstructionError, Context, EventBus, EventType, Func, Param, Status, TaskDef,
    TaskError, Value, create_task, resolve_all,
};

type Log = Arc<Mutex<Vec<(EventType, String)>>>;

/// Installs a fresh bus recording every event on this thread.
fn record() -> (Log, Arc<EventBus>) {
    let log: Log = Arc::default();
    let bus = Arc::new(EventBus::new());
    for kind in EventType::ALL {
        let log = log.clone();
        bus.listen(kind, move |event| {
            log.lock()
                .unwrap()
                .push((event.kind, event.task.name().to_string()));
        });
    }
    (log, bus)
}

fn events(log: &Log) -> Vec<(EventType, String)> {
    log.lock().unwrap().clone()
}

fn ev(kind: EventType, name: &str) -> (EventType, String) {
    (kind, name.to_string())
}

fn add() -> Func {
    TaskDef::new("add")
        .param("a")
        .param("b")
        .run(|inputs| Ok(Value::from(inputs.int("a")? + inputs.int("b")?)))
}

fn multiply() -> Func {
    TaskDef::new("multiply")
        .param("x")
        .param("y")
        .run(|inputs| Ok(Value::from(inputs.int("x")? * inputs.int("y")?)))
}

#[derive(Debug, thiserror::Error)]
#[error("Intentional failure")]
struct Intentional;

#[test]
fn basic_task_execution() {
    let (_, bus) = record();
    let _bus = bus.install();

    let result = add().call(Arguments::new().arg(1).arg(2)).unwrap();
    assert_eq!(result.resolve().unwrap(), Value::Int(3));
    assert!(result.exists());
    assert_eq!(result.value(), Some(Value::Int(3)));
}

#[test]
fn equal_arguments_share_a_signature() {
    let (_, bus) = record();
    let _bus = bus.install();

    let f = add();
    let first = create_task(&f, Arguments::new().arg(1).arg(2)).unwrap();
    let second = create_task(&f, Arguments::new().arg(2).arg(3)).unwrap();
    let third = create_task(&f, Arguments::new().arg(1).arg(2)).unwrap();

    assert_eq!(first.signature(), third.signature());
    assert_ne!(first.signature(), second.signature());
    assert_eq!(first, third);
    assert_ne!(first, second);

    assert_eq!(first.resolve().unwrap(), Value::Int(3));
    assert_eq!(second.resolve().unwrap(), Value::Int(5));
    assert_eq!(third.resolve().unwrap(), Value::Int(3));
}

#[test]
fn dependency_chain() {
    let (log, bus) = record();
    let _bus = bus.install();

    let sum = add().call(Arguments::new().arg(2).arg(3)).unwrap();
    let product = multiply().call(Arguments::new().arg(&sum).arg(4)).unwrap();

    assert!(!sum.exists());
    assert_eq!(product.resolve().unwrap(), Value::Int(20));
    assert!(sum.exists());

    assert_eq!(
        events(&log),
        vec![
            ev(EventType::RootStarted, "multiply"),
            ev(EventType::TaskStarted, "multiply"),
            ev(EventType::TaskStarted, "add"),
            ev(EventType::TaskFinished, "add"),
            ev(EventType::TaskFinished, "multiply"),
            ev(EventType::RootFinished, "multiply"),
        ]
    );
}

#[test]
fn root_failure() {
    let (log, bus) = record();
    let _bus = bus.install();

    let failing = TaskDef::new("failing_task")
        .run(|_| Err(Intentional.into()))
        .call(Arguments::new())
        .unwrap();

    let err = failing.resolve().unwrap_err();
    assert_eq!(err.to_string(), "Intentional failure");
    assert!(err.downcast_ref::<Intentional>().is_some());
    assert_eq!(failing.owner().status(), Status::Failed);
    assert!(!failing.exists());

    assert_eq!(
        events(&log),
        vec![
            ev(EventType::RootStarted, "failing_task"),
            ev(EventType::TaskStarted, "failing_task"),
            ev(EventType::TaskFailed, "failing_task"),
            ev(EventType::RootFailed, "failing_task"),
        ]
    );
}

#[test]
fn dependency_failure_propagates_verbatim() {
    let (log, bus) = record();
    let _bus = bus.install();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let failing = TaskDef::new("failing_task").run(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(Intentional.into())
    });
    let double = TaskDef::new("double")
        .param("x")
        .run(|inputs| Ok(Value::from(inputs.int("x")? * 2)));

    let upstream = failing.call(Arguments::new()).unwrap();
    let downstream = double.call(Arguments::new().arg(&upstream)).unwrap();

    let err = downstream.resolve().unwrap_err();
    assert!(err.downcast_ref::<Intentional>().is_some());
    assert_eq!(err.to_string(), "Intentional failure");

    let cached = upstream.owner().error().unwrap();
    match (&err, &cached) {
        (TaskError::Execution(a), TaskError::Execution(b)) => assert!(a.same(b)),
        other => panic!("unexpected errors: {other:?}"),
    }

    assert_eq!(upstream.owner().status(), Status::Failed);
    assert_eq!(downstream.owner().status(), Status::DepFailed);
    assert!(!upstream.exists());
    assert!(!downstream.exists());

    assert_eq!(
        events(&log),
        vec![
            ev(EventType::RootStarted, "double"),
            ev(EventType::TaskStarted, "double"),
            ev(EventType::TaskStarted, "failing_task"),
            ev(EventType::TaskFailed, "failing_task"),
            ev(EventType::TaskDepFailed, "double"),
        ]
    );

    // Settled tasks are not retried.
    let again = downstream.resolve().unwrap_err();
    assert!(matches!(again, TaskError::DependencyFailed { ref task } if task == "double"));
    assert!(upstream.resolve().unwrap_err().downcast_ref::<Intentional>().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(events(&log).len(), 5);
}

#[test]
fn completed_task_is_memoized() {
    let (log, bus) = record();
    let _bus = bus.install();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let count = TaskDef::new("count").run(move |_| {
        Ok(Value::from(counter.fetch_add(1, Ordering::SeqCst) as i64))
    });

    let output = count.call(Arguments::new()).unwrap();
    assert_eq!(output.resolve().unwrap(), Value::Int(0));
    assert_eq!(output.resolve().unwrap(), Value::Int(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(events(&log).len(), 4);
}

#[test]
fn shared_dependency_runs_once() {
    let (_, bus) = record();
    let _bus = bus.install();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let source = TaskDef::new("source").run(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::from(5))
    });

    let shared = source.call(Arguments::new()).unwrap();
    let left = add().call(Arguments::new().arg(&shared).arg(1)).unwrap();
    let right = multiply().call(Arguments::new().arg(&shared).arg(2)).unwrap();
    let total = add().call(Arguments::new().arg(left).arg(right)).unwrap();

    assert_eq!(total.resolve().unwrap(), Value::Int(16));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(total.owner().graph().len(), 4);
}

#[test]
fn resolve_and_create_are_rejected_inside_a_body() {
    let (_, bus) = record();
    let _bus = bus.install();

    let inner = add().call(Arguments::new().arg(1).arg(1)).unwrap();

    let probe = {
        let inner = inner.clone();
        TaskDef::new("probe").run(move |_| {
            let resolve = inner.resolve().unwrap_err();
            let create = add().call(Arguments::new().arg(1).arg(2)).unwrap_err();
            Ok(Value::list([
                Value::from(matches!(resolve, TaskError::ResolveInTask)),
                Value::from(create == ConstructionError::Reentrant),
            ]))
        })
    };

    let output = probe.call(Arguments::new()).unwrap();
    assert_eq!(output.resolve().unwrap(), Value::list([true, true]));
    assert!(!inner.exists());
    assert!(!tsumugi::in_task());
}

#[test]
fn injectable_parameter_reads_context() {
    let (_, bus) = record();
    let _bus = bus.install();

    let process = TaskDef::new("process")
        .param("data")
        .param(Param::new("debug").injectable())
        .run(|inputs| {
            let data = inputs.str("data")?;
            Ok(Value::from(if inputs.bool("debug")? {
                format!("debug:{data}")
            } else {
                data.to_string()
            }))
        });

    let ctx = Context::new([("debug", true)]);
    let output = ctx.scope(|| process.call(Arguments::new().arg("x"))).unwrap();
    assert_eq!(output.resolve().unwrap(), Value::from("debug:x"));

    let err = process.call(Arguments::new().arg("x")).unwrap_err();
    assert_eq!(err, ConstructionError::MissingInjected("debug".into()));
    assert_eq!(
        err.to_string(),
        "Required injectable parameter 'debug' not found in context"
    );
}

#[test]
fn captured_context_survives_thread_handoff() {
    let (_, bus) = record();

    let read = TaskDef::new("read_mode").run(|_| Ok(tsumugi::context::lookup("mode")?));

    let ctx = Context::new([("mode", "captured")]);
    let output = ctx.scope(|| read.call(Arguments::new())).unwrap();

    let other = Context::new([("mode", "resolver")]);
    let value = thread::spawn(move || {
        let _bus = bus.install();
        other.scope(|| output.resolve())
    })
    .join()
    .unwrap()
    .unwrap();

    assert_eq!(value, Value::from("captured"));
}

#[test]
fn ignored_parameter_reaches_body_only() {
    let (_, bus) = record();
    let _bus = bus.install();

    let report = TaskDef::new("report")
        .param("data")
        .param(Param::new("verbose").ignored().default(false))
        .run(|inputs| {
            let data = inputs.int("data")?;
            Ok(if inputs.bool("verbose")? {
                Value::from(format!("data={data}"))
            } else {
                Value::from(data)
            })
        });

    let quiet = tsumugi::create_task(&report, Arguments::new().arg(7)).unwrap();
    let loud = create_task(&report, Arguments::new().arg(7).named("verbose", true)).unwrap();

    assert_eq!(quiet, loud);
    assert_eq!(quiet.resolve().unwrap(), Value::Int(7));
    assert_eq!(loud.resolve().unwrap(), Value::from("data=7"));
}

#[test]
fn version_changes_identity() {
    let v1 = TaskDef::new("step").version(1).param("x").run(|i| Ok(i.get("x")?.clone()));
    let v2 = TaskDef::new("step").version(2).param("x").run(|i| Ok(i.get("x")?.clone()));

    let a = create_task(&v1, Arguments::new().arg(1)).unwrap();
    let b = create_task(&v2, Arguments::new().arg(1)).unwrap();
    let c = create_task(&v1, Arguments::new().named("x", 1)).unwrap();

    assert_ne!(a.signature(), b.signature());
    assert_eq!(a.signature(), c.signature());
}

#[test]
fn batch_resolution_reports_each_root() {
    let (log, bus) = record();
    let _bus = bus.install();

    let fail = TaskDef::new("fail").run(|_| Err(Intentional.into()));
    let outputs = vec![
        add().call(Arguments::new().arg(1).arg(2)).unwrap(),
        fail.call(Arguments::new()).unwrap(),
        multiply().call(Arguments::new().arg(3).arg(3)).unwrap(),
    ];

    let results = resolve_all(&outputs);
    assert_eq!(results[0].as_ref().unwrap(), &Value::Int(3));
    assert!(results[1].as_ref().unwrap_err().downcast_ref::<Intentional>().is_some());
    assert_eq!(results[2].as_ref().unwrap(), &Value::Int(9));

    let log = events(&log);
    let roots = |kind| log.iter().filter(|(k, _)| *k == kind).count();
    assert_eq!(roots(EventType::RootStarted), 3);
    assert_eq!(roots(EventType::RootFinished), 2);
    assert_eq!(roots(EventType::RootFailed), 1);
}

#[test]
fn concurrent_resolvers_share_one_execution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slow = TaskDef::new("slow").run(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(std::time::Duration::from_millis(20));
        Ok(Value::from("ready"))
    });

    let output = slow.call(Arguments::new()).unwrap();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let output = output.clone();
            thread::spawn(move || {
                let bus = Arc::new(EventBus::new());
                let _bus = bus.install();
                output.resolve()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), Value::from("ready"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_listener_does_not_break_resolution() {
    let (log, bus) = record();
    bus.listen(EventType::TaskStarted, |_| panic!("listener bug"));
    let _bus = bus.install();

    let output = add().call(Arguments::new().arg(2).arg(2)).unwrap();
    assert_eq!(output.resolve().unwrap(), Value::Int(4));
    assert_eq!(events(&log).len(), 4);
}
