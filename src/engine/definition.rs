use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use crate::context;
use crate::engine::task::{Body, TaskInner, TaskState};
use crate::engine::{LazyOutput, Task, mode};
use crate::error::{ConstructionError, InputError};
use crate::persistence;
use crate::signature::compute_signature;
use crate::value::Value;

/// A declared parameter of a task function.
#[derive(Clone, Debug)]
pub struct Param {
    name: String,
    injectable: bool,
    ignored: bool,
    default: Option<Value>,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            injectable: false,
            ignored: false,
            default: None,
        }
    }

    /// Fill this parameter from the ambient context when the caller leaves
    /// it out.
    pub fn injectable(mut self) -> Self {
        self.injectable = true;
        self
    }

    /// Pass this parameter to the body but leave it out of the signature.
    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_injectable(&self) -> bool {
        self.injectable
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }
}

impl From<&str> for Param {
    fn from(name: &str) -> Self {
        Param::new(name)
    }
}

impl From<String> for Param {
    fn from(name: String) -> Self {
        Param::new(name)
    }
}

/// Declaration of a task function, built up before the body is attached.
///
/// ```
/// use tsumugi::{Arguments, TaskDef, Value};
///
/// let add = TaskDef::new("add")
///     .param("a")
///     .param("b")
///     .run(|inputs| Ok(Value::from(inputs.int("a")? + inputs.int("b")?)));
///
/// let output = add.call(Arguments::new().arg(1).arg(2)).unwrap();
/// assert_eq!(output.resolve().unwrap(), Value::Int(3));
/// ```
#[derive(Clone, Debug)]
pub struct TaskDef {
    name: String,
    version: u32,
    persist: bool,
    params: Vec<Param>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            persist: false,
            params: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Store results through the persistence layer captured at construction.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Declares the next parameter. Redeclaring a name replaces it in place.
    pub fn param(mut self, param: impl Into<Param>) -> Self {
        let param = param.into();
        match self.params.iter_mut().find(|p| p.name == param.name) {
            Some(slot) => *slot = param,
            None => self.params.push(param),
        }
        self
    }

    pub fn run<F>(self, body: F) -> Func
    where
        F: Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Func(Arc::new(FuncInner {
            def: self,
            body: Arc::new(body),
        }))
    }
}

struct FuncInner {
    def: TaskDef,
    body: Body,
}

/// A task function. Calling it creates a task and hands back its output.
#[derive(Clone)]
pub struct Func(Arc<FuncInner>);

impl Func {
    pub fn name(&self) -> &str {
        &self.0.def.name
    }

    pub fn version(&self) -> u32 {
        self.0.def.version
    }

    pub fn params(&self) -> &[Param] {
        &self.0.def.params
    }

    /// Creates a task from `args` and returns its deferred output.
    pub fn call(&self, args: Arguments) -> Result<LazyOutput, ConstructionError> {
        create_task(self, args).map(|task| task.output())
    }
}

impl Debug for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Func").field(&self.0.def).finish()
    }
}

/// Call-site arguments for a [`Func`].
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.push((name.into(), value.into()));
        self
    }
}

/// Creates a task for `func` bound to `args`.
///
/// Captures the calling thread's context and persistence layer, fills
/// injectable parameters from the context and computes the signature. Fails
/// when called from inside a task body.
pub fn create_task(func: &Func, args: Arguments) -> Result<Task, ConstructionError> {
    if mode::in_task() {
        return Err(ConstructionError::Reentrant);
    }

    let def = &func.0.def;
    let context = context::current();

    if args.positional.len() > def.params.len() {
        return Err(ConstructionError::TooManyArguments {
            expected: def.params.len(),
            got: args.positional.len(),
        });
    }

    let mut bound: BTreeMap<String, Value> = def
        .params
        .iter()
        .zip(args.positional)
        .map(|(param, value)| (param.name.clone(), value))
        .collect();

    for (name, value) in args.named {
        if !def.params.iter().any(|p| p.name == name) {
            return Err(ConstructionError::UnexpectedArgument(name));
        }
        if bound.contains_key(&name) {
            return Err(ConstructionError::DuplicateArgument(name));
        }
        bound.insert(name, value);
    }

    for param in &def.params {
        if bound.contains_key(&param.name) {
            continue;
        }

        let value = if param.injectable {
            match (context.get(&param.name), &param.default) {
                (Ok(value), _) => value.clone(),
                (Err(_), Some(default)) => default.clone(),
                (Err(_), None) => {
                    return Err(ConstructionError::MissingInjected(param.name.clone()));
                }
            }
        } else {
            match &param.default {
                Some(default) => default.clone(),
                None => return Err(ConstructionError::MissingArgument(param.name.clone())),
            }
        };

        bound.insert(param.name.clone(), value);
    }

    let (ignored, params): (BTreeMap<_, _>, BTreeMap<_, _>) = bound
        .into_iter()
        .partition(|(name, _)| def.params.iter().any(|p| &p.name == name && p.ignored));

    let persistence = def.persist.then(persistence::current).flatten();
    let signature = compute_signature(&def.name, def.version, &params)?;

    tracing::debug!(task = %def.name, %signature, "created task");

    Ok(Task(Arc::new(TaskInner {
        name: def.name.clone(),
        version: def.version,
        body: func.0.body.clone(),
        params,
        ignored,
        context,
        persist: def.persist,
        persistence,
        signature,
        state: Mutex::new(TaskState::Pending),
        run: Mutex::new(()),
    })))
}

/// The resolved arguments a task body is called with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Inputs(pub(crate) BTreeMap<String, Value>);

impl Inputs {
    pub fn get(&self, name: &str) -> Result<&Value, InputError> {
        self.0
            .get(name)
            .ok_or_else(|| InputError::Missing(name.to_string()))
    }

    /// Like [`Inputs::get`] but treats a missing input as null.
    pub fn get_or_null(&self, name: &str) -> &Value {
        const NULL: &Value = &Value::Null;
        self.0.get(name).unwrap_or(NULL)
    }

    pub fn int(&self, name: &str) -> Result<i64, InputError> {
        self.typed(name, "int", Value::as_int)
    }

    /// Ints are widened to floats.
    pub fn float(&self, name: &str) -> Result<f64, InputError> {
        self.typed(name, "float", Value::as_float)
    }

    pub fn bool(&self, name: &str) -> Result<bool, InputError> {
        self.typed(name, "bool", Value::as_bool)
    }

    pub fn str(&self, name: &str) -> Result<&str, InputError> {
        self.typed(name, "str", Value::as_str)
    }

    pub fn list(&self, name: &str) -> Result<&[Value], InputError> {
        self.typed(name, "list", Value::as_list)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn typed<'a, T>(
        &'a self,
        name: &str,
        expected: &'static str,
        read: impl FnOnce(&'a Value) -> Option<T>,
    ) -> Result<T, InputError> {
        let value = self.get(name)?;
        read(value).ok_or_else(|| InputError::Mismatch {
            name: name.to_string(),
            expected,
            found: value.type_name(),
        })
    }
}
