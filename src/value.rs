//! The dynamic value tree shared by task parameters, task results and
//! context settings.
//!
//! A [`Value`] is either a scalar, a container, a structured [`Record`] or a
//! [`LazyOutput`] pointing at another task. Outputs are what turn a parameter
//! tree into a dependency graph: the engine resolves them before the task body
//! runs, and the signature engine hashes them by their owner's identity.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::engine::LazyOutput;

/// A dynamically typed value.
///
/// `Value` has a total order, so sets and maps keyed by arbitrary values are
/// stored sorted and never remember insertion order. Floats are ordered by
/// [`f64::total_cmp`], outputs by the signature of the task that owns them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(BTreeSet<Value>),
    Map(#[serde(with = "pairs")] BTreeMap<Value, Value>),
    Record(Record),
    /// A dependency on another task. Never serializable.
    #[serde(skip)]
    Output(LazyOutput),
}

impl Value {
    /// Builds an ordered list.
    pub fn list<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Builds a tuple, which is ordered like a list but tagged differently.
    pub fn tuple<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Value::Tuple(items.into_iter().map(Into::into).collect())
    }

    /// Builds an unordered set.
    pub fn set<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Value::Set(items.into_iter().map(Into::into).collect())
    }

    /// Builds an unordered mapping.
    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Short name of the variant, used as the type tag of the canonical form
    /// and in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Record(_) => "record",
            Value::Output(_) => "output",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and ints widened to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list or a tuple.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_output(&self) -> Option<&LazyOutput> {
        match self {
            Value::Output(output) => Some(output),
            _ => None,
        }
    }

    /// Looks up a string key in a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(&Value::Str(key.to_string()))
    }

    /// Calls `f` for every output reachable from this value, depth first.
    pub(crate) fn visit_outputs(&self, f: &mut impl FnMut(&LazyOutput)) {
        match self {
            Value::Output(output) => f(output),
            Value::List(items) | Value::Tuple(items) => {
                items.iter().for_each(|item| item.visit_outputs(f))
            }
            Value::Set(items) => items.iter().for_each(|item| item.visit_outputs(f)),
            Value::Map(map) => {
                for (k, v) in map {
                    k.visit_outputs(f);
                    v.visit_outputs(f);
                }
            }
            Value::Record(record) => record
                .fields
                .iter()
                .for_each(|field| field.value.visit_outputs(f)),
            _ => {}
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::List(_) => 5,
            Value::Tuple(_) => 6,
            Value::Set(_) => 7,
            Value::Map(_) => 8,
            Value::Record(_) => 9,
            Value::Output(_) => 10,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Tuple(a), Value::Tuple(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (Value::Record(a), Value::Record(b)) => a.cmp(b),
            (Value::Output(a), Value::Output(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            // total_cmp equality is bit equality
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::List(items) | Value::Tuple(items) => items.hash(state),
            Value::Set(items) => items.hash(state),
            Value::Map(map) => map.hash(state),
            Value::Record(record) => record.hash(state),
            Value::Output(output) => output.hash(state),
        }
    }
}

/// A structured record: a type name and an ordered list of named fields.
///
/// Fields flagged as ignored are carried along with the record and visible to
/// task bodies, but they do not take part in the task's signature.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Record {
    name: String,
    fields: Vec<Field>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub ignored: bool,
}

impl Record {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field that is part of the record's identity.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
            ignored: false,
        });
        self
    }

    /// Appends a field that is excluded from signatures.
    pub fn ignored_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
            ignored: true,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }

    pub(crate) fn with_fields(&self, fields: Vec<Field>) -> Self {
        Self {
            name: self.name.clone(),
            fields,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i32 => Int,
    u32 => Int,
    i64 => Int,
    f32 => Float,
    f64 => Float,
    String => Str,
    &str => Str,
    Record => Record,
    LazyOutput => Output,
}

impl From<&LazyOutput> for Value {
    fn from(value: &LazyOutput) -> Self {
        Value::Output(value.clone())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::list(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Serializes a map as a sequence of pairs, so formats that only accept
/// string keys can still store maps keyed by arbitrary values.
mod pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::Value;

    pub fn serialize<S>(map: &BTreeMap<Value, Value>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<Value, Value>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(Value, Value)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
