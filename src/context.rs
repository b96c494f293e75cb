//! Ambient, scoped configuration.
//!
//! A [`Context`] is an immutable bag of named [`Value`]s. Contexts are entered
//! with [`Context::enter`], which pushes them onto a stack owned by the calling
//! thread; the returned guard pops the stack again when it goes out of scope,
//! including during unwinding. Lookups through [`lookup`] scan that stack from
//! the most recently entered context downwards.
//!
//! Separately from the stack, [`Context::replace`] derives a new context whose
//! own settings are the overrides and whose fallback chain is the original
//! context.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::ContextError;
use crate::value::Value;

thread_local! {
    static STACK: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

#[derive(Default)]
struct Node {
    settings: BTreeMap<String, Value>,
    parent: Option<Context>,
}

/// An immutable scope of named settings.
///
/// Two contexts are equal when their own settings are equal and they fall
/// back to the very same parent node (compared by identity, not by content).
#[derive(Clone, Default)]
pub struct Context(Arc<Node>);

impl Context {
    /// Creates an unattached context from `(key, value)` pairs.
    pub fn new<K, V>(settings: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Context(Arc::new(Node {
            settings: collect(settings),
            parent: None,
        }))
    }

    /// A context without any settings.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derives a context holding `overrides` that falls back to `self` for
    /// every other key. `self` is left untouched.
    pub fn replace<K, V>(&self, overrides: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Context(Arc::new(Node {
            settings: collect(overrides),
            parent: Some(self.clone()),
        }))
    }

    /// Looks `key` up in this context and then along its fallback chain.
    pub fn get(&self, key: &str) -> Result<&Value, ContextError> {
        let mut node = self;
        loop {
            if let Some(value) = node.0.settings.get(key) {
                return Ok(value);
            }
            match &node.0.parent {
                Some(parent) => node = parent,
                None => return Err(ContextError::KeyNotFound(key.to_string())),
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }

    /// The settings defined by this node itself, without the fallback chain.
    pub fn settings(&self) -> &BTreeMap<String, Value> {
        &self.0.settings
    }

    pub fn parent(&self) -> Option<&Context> {
        self.0.parent.as_ref()
    }

    /// Number of distinct keys visible through this context.
    pub fn len(&self) -> usize {
        self.visible().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` when both handles point at the same node.
    pub fn same(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Pushes this context onto the calling thread's stack until the guard
    /// is dropped.
    pub fn enter(&self) -> ContextGuard {
        let depth = STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(self.clone());
            stack.len()
        });

        ContextGuard {
            depth,
            _not_send: PhantomData,
        }
    }

    /// Runs `f` with this context entered.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// Every key visible through the chain, nearer nodes winning.
    fn visible(&self) -> BTreeMap<String, Value> {
        let mut chain = Vec::new();
        let mut node = Some(self);
        while let Some(current) = node {
            chain.push(current);
            node = current.parent();
        }

        let mut merged = BTreeMap::new();
        for node in chain.into_iter().rev() {
            for (key, value) in &node.0.settings {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

fn collect<K, V>(settings: impl IntoIterator<Item = (K, V)>) -> BTreeMap<String, Value>
where
    K: Into<String>,
    V: Into<Value>,
{
    settings
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        let same_parent = match (&self.0.parent, &other.0.parent) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same(b),
            _ => false,
        };
        same_parent && self.0.settings == other.0.settings
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.settings.hash(state);
        self.0
            .parent
            .as_ref()
            .map(|parent| Arc::as_ptr(&parent.0) as usize)
            .hash(state);
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("settings", &self.0.settings)
            .field("parent", &self.0.parent)
            .finish()
    }
}

/// Keeps a context on the thread's stack. Not `Send`: it must be dropped on
/// the thread that entered the context.
#[must_use = "the context is exited as soon as the guard is dropped"]
pub struct ContextGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        STACK.with(|stack| stack.borrow_mut().truncate(self.depth - 1));
    }
}

/// The context currently in effect on this thread.
///
/// With nothing entered this is an empty context. With a single entered
/// context it is that very node. With nested scopes it is a fresh node
/// holding every visible setting, so it can be captured and re-entered later
/// (possibly on another thread) with the same effect.
pub fn current() -> Context {
    STACK.with(|stack| {
        let stack = stack.borrow();
        match stack.as_slice() {
            [] => Context::empty(),
            [only] => only.clone(),
            nodes => {
                let mut merged = BTreeMap::new();
                for node in nodes {
                    merged.extend(node.visible());
                }
                Context(Arc::new(Node {
                    settings: merged,
                    parent: None,
                }))
            }
        }
    })
}

/// Reads `key` from the active scopes, innermost first.
pub fn lookup(key: &str) -> Result<Value, ContextError> {
    STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find_map(|node| node.get(key).ok().cloned())
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))
    })
}

/// Number of contexts entered on this thread.
pub fn depth() -> usize {
    STACK.with(|stack| stack.borrow().len())
}
