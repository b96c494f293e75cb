#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod context;
mod engine;
mod error;
pub mod events;
pub mod persistence;
pub mod signature;
mod utils;
mod value;

pub use crate::context::Context;
pub use crate::engine::{
    Arguments, Func, Inputs, LazyOutput, Param, Status, Task, TaskDef, TaskGraph, create_task,
    in_task, resolve_all,
};
pub use crate::error::*;
pub use crate::events::{Event, EventBus, EventType, listen};
pub use crate::persistence::{OutputPersistence, set_persistence};
pub use crate::signature::{Signature, compute_signature};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::value::{Field, Record, Value};
