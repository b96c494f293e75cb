mod definition;
mod graph;
pub(crate) mod mode;
mod output;
mod resolve;
mod task;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

pub use crate::engine::definition::{Arguments, Func, Inputs, Param, TaskDef, create_task};
pub use crate::engine::graph::TaskGraph;
pub use crate::engine::mode::in_task;
pub use crate::engine::output::LazyOutput;
pub use crate::engine::task::{Status, Task};

use crate::error::TaskError;
use crate::events;
use crate::value::Value;

/// Resolves independent outputs on the rayon pool.
///
/// Results come back in input order. Events are delivered to the bus that
/// is current on the calling thread, whichever worker emits them.
pub fn resolve_all(outputs: &[LazyOutput]) -> Vec<Result<Value, TaskError>> {
    if mode::in_task() {
        return outputs.iter().map(|_| Err(TaskError::ResolveInTask)).collect();
    }

    let bus = events::current();
    outputs
        .par_iter()
        .map(|output| {
            let _bus = bus.install();
            output.resolve()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::Context;
    use crate::events::EventBus;

    #[test]
    fn test_resolve_all_keeps_order_and_contexts() {
        let bus = Arc::new(EventBus::new());
        let _bus = bus.install();

        let label = TaskDef::new("label")
            .param("n")
            .run(|inputs| {
                let prefix = crate::context::lookup("prefix")?;
                Ok(Value::from(format!(
                    "{}-{}",
                    prefix.as_str().unwrap_or_default(),
                    inputs.int("n")?
                )))
            });

        let outputs: Vec<_> = (0..16)
            .map(|n| {
                let ctx = Context::new([("prefix", format!("p{}", n % 3))]);
                ctx.scope(|| label.call(Arguments::new().arg(n)))
                    .unwrap()
            })
            .collect();

        let results = resolve_all(&outputs);
        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), Value::from(format!("p{}-{}", n % 3, n)));
        }
    }
}
