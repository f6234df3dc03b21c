//! Prebuilt automa shapes.

use serde_json::Value;

use automa_core::error::{AutomaError, Result};
use automa_core::types::Arguments;

use crate::automa::{Automa, AutomaBuilder, AutomaKind};
use crate::graph::{ArgsBinding, WorkerNode};
use crate::worker::worker_fn;

/// Key of the hidden output worker of a concurrent automa.
pub const MERGER_KEY: &str = "__merger__";

/// Chain `workers` so each depends on the one before it.
///
/// The first worker starts the run and the last one is its output. Each
/// node's own dependencies are replaced by the chain edge.
pub fn sequential(name: impl Into<String>, workers: Vec<WorkerNode>) -> Result<Automa> {
    sequential_builder(name, workers)?.build()
}

/// `sequential`, returning the builder so callbacks or config can be added.
pub fn sequential_builder(
    name: impl Into<String>,
    workers: Vec<WorkerNode>,
) -> Result<AutomaBuilder> {
    let name = name.into();
    if workers.is_empty() {
        return Err(AutomaError::Compilation(format!(
            "sequential automa {} needs at least one worker",
            name
        )));
    }

    let last = workers.len() - 1;
    let mut builder = Automa::builder(name);
    let mut previous: Option<String> = None;
    for (index, mut node) in workers.into_iter().enumerate() {
        node.dependencies.clear();
        node.is_start = index == 0;
        node.is_output = index == last;
        if let Some(prev) = previous.take() {
            node.dependencies.push(prev);
        }
        previous = Some(node.key.clone());
        builder = builder.worker(node);
    }
    Ok(builder)
}

/// Run every worker at once on the same inputs.
///
/// Results come back as one array in declaration order, gathered by a
/// hidden merger worker. Dependency edges cannot be added afterwards.
pub fn concurrent(name: impl Into<String>, workers: Vec<WorkerNode>) -> Result<Automa> {
    concurrent_builder(name, workers)?.build()
}

pub fn concurrent_builder(
    name: impl Into<String>,
    workers: Vec<WorkerNode>,
) -> Result<AutomaBuilder> {
    let name = name.into();
    if workers.is_empty() {
        return Err(AutomaError::Compilation(format!(
            "concurrent automa {} needs at least one worker",
            name
        )));
    }

    let mut builder = Automa::builder(name).kind(AutomaKind::Concurrent);
    let mut keys = Vec::with_capacity(workers.len());
    for mut node in workers {
        if node.key == MERGER_KEY {
            return Err(AutomaError::DuplicateKey(MERGER_KEY.to_string()));
        }
        node.dependencies.clear();
        node.is_start = true;
        node.is_output = false;
        keys.push(node.key.clone());
        builder = builder.worker(node);
    }

    let merger = worker_fn(|_ctx, args: Arguments| async move {
        Ok(args.args.into_iter().next().unwrap_or(Value::Array(Vec::new())))
    });
    Ok(builder.worker(
        WorkerNode::new(MERGER_KEY, merger)
            .depends_on(keys)
            .binding(ArgsBinding::Merge)
            .output(),
    ))
}
