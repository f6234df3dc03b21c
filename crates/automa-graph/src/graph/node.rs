use std::sync::Arc;

use serde::{Deserialize, Serialize};

use automa_core::traits::WorkerCallback;

use crate::worker::Worker;

/// How upstream results become a worker's call arguments when it is
/// scheduled through its dependency edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgsBinding {
    /// One positional value per dependency, in declared order.
    #[default]
    AsIs,
    /// A single positional array of all dependency results, in declared order.
    Merge,
    /// Spread the single dependency's result: arrays positionally, objects by name.
    Unpack,
    /// Receive no upstream values at all.
    Suppressed,
}

/// A node in the dependency graph.
///
/// Each node wraps a worker plus the scheduling metadata the graph needs:
/// its static dependencies, whether it seeds a run, whether its result
/// feeds the automa's return value, and its argument binding rule.
#[derive(Clone)]
pub struct WorkerNode {
    pub key: String,
    pub worker: Arc<dyn Worker>,
    pub dependencies: Vec<String>,
    pub is_start: bool,
    pub is_output: bool,
    pub binding: ArgsBinding,
    /// Worker-scoped callbacks, invoked after global and automa callbacks.
    pub callbacks: Vec<Arc<dyn WorkerCallback>>,
}

impl WorkerNode {
    pub fn new(key: impl Into<String>, worker: impl Worker) -> Self {
        Self::from_arc(key, Arc::new(worker))
    }

    pub fn from_arc(key: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            key: key.into(),
            worker,
            dependencies: Vec::new(),
            is_start: false,
            is_output: false,
            binding: ArgsBinding::default(),
            callbacks: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn start(mut self) -> Self {
        self.is_start = true;
        self
    }

    pub fn output(mut self) -> Self {
        self.is_output = true;
        self
    }

    pub fn binding(mut self, binding: ArgsBinding) -> Self {
        self.binding = binding;
        self
    }

    pub fn callback(mut self, callback: Arc<dyn WorkerCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Serializable description of this node (everything but the worker).
    pub fn record(&self) -> NodeRecord {
        NodeRecord {
            key: self.key.clone(),
            dependencies: self.dependencies.clone(),
            is_start: self.is_start,
            is_output: self.is_output,
            binding: self.binding,
        }
    }
}

impl std::fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerNode")
            .field("key", &self.key)
            .field("dependencies", &self.dependencies)
            .field("is_start", &self.is_start)
            .field("is_output", &self.is_output)
            .field("binding", &self.binding)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Topology-only view of a node, as stored in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub key: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub is_start: bool,
    #[serde(default)]
    pub is_output: bool,
    #[serde(default)]
    pub binding: ArgsBinding,
}

impl NodeRecord {
    /// Rebuild a node around a worker instance.
    pub fn into_node(self, worker: Arc<dyn Worker>) -> WorkerNode {
        WorkerNode {
            key: self.key,
            worker,
            dependencies: self.dependencies,
            is_start: self.is_start,
            is_output: self.is_output,
            binding: self.binding,
            callbacks: Vec::new(),
        }
    }
}
