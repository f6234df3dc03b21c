use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use automa_core::error::{AutomaError, Result};
use automa_core::types::{Arguments, Snapshot};

use crate::automa::{Automa, AutomaInner};
use crate::graph::{DependencyGraph, GraphStore, Mutation, MutationRecord, NodeRecord, WorkerNode};
use crate::interaction::InteractionRecord;
use crate::state::{FerryRequest, LocalSpace, StepState};
use crate::worker::Worker;

/// Workers to re-attach when restoring nodes the target automa does not
/// declare itself (typically ones added dynamically during the run).
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self, key: impl Into<String>, worker: impl Worker) -> Self {
        self.register_arc(key, Arc::new(worker))
    }

    pub fn register_arc(mut self, key: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(key.into(), worker);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Serialized state of one automa and, recursively, its nested automas.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AutomaState {
    name: String,
    topology: Vec<NodeRecord>,
    #[serde(default)]
    pending_mutations: Vec<MutationRecord>,
    #[serde(default)]
    results: BTreeMap<String, Value>,
    #[serde(default)]
    completed: Vec<String>,
    #[serde(default)]
    inputs: Arguments,
    #[serde(default)]
    step: Option<StepState>,
    #[serde(default)]
    steps: usize,
    #[serde(default)]
    ferries: Vec<FerryRequest>,
    #[serde(default)]
    interactions: BTreeMap<String, Vec<InteractionRecord>>,
    #[serde(default)]
    locals: BTreeMap<String, LocalSpace>,
    #[serde(default)]
    children: BTreeMap<String, AutomaState>,
}

/// Nested automas among the nodes of `graph`.
pub(crate) fn nested_automas(graph: &DependencyGraph) -> Vec<Automa> {
    graph
        .nodes()
        .filter_map(|node| node.worker.as_automa().cloned())
        .collect()
}

pub(crate) fn capture(inner: &AutomaInner) -> Result<Snapshot> {
    let state = capture_state(inner);
    Ok(Snapshot::new(&inner.name, serde_json::to_value(&state)?))
}

fn capture_state(inner: &AutomaInner) -> AutomaState {
    let (mut saved, nested) = {
        let state = inner.lock_state();
        let committed = state.graph.committed();
        let mut completed: Vec<String> = state.completed.iter().cloned().collect();
        completed.sort();

        let nested: Vec<(String, Automa)> = state
            .graph
            .view()
            .nodes()
            .filter_map(|node| {
                node.worker
                    .as_automa()
                    .map(|automa| (node.key.clone(), automa.clone()))
            })
            .collect();

        let saved = AutomaState {
            name: inner.name.clone(),
            topology: committed.records(),
            pending_mutations: state.graph.pending().iter().map(Mutation::record).collect(),
            results: state
                .results
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            completed,
            inputs: state.inputs.clone(),
            step: state.step.clone(),
            steps: state.steps,
            ferries: state.ferries.clone(),
            interactions: state
                .records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            locals: state
                .locals
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            children: BTreeMap::new(),
        };
        (saved, nested)
    };

    for (key, child) in nested {
        saved.children.insert(key, capture_state(&child.inner));
    }
    saved
}

pub(crate) fn restore(
    inner: &AutomaInner,
    snapshot: &Snapshot,
    registry: &WorkerRegistry,
) -> Result<()> {
    let saved: AutomaState = serde_json::from_value(snapshot.payload.clone())
        .map_err(|e| AutomaError::Snapshot(format!("malformed payload: {}", e)))?;
    restore_state(inner, saved, registry)
}

fn restore_state(inner: &AutomaInner, saved: AutomaState, registry: &WorkerRegistry) -> Result<()> {
    if saved.name != inner.name {
        warn!(automa = %inner.name, snapshot = %saved.name, "Restoring snapshot taken from a differently named automa");
    }

    let current = inner.lock_state().graph.committed();
    let attach = |record: NodeRecord| -> Result<WorkerNode> {
        match current.node(&record.key) {
            Some(existing) => {
                let callbacks = existing.callbacks.clone();
                let mut node = record.into_node(Arc::clone(&existing.worker));
                node.callbacks = callbacks;
                Ok(node)
            }
            None => match registry.get(&record.key) {
                Some(worker) => Ok(record.into_node(worker)),
                None => Err(AutomaError::UnknownKey(record.key)),
            },
        }
    };

    let mut graph = DependencyGraph::new();
    for record in saved.topology {
        graph.add_worker(attach(record)?)?;
    }
    let mut store = GraphStore::new(graph);
    if saved.step.is_some() {
        store.begin_staging();
        for record in saved.pending_mutations {
            let mutation = match record {
                MutationRecord::AddWorker(record) => Mutation::AddWorker(attach(record)?),
                MutationRecord::RemoveWorker { key } => Mutation::RemoveWorker(key),
                MutationRecord::AddDependency { consumer, producer } => {
                    Mutation::AddDependency { consumer, producer }
                }
            };
            store.apply(mutation)?;
        }
    }

    for (key, child_state) in saved.children {
        let child = store
            .view()
            .node(&key)
            .and_then(|node| node.worker.as_automa().cloned())
            .ok_or_else(|| {
                AutomaError::Snapshot(format!("worker {} is not a nested automa", key))
            })?;
        restore_state(&child.inner, child_state, registry)?;
    }

    let mut state = inner.lock_state();
    state.graph = store;
    state.results = saved.results.into_iter().collect();
    state.completed = saved.completed.into_iter().collect::<HashSet<_>>();
    state.inputs = saved.inputs;
    state.step = saved.step;
    state.steps = saved.steps;
    state.ferries = saved.ferries;
    state.records = saved.interactions.into_iter().collect();
    state.locals = saved.locals.into_iter().collect();
    debug!(
        automa = %inner.name,
        workers = state.graph.committed().len(),
        running = state.is_running(),
        "Automa state restored"
    );
    Ok(())
}
