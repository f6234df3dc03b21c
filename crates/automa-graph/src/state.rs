use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use automa_core::types::Arguments;

use crate::args::KickoffSource;
use crate::graph::GraphStore;
use crate::interaction::InteractionRecord;

/// One worker placed in a dynamic step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Kickoff {
    pub key: String,
    pub source: KickoffSource,
    /// Resolved call arguments, once the worker has been launched.
    #[serde(default)]
    pub args: Option<Arguments>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub result: Value,
    /// A future for this kickoff is currently in flight.
    #[serde(skip)]
    pub launched: bool,
}

impl Kickoff {
    pub fn new(key: impl Into<String>, source: KickoffSource) -> Self {
        Self {
            key: key.into(),
            source,
            args: None,
            finished: false,
            result: Value::Null,
            launched: false,
        }
    }
}

/// The dynamic step currently executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StepState {
    pub index: usize,
    pub kickoffs: Vec<Kickoff>,
}

/// A redirection issued during the current step, consumed at its boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FerryRequest {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub args: Arguments,
}

/// Scratch state a worker keeps across its activations.
pub type LocalSpace = Map<String, Value>;

/// Everything an automa knows about its current (or last) run.
pub(crate) struct RunState {
    pub graph: GraphStore,
    /// Latest result of every worker that completed during this run.
    pub results: HashMap<String, Value>,
    /// Completion ledger consulted by readiness checks.
    pub completed: HashSet<String>,
    pub inputs: Arguments,
    /// Present while a run is in progress (including while suspended).
    pub step: Option<StepState>,
    pub ferries: Vec<FerryRequest>,
    /// Interaction records per worker key.
    pub records: HashMap<String, Vec<InteractionRecord>>,
    /// Dynamic steps launched so far in this run.
    pub steps: usize,
    /// Local space per worker key. Survives suspension and, unless reset,
    /// the end of a run.
    pub locals: HashMap<String, LocalSpace>,
}

impl RunState {
    pub fn new(graph: GraphStore) -> Self {
        Self {
            graph,
            results: HashMap::new(),
            completed: HashSet::new(),
            inputs: Arguments::new(),
            step: None,
            ferries: Vec::new(),
            records: HashMap::new(),
            steps: 0,
            locals: HashMap::new(),
        }
    }

    /// Clear per-run bookkeeping before a fresh run. Topology is kept.
    pub fn reset(&mut self, inputs: Arguments) {
        self.results.clear();
        self.completed.clear();
        self.inputs = inputs;
        self.step = None;
        self.ferries.clear();
        self.records.clear();
        self.steps = 0;
    }

    /// Drop everything tied to the in-progress run, keeping results.
    pub fn abandon(&mut self) {
        self.graph.discard();
        self.step = None;
        self.ferries.clear();
        self.records.clear();
    }

    /// Settle local spaces once a run is over: cleared, or pruned to the
    /// workers still in the topology.
    pub fn settle_locals(&mut self, reset: bool) {
        if reset {
            self.locals.clear();
            return;
        }
        let graph = self.graph.committed();
        self.locals.retain(|key, _| graph.contains(key));
    }

    pub fn is_running(&self) -> bool {
        self.step.is_some()
    }

    /// Record a finished worker in the current step.
    pub fn finish(&mut self, key: &str, result: Value) {
        if let Some(step) = self.step.as_mut() {
            if let Some(kickoff) = step.kickoffs.iter_mut().find(|k| k.key == key) {
                kickoff.finished = true;
                kickoff.launched = false;
                kickoff.result = result;
            }
        }
        self.records.remove(key);
    }
}
