use std::sync::Arc;

use serde::{Deserialize, Serialize};

use automa_core::error::Result;

use super::node::{NodeRecord, WorkerNode};
use super::store::DependencyGraph;

/// A topology change requested through an automa or a worker context.
#[derive(Debug, Clone)]
pub enum Mutation {
    AddWorker(WorkerNode),
    RemoveWorker(String),
    AddDependency { consumer: String, producer: String },
}

impl Mutation {
    fn apply_to(&self, graph: &mut DependencyGraph) -> Result<()> {
        match self {
            Mutation::AddWorker(node) => graph.add_worker(node.clone()),
            Mutation::RemoveWorker(key) => graph.remove_worker(key).map(|_| ()),
            Mutation::AddDependency { consumer, producer } => {
                graph.add_dependency(consumer, producer).map(|_| ())
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Mutation::AddWorker(node) => format!("add_worker({})", node.key),
            Mutation::RemoveWorker(key) => format!("remove_worker({})", key),
            Mutation::AddDependency { consumer, producer } => {
                format!("add_dependency({} <- {})", consumer, producer)
            }
        }
    }

    pub fn record(&self) -> MutationRecord {
        match self {
            Mutation::AddWorker(node) => MutationRecord::AddWorker(node.record()),
            Mutation::RemoveWorker(key) => MutationRecord::RemoveWorker { key: key.clone() },
            Mutation::AddDependency { consumer, producer } => MutationRecord::AddDependency {
                consumer: consumer.clone(),
                producer: producer.clone(),
            },
        }
    }
}

/// Serialized form of a staged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationRecord {
    AddWorker(NodeRecord),
    RemoveWorker { key: String },
    AddDependency { consumer: String, producer: String },
}

/// Committed graph plus the changes staged during the current dynamic step.
///
/// While a run is active, mutations are validated against a staged copy and
/// logged; the scheduler keeps reading the committed graph until `commit`
/// folds the staged copy in at the step boundary. Outside a run, mutations
/// go straight to the committed graph.
pub struct GraphStore {
    committed: Arc<DependencyGraph>,
    staged: Option<DependencyGraph>,
    log: Vec<Mutation>,
    staging: bool,
}

impl GraphStore {
    pub fn new(graph: DependencyGraph) -> Self {
        Self {
            committed: Arc::new(graph),
            staged: None,
            log: Vec::new(),
            staging: false,
        }
    }

    /// The graph the scheduler reads.
    pub fn committed(&self) -> Arc<DependencyGraph> {
        Arc::clone(&self.committed)
    }

    /// The graph as it will look after the next commit.
    pub fn view(&self) -> &DependencyGraph {
        self.staged.as_ref().unwrap_or(&*self.committed)
    }

    pub fn is_staging(&self) -> bool {
        self.staging
    }

    pub fn begin_staging(&mut self) {
        self.staging = true;
    }

    /// Commit anything staged and go back to direct mutation.
    pub fn end_staging(&mut self) -> Vec<Mutation> {
        let applied = self.commit();
        self.staging = false;
        applied
    }

    /// Drop staged changes and go back to direct mutation.
    pub fn discard(&mut self) {
        self.staged = None;
        self.log.clear();
        self.staging = false;
    }

    pub fn apply(&mut self, mutation: Mutation) -> Result<()> {
        if self.staging {
            let committed = &self.committed;
            let staged = self.staged.get_or_insert_with(|| (**committed).clone());
            mutation.apply_to(staged)?;
            self.log.push(mutation);
        } else {
            mutation.apply_to(Arc::make_mut(&mut self.committed))?;
        }
        Ok(())
    }

    /// Fold staged changes into the committed graph. Returns what was applied.
    pub fn commit(&mut self) -> Vec<Mutation> {
        if let Some(staged) = self.staged.take() {
            self.committed = Arc::new(staged);
        }
        std::mem::take(&mut self.log)
    }

    pub fn pending(&self) -> &[Mutation] {
        &self.log
    }
}
