use std::collections::{HashMap, HashSet, VecDeque};

use automa_core::error::{AutomaError, Result};

use super::node::{NodeRecord, WorkerNode};

/// Workers keyed by string id plus their static dependency edges.
///
/// `successors` is the reverse adjacency (producer -> consumers). It may hold
/// entries for producers that do not exist yet: a consumer is allowed to
/// declare a dependency on a key that is added later.
#[derive(Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, WorkerNode>,
    order: Vec<String>,
    successors: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Duplicate dependency keys collapse to one edge.
    pub fn add_worker(&mut self, mut node: WorkerNode) -> Result<()> {
        if self.nodes.contains_key(&node.key) {
            return Err(AutomaError::DuplicateKey(node.key));
        }

        let mut seen = HashSet::new();
        node.dependencies.retain(|dep| seen.insert(dep.clone()));

        for dep in &node.dependencies {
            let consumers = self.successors.entry(dep.clone()).or_default();
            if !consumers.contains(&node.key) {
                consumers.push(node.key.clone());
            }
        }
        self.order.push(node.key.clone());
        self.nodes.insert(node.key.clone(), node);
        Ok(())
    }

    /// Remove a node and every edge that references it.
    pub fn remove_worker(&mut self, key: &str) -> Result<WorkerNode> {
        let node = self
            .nodes
            .remove(key)
            .ok_or_else(|| AutomaError::UnknownKey(key.to_string()))?;
        self.order.retain(|k| k != key);

        if let Some(consumers) = self.successors.remove(key) {
            for consumer in consumers {
                if let Some(c) = self.nodes.get_mut(&consumer) {
                    c.dependencies.retain(|d| d != key);
                }
            }
        }
        for dep in &node.dependencies {
            if let Some(consumers) = self.successors.get_mut(dep) {
                consumers.retain(|c| c != key);
                if consumers.is_empty() {
                    self.successors.remove(dep);
                }
            }
        }
        Ok(node)
    }

    /// Add the edge `producer -> consumer`. Returns false if it already existed.
    pub fn add_dependency(&mut self, consumer: &str, producer: &str) -> Result<bool> {
        if !self.nodes.contains_key(producer) {
            return Err(AutomaError::UnknownKey(producer.to_string()));
        }
        let node = self
            .nodes
            .get_mut(consumer)
            .ok_or_else(|| AutomaError::UnknownKey(consumer.to_string()))?;
        if node.dependencies.iter().any(|d| d == producer) {
            return Ok(false);
        }
        node.dependencies.push(producer.to_string());
        self.successors
            .entry(producer.to_string())
            .or_default()
            .push(consumer.to_string());
        Ok(true)
    }

    /// True iff every dependency of `key` is in `completed` and `key` itself is not.
    pub fn is_ready(&self, key: &str, completed: &HashSet<String>) -> Result<bool> {
        let node = self
            .nodes
            .get(key)
            .ok_or_else(|| AutomaError::UnknownKey(key.to_string()))?;
        Ok(!completed.contains(key) && node.dependencies.iter().all(|d| completed.contains(d)))
    }

    pub fn node(&self, key: &str) -> Option<&WorkerNode> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &WorkerNode> {
        self.order.iter().filter_map(|k| self.nodes.get(k))
    }

    pub fn successors(&self, key: &str) -> &[String] {
        self.successors.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn start_keys(&self) -> Vec<String> {
        self.nodes()
            .filter(|n| n.is_start)
            .map(|n| n.key.clone())
            .collect()
    }

    pub fn output_keys(&self) -> Vec<String> {
        self.nodes()
            .filter(|n| n.is_output)
            .map(|n| n.key.clone())
            .collect()
    }

    pub fn records(&self) -> Vec<NodeRecord> {
        self.nodes().map(WorkerNode::record).collect()
    }

    /// Kahn's algorithm over edges between existing nodes.
    /// Returns the keys that sit on or behind a cycle, if any.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes()
            .map(|n| {
                let degree = n
                    .dependencies
                    .iter()
                    .filter(|d| self.nodes.contains_key(*d))
                    .count();
                (n.key.as_str(), degree)
            })
            .collect();

        let mut queue: VecDeque<&str> = self
            .keys()
            .filter(|k| in_degree.get(k).copied() == Some(0))
            .collect();
        let mut visited = 0;

        while let Some(key) = queue.pop_front() {
            visited += 1;
            for consumer in self.successors(key) {
                if let Some(degree) = in_degree.get_mut(consumer.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(consumer.as_str());
                    }
                }
            }
        }

        if visited == self.nodes.len() {
            None
        } else {
            Some(
                self.keys()
                    .filter(|k| in_degree.get(k).copied().unwrap_or(0) > 0)
                    .map(str::to_string)
                    .collect(),
            )
        }
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.records())
            .finish()
    }
}
