//! Dependency graph store.
//!
//! Workers are nodes keyed by string id; static dependency edges carry AND
//! semantics (a consumer waits for all of its producers). The `GraphStore`
//! wraps the graph with a staging layer so topology changes issued during a
//! dynamic step only become visible to the scheduler at the step boundary.

pub mod mutation;
pub mod node;
pub mod store;

pub use mutation::{GraphStore, Mutation, MutationRecord};
pub use node::{ArgsBinding, NodeRecord, WorkerNode};
pub use store::DependencyGraph;
