pub mod args;
pub mod automa;
pub mod callback;
pub mod checkpoint;
pub mod context;
pub mod graph;
pub mod interaction;
pub mod patterns;
pub mod run_log;
pub mod snapshot;
pub mod worker;

mod scheduler;
mod state;

pub use args::{ArgumentResolver, Inject, KickoffSource, Param, Signature, SystemRef};
pub use automa::{Automa, AutomaBuilder, AutomaKind};
pub use callback::{GlobalSettings, SuppressErrors, TracingCallback};
pub use checkpoint::SnapshotStore;
pub use context::WorkerContext;
pub use graph::{ArgsBinding, DependencyGraph, GraphStore, Mutation, NodeRecord, WorkerNode};
pub use interaction::{InteractionBroker, InteractionRecord};
pub use patterns::{concurrent, sequential};
pub use run_log::RunLogger;
pub use snapshot::WorkerRegistry;
pub use state::LocalSpace;
pub use worker::{worker_fn, FnWorker, Worker};
