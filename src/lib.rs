//! Automa: a dynamic directed graph scheduler.
//!
//! Workers are wired into a graph by static AND-dependencies and run in
//! dynamic steps. While running, a worker can redirect control to any other
//! worker, add or remove workers and edges, or suspend the whole run on an
//! external interaction that is later resumed, possibly in another process
//! from a snapshot.

use tracing_subscriber::EnvFilter;

pub use automa_core::config::{AutomaConfig, CheckpointConfig, LogConfig, SchedulerConfig};
pub use automa_core::error::{AutomaError, Result};
pub use automa_core::event::EventBus;
pub use automa_core::traits::{CallbackInfo, WorkerCallback};
pub use automa_core::types::{
    Arguments, AutomaEvent, Event, Feedback, Interaction, InteractionFeedback, InteractionId,
    InteractionSignal, Snapshot,
};
pub use automa_graph::{
    concurrent, sequential, worker_fn, ArgsBinding, Automa, AutomaBuilder, AutomaKind, FnWorker,
    GlobalSettings, Inject, LocalSpace, Param, RunLogger, Signature, SnapshotStore, SuppressErrors, SystemRef,
    TracingCallback, Worker, WorkerContext, WorkerNode, WorkerRegistry,
};

/// Install a `fmt` subscriber. `RUST_LOG` wins over `default_filter`.
/// Does nothing if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .try_init();
}
