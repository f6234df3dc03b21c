use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use automa_core::config::SchedulerConfig;
use automa_core::error::{AutomaError, Result};
use automa_core::event::EventBus;
use automa_core::traits::WorkerCallback;
use automa_core::types::{
    Arguments, AutomaEvent, Feedback, Interaction, InteractionFeedback, InteractionId, Snapshot,
};

use crate::args::Signature;
use crate::callback::GlobalSettings;
use crate::context::WorkerContext;
use crate::graph::{DependencyGraph, GraphStore, Mutation, WorkerNode};
use crate::interaction::{InteractionBroker, PendingKind};
use crate::scheduler::{self, LiveRun, RunEnv, RunGuard};
use crate::snapshot::{self, WorkerRegistry};
use crate::state::{LocalSpace, RunState};
use crate::worker::Worker;

/// How an automa's topology may be edited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutomaKind {
    #[default]
    Graph,
    /// Fan-out of independent workers; explicit edges are rejected.
    Concurrent,
}

pub(crate) struct AutomaInner {
    pub name: String,
    pub kind: AutomaKind,
    pub state: Mutex<RunState>,
    /// In-flight worker futures of a suspended top-level run.
    pub live: tokio::sync::Mutex<Option<LiveRun>>,
    pub callbacks: Vec<Arc<dyn WorkerCallback>>,
    pub settings: Arc<GlobalSettings>,
    pub config: SchedulerConfig,
    pub bus: Arc<EventBus>,
    pub broker: Arc<InteractionBroker>,
}

impl AutomaInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a topology change: staged while a run is active, direct otherwise.
    pub(crate) fn apply(&self, mutation: Mutation) -> Result<()> {
        if self.kind == AutomaKind::Concurrent {
            if let Mutation::AddDependency { consumer, .. } = &mutation {
                return Err(AutomaError::Compilation(format!(
                    "concurrent automa {} does not accept dependency edges (on {})",
                    self.name, consumer
                )));
            }
        }
        let description = mutation.describe();
        let mut state = self.lock_state();
        state.graph.apply(mutation)?;
        debug!(automa = %self.name, staged = state.graph.is_staging(), mutation = %description, "Topology mutation");
        Ok(())
    }
}

/// A dynamic directed graph of workers.
///
/// Cloning yields another handle to the same automa. An automa is itself a
/// [`Worker`], so it can be placed as a node inside another automa.
#[derive(Clone)]
pub struct Automa {
    pub(crate) inner: Arc<AutomaInner>,
}

impl Automa {
    /// An empty automa with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        let config = SchedulerConfig::default();
        let bus = Arc::new(EventBus::new(config.event_capacity));
        Self::from_parts(
            name.into(),
            AutomaKind::Graph,
            DependencyGraph::new(),
            Vec::new(),
            Arc::new(GlobalSettings::default()),
            config,
            bus,
        )
    }

    pub fn builder(name: impl Into<String>) -> AutomaBuilder {
        AutomaBuilder::new(name)
    }

    fn from_parts(
        name: String,
        kind: AutomaKind,
        graph: DependencyGraph,
        callbacks: Vec<Arc<dyn WorkerCallback>>,
        settings: Arc<GlobalSettings>,
        config: SchedulerConfig,
        bus: Arc<EventBus>,
    ) -> Self {
        let broker = Arc::new(InteractionBroker::new(Arc::clone(&bus)));
        Self {
            inner: Arc::new(AutomaInner {
                name,
                kind,
                state: Mutex::new(RunState::new(GraphStore::new(graph))),
                live: tokio::sync::Mutex::new(None),
                callbacks,
                settings,
                config,
                bus,
                broker,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<AutomaInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> AutomaKind {
        self.inner.kind
    }

    /// Whether two handles point at the same automa.
    pub fn ptr_eq(&self, other: &Automa) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Execute the graph from its start workers.
    ///
    /// Returns the output workers' result (a single value, or an array in
    /// declaration order when several workers are outputs). Suspension on
    /// pending interactions comes back as `Err(AutomaError::Interaction)`.
    pub async fn run(&self, inputs: Arguments) -> Result<Value> {
        let mut slot = self.inner.live.lock().await;
        if slot.is_some() || self.inner.lock_state().is_running() {
            return Err(AutomaError::InvalidState(format!(
                "automa {} has a suspended run; resume it instead",
                self.inner.name
            )));
        }

        let env = RunEnv::top_level(&self.inner);
        scheduler::start_run(&self.inner, inputs, &env)?;
        let mut live = LiveRun::new(env);
        let guard = RunGuard::new(&self.inner, &live.env);
        let outcome = scheduler::drive(&self.inner, &mut live).await;
        guard.disarm();

        if matches!(outcome, Err(AutomaError::Interaction(_))) {
            *slot = Some(live);
        }
        outcome
    }

    /// Continue a suspended run with feedback for its pending interactions.
    ///
    /// Works both on a run suspended in this process and on one rebuilt with
    /// [`Automa::restore`]. Every id must belong to a pending interaction.
    pub async fn resume(&self, feedbacks: Vec<InteractionFeedback>) -> Result<Value> {
        let mut slot = self.inner.live.lock().await;
        let mut live = match slot.take() {
            Some(live) => live,
            None if self.inner.lock_state().is_running() => {
                LiveRun::new(RunEnv::top_level(&self.inner))
            }
            None => {
                return Err(AutomaError::InvalidState(format!(
                    "automa {} has no suspended run",
                    self.inner.name
                )))
            }
        };

        for feedback in &feedbacks {
            let id = &feedback.interaction_id;
            let known = live.env.broker.contains(id, PendingKind::Suspension)
                || deliver_recorded(&self.inner, feedback, false);
            if !known {
                *slot = Some(live);
                return Err(AutomaError::UnknownInteraction(id.to_string()));
            }
        }
        for feedback in feedbacks {
            let delivered = live.env.broker.respond_kind(
                &feedback.interaction_id,
                PendingKind::Suspension,
                feedback.feedback.clone(),
            );
            if !delivered {
                deliver_recorded(&self.inner, &feedback, true);
            }
        }

        info!(automa = %self.inner.name, "Automa resumed");
        live.env.bus.publish(AutomaEvent::Resumed {
            automa: self.inner.name.clone(),
        });

        let guard = RunGuard::new(&self.inner, &live.env);
        let outcome = scheduler::drive(&self.inner, &mut live).await;
        guard.disarm();

        if matches!(outcome, Err(AutomaError::Interaction(_))) {
            *slot = Some(live);
        }
        outcome
    }

    /// Serialize the automa's full state, nested automas included.
    pub fn snapshot(&self) -> Result<Snapshot> {
        snapshot::capture(&self.inner)
    }

    /// Rebuild state from a snapshot. The automa must be idle.
    pub fn restore(&self, snapshot: &Snapshot, registry: &WorkerRegistry) -> Result<()> {
        let slot = self.inner.live.try_lock().map_err(|_| {
            AutomaError::InvalidState(format!("automa {} is running", self.inner.name))
        })?;
        if slot.is_some() || self.inner.lock_state().is_running() {
            return Err(AutomaError::InvalidState(format!(
                "automa {} has a run in progress",
                self.inner.name
            )));
        }
        snapshot::restore(&self.inner, snapshot, registry)?;
        info!(automa = %self.inner.name, taken_at = %snapshot.taken_at, "Automa restored from snapshot");
        Ok(())
    }

    pub fn add_worker(&self, node: WorkerNode) -> Result<()> {
        self.inner.apply(Mutation::AddWorker(node))
    }

    pub fn remove_worker(&self, key: &str) -> Result<()> {
        self.inner.apply(Mutation::RemoveWorker(key.to_string()))
    }

    pub fn add_dependency(&self, consumer: &str, producer: &str) -> Result<()> {
        self.inner.apply(Mutation::AddDependency {
            consumer: consumer.to_string(),
            producer: producer.to_string(),
        })
    }

    /// Answer an in-flight `request_feedback` call. Returns false if no
    /// request with that id is waiting.
    pub fn send_feedback(&self, request_id: &InteractionId, feedback: Feedback) -> bool {
        self.inner
            .broker
            .respond_kind(request_id, PendingKind::Request, feedback)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutomaEvent> {
        self.inner.bus.subscribe()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }

    /// Interactions the current run is suspended on.
    pub fn pending_interactions(&self) -> Vec<Interaction> {
        let live = self.inner.broker.pending_interactions();
        if !live.is_empty() {
            return live;
        }
        let mut recorded = unresolved_records(&self.inner);
        recorded.sort_by(|a, b| a.event.timestamp.cmp(&b.event.timestamp));
        recorded
    }

    /// Pending `request_feedback` calls.
    pub fn pending_requests(&self) -> Vec<Interaction> {
        self.inner.broker.pending_requests()
    }

    /// Result of a worker in the current or last run.
    pub fn output_of(&self, key: &str) -> Option<Value> {
        self.inner.lock_state().results.get(key).cloned()
    }

    /// Local space of a worker, if it has written one that was kept.
    pub fn local_space_of(&self, key: &str) -> Option<LocalSpace> {
        self.inner.lock_state().locals.get(key).cloned()
    }

    /// Keys of the committed graph, in insertion order.
    pub fn worker_keys(&self) -> Vec<String> {
        let graph = self.inner.lock_state().graph.committed();
        graph.keys().map(str::to_string).collect()
    }

    /// Declared dependencies of `key`, including staged changes.
    pub fn dependencies_of(&self, key: &str) -> Option<Vec<String>> {
        let state = self.inner.lock_state();
        state
            .graph
            .view()
            .node(key)
            .map(|node| node.dependencies.clone())
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock_state().is_running()
    }
}

/// Write feedback into the first unanswered record with a matching id,
/// searching nested automas too. With `apply == false` only checks.
fn deliver_recorded(inner: &AutomaInner, feedback: &InteractionFeedback, apply: bool) -> bool {
    let nested = {
        let mut state = inner.lock_state();
        for records in state.records.values_mut() {
            for record in records.iter_mut() {
                if record.interaction.interaction_id == feedback.interaction_id
                    && record.feedback.is_none()
                {
                    if apply {
                        record.feedback = Some(feedback.feedback.clone());
                    }
                    return true;
                }
            }
        }
        snapshot::nested_automas(state.graph.view())
    };
    nested
        .iter()
        .any(|child| deliver_recorded(&child.inner, feedback, apply))
}

fn unresolved_records(inner: &AutomaInner) -> Vec<Interaction> {
    let (mut found, nested) = {
        let state = inner.lock_state();
        let found: Vec<Interaction> = state
            .records
            .values()
            .flatten()
            .filter(|record| record.feedback.is_none())
            .map(|record| record.interaction.clone())
            .collect();
        (found, snapshot::nested_automas(state.graph.view()))
    };
    for child in nested {
        found.extend(unresolved_records(&child.inner));
    }
    found
}

impl Worker for Automa {
    fn signature(&self) -> Signature {
        Signature::open()
    }

    /// Run as a node of a parent automa, sharing the parent's broker and bus.
    fn run(&self, ctx: WorkerContext, args: Arguments) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let key = ctx.key().to_string();
            let env = ctx.env().nested();

            let resuming = self.inner.lock_state().is_running();
            let outcome = if resuming {
                debug!(automa = %self.inner.name, "Continuing restored nested run");
                Ok(())
            } else {
                scheduler::start_run(&self.inner, args, &env)
            };
            let outcome = match outcome {
                Ok(()) => {
                    let mut live = LiveRun::new(env);
                    let guard = RunGuard::new(&self.inner, &live.env);
                    let outcome = scheduler::drive(&self.inner, &mut live).await;
                    guard.disarm();
                    outcome
                }
                Err(err) => Err(err),
            };

            outcome.map_err(|err| {
                if err.is_interaction() {
                    err
                } else {
                    AutomaError::WorkerExecution {
                        key,
                        source: anyhow::Error::new(err),
                    }
                }
            })
        })
    }

    fn as_automa(&self) -> Option<&Automa> {
        Some(self)
    }
}

impl std::fmt::Debug for Automa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automa")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

/// Builder for an [`Automa`].
pub struct AutomaBuilder {
    name: String,
    kind: AutomaKind,
    nodes: Vec<WorkerNode>,
    callbacks: Vec<Arc<dyn WorkerCallback>>,
    settings: Option<Arc<GlobalSettings>>,
    config: SchedulerConfig,
    event_bus: Option<Arc<EventBus>>,
}

impl AutomaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AutomaKind::Graph,
            nodes: Vec::new(),
            callbacks: Vec::new(),
            settings: None,
            config: SchedulerConfig::default(),
            event_bus: None,
        }
    }

    pub fn worker(mut self, node: WorkerNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Automa-level callback, fired for every worker of this automa.
    pub fn callback(mut self, callback: Arc<dyn WorkerCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn settings(mut self, settings: Arc<GlobalSettings>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn kind(mut self, kind: AutomaKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn build(self) -> Result<Automa> {
        let mut graph = DependencyGraph::new();
        for node in self.nodes {
            graph.add_worker(node)?;
        }
        scheduler::validate(&graph)?;

        let bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.config.event_capacity)));
        Ok(Automa::from_parts(
            self.name,
            self.kind,
            graph,
            self.callbacks,
            self.settings.unwrap_or_default(),
            self.config,
            bus,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ArgsBinding;
    use crate::worker::worker_fn;
    use automa_core::types::Event;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn constant(value: Value) -> impl Worker {
        worker_fn(move |_ctx, _args| {
            let value = value.clone();
            async move { Ok(value) }
        })
        .params(&[])
    }

    #[tokio::test]
    async fn test_linear_run() {
        let automa = Automa::builder("linear")
            .worker(WorkerNode::new("a", constant(json!(2))).start())
            .worker(
                WorkerNode::new(
                    "b",
                    worker_fn(|_ctx, args: Arguments| async move {
                        let x = args.get("x").and_then(Value::as_i64).unwrap_or(0);
                        Ok(json!(x * 10))
                    })
                    .params(&["x"]),
                )
                .depends_on(["a"])
                .output(),
            )
            .build()
            .unwrap();

        assert_eq!(automa.run(Arguments::new()).await.unwrap(), json!(20));
        assert_eq!(automa.output_of("a"), Some(json!(2)));
        assert!(!automa.is_suspended());
    }

    #[tokio::test]
    async fn test_build_rejects_cycle() {
        let err = Automa::builder("cyclic")
            .worker(WorkerNode::new("a", constant(json!(1))).depends_on(["b"]))
            .worker(WorkerNode::new("b", constant(json!(1))).depends_on(["a"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, AutomaError::Compilation(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_unpack_with_two_deps() {
        let err = Automa::builder("unpack")
            .worker(WorkerNode::new("a", constant(json!(1))).start())
            .worker(WorkerNode::new("b", constant(json!(1))).start())
            .worker(
                WorkerNode::new("c", constant(json!(1)))
                    .depends_on(["a", "b"])
                    .binding(ArgsBinding::Unpack),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, AutomaError::Compilation(_)));
    }

    #[tokio::test]
    async fn test_run_while_suspended_is_invalid() {
        let automa = Automa::builder("suspends")
            .worker(
                WorkerNode::new(
                    "ask",
                    worker_fn(|ctx: WorkerContext, _args| async move {
                        let feedback = ctx.interact(Event::typed("question", "ok?")).await?;
                        Ok(feedback.data)
                    }),
                )
                .start()
                .output(),
            )
            .build()
            .unwrap();

        let err = automa.run(Arguments::new()).await.unwrap_err();
        let signal = err.into_interaction().unwrap();
        assert_eq!(signal.interactions.len(), 1);
        assert!(automa.is_suspended());

        let again = automa.run(Arguments::new()).await.unwrap_err();
        assert!(matches!(again, AutomaError::InvalidState(_)));

        let id = signal.interactions[0].interaction_id.clone();
        let out = automa
            .resume(vec![InteractionFeedback::new(id, "yes")])
            .await
            .unwrap();
        assert_eq!(out, json!("yes"));
    }

    #[tokio::test]
    async fn test_resume_rejects_unknown_id() {
        let automa = Automa::builder("strict")
            .worker(
                WorkerNode::new(
                    "ask",
                    worker_fn(|ctx: WorkerContext, _args| async move {
                        Ok(ctx.interact(Event::new("?")).await?.data)
                    }),
                )
                .start()
                .output(),
            )
            .build()
            .unwrap();

        let signal = automa
            .run(Arguments::new())
            .await
            .unwrap_err()
            .into_interaction()
            .unwrap();
        let err = automa
            .resume(vec![InteractionFeedback::new(
                InteractionId::from_str("bogus"),
                1,
            )])
            .await
            .unwrap_err();
        assert!(matches!(err, AutomaError::UnknownInteraction(_)));

        // The run is still resumable with the right id.
        let out = automa
            .resume(vec![InteractionFeedback::new(signal.ids()[0].clone(), 7)])
            .await
            .unwrap();
        assert_eq!(out, json!(7));
    }

    #[tokio::test]
    async fn test_resume_when_idle_is_invalid() {
        let automa = Automa::new("idle");
        let err = automa.resume(Vec::new()).await.unwrap_err();
        assert!(matches!(err, AutomaError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_failure_clears_run_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let automa = Automa::builder("fails")
            .worker(
                WorkerNode::new(
                    "boom",
                    worker_fn(move |_ctx, _args| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            anyhow::bail!("boom")
                        }
                    }),
                )
                .start(),
            )
            .build()
            .unwrap();

        let err = automa.run(Arguments::new()).await.unwrap_err();
        assert_eq!(err.worker_key(), Some("boom"));
        assert!(!automa.is_suspended());

        // A failed run can be re-run.
        assert!(automa.run(Arguments::new()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_max_steps_guard() {
        let automa = Automa::builder("loop")
            .config(SchedulerConfig {
                max_steps: 5,
                ..SchedulerConfig::default()
            })
            .worker(
                WorkerNode::new(
                    "spin",
                    worker_fn(|ctx: WorkerContext, _args| async move {
                        ctx.ferry_to("spin", Arguments::new())?;
                        Ok(Value::Null)
                    }),
                )
                .start(),
            )
            .build()
            .unwrap();

        let err = automa.run(Arguments::new()).await.unwrap_err();
        assert!(matches!(err, AutomaError::StepLimitExceeded(5)));
    }

    #[tokio::test]
    async fn test_concurrent_kind_rejects_edges() {
        let automa = Automa::builder("fan")
            .kind(AutomaKind::Concurrent)
            .worker(WorkerNode::new("a", constant(json!(1))).start())
            .worker(WorkerNode::new("b", constant(json!(2))).start())
            .build()
            .unwrap();
        let err = automa.add_dependency("b", "a").unwrap_err();
        assert!(matches!(err, AutomaError::Compilation(_)));
    }

    #[tokio::test]
    async fn test_no_output_returns_null() {
        let automa = Automa::builder("silent")
            .worker(WorkerNode::new("a", constant(json!(1))).start())
            .build()
            .unwrap();
        assert_eq!(automa.run(Arguments::new()).await.unwrap(), Value::Null);
    }
}
