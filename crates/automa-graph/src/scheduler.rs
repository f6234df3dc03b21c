//! Dynamic step scheduler.
//!
//! A run is a sequence of dynamic steps. Every worker placed in a step is
//! launched concurrently; when the step drains, staged topology changes are
//! committed, results folded into the completion ledger, and the next step
//! is built from redirections plus newly satisfied dependencies.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use automa_core::error::{AutomaError, Result};
use automa_core::event::EventBus;
use automa_core::traits::{CallbackInfo, WorkerCallback};
use automa_core::types::{Arguments, AutomaEvent, InteractionSignal};

use crate::args::{ArgumentResolver, KickoffSource};
use crate::automa::AutomaInner;
use crate::callback;
use crate::context::WorkerContext;
use crate::graph::{ArgsBinding, DependencyGraph, Mutation, WorkerNode};
use crate::interaction::{InteractionBroker, ParkScope};
use crate::snapshot;
use crate::state::{Kickoff, RunState, StepState};
use crate::worker::Worker;

type WorkerFuture = BoxFuture<'static, (String, Result<Value>)>;

/// Shared plumbing of one run: where interactions and events go, and which
/// step scope parked workers are counted in.
#[derive(Clone)]
pub(crate) struct RunEnv {
    pub broker: Arc<InteractionBroker>,
    pub bus: Arc<EventBus>,
    pub scope: Arc<ParkScope>,
    pub top_level: bool,
}

impl RunEnv {
    pub(crate) fn top_level(inner: &AutomaInner) -> Self {
        Self {
            broker: Arc::clone(&inner.broker),
            bus: Arc::clone(&inner.bus),
            scope: ParkScope::root(),
            top_level: true,
        }
    }

    /// Environment for an automa dispatched as a worker of this run.
    pub(crate) fn nested(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            bus: Arc::clone(&self.bus),
            scope: ParkScope::child(&self.scope),
            top_level: false,
        }
    }
}

/// Worker futures of the current step, kept across suspension.
pub(crate) struct LiveRun {
    in_flight: FuturesUnordered<WorkerFuture>,
    pub env: RunEnv,
    started: Instant,
}

impl LiveRun {
    pub(crate) fn new(env: RunEnv) -> Self {
        Self {
            in_flight: FuturesUnordered::new(),
            env,
            started: Instant::now(),
        }
    }
}

/// Resets the automa if a run is dropped before it returns.
pub(crate) struct RunGuard {
    inner: Arc<AutomaInner>,
    env: RunEnv,
    armed: bool,
}

impl RunGuard {
    pub(crate) fn new(inner: &Arc<AutomaInner>, env: &RunEnv) -> Self {
        Self {
            inner: Arc::clone(inner),
            env: env.clone(),
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(automa = %self.inner.name, "Run dropped while in progress, discarding its state");
        {
            let mut state = self.inner.lock_state();
            state.abandon();
            state.settle_locals(self.inner.config.reset_local_space);
        }
        self.env.broker.forget_scope(&self.env.scope);
    }
}

enum StepEvent {
    Finished(String, Result<Value>),
    Drained,
    Settled,
}

/// Static checks run before a fresh run and after topology changes.
pub(crate) fn validate(graph: &DependencyGraph) -> Result<()> {
    if let Some(cycle) = graph.detect_cycle() {
        return Err(AutomaError::Compilation(format!(
            "dependency cycle among workers: {}",
            cycle.join(", ")
        )));
    }
    for node in graph.nodes() {
        if node.binding == ArgsBinding::Unpack && node.dependencies.len() != 1 {
            return Err(AutomaError::Compilation(format!(
                "worker {} unpacks its input but has {} dependencies",
                node.key,
                node.dependencies.len()
            )));
        }
    }
    Ok(())
}

/// Reset per-run state and seed the first step with the start workers.
pub(crate) fn start_run(inner: &AutomaInner, inputs: Arguments, env: &RunEnv) -> Result<()> {
    let workers = {
        let mut state = inner.lock_state();
        let graph = state.graph.committed();
        validate(&graph)?;

        state.reset(inputs);
        state.graph.begin_staging();
        let kickoffs: Vec<Kickoff> = graph
            .start_keys()
            .into_iter()
            .map(|key| Kickoff::new(key, KickoffSource::Seed))
            .collect();
        let workers: Vec<String> = kickoffs.iter().map(|k| k.key.clone()).collect();
        if !kickoffs.is_empty() {
            state.step = Some(StepState { index: 0, kickoffs });
            state.steps = 1;
        }
        workers
    };

    info!(automa = %inner.name, top_level = env.top_level, start = ?workers, "Automa run started");
    env.bus.publish(AutomaEvent::RunStarted {
        automa: inner.name.clone(),
        top_level: env.top_level,
    });
    if !workers.is_empty() {
        env.bus.publish(AutomaEvent::StepStarted {
            automa: inner.name.clone(),
            step: 0,
            workers,
        });
    }
    Ok(())
}

/// Run steps until the automa finishes, fails, or (top level only) every
/// in-flight worker is parked on an interaction.
pub(crate) async fn drive(inner: &Arc<AutomaInner>, live: &mut LiveRun) -> Result<Value> {
    loop {
        launch_pending(inner, live);

        loop {
            match next_event(live).await {
                StepEvent::Finished(key, Ok(value)) => {
                    inner.lock_state().finish(&key, value);
                }
                StepEvent::Finished(_, Err(err)) => return Err(fail_run(inner, live, err)),
                StepEvent::Drained => break,
                StepEvent::Settled => return Err(suspend(inner, &live.env)),
            }
        }

        let advanced = {
            let mut state = inner.lock_state();
            advance(inner, &mut state, &live.env)
        };
        match advanced {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => return Err(fail_run(inner, live, err)),
        }
    }
    Ok(finish_run(inner, live))
}

/// Launch every kickoff of the current step that is not yet in flight.
fn launch_pending(inner: &Arc<AutomaInner>, live: &mut LiveRun) {
    let futures = {
        let mut guard = inner.lock_state();
        let state = &mut *guard;
        let Some(step) = state.step.as_mut() else {
            return;
        };
        let graph = state.graph.committed();
        let resolver = ArgumentResolver::new(&graph, &state.results, &state.inputs, &inner.name);

        let mut futures = Vec::new();
        for kickoff in step.kickoffs.iter_mut() {
            if kickoff.finished || kickoff.launched {
                continue;
            }
            let Some(node) = graph.node(&kickoff.key) else {
                warn!(automa = %inner.name, worker = %kickoff.key, "Scheduled worker no longer exists");
                continue;
            };
            let args = match &kickoff.args {
                Some(args) => Ok(args.clone()),
                None => resolver.resolve(&kickoff.key, &kickoff.source),
            };
            if let Ok(args) = &args {
                kickoff.args = Some(args.clone());
            }
            kickoff.launched = true;
            state.completed.remove(&kickoff.key);
            futures.push(launch(inner, &live.env, node, args));
        }
        futures
    };
    for future in futures {
        live.in_flight.push(future);
    }
}

fn launch(
    inner: &Arc<AutomaInner>,
    env: &RunEnv,
    node: &WorkerNode,
    args: Result<Arguments>,
) -> WorkerFuture {
    let key = node.key.clone();
    let worker = Arc::clone(&node.worker);
    let callbacks = callback::chain(&inner.settings.callbacks, &inner.callbacks, &node.callbacks);
    let ctx = WorkerContext::new(key.clone(), inner, env.clone());
    let invocation = Invocation {
        key: key.clone(),
        automa: inner.name.clone(),
        top_level: env.top_level,
        bus: Arc::clone(&env.bus),
        callbacks,
    };
    Box::pin(async move {
        let result = invocation.run(worker, ctx, args).await;
        (key, result)
    })
}

/// One worker activation, wrapped in its callbacks and events.
struct Invocation {
    key: String,
    automa: String,
    top_level: bool,
    bus: Arc<EventBus>,
    callbacks: Vec<Arc<dyn WorkerCallback>>,
}

impl Invocation {
    async fn run(
        self,
        worker: Arc<dyn Worker>,
        ctx: WorkerContext,
        args: Result<Arguments>,
    ) -> Result<Value> {
        let started = Instant::now();
        self.bus.publish(AutomaEvent::WorkerStarted {
            automa: self.automa.clone(),
            worker: self.key.clone(),
        });
        debug!(automa = %self.automa, worker = %self.key, "Worker started");

        let (outcome, arguments) = match args {
            Ok(args) => {
                let info = self.info(&args);
                for callback in &self.callbacks {
                    callback.on_worker_start(&info).await;
                }
                (worker.run(ctx, args.clone()).await, args)
            }
            // Resolution failed: the worker never starts.
            Err(err) => (Err(err), Arguments::new()),
        };
        let info = self.info(&arguments);

        match outcome {
            Ok(value) => {
                for callback in &self.callbacks {
                    callback.on_worker_end(&info, &value).await;
                }
                let elapsed_ms = started.elapsed().as_millis() as u64;
                debug!(automa = %self.automa, worker = %self.key, elapsed_ms, "Worker completed");
                self.bus.publish(AutomaEvent::WorkerCompleted {
                    automa: self.automa.clone(),
                    worker: self.key.clone(),
                    elapsed_ms,
                });
                Ok(value)
            }
            Err(err) if err.is_interaction() => Err(err),
            Err(err) => {
                let mut suppressed = false;
                for callback in self.callbacks.iter().filter(|cb| cb.accepts(&err)) {
                    if callback.on_worker_error(&info, &err).await {
                        suppressed = true;
                    }
                }
                self.bus.publish(AutomaEvent::WorkerFailed {
                    automa: self.automa.clone(),
                    worker: self.key.clone(),
                    error: err.to_string(),
                    suppressed,
                });
                if suppressed {
                    warn!(automa = %self.automa, worker = %self.key, error = %err, "Worker error suppressed");
                    Ok(Value::Null)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn info<'a>(&'a self, arguments: &'a Arguments) -> CallbackInfo<'a> {
        CallbackInfo {
            key: &self.key,
            is_top_level: self.top_level,
            parent: &self.automa,
            arguments,
        }
    }
}

async fn next_event(live: &mut LiveRun) -> StepEvent {
    let LiveRun { in_flight, env, .. } = live;
    futures::future::poll_fn(|cx| {
        if in_flight.is_empty() {
            return Poll::Ready(StepEvent::Drained);
        }
        match in_flight.poll_next_unpin(cx) {
            Poll::Ready(Some((key, result))) => Poll::Ready(StepEvent::Finished(key, result)),
            Poll::Ready(None) => Poll::Ready(StepEvent::Drained),
            Poll::Pending => {
                // A nested step that settles keeps waiting; it is counted as
                // parked by its parent instead.
                if env.scope.is_settled(in_flight.len()) && env.top_level {
                    Poll::Ready(StepEvent::Settled)
                } else {
                    Poll::Pending
                }
            }
        }
    })
    .await
}

/// Step boundary. Returns whether another step was scheduled.
fn advance(inner: &AutomaInner, state: &mut RunState, env: &RunEnv) -> Result<bool> {
    let Some(step) = state.step.take() else {
        return Ok(false);
    };

    // A failed boundary must leave the committed graph untouched.
    {
        let staged = state.graph.view();
        if !state.graph.pending().is_empty() {
            validate(staged)?;
        }
        if let Some(ferry) = state.ferries.iter().find(|f| !staged.contains(&f.to)) {
            return Err(AutomaError::UnknownKey(ferry.to.clone()));
        }
    }

    let applied = state.graph.commit();
    let graph = state.graph.committed();
    if !applied.is_empty() {
        let mutations: Vec<String> = applied.iter().map(Mutation::describe).collect();
        info!(automa = %inner.name, step = step.index, mutations = ?mutations, "Topology changed");
        env.bus.publish(AutomaEvent::TopologyChanged {
            automa: inner.name.clone(),
            step: step.index,
            mutations,
        });
    }

    let mut finished = Vec::new();
    for kickoff in step.kickoffs {
        if !kickoff.finished {
            continue;
        }
        if !graph.contains(&kickoff.key) {
            debug!(automa = %inner.name, worker = %kickoff.key, "Discarding result of removed worker");
            continue;
        }
        state.results.insert(kickoff.key.clone(), kickoff.result);
        state.completed.insert(kickoff.key.clone());
        finished.push(kickoff.key);
    }

    // A re-run producer invalidates consumers that completed before it.
    let finished_set: HashSet<&str> = finished.iter().map(String::as_str).collect();
    for key in &finished {
        for consumer in graph.successors(key) {
            if !finished_set.contains(consumer.as_str()) {
                state.completed.remove(consumer);
            }
        }
    }

    let mut scheduled: HashSet<String> = HashSet::new();
    let mut next = Vec::new();
    for ferry in std::mem::take(&mut state.ferries) {
        if !scheduled.insert(ferry.to.clone()) {
            warn!(automa = %inner.name, from = %ferry.from, to = %ferry.to, "Duplicate redirection dropped");
            continue;
        }
        next.push(Kickoff::new(
            ferry.to,
            KickoffSource::Ferry {
                from: ferry.from,
                args: ferry.args,
            },
        ));
    }
    for key in &finished {
        for consumer in graph.successors(key) {
            if scheduled.contains(consumer) || !graph.is_ready(consumer, &state.completed)? {
                continue;
            }
            scheduled.insert(consumer.clone());
            next.push(Kickoff::new(consumer.clone(), KickoffSource::Dependencies));
        }
    }

    if next.is_empty() {
        return Ok(false);
    }

    let index = step.index + 1;
    let max_steps = inner.config.max_steps;
    if max_steps > 0 && index >= max_steps {
        return Err(AutomaError::StepLimitExceeded(max_steps));
    }

    let workers: Vec<String> = next.iter().map(|k| k.key.clone()).collect();
    debug!(automa = %inner.name, step = index, workers = ?workers, "Dynamic step scheduled");
    env.bus.publish(AutomaEvent::StepStarted {
        automa: inner.name.clone(),
        step: index,
        workers,
    });
    state.step = Some(StepState {
        index,
        kickoffs: next,
    });
    state.steps = index + 1;
    Ok(true)
}

fn suspend(inner: &Arc<AutomaInner>, env: &RunEnv) -> AutomaError {
    let interactions = env.broker.pending_interactions();
    let snapshot = match snapshot::capture(inner) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(automa = %inner.name, error = %e, "Failed to capture suspension snapshot");
            None
        }
    };
    info!(automa = %inner.name, pending = interactions.len(), "Automa suspended");
    env.bus.publish(AutomaEvent::Suspended {
        automa: inner.name.clone(),
        pending: interactions.len(),
    });
    AutomaError::Interaction(InteractionSignal {
        interactions,
        snapshot,
    })
}

fn fail_run(inner: &AutomaInner, live: &mut LiveRun, err: AutomaError) -> AutomaError {
    live.in_flight = FuturesUnordered::new();
    live.env.broker.forget_scope(&live.env.scope);
    {
        let mut state = inner.lock_state();
        state.abandon();
        state.settle_locals(inner.config.reset_local_space);
    }

    error!(automa = %inner.name, error = %err, "Automa run failed");
    live.env.bus.publish(AutomaEvent::RunError {
        automa: inner.name.clone(),
        error: err.to_string(),
    });
    err
}

fn finish_run(inner: &AutomaInner, live: &LiveRun) -> Value {
    let (output, steps) = {
        let mut state = inner.lock_state();
        state.graph.end_staging();
        state.ferries.clear();
        state.records.clear();
        state.settle_locals(inner.config.reset_local_space);

        let graph = state.graph.committed();
        let mut values = Vec::new();
        for key in graph.output_keys() {
            match state.results.get(&key) {
                Some(value) => values.push(value.clone()),
                None => {
                    warn!(automa = %inner.name, worker = %key, "Output worker produced no result");
                    values.push(Value::Null);
                }
            }
        }
        let output = match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::Array(values),
        };
        (output, state.steps)
    };

    let elapsed_ms = live.started.elapsed().as_millis() as u64;
    info!(automa = %inner.name, steps, elapsed_ms, "Automa run complete");
    live.env.bus.publish(AutomaEvent::RunComplete {
        automa: inner.name.clone(),
        steps,
        elapsed_ms,
    });
    output
}
