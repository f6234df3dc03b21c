use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use automa_core::error::{AutomaError, Result};
use automa_core::types::{
    Arguments, AutomaEvent, Event, Feedback, Interaction, InteractionId,
};

use crate::automa::{Automa, AutomaInner};
use crate::graph::{Mutation, WorkerNode};
use crate::interaction::{Activation, InteractionRecord, PendingGuard, PendingKind};
use crate::scheduler::RunEnv;
use crate::state::{FerryRequest, LocalSpace};

/// Handle a running worker uses to talk back to its owning automa.
///
/// One context is created per worker activation. Clones share the
/// activation's interaction counter and its parked state.
#[derive(Clone)]
pub struct WorkerContext {
    key: String,
    automa_name: String,
    automa: Weak<AutomaInner>,
    env: RunEnv,
    calls: Arc<AtomicUsize>,
    activation: Arc<Activation>,
}

impl WorkerContext {
    pub(crate) fn new(key: impl Into<String>, automa: &Arc<AutomaInner>, env: RunEnv) -> Self {
        Self {
            key: key.into(),
            automa_name: automa.name.clone(),
            automa: Arc::downgrade(automa),
            activation: Activation::new(Arc::clone(&env.scope)),
            env,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Key of the worker this context belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn automa_name(&self) -> &str {
        &self.automa_name
    }

    /// False when the owning automa runs as a node of another automa.
    pub fn is_top_level(&self) -> bool {
        self.env.top_level
    }

    pub(crate) fn env(&self) -> &RunEnv {
        &self.env
    }

    fn inner(&self) -> Result<Arc<AutomaInner>> {
        self.automa.upgrade().ok_or_else(|| {
            AutomaError::InvalidState(format!("automa '{}' was dropped", self.automa_name))
        })
    }

    /// The owning automa.
    pub fn automa(&self) -> Result<Automa> {
        Ok(Automa::from_inner(self.inner()?))
    }

    /// Make `key` run in the next dynamic step, bypassing its dependencies.
    pub fn ferry_to(&self, key: &str, args: Arguments) -> Result<()> {
        let inner = self.inner()?;
        {
            let mut state = inner.lock_state();
            if !state.graph.view().contains(key) {
                return Err(AutomaError::UnknownKey(key.to_string()));
            }
            state.ferries.push(FerryRequest {
                from: self.key.clone(),
                to: key.to_string(),
                args,
            });
        }
        debug!(automa = %self.automa_name, from = %self.key, to = %key, "Ferry requested");
        self.env.bus.publish(AutomaEvent::Ferried {
            automa: self.automa_name.clone(),
            from: self.key.clone(),
            to: key.to_string(),
        });
        Ok(())
    }

    /// Add a worker; visible to the scheduler from the next dynamic step.
    pub fn add_worker(&self, node: WorkerNode) -> Result<()> {
        self.inner()?.apply(Mutation::AddWorker(node))
    }

    pub fn remove_worker(&self, key: &str) -> Result<()> {
        self.inner()?.apply(Mutation::RemoveWorker(key.to_string()))
    }

    pub fn add_dependency(&self, consumer: &str, producer: &str) -> Result<()> {
        self.inner()?.apply(Mutation::AddDependency {
            consumer: consumer.to_string(),
            producer: producer.to_string(),
        })
    }

    /// Result of a worker that already completed in this run.
    pub fn output_of(&self, key: &str) -> Option<Value> {
        let inner = self.automa.upgrade()?;
        let state = inner.lock_state();
        state.results.get(key).cloned()
    }

    /// Copy of this worker's local space.
    pub fn local_space(&self) -> Result<LocalSpace> {
        let inner = self.inner()?;
        let state = inner.lock_state();
        Ok(state.locals.get(&self.key).cloned().unwrap_or_default())
    }

    /// Modify this worker's local space in place.
    ///
    /// `update` runs under the automa's state lock and must not call back
    /// into the automa.
    pub fn update_local_space<R>(&self, update: impl FnOnce(&mut LocalSpace) -> R) -> Result<R> {
        let inner = self.inner()?;
        let mut state = inner.lock_state();
        Ok(update(state.locals.entry(self.key.clone()).or_default()))
    }

    /// Wait for external feedback on `event`.
    ///
    /// The run suspends once every worker of the current step is waiting;
    /// the caller resumes it with feedback keyed by interaction id, and this
    /// call returns that feedback. A worker re-run from a snapshot replays
    /// feedback it already received instead of asking again. Dropping the
    /// returned future withdraws the interaction.
    pub async fn interact(&self, event: Event) -> Result<Feedback> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let interaction = {
            let inner = self.inner()?;
            let mut state = inner.lock_state();
            let records = state.records.entry(self.key.clone()).or_default();
            match records.get(index) {
                Some(record) => {
                    if record.interaction.event.event_type != event.event_type {
                        return Err(AutomaError::InvalidState(format!(
                            "worker {} replayed interaction #{} with event type {:?}, recorded {:?}",
                            self.key, index, event.event_type, record.interaction.event.event_type
                        )));
                    }
                    if let Some(feedback) = &record.feedback {
                        debug!(
                            worker = %self.key,
                            interaction_id = %record.interaction.interaction_id,
                            "Replaying recorded feedback"
                        );
                        return Ok(feedback.clone());
                    }
                    record.interaction.clone()
                }
                None => {
                    let interaction = Interaction {
                        interaction_id: InteractionId::new(),
                        worker_key: self.key.clone(),
                        automa: self.automa_name.clone(),
                        event,
                    };
                    records.push(InteractionRecord {
                        interaction: interaction.clone(),
                        feedback: None,
                    });
                    interaction
                }
            }
        };

        let id = interaction.interaction_id.clone();
        info!(
            automa = %self.automa_name,
            worker = %self.key,
            interaction_id = %id,
            "Worker waiting for feedback"
        );
        let rx = self.env.broker.register(
            interaction,
            PendingKind::Suspension,
            Some(Arc::clone(&self.activation)),
        );
        let _guard = PendingGuard::new(&self.env.broker, id.clone());
        let feedback = rx.await.map_err(|_| {
            AutomaError::InvalidState(format!("interaction {} was abandoned", id))
        })?;

        if let Some(inner) = self.automa.upgrade() {
            let mut state = inner.lock_state();
            if let Some(record) = state
                .records
                .get_mut(&self.key)
                .and_then(|records| records.get_mut(index))
            {
                record.feedback = Some(feedback.clone());
            }
        }
        Ok(feedback)
    }

    /// Publish an application event. Fire-and-forget.
    pub fn post_event(&self, event: Event) {
        debug!(automa = %self.automa_name, worker = %self.key, event_type = ?event.event_type, "Event posted");
        self.env.bus.publish(AutomaEvent::EventPosted {
            automa: self.automa_name.clone(),
            worker: self.key.clone(),
            event,
        });
    }

    /// Ask for feedback without suspending the run.
    ///
    /// The request is answered through `Automa::send_feedback`. `None` uses
    /// the automa's configured feedback timeout.
    pub async fn request_feedback(
        &self,
        event: Event,
        timeout: Option<Duration>,
    ) -> Result<Feedback> {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_secs(self.inner()?.config.feedback_timeout_secs),
        };
        let interaction = Interaction {
            interaction_id: InteractionId::new(),
            worker_key: self.key.clone(),
            automa: self.automa_name.clone(),
            event: event.clone(),
        };
        let id = interaction.interaction_id.clone();

        let rx = self.env.broker.register(interaction, PendingKind::Request, None);
        let _guard = PendingGuard::new(&self.env.broker, id.clone());
        self.env.bus.publish(AutomaEvent::FeedbackRequested {
            request_id: id.0.clone(),
            worker: self.key.clone(),
            event,
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(feedback)) => Ok(feedback),
            Ok(Err(_)) => Err(AutomaError::InvalidState(format!(
                "feedback request {} was abandoned",
                id
            ))),
            Err(_) => {
                warn!(worker = %self.key, request_id = %id, "Feedback request timed out");
                Err(AutomaError::FeedbackTimeout(id.0))
            }
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("key", &self.key)
            .field("automa", &self.automa_name)
            .field("top_level", &self.env.top_level)
            .finish()
    }
}
