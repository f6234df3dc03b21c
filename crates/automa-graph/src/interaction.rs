use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use automa_core::event::EventBus;
use automa_core::types::{AutomaEvent, Feedback, Interaction, InteractionId};

/// Counts the workers of one running step that are parked on an interaction.
///
/// A step whose in-flight workers are all parked cannot make progress on its
/// own. At the top level that suspends the run; a nested automa instead
/// reports itself as one parked entry to the scope of its parent step.
pub(crate) struct ParkScope {
    counts: Mutex<ScopeCounts>,
    parent: Option<Arc<ParkScope>>,
}

#[derive(Default)]
struct ScopeCounts {
    parked: usize,
    lent: bool,
}

impl ParkScope {
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(ScopeCounts::default()),
            parent: None,
        })
    }

    pub(crate) fn child(parent: &Arc<ParkScope>) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(ScopeCounts::default()),
            parent: Some(Arc::clone(parent)),
        })
    }

    fn counts(&self) -> MutexGuard<'_, ScopeCounts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn park(&self) {
        self.counts().parked += 1;
    }

    pub(crate) fn unpark(&self) {
        let lent = {
            let mut counts = self.counts();
            counts.parked = counts.parked.saturating_sub(1);
            std::mem::take(&mut counts.lent)
        };
        if lent {
            if let Some(parent) = &self.parent {
                parent.unpark();
            }
        }
    }

    /// Whether every one of `in_flight` workers is parked. A settled child
    /// scope parks itself once in its parent.
    pub(crate) fn is_settled(&self, in_flight: usize) -> bool {
        let lend = {
            let mut counts = self.counts();
            if counts.parked == 0 || counts.parked < in_flight {
                return false;
            }
            let lend = !counts.lent && self.parent.is_some();
            if lend {
                counts.lent = true;
            }
            lend
        };
        if lend {
            if let Some(parent) = &self.parent {
                parent.park();
            }
        }
        true
    }

    pub(crate) fn descends_from(&self, ancestor: &Arc<ParkScope>) -> bool {
        if std::ptr::eq(self, Arc::as_ptr(ancestor)) {
            return true;
        }
        self.parent
            .as_ref()
            .map_or(false, |parent| parent.descends_from(ancestor))
    }
}

/// Parked state of one worker activation.
///
/// The activation counts once in its step scope for as long as at least one
/// of its suspension interactions is outstanding, however many there are.
pub(crate) struct Activation {
    scope: Arc<ParkScope>,
    waiting: Mutex<usize>,
}

impl Activation {
    pub(crate) fn new(scope: Arc<ParkScope>) -> Arc<Self> {
        Arc::new(Self {
            scope,
            waiting: Mutex::new(0),
        })
    }

    fn enter(&self) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        *waiting += 1;
        if *waiting == 1 {
            self.scope.park();
        }
    }

    fn leave(&self) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if *waiting == 0 {
            return;
        }
        *waiting -= 1;
        if *waiting == 0 {
            self.scope.unpark();
        }
    }
}

/// An interaction raised by a worker, with the feedback it received (if any).
/// Kept per worker activation so a restored worker can replay its calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub interaction: Interaction,
    #[serde(default)]
    pub feedback: Option<Feedback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    /// Suspends the run until resumed.
    Suspension,
    /// Answered in-flight through `send_feedback`.
    Request,
}

struct PendingEntry {
    interaction: Interaction,
    kind: PendingKind,
    activation: Option<Arc<Activation>>,
    seq: u64,
    tx: oneshot::Sender<Feedback>,
}

/// Manages pending interactions with oneshot channels.
///
/// One broker serves a top-level automa and every automa nested under it.
/// The map lock is never held across an await, so entries can be withdrawn
/// from `Drop`.
pub struct InteractionBroker {
    pending: Mutex<HashMap<InteractionId, PendingEntry>>,
    seq: AtomicU64,
    event_bus: Arc<EventBus>,
}

impl InteractionBroker {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            event_bus,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<InteractionId, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending interaction and return the receiver to await.
    /// Suspension entries park their activation until answered or withdrawn.
    pub(crate) fn register(
        &self,
        interaction: Interaction,
        kind: PendingKind,
        activation: Option<Arc<Activation>>,
    ) -> oneshot::Receiver<Feedback> {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        if kind == PendingKind::Suspension {
            self.event_bus.publish(AutomaEvent::InteractionRequested {
                interaction: interaction.clone(),
            });
        }

        let mut pending = self.pending();
        if let Some(activation) = &activation {
            activation.enter();
        }
        pending.insert(
            interaction.interaction_id.clone(),
            PendingEntry {
                interaction,
                kind,
                activation,
                seq,
                tx,
            },
        );
        rx
    }

    /// Deliver feedback to a pending interaction of the given kind.
    /// Returns true if the interaction was found and resolved.
    pub(crate) fn respond_kind(&self, id: &InteractionId, kind: PendingKind, feedback: Feedback) -> bool {
        let entry = {
            let mut pending = self.pending();
            match pending.get(id) {
                Some(entry) if entry.kind == kind => pending.remove(id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                if let Some(activation) = &entry.activation {
                    activation.leave();
                }
                self.event_bus.publish(AutomaEvent::InteractionResolved {
                    interaction_id: id.clone(),
                });
                // Ignore send error (receiver may have been dropped due to timeout)
                let _ = entry.tx.send(feedback);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, id: &InteractionId, kind: PendingKind) -> bool {
        self.pending()
            .get(id)
            .map_or(false, |entry| entry.kind == kind)
    }

    /// Withdraw a pending entry without answering it. Returns false if it
    /// was already answered or withdrawn.
    pub(crate) fn cancel(&self, id: &InteractionId) -> bool {
        let entry = self.pending().remove(id);
        match entry {
            Some(entry) => {
                if let Some(activation) = &entry.activation {
                    activation.leave();
                }
                true
            }
            None => false,
        }
    }

    /// Drop every entry raised under `scope` or any scope nested inside it.
    pub(crate) fn forget_scope(&self, scope: &Arc<ParkScope>) {
        self.pending().retain(|_, entry| {
            !entry
                .activation
                .as_ref()
                .map_or(false, |a| a.scope.descends_from(scope))
        });
    }

    /// Pending suspension interactions, oldest first.
    pub fn pending_interactions(&self) -> Vec<Interaction> {
        self.listed(PendingKind::Suspension)
    }

    /// Pending in-flight feedback requests, oldest first.
    pub fn pending_requests(&self) -> Vec<Interaction> {
        self.listed(PendingKind::Request)
    }

    fn listed(&self, kind: PendingKind) -> Vec<Interaction> {
        let pending = self.pending();
        let mut entries: Vec<&PendingEntry> =
            pending.values().filter(|e| e.kind == kind).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.interaction.clone()).collect()
    }
}

/// Withdraws an interaction from the broker when the future waiting on it
/// is dropped before an answer arrives.
pub(crate) struct PendingGuard {
    broker: Arc<InteractionBroker>,
    id: InteractionId,
}

impl PendingGuard {
    pub(crate) fn new(broker: &Arc<InteractionBroker>, id: InteractionId) -> Self {
        Self {
            broker: Arc::clone(broker),
            id,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.broker.cancel(&self.id) {
            debug!(interaction_id = %self.id, "Pending interaction withdrawn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automa_core::types::Event;

    fn interaction(id: &str) -> Interaction {
        Interaction {
            interaction_id: InteractionId::from_str(id),
            worker_key: "approve".to_string(),
            automa: "main".to_string(),
            event: Event::typed("approval", "ok?"),
        }
    }

    #[tokio::test]
    async fn test_respond_delivers_and_unparks() {
        let broker = InteractionBroker::new(Arc::new(EventBus::default()));
        let scope = ParkScope::root();
        let activation = Activation::new(scope.clone());

        let rx = broker.register(
            interaction("i-1"),
            PendingKind::Suspension,
            Some(activation),
        );
        assert!(scope.is_settled(1));

        let id = InteractionId::from_str("i-1");
        assert!(broker.respond_kind(&id, PendingKind::Suspension, Feedback::new("yes")));
        assert!(!scope.is_settled(1));
        assert_eq!(rx.await.unwrap().data, serde_json::json!("yes"));
    }

    #[test]
    fn test_respond_unknown_or_wrong_kind() {
        let broker = InteractionBroker::new(Arc::new(EventBus::default()));
        let _rx = broker.register(interaction("i-2"), PendingKind::Suspension, None);
        let id = InteractionId::from_str("i-2");

        assert!(!broker.respond_kind(&id, PendingKind::Request, Feedback::new(1)));
        assert!(!broker.respond_kind(
            &InteractionId::from_str("nope"),
            PendingKind::Suspension,
            Feedback::new(1)
        ));
        assert!(broker.contains(&id, PendingKind::Suspension));
    }

    #[test]
    fn test_pending_listed_in_order() {
        let broker = InteractionBroker::new(Arc::new(EventBus::default()));
        let _a = broker.register(interaction("a"), PendingKind::Suspension, None);
        let _b = broker.register(interaction("b"), PendingKind::Suspension, None);
        let _c = broker.register(interaction("c"), PendingKind::Request, None);

        let ids: Vec<String> = broker
            .pending_interactions()
            .into_iter()
            .map(|i| i.interaction_id.0)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(broker.pending_requests().len(), 1);
    }

    #[test]
    fn test_forget_scope_covers_nested_scopes() {
        let broker = InteractionBroker::new(Arc::new(EventBus::default()));
        let root = ParkScope::root();
        let child = ParkScope::child(&root);
        let other = ParkScope::root();

        let _a = broker.register(
            interaction("a"),
            PendingKind::Suspension,
            Some(Activation::new(child)),
        );
        let _b = broker.register(
            interaction("b"),
            PendingKind::Suspension,
            Some(Activation::new(other)),
        );

        broker.forget_scope(&root);
        let left = broker.pending_interactions();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].interaction_id.0, "b");
    }

    #[test]
    fn test_activation_parks_once_for_many_interactions() {
        let broker = InteractionBroker::new(Arc::new(EventBus::default()));
        let scope = ParkScope::root();
        let activation = Activation::new(scope.clone());

        let _a = broker.register(
            interaction("a"),
            PendingKind::Suspension,
            Some(activation.clone()),
        );
        let _b = broker.register(interaction("b"), PendingKind::Suspension, Some(activation));
        // One worker waiting on two answers while a sibling is still busy.
        assert!(!scope.is_settled(2));
        assert!(scope.is_settled(1));

        let a = InteractionId::from_str("a");
        let b = InteractionId::from_str("b");
        assert!(broker.respond_kind(&a, PendingKind::Suspension, Feedback::new(1)));
        assert!(scope.is_settled(1));
        assert!(broker.respond_kind(&b, PendingKind::Suspension, Feedback::new(2)));
        assert!(!scope.is_settled(1));
    }

    #[test]
    fn test_guard_withdraws_unanswered_interaction() {
        let broker = Arc::new(InteractionBroker::new(Arc::new(EventBus::default())));
        let scope = ParkScope::root();
        let id = InteractionId::from_str("dropped");

        let rx = broker.register(
            interaction("dropped"),
            PendingKind::Suspension,
            Some(Activation::new(scope.clone())),
        );
        let guard = PendingGuard::new(&broker, id.clone());
        assert!(scope.is_settled(1));

        drop(rx);
        drop(guard);
        assert!(!broker.contains(&id, PendingKind::Suspension));
        assert!(!scope.is_settled(1));
        // Withdrawing twice leaves the count alone.
        assert!(!broker.cancel(&id));
        scope.park();
        assert!(scope.is_settled(1));
    }

    #[test]
    fn test_nested_scope_lends_itself_to_parent() {
        let root = ParkScope::root();
        let child = ParkScope::child(&root);

        child.park();
        assert!(child.is_settled(1));
        // The child counts as one parked entry in the root.
        assert!(root.is_settled(1));
        // Settling twice does not double-count.
        assert!(child.is_settled(1));
        assert!(!root.is_settled(2));

        child.unpark();
        assert!(!root.is_settled(1));
        assert!(!child.is_settled(1));
    }
}
