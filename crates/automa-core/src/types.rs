use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Call arguments for a worker: positional values plus named values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn keywords(kwargs: Map<String, Value>) -> Self {
        Self {
            args: Vec::new(),
            kwargs,
        }
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument by index.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Named argument.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Named argument as a string, if it is one.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.kwargs.get(name).and_then(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// Unique interaction identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct InteractionId(pub String);

impl InteractionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for InteractionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InteractionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An application event emitted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Optional routing tag (e.g. "approval", "progress").
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            event_type: None,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn typed(event_type: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            data: data.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Feedback supplied by the outside world in reply to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Feedback {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Feedback addressed to one pending interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionFeedback {
    pub interaction_id: InteractionId,
    pub feedback: Feedback,
}

impl InteractionFeedback {
    pub fn new(interaction_id: InteractionId, data: impl Into<Value>) -> Self {
        Self {
            interaction_id,
            feedback: Feedback::new(data),
        }
    }
}

/// A worker waiting for external feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub interaction_id: InteractionId,
    /// Key of the requesting worker.
    pub worker_key: String,
    /// Name of the automa that owns the requesting worker.
    pub automa: String,
    pub event: Event,
}

/// Versioned, serialized automa state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub automa: String,
    pub taken_at: DateTime<Utc>,
    pub payload: Value,
}

impl Snapshot {
    pub const VERSION: u32 = 1;

    pub fn new(automa: impl Into<String>, payload: Value) -> Self {
        Self {
            version: Self::VERSION,
            automa: automa.into(),
            taken_at: Utc::now(),
            payload,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        if snapshot.version != Self::VERSION {
            return Err(crate::AutomaError::Snapshot(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version,
                Self::VERSION
            )));
        }
        Ok(snapshot)
    }
}

/// Suspension signal returned to the caller of `run`/`resume`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionSignal {
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
}

impl InteractionSignal {
    pub fn ids(&self) -> Vec<InteractionId> {
        self.interactions
            .iter()
            .map(|i| i.interaction_id.clone())
            .collect()
    }
}

/// Events published on the EventBus.
#[derive(Debug, Clone)]
pub enum AutomaEvent {
    /// Automa run started (fresh, not resumed).
    RunStarted { automa: String, top_level: bool },
    /// A dynamic step was launched.
    StepStarted {
        automa: String,
        step: usize,
        workers: Vec<String>,
    },
    /// Worker invocation started.
    WorkerStarted { automa: String, worker: String },
    /// Worker invocation completed.
    WorkerCompleted {
        automa: String,
        worker: String,
        elapsed_ms: u64,
    },
    /// Worker invocation failed (possibly suppressed by a callback).
    WorkerFailed {
        automa: String,
        worker: String,
        error: String,
        suppressed: bool,
    },
    /// A worker redirected execution to another worker.
    Ferried {
        automa: String,
        from: String,
        to: String,
    },
    /// Staged graph mutations were committed at a step boundary.
    TopologyChanged {
        automa: String,
        step: usize,
        mutations: Vec<String>,
    },
    /// A worker is waiting for external feedback.
    InteractionRequested { interaction: Interaction },
    /// Feedback was delivered to a pending interaction.
    InteractionResolved { interaction_id: InteractionId },
    /// Top-level automa suspended.
    Suspended { automa: String, pending: usize },
    /// Suspended automa resumed.
    Resumed { automa: String },
    /// A worker posted an application event.
    EventPosted {
        automa: String,
        worker: String,
        event: Event,
    },
    /// A worker requested in-flight feedback.
    FeedbackRequested {
        request_id: String,
        worker: String,
        event: Event,
    },
    /// Automa run completed.
    RunComplete {
        automa: String,
        steps: usize,
        elapsed_ms: u64,
    },
    /// Automa run failed.
    RunError { automa: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arguments_builders() {
        let args = Arguments::new()
            .with_arg(1)
            .with_arg("two")
            .with_kwarg("name", "automa");
        assert_eq!(args.arg(0), Some(&json!(1)));
        assert_eq!(args.arg(1), Some(&json!("two")));
        assert_eq!(args.get_str("name"), Some("automa"));
        assert!(!args.is_empty());
        assert!(Arguments::new().is_empty());
    }

    #[test]
    fn test_arguments_deserialize_partial() {
        let args: Arguments = serde_json::from_value(json!({"args": [1]})).unwrap();
        assert_eq!(args.args, vec![json!(1)]);
        assert!(args.kwargs.is_empty());
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snap = Snapshot::new("main", json!({"results": {"a": 1}}));
        let text = snap.to_json().unwrap();
        let back = Snapshot::from_json(&text).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_snapshot_version_mismatch() {
        let mut snap = Snapshot::new("main", Value::Null);
        snap.version = 99;
        let text = serde_json::to_string(&snap).unwrap();
        assert!(Snapshot::from_json(&text).is_err());
    }

    #[test]
    fn test_interaction_ids_unique() {
        assert_ne!(InteractionId::new(), InteractionId::new());
        assert_eq!(InteractionId::from_str("abc").to_string(), "abc");
    }
}
