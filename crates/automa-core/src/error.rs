use thiserror::Error;

use crate::types::InteractionSignal;

#[derive(Debug, Error)]
pub enum AutomaError {
    // Graph structure errors
    #[error("Duplicate worker key: {0}")]
    DuplicateKey(String),

    #[error("Unknown worker key: {0}")]
    UnknownKey(String),

    #[error("Compilation error: {0}")]
    Compilation(String),

    // Worker errors
    #[error("Cannot map arguments for worker {key}: {message}")]
    ArgsMapping { key: String, message: String },

    #[error("Worker {key} failed: {source}")]
    WorkerExecution {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    // Interaction
    #[error("Automa suspended on {} pending interaction(s)", .0.interactions.len())]
    Interaction(InteractionSignal),

    #[error("No pending interaction with id: {0}")]
    UnknownInteraction(String),

    #[error("Feedback request timed out: {0}")]
    FeedbackTimeout(String),

    // Scheduler errors
    #[error("Invalid automa state: {0}")]
    InvalidState(String),

    #[error("Automa exceeded max steps ({0})")]
    StepLimitExceeded(usize),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AutomaError {
    /// Wrap a failure raised inside a worker body.
    ///
    /// Errors that are already `AutomaError`s keep their identity when they
    /// are control flow (suspension) and are wrapped otherwise.
    pub fn worker(key: impl Into<String>, error: anyhow::Error) -> Self {
        let key = key.into();
        match error.downcast::<AutomaError>() {
            Ok(inner @ AutomaError::Interaction(_)) => inner,
            Ok(inner) => AutomaError::WorkerExecution {
                key,
                source: anyhow::Error::new(inner),
            },
            Err(source) => AutomaError::WorkerExecution { key, source },
        }
    }

    pub fn args_mapping(key: impl Into<String>, message: impl Into<String>) -> Self {
        AutomaError::ArgsMapping {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether this is the suspension signal rather than a failure.
    pub fn is_interaction(&self) -> bool {
        matches!(self, AutomaError::Interaction(_))
    }

    pub fn into_interaction(self) -> Option<InteractionSignal> {
        match self {
            AutomaError::Interaction(signal) => Some(signal),
            _ => None,
        }
    }

    /// Find an error of type `E` anywhere in the worker failure chain,
    /// including failures re-wrapped by nested automas.
    pub fn find<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            AutomaError::WorkerExecution { source, .. } => {
                if let Some(found) = source.downcast_ref::<E>() {
                    return Some(found);
                }
                source
                    .downcast_ref::<AutomaError>()
                    .and_then(|inner| inner.find::<E>())
            }
            _ => None,
        }
    }

    /// Key of the worker that raised this error, if any.
    pub fn worker_key(&self) -> Option<&str> {
        match self {
            AutomaError::ArgsMapping { key, .. } | AutomaError::WorkerExecution { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AutomaError>;
