//! Fixtures shared by the Automa test suites.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use automa_core::config::AutomaConfig;
use automa_core::error::AutomaError;
use automa_core::traits::{CallbackInfo, WorkerCallback};
use automa_core::types::{Arguments, Event};
use automa_graph::{worker_fn, Worker, WorkerContext};

/// Worker with no parameters that always returns `value`.
pub fn constant(value: Value) -> impl Worker {
    worker_fn(move |_ctx, _args| {
        let value = value.clone();
        async move { Ok(value) }
    })
    .params(&[])
}

/// Worker returning its first positional argument (null if none).
pub fn echo() -> impl Worker {
    worker_fn(|_ctx, args: Arguments| async move {
        Ok(args.arg(0).cloned().unwrap_or(Value::Null))
    })
}

/// Worker returning all of its arguments as `{"args": [...], "kwargs": {...}}`.
pub fn capture_args() -> impl Worker {
    worker_fn(|_ctx, args: Arguments| async move {
        Ok(serde_json::json!({ "args": args.args, "kwargs": args.kwargs }))
    })
}

/// Worker that always fails with `message`.
pub fn failing(message: &'static str) -> impl Worker {
    worker_fn(move |_ctx, _args| async move { Err(anyhow::anyhow!(message)) })
}

/// Worker that fails with the error built by `make`.
pub fn failing_with<E, F>(make: F) -> impl Worker
where
    E: std::error::Error + Send + Sync + 'static,
    F: Fn() -> E + Send + Sync + 'static,
{
    worker_fn(move |_ctx, _args| {
        let err = make();
        async move { Err(anyhow::Error::new(err)) }
    })
}

/// Worker that asks for feedback once and returns the feedback data.
pub fn interacting(event_type: &'static str) -> impl Worker {
    worker_fn(move |ctx: WorkerContext, _args| async move {
        let feedback = ctx.interact(Event::typed(event_type, Value::Null)).await?;
        Ok(feedback.data)
    })
}

/// Ordered record of which workers ran.
#[derive(Clone, Default)]
pub struct ExecutionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    /// Position of the first occurrence of `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().unwrap().iter().position(|e| e == entry)
    }

    /// Worker that logs `name` each time it runs and returns `value`.
    pub fn recording(&self, name: &'static str, value: Value) -> impl Worker {
        let log = self.clone();
        worker_fn(move |_ctx, _args| {
            log.push(name);
            let value = value.clone();
            async move { Ok(value) }
        })
    }
}

/// Callback that records every hook invocation as `"{label}:{hook}:{key}"`.
pub struct RecordingCallback {
    label: String,
    suppress: bool,
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingCallback {
    pub fn new(label: impl Into<String>, events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            label: label.into(),
            suppress: false,
            events,
        }
    }

    /// Make `on_worker_error` suppress whatever it receives.
    pub fn suppressing(mut self) -> Self {
        self.suppress = true;
        self
    }

    fn record(&self, hook: &str, info: &CallbackInfo<'_>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}:{}", self.label, hook, info.key));
    }
}

impl WorkerCallback for RecordingCallback {
    fn on_worker_start<'a>(&'a self, info: &'a CallbackInfo<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.record("start", info) })
    }

    fn on_worker_end<'a>(
        &'a self,
        info: &'a CallbackInfo<'a>,
        _result: &'a Value,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.record("end", info) })
    }

    fn on_worker_error<'a>(
        &'a self,
        info: &'a CallbackInfo<'a>,
        _error: &'a AutomaError,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            self.record("error", info);
            self.suppress
        })
    }
}

/// Callback that records `(key, is_top_level, parent)` for each start.
#[derive(Default)]
pub struct ScopeRecorder {
    pub seen: Mutex<Vec<(String, bool, String)>>,
}

impl WorkerCallback for ScopeRecorder {
    fn on_worker_start<'a>(&'a self, info: &'a CallbackInfo<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.seen.lock().unwrap().push((
                info.key.to_string(),
                info.is_top_level,
                info.parent.to_string(),
            ));
        })
    }
}

/// Write `contents` to a config file in a fresh temp dir.
/// Keep the returned `TempDir` alive for as long as the file is needed.
pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("automa.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

/// Parse a config from inline TOML.
pub fn config_from_toml(contents: &str) -> AutomaConfig {
    toml::from_str(contents).unwrap()
}
