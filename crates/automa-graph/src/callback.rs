use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use automa_core::error::AutomaError;
use automa_core::traits::{CallbackInfo, WorkerCallback};

/// Process-wide defaults shared by every automa built with them.
#[derive(Clone, Default)]
pub struct GlobalSettings {
    pub callbacks: Vec<Arc<dyn WorkerCallback>>,
}

impl GlobalSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(mut self, callback: Arc<dyn WorkerCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }
}

impl std::fmt::Debug for GlobalSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSettings")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Callbacks for one invocation, in firing order: global, automa, worker.
pub(crate) fn chain(
    global: &[Arc<dyn WorkerCallback>],
    automa: &[Arc<dyn WorkerCallback>],
    worker: &[Arc<dyn WorkerCallback>],
) -> Vec<Arc<dyn WorkerCallback>> {
    global
        .iter()
        .chain(automa)
        .chain(worker)
        .cloned()
        .collect()
}

/// Suppresses worker failures caused by an error of type `E`.
///
/// The failing worker's result becomes null and the run continues.
pub struct SuppressErrors<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> SuppressErrors<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for SuppressErrors<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> WorkerCallback for SuppressErrors<E>
where
    E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    fn accepts(&self, error: &AutomaError) -> bool {
        error.find::<E>().is_some()
    }

    fn on_worker_error<'a>(
        &'a self,
        info: &'a CallbackInfo<'a>,
        error: &'a AutomaError,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            warn!(worker = %info.key, automa = %info.parent, error = %error, "Suppressing worker error");
            true
        })
    }
}

/// Mirrors worker lifecycle into `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCallback;

impl WorkerCallback for TracingCallback {
    fn on_worker_start<'a>(&'a self, info: &'a CallbackInfo<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(
                worker = %info.key,
                automa = %info.parent,
                top_level = info.is_top_level,
                args = info.arguments.args.len(),
                kwargs = info.arguments.kwargs.len(),
                "Worker start"
            );
        })
    }

    fn on_worker_end<'a>(
        &'a self,
        info: &'a CallbackInfo<'a>,
        result: &'a Value,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            debug!(worker = %info.key, automa = %info.parent, result = %result, "Worker end");
        })
    }

    fn on_worker_error<'a>(
        &'a self,
        info: &'a CallbackInfo<'a>,
        error: &'a AutomaError,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            debug!(worker = %info.key, automa = %info.parent, error = %error, "Worker error");
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automa_core::types::Arguments;

    #[derive(Debug)]
    struct ParseError;

    impl std::fmt::Display for ParseError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "parse error")
        }
    }

    impl std::error::Error for ParseError {}

    #[tokio::test]
    async fn test_suppress_errors_matches_by_type() {
        let callback = SuppressErrors::<ParseError>::new();
        let matching = AutomaError::worker("parse", anyhow::Error::new(ParseError));
        let other = AutomaError::worker("parse", anyhow::anyhow!("boom"));

        assert!(callback.accepts(&matching));
        assert!(!callback.accepts(&other));

        let args = Arguments::new();
        let info = CallbackInfo {
            key: "parse",
            is_top_level: true,
            parent: "main",
            arguments: &args,
        };
        assert!(callback.on_worker_error(&info, &matching).await);
    }

    #[test]
    fn test_chain_order() {
        let a: Arc<dyn WorkerCallback> = Arc::new(TracingCallback);
        let b: Arc<dyn WorkerCallback> = Arc::new(TracingCallback);
        let c: Arc<dyn WorkerCallback> = Arc::new(TracingCallback);
        let chained = chain(&[a.clone()], &[b.clone()], &[c.clone()]);
        assert_eq!(chained.len(), 3);
        assert!(Arc::ptr_eq(&chained[0], &a));
        assert!(Arc::ptr_eq(&chained[2], &c));
    }
}
