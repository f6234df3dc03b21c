use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::AutomaError;
use crate::types::Arguments;

/// What a callback sees about the worker invocation it observes.
#[derive(Debug, Clone, Copy)]
pub struct CallbackInfo<'a> {
    /// Key of the worker being invoked.
    pub key: &'a str,
    /// False when the owning automa runs nested inside another automa.
    pub is_top_level: bool,
    /// Name of the automa that owns the worker.
    pub parent: &'a str,
    /// Resolved call arguments.
    pub arguments: &'a Arguments,
}

/// Worker lifecycle hooks (tracing backends, auditing, error policy).
pub trait WorkerCallback: Send + Sync + 'static {
    /// Whether `on_worker_error` should be routed this error.
    /// Implementations narrow this to the error types they handle.
    fn accepts(&self, error: &AutomaError) -> bool {
        let _ = error;
        true
    }

    fn on_worker_start<'a>(&'a self, info: &'a CallbackInfo<'a>) -> BoxFuture<'a, ()> {
        let _ = info;
        Box::pin(async {})
    }

    fn on_worker_end<'a>(
        &'a self,
        info: &'a CallbackInfo<'a>,
        result: &'a Value,
    ) -> BoxFuture<'a, ()> {
        let _ = (info, result);
        Box::pin(async {})
    }

    /// Return true to suppress the error and substitute a null result.
    fn on_worker_error<'a>(
        &'a self,
        info: &'a CallbackInfo<'a>,
        error: &'a AutomaError,
    ) -> BoxFuture<'a, bool> {
        let _ = (info, error);
        Box::pin(async { false })
    }
}
