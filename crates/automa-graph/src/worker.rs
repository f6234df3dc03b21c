use std::future::Future;

use futures::future::BoxFuture;
use serde_json::Value;

use automa_core::error::{AutomaError, Result};
use automa_core::types::Arguments;

use crate::args::Signature;
use crate::automa::Automa;
use crate::context::WorkerContext;

/// The unit the scheduler dispatches.
///
/// Plain functions and nested automas implement the same trait, so the
/// scheduler never branches on what kind of worker it runs.
pub trait Worker: Send + Sync + 'static {
    /// Declared parameters. The default accepts and passes through anything.
    fn signature(&self) -> Signature {
        Signature::open()
    }

    /// Execute with resolved arguments.
    ///
    /// `ctx` is the handle back into the owning automa: redirection, graph
    /// mutation, interaction and event posting all go through it.
    fn run(&self, ctx: WorkerContext, args: Arguments) -> BoxFuture<'_, Result<Value>>;

    /// Nested automa behind this worker, if any (used for snapshots).
    fn as_automa(&self) -> Option<&Automa> {
        None
    }
}

/// Worker backed by an async closure.
pub struct FnWorker<F> {
    signature: Signature,
    func: F,
}

impl<F, Fut> FnWorker<F>
where
    F: Fn(WorkerContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            signature: Signature::open(),
            func,
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    /// Shorthand for a signature of plain required params.
    pub fn params(self, names: &[&str]) -> Self {
        self.with_signature(Signature::of(names))
    }
}

impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(WorkerContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    fn run(&self, ctx: WorkerContext, args: Arguments) -> BoxFuture<'_, Result<Value>> {
        let key = ctx.key().to_string();
        let fut = (self.func)(ctx, args);
        Box::pin(async move { fut.await.map_err(|e| AutomaError::worker(key, e)) })
    }
}

/// Build a worker from an async closure.
pub fn worker_fn<F, Fut>(func: F) -> FnWorker<F>
where
    F: Fn(WorkerContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnWorker::new(func)
}
