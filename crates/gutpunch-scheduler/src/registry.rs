use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::types::Parameters;

/// Executable logic for one job type.
///
/// The engine awaits `handle` before it writes COMPLETED, so a handler may
/// finish immediately or much later. Any `Err` is recorded on the job and
/// counts as a failed attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, parameters: Parameters) -> anyhow::Result<()>;
}

/// Adapter for plain synchronous closures. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(Parameters) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, parameters: Parameters) -> anyhow::Result<()> {
        (self.0)(parameters)
    }
}

/// Adapter for closures returning a future. See [`async_handler_fn`].
pub struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for AsyncFnHandler<F>
where
    F: Fn(Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, parameters: Parameters) -> anyhow::Result<()> {
        (self.0)(parameters).await
    }
}

/// Wrap a synchronous closure. It runs on the async worker, so keep it short.
pub fn handler_fn<F>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Parameters) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap a closure that returns a future.
pub fn async_handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f))
}

/// In-memory map from job name to handler.
///
/// Process-local and never persisted: a restarted host must register every
/// handler again before the poll loop runs, otherwise matching jobs fail
/// with "No handler registered".
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` under `name`, replacing any previous one.
    ///
    /// Returns false only if the map is unusable (a writer panicked while
    /// holding the lock).
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> bool {
        let name = name.into();
        match self.handlers.write() {
            Ok(mut handlers) => {
                let replaced = handlers.insert(name.clone(), handler).is_some();
                debug!(%name, replaced, "handler registered");
                true
            }
            Err(_) => {
                error!(%name, "handler registry poisoned; registration rejected");
                false
            }
        }
    }

    /// Remove the handler for `name`. Returns whether one existed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let existed = handlers.remove(name).is_some();
        if existed {
            debug!(name, "handler unregistered");
        }
        existed
    }

    pub fn clear_all(&self) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.clear();
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        match self.handlers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
