//! Handler registry: job-type tag → business logic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::Job;

/// Why a handler invocation did not succeed.
///
/// Workers treat every variant the same way: the attempt is routed to
/// `JobStore::fail`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("no handler registered for job type '{0}'")]
    UnknownJobType(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Business logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Adapter so plain async closures can be registered.
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        (self.f)(job.clone()).await
    }
}

/// Maps job-type tags to handlers.
///
/// Lookup tries the exact tag first, then category patterns such as
/// `"reports.*"` (matches `"reports.daily"`). An unmatched tag is reported as
/// [`HandlerError::UnknownJobType`] by the worker, never dropped.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same tag.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler { f }))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        self.handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler.clone())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.get(job_type).is_some()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
