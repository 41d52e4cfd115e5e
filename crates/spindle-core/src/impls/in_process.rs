//! In-process processor: the user function runs on the worker's runtime.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::ProcessError;
use crate::ports::{JobContext, Processor};

/// Adapts an async closure to [`Processor`].
///
/// Panics are not caught here; the worker runs every attempt in its own task
/// and turns a panic into a recoverable failure.
pub struct InProcess<F> {
    f: F,
}

impl<F, Fut> InProcess<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ProcessError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Processor for InProcess<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ProcessError>> + Send + 'static,
{
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessError> {
        (self.f)(job).await
    }
}
