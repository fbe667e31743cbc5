//! The seam between the engine and whatever performs the actual HTTP call.
//!
//! The engine is generic over a closure `Fn(Arc<RequestTemplate>) -> Future`
//! so callers can bind any client. Executor errors never escape the engine;
//! they are recorded as failures with the synthetic status `0`.

use stampede_core::{ExecutedRequest, RequestTemplate};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// A transport-level failure reported by the request executor.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutorError {
    message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type ExecutorResult = Result<ExecutedRequest, ExecutorError>;

/// Bound alias used throughout the engine for the executor closure.
pub trait RequestExecutor<F>: Fn(Arc<RequestTemplate>) -> F + Send + Sync + Clone + 'static
where
    F: Future<Output = ExecutorResult> + Send + 'static,
{
}

impl<T, F> RequestExecutor<F> for T
where
    T: Fn(Arc<RequestTemplate>) -> F + Send + Sync + Clone + 'static,
    F: Future<Output = ExecutorResult> + Send + 'static,
{
}
