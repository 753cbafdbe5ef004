//! Error types for the batch execution queue.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::BoxError;

/// An error returned to a caller of [`BatchExecutionQueue::execute`].
///
/// Errors are `Clone`, because a single batch failure is delivered to every
/// caller in that batch.
///
/// [`BatchExecutionQueue::execute`]: crate::BatchExecutionQueue::execute
#[derive(Clone, Debug, Error)]
pub enum BatchError {
    /// The request was submitted while the queue's worker was not running.
    #[error("batch queue is not running")]
    NotRunning,

    /// The request was pending when the worker was stopped,
    /// and the shutdown policy rejected it.
    #[error("batch queue is shutting down")]
    ShuttingDown,

    /// The batch processor failed for the whole batch containing this request.
    #[error("batch processing failed: {0}")]
    Batch(#[source] ServiceError),

    /// The batch processor broke its positional contract.
    #[error("batch processor returned {outputs} results for {inputs} inputs")]
    ResultCountMismatch {
        /// The number of requests in the batch.
        inputs: usize,
        /// The number of responses the batch processor returned.
        outputs: usize,
    },

    /// The worker task panicked or was cancelled before resolving the request.
    #[error("batch worker stopped unexpectedly")]
    WorkerLost,
}

impl BatchError {
    /// Wraps a batch processor error, so it can be shared with every caller in the batch.
    pub(crate) fn batch(error: impl Into<BoxError>) -> Self {
        BatchError::Batch(ServiceError::new(error.into()))
    }
}

/// A batch processor error, shared between all the callers in a failed batch.
#[derive(Clone)]
pub struct ServiceError {
    inner: Arc<BoxError>,
}

impl ServiceError {
    pub(crate) fn new(inner: BoxError) -> ServiceError {
        ServiceError {
            inner: Arc::new(inner),
        }
    }

    /// Returns a reference to the batch processor's error.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &**self.inner
    }

    /// Returns `true` if both errors came from the same batch failure.
    pub fn ptr_eq(&self, other: &ServiceError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.inner, fmt)
    }
}

impl fmt::Debug for ServiceError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("ServiceError").field(&self.inner).finish()
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&**self.inner)
    }
}
