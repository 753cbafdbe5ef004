//! User-configurable batch queue parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

/// The default maximum number of items in a batch.
pub const DEFAULT_BATCH_SIZE: usize = 4;

/// The default maximum wait after the first item of a batch arrives.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Batch queue configuration section.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The maximum number of items in a batch.
    ///
    /// A batch is flushed as soon as it reaches this size,
    /// without waiting for the rest of the timeout.
    ///
    /// Zero is treated as 1.
    pub batch_size: usize,

    /// The maximum time the queue waits for more items,
    /// measured from the arrival of the first item in a batch.
    ///
    /// When it elapses, the partial batch is flushed.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The maximum number of batches the batch processor runs at the same time.
    ///
    /// The default of 1 processes batches strictly one after another.
    /// While the limit is reached, new items wait in the admission channel.
    ///
    /// Zero is treated as 1.
    pub max_concurrent_batches: usize,

    /// What happens to items that are still pending when the worker is stopped.
    pub shutdown_policy: ShutdownPolicy,
}

impl Config {
    /// Returns this config with `batch_size` and `max_concurrent_batches` clamped to sensible values.
    pub fn clamped(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.max_concurrent_batches = self.max_concurrent_batches.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: DEFAULT_TIMEOUT,
            max_concurrent_batches: 1,
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

/// The policy for items that are pending when [`stop_worker`] is called.
///
/// Batches that were already sent to the batch processor always finish,
/// regardless of the policy.
///
/// [`stop_worker`]: crate::BatchExecutionQueue::stop_worker
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Flush pending items in final batches, without waiting for the timeout.
    #[default]
    Drain,

    /// Fail pending items with [`BatchError::ShuttingDown`](crate::BatchError::ShuttingDown).
    Reject,
}
