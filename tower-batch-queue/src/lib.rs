//! Tower middleware for batched execution of independent requests
//!
//! This crate lets many concurrent callers share a single batch-oriented
//! worker function. Each caller submits one request and awaits one response,
//! while the queue groups contemporaneous requests into bounded batches and
//! calls the worker function once per batch.
//!
//! ## Why batch?
//!
//! Some computations are much cheaper per item when they run over many items
//! at once: model inference, vectorised image processing, bulk database
//! writes. But callers usually arrive one at a time, from unrelated request
//! handlers, and should not have to know about each other.
//!
//! The [`BatchExecutionQueue`] sits between the two. It manages the
//! latency/throughput tradeoff with two parameters:
//!
//! * `batch_size`: a batch is flushed as soon as it holds this many items.
//! * `timeout`: a partial batch is flushed this long after its first item
//!   arrived, so a lone request is never stuck waiting for siblings.
//!
//! ## Batch processors
//!
//! The worker function is any [`Service`](tower::Service) from `Vec<Request>`
//! to `Vec<Response>`, including closures wrapped by
//! [`service_fn`](tower::service_fn). Its contract is positional: given `N`
//! inputs it returns exactly `N` outputs, where output `i` answers input `i`.
//! If it fails, the whole batch fails, and every caller in that batch receives
//! the same error. The queue does not retry or split failed batches.
//!
//! ## Lifecycle
//!
//! A queue is created stopped. The host application calls
//! [`start_worker`](BatchExecutionQueue::start_worker) during startup and
//! [`stop_worker`](BatchExecutionQueue::stop_worker) during shutdown, and
//! passes clones of the queue handle to its request handlers.
//!
//! Requests submitted while the queue is stopped fail with
//! [`BatchError::NotRunning`]. Requests that are pending when the queue stops
//! are either flushed in a final batch or failed with
//! [`BatchError::ShuttingDown`], depending on the [`ShutdownPolicy`].
//! Every admitted request is resolved, one way or the other.
//!
//! ## Implementation History
//!
//! The worker loop is derived from `tower-batch-control`, which was itself
//! modified from a 2019 version of:
//! <https://github.com/tower-rs/tower/tree/master/tower/src/buffer>

pub mod config;
pub mod error;
pub mod future;
mod layer;
mod message;
mod service;
mod worker;

/// A boxed error type, for batch processor errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use self::config::{Config, ShutdownPolicy};
pub use self::error::{BatchError, ServiceError};
pub use self::layer::BatchQueueLayer;
pub use self::service::BatchExecutionQueue;
