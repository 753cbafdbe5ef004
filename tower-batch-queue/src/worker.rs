//! Batch worker item handling and run loop implementation.

use std::{future::Future, mem, pin::Pin, time::Duration};

use futures::{
    future::{BoxFuture, OptionFuture},
    stream::FuturesUnordered,
    FutureExt, StreamExt,
};
use tokio::{
    sync::mpsc,
    time::{sleep, sleep_until, Sleep},
};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing_futures::Instrument;

use crate::{BoxError, Config, ShutdownPolicy};

use super::{
    error::BatchError,
    message::{Message, Tx},
};

/// Task that collects submitted requests into batches, and runs them on the batch processor.
///
/// Only one worker exists per queue at a time. It owns the pending items and
/// the batch timer, so no other task can flush overlapping items.
pub(crate) struct Worker<S, Request, Response> {
    // Batch management
    //
    /// An unbounded channel for receiving requests from the queue handles.
    rx: mpsc::UnboundedReceiver<Message<Request, Response>>,

    /// The batch processor.
    service: S,

    /// The items collected since the last flush, in submission order.
    pending_items: Vec<Message<Request, Response>>,

    /// The timer for the pending batch, if it has any items.
    ///
    /// The timer is started when the first item of a new batch is admitted,
    /// and expires `max_latency` after that item was submitted. We don't keep
    /// the timer running unless there is a pending item, to prevent wakeups
    /// on idle queues.
    pending_batch_timer: Option<Pin<Box<Sleep>>>,

    /// The batches that the worker is concurrently executing.
    ///
    /// Each future resolves the callers of its batch before it completes.
    concurrent_batches: FuturesUnordered<BoxFuture<'static, ()>>,

    // Termination
    //
    /// Cancelled by `stop_worker()`.
    shutdown: CancellationToken,

    // Config
    //
    /// The maximum number of items allowed in a batch.
    max_items_in_batch: usize,

    /// The maximum number of batches that are allowed to run concurrently.
    max_concurrent_batches: usize,

    /// The maximum delay before processing a batch with fewer than `max_items_in_batch`.
    max_latency: Duration,

    /// What to do with pending items on shutdown.
    shutdown_policy: ShutdownPolicy,
}

impl<S, Request, Response> Worker<S, Request, Response>
where
    S: Service<Vec<Request>, Response = Vec<Response>>,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + 'static,
    Response: Send + 'static,
{
    /// Creates a new batch worker.
    ///
    /// See [`BatchExecutionQueue::start_worker()`](crate::BatchExecutionQueue::start_worker) for details.
    pub(crate) fn new(
        service: S,
        rx: mpsc::UnboundedReceiver<Message<Request, Response>>,
        shutdown: CancellationToken,
        config: &Config,
    ) -> Self {
        Worker {
            rx,
            service,
            pending_items: Vec::with_capacity(config.batch_size),
            pending_batch_timer: None,
            concurrent_batches: FuturesUnordered::new(),
            shutdown,
            max_items_in_batch: config.batch_size,
            max_concurrent_batches: config.max_concurrent_batches,
            max_latency: config.timeout,
            shutdown_policy: config.shutdown_policy,
        }
    }

    /// Add a submitted request to the pending batch.
    fn admit(&mut self, msg: Message<Request, Response>) {
        if self.pending_items.is_empty() {
            // The first item in a new batch.
            let timer = match msg.enqueued_at.checked_add(self.max_latency) {
                Some(deadline) => sleep_until(deadline),
                // The deadline overflows, so the timer saturates far in the future.
                None => sleep(self.max_latency),
            };
            self.pending_batch_timer = Some(Box::pin(timer));
        }

        // Apply the caller's span to the admission event.
        msg.span.in_scope(|| {
            tracing::trace!(
                pending_items = self.pending_items.len() + 1,
                batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
                "batch item admitted",
            )
        });

        self.pending_items.push(msg);
    }

    /// Admit requests that are already waiting in the channel, until the batch is full.
    fn admit_queued(&mut self) {
        while self.pending_items.len() < self.max_items_in_batch {
            match self.rx.try_recv() {
                Ok(msg) => self.admit(msg),
                Err(_) => break,
            }
        }
    }

    /// Send the pending items to the batch processor, as a single batch.
    ///
    /// Waits for a running batch to finish if the concurrency limit is reached,
    /// then waits until the batch processor is ready, then stores a future
    /// which resolves every caller in the batch when it finishes.
    async fn flush_batch(&mut self) {
        // Now we have an empty batch.
        self.pending_batch_timer = None;

        if self.pending_items.is_empty() {
            return;
        }

        while !self.can_spawn_new_batches() {
            if self.concurrent_batches.next().await.is_none() {
                break;
            }
        }

        let (requests, callers): (Vec<Request>, Vec<Tx<Response>>) =
            mem::take(&mut self.pending_items)
                .into_iter()
                .map(|msg| (msg.request, msg.tx))
                .unzip();

        let span = tracing::debug_span!("batch", batch_size = requests.len());

        match self.service.ready().await {
            Ok(ready_service) => {
                let batch = ready_service.call(requests);
                self.concurrent_batches
                    .push(resolve_batch(batch, callers).instrument(span).boxed());
            }
            Err(error) => {
                span.in_scope(|| {
                    tracing::trace!("batch processor failed before the batch started")
                });
                fail_all(callers, BatchError::batch(error));
            }
        }
    }

    /// Is the current number of concurrent batches below the configured limit?
    fn can_spawn_new_batches(&self) -> bool {
        self.concurrent_batches.len() < self.max_concurrent_batches
    }

    /// Run loop for batch requests, which implements the batch policies.
    ///
    /// Returns the batch processor when the worker stops,
    /// so the queue can be started again.
    pub(crate) async fn run(mut self) -> S {
        loop {
            // Wait on a finished batch, shutdown, the batch timer, or a new message.
            //
            // If the timer and a message are both ready, end the batch now, because the timer has elapsed.
            // If the timer elapses, any pending messages are preserved:
            // https://docs.rs/tokio/latest/tokio/sync/mpsc/struct.UnboundedReceiver.html#cancel-safety
            tokio::select! {
                biased;

                batch_result = self.concurrent_batches.next(), if !self.concurrent_batches.is_empty() => {
                    batch_result.expect("only returns None when empty");

                    tracing::trace!(
                        pending_items = self.pending_items.len(),
                        batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
                        running_batches = self.concurrent_batches.len(),
                        "batch finished executing",
                    );
                },

                () = self.shutdown.cancelled() => {
                    tracing::debug!(
                        pending_items = self.pending_items.len(),
                        running_batches = self.concurrent_batches.len(),
                        policy = ?self.shutdown_policy,
                        "batch worker shutting down",
                    );

                    self.shut_down().await;
                    return self.service;
                },

                Some(()) = OptionFuture::from(self.pending_batch_timer.as_mut()), if self.pending_batch_timer.is_some() => {
                    tracing::trace!(
                        pending_items = self.pending_items.len(),
                        batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
                        running_batches = self.concurrent_batches.len(),
                        "batch timer expired",
                    );

                    self.flush_batch().await;
                },

                maybe_msg = self.rx.recv(), if self.can_spawn_new_batches() => match maybe_msg {
                    Some(msg) => {
                        self.admit(msg);
                        self.admit_queued();

                        if self.pending_items.len() >= self.max_items_in_batch {
                            tracing::trace!(
                                pending_items = self.pending_items.len(),
                                running_batches = self.concurrent_batches.len(),
                                "batch is full",
                            );

                            self.flush_batch().await;
                        } else {
                            tracing::trace!(
                                pending_items = self.pending_items.len(),
                                batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
                                running_batches = self.concurrent_batches.len(),
                                "waiting for full batch or batch timer",
                            );
                        }
                    }
                    None => {
                        // Every queue handle was dropped.
                        tracing::trace!("batch channel closed and emptied, exiting worker task");

                        self.shut_down().await;
                        return self.service;
                    }
                },
            }
        }
    }

    /// Resolve every pending and queued item according to the shutdown policy,
    /// then wait for running batches to finish.
    async fn shut_down(&mut self) {
        // Queued messages can still be received after the channel is closed.
        self.rx.close();

        match self.shutdown_policy {
            ShutdownPolicy::Drain => {
                while let Some(msg) = self.rx.recv().await {
                    self.admit(msg);

                    if self.pending_items.len() >= self.max_items_in_batch {
                        self.flush_batch().await;
                    }
                }

                self.flush_batch().await;
            }
            ShutdownPolicy::Reject => {
                self.pending_batch_timer = None;

                let mut rejected: Vec<Tx<Response>> = mem::take(&mut self.pending_items)
                    .into_iter()
                    .map(|msg| msg.tx)
                    .collect();
                while let Some(msg) = self.rx.recv().await {
                    rejected.push(msg.tx);
                }

                tracing::debug!(rejected = rejected.len(), "rejecting pending batch items");
                fail_all(rejected, BatchError::ShuttingDown);
            }
        }

        // Batches that were already sent to the processor still resolve their callers.
        while self.concurrent_batches.next().await.is_some() {}
    }
}

/// Wait for `batch` to finish, then send each caller its response, in batch order.
///
/// If the batch fails, every caller receives the same error.
async fn resolve_batch<F, Response, E>(batch: F, callers: Vec<Tx<Response>>)
where
    F: Future<Output = Result<Vec<Response>, E>>,
    E: Into<BoxError>,
{
    match batch.await {
        Ok(responses) if responses.len() == callers.len() => {
            tracing::trace!("batch succeeded, sending responses");

            for (tx, response) in callers.into_iter().zip(responses) {
                // The caller might have dropped its response future.
                let _ = tx.send(Ok(response));
            }
        }
        Ok(responses) => {
            let error = BatchError::ResultCountMismatch {
                inputs: callers.len(),
                outputs: responses.len(),
            };

            tracing::trace!(?error, "batch returned the wrong number of responses");
            fail_all(callers, error);
        }
        Err(error) => {
            tracing::trace!("batch failed, sending the error to every caller");
            fail_all(callers, BatchError::batch(error));
        }
    }
}

/// Send a copy of `error` to every caller.
fn fail_all<Response>(callers: impl IntoIterator<Item = Tx<Response>>, error: BatchError) {
    for tx in callers {
        let _ = tx.send(Err(error.clone()));
    }
}
