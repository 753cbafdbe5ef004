//! The batch execution queue handle, and its worker lifecycle.

use std::{
    fmt, mem,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{info_span, Instrument};

use crate::{BoxError, Config};

use super::{error::BatchError, future::ResponseFuture, message::Message, worker::Worker};

/// Allows concurrent callers to share a batch processor.
///
/// The queue starts stopped: call [`start_worker`](Self::start_worker) before
/// submitting requests. Clones share the same worker, so request handlers can
/// each hold their own handle.
///
/// See the crate documentation for more details.
pub struct BatchExecutionQueue<S, Request, Response> {
    /// The effective queue config.
    config: Config,

    /// State shared between all the clones of this queue.
    shared: Arc<Shared<S, Request, Response>>,
}

struct Shared<S, Request, Response> {
    /// The sender for the running worker's channel, or `None` if the worker is stopped.
    ///
    /// Only locked for non-blocking operations, never across an `.await`.
    admission: Mutex<Option<mpsc::UnboundedSender<Message<Request, Response>>>>,

    /// The worker task, or the batch processor if there is no worker.
    ///
    /// Held for the whole of a start or stop, so those transitions can't interleave.
    lifecycle: tokio::sync::Mutex<Lifecycle<S>>,
}

enum Lifecycle<S> {
    /// The worker is stopped, and the queue owns the batch processor.
    Stopped(S),

    /// The worker task owns the batch processor, and returns it when it stops.
    Running {
        worker: JoinHandle<S>,
        shutdown: CancellationToken,
    },

    /// The worker task panicked or was cancelled, and the batch processor was dropped with it.
    Lost,
}

impl<S, Request, Response> BatchExecutionQueue<S, Request, Response>
where
    S: Service<Vec<Request>, Response = Vec<Response>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + 'static,
    Request: Send + 'static,
    Response: Send + 'static,
{
    /// Creates a new stopped queue, which sends batches to `service`.
    ///
    /// These parameters control the batch policy:
    ///
    /// * `batch_size` gives the maximum number of items per batch.
    ///   A full batch is flushed immediately.
    /// * `timeout` gives the maximum time a partial batch waits for more items,
    ///   measured from the submission of its first item.
    ///
    /// Other settings take their [`Config`] defaults.
    pub fn new(service: S, batch_size: usize, timeout: Duration) -> Self {
        Self::with_config(
            service,
            Config {
                batch_size,
                timeout,
                ..Config::default()
            },
        )
    }

    /// Creates a new stopped queue from `config`, which sends batches to `service`.
    pub fn with_config(service: S, config: Config) -> Self {
        // Clamp config to sensible values.
        let config = config.clamped();

        BatchExecutionQueue {
            config,
            shared: Arc::new(Shared {
                admission: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::Stopped(service)),
            }),
        }
    }

    /// Returns the effective config of this queue.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns `true` if the queue is accepting requests.
    ///
    /// Returns `false` if the worker is stopped, or if the worker task died.
    pub fn is_running(&self) -> bool {
        self.worker_status().is_ok()
    }

    /// Checks that the worker is started, and that its task is still alive.
    fn worker_status(&self) -> Result<(), BatchError> {
        let admission = self
            .shared
            .admission
            .lock()
            .expect("previous task panicked while holding the admission mutex");

        match admission.as_ref() {
            Some(tx) if !tx.is_closed() => Ok(()),
            // The worker drops its receiver when its task panics or is cancelled.
            Some(_) => Err(BatchError::WorkerLost),
            None => Err(BatchError::NotRunning),
        }
    }

    /// Submits `request` to the next batch, and returns a future for its response.
    ///
    /// The request is queued before this method returns, so requests from the
    /// same task are batched in the order `execute` was called.
    ///
    /// The future resolves with [`BatchError::NotRunning`] if the worker is
    /// stopped. It never waits longer than the batch timeout plus the batch
    /// processing time.
    pub fn execute(&self, request: Request) -> ResponseFuture<Response> {
        let admission = self
            .shared
            .admission
            .lock()
            .expect("previous task panicked while holding the admission mutex");

        let Some(tx) = admission.as_ref() else {
            tracing::trace!("batch worker is not running, rejecting request");
            return ResponseFuture::failed(BatchError::NotRunning);
        };

        tracing::trace!("sending request to batch worker");

        // get the current Span so that we can explicitly propagate it to the worker
        // if we didn't do this, events on the worker related to this span wouldn't be counted
        // towards that span since the worker would have no way of entering it.
        let span = tracing::Span::current();
        let (rsp_tx, rsp_rx) = oneshot::channel();

        match tx.send(Message {
            request,
            tx: rsp_tx,
            span,
            enqueued_at: Instant::now(),
        }) {
            Ok(()) => ResponseFuture::new(rsp_rx),
            // The admission sender is removed before the worker is told to stop,
            // so a closed channel means the worker task died.
            Err(_) => ResponseFuture::failed(BatchError::WorkerLost),
        }
    }

    /// Spawns the batch worker on the tokio runtime, and starts accepting requests.
    ///
    /// Does nothing if the worker is already running. Returns
    /// [`BatchError::WorkerLost`] if a previous worker panicked, because the
    /// batch processor was lost with it.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start_worker(&self) -> Result<(), BatchError> {
        let mut lifecycle = self.shared.lifecycle.lock().await;

        let service = match mem::replace(&mut *lifecycle, Lifecycle::Lost) {
            Lifecycle::Stopped(service) => service,
            running @ Lifecycle::Running { .. } => {
                *lifecycle = running;
                tracing::debug!("batch worker is already running");
                return Ok(());
            }
            Lifecycle::Lost => return Err(BatchError::WorkerLost),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = Worker::new(service, rx, shutdown.clone(), &self.config);

        let span = info_span!("batch worker", kind = std::any::type_name::<S>());
        let worker = tokio::spawn(worker.run().instrument(span));

        *self
            .shared
            .admission
            .lock()
            .expect("previous task panicked while holding the admission mutex") = Some(tx);
        *lifecycle = Lifecycle::Running { worker, shutdown };

        tracing::debug!(
            batch_size = self.config.batch_size,
            timeout = ?self.config.timeout,
            max_concurrent_batches = self.config.max_concurrent_batches,
            "started batch worker",
        );

        Ok(())
    }

    /// Stops accepting requests, and waits for the batch worker to exit.
    ///
    /// Pending requests are flushed or rejected according to the
    /// [`ShutdownPolicy`](crate::ShutdownPolicy). Batches that are already
    /// running are awaited. When this method returns, every request accepted
    /// by this queue has been resolved.
    ///
    /// Does nothing if the worker is not running. Returns
    /// [`BatchError::WorkerLost`] if the worker task panicked or was cancelled.
    pub async fn stop_worker(&self) -> Result<(), BatchError> {
        let mut lifecycle = self.shared.lifecycle.lock().await;

        let (worker, shutdown) = match mem::replace(&mut *lifecycle, Lifecycle::Lost) {
            Lifecycle::Running { worker, shutdown } => (worker, shutdown),
            other => {
                *lifecycle = other;
                tracing::trace!("batch worker is not running");
                return Ok(());
            }
        };

        // Close admission before signalling the worker, so every request is
        // either rejected here, or queued before the worker closes its channel.
        self.shared
            .admission
            .lock()
            .expect("previous task panicked while holding the admission mutex")
            .take();
        shutdown.cancel();

        match worker.await {
            Ok(service) => {
                *lifecycle = Lifecycle::Stopped(service);
                tracing::debug!("stopped batch worker");

                Ok(())
            }
            Err(join_error) => {
                tracing::warn!(?join_error, "batch worker task failed");

                Err(BatchError::WorkerLost)
            }
        }
    }
}

impl<S, Request, Response> Service<Request> for BatchExecutionQueue<S, Request, Response>
where
    S: Service<Vec<Request>, Response = Vec<Response>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + 'static,
    Request: Send + 'static,
    Response: Send + 'static,
{
    type Response = Response;
    type Error = BatchError;
    type Future = ResponseFuture<Response>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // The admission channel is unbounded, so a running queue is always ready.
        Poll::Ready(self.worker_status())
    }

    fn call(&mut self, request: Request) -> Self::Future {
        self.execute(request)
    }
}

impl<S, Request, Response> Clone for BatchExecutionQueue<S, Request, Response> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S, Request, Response> fmt::Debug for BatchExecutionQueue<S, Request, Response> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<Self>();
        let running = self
            .shared
            .admission
            .lock()
            .map(|admission| admission.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false);

        f.debug_struct(name)
            .field("config", &self.config)
            .field("running", &running)
            .finish()
    }
}
