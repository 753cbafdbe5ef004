use std::{fmt, marker::PhantomData};

use tower::{layer::Layer, Service};

use crate::{BoxError, Config};

use super::service::BatchExecutionQueue;

/// Wraps a batch processor in a [`BatchExecutionQueue`].
///
/// The queue is created stopped, so the host must call
/// [`start_worker`](BatchExecutionQueue::start_worker) before using it.
///
/// See the crate documentation for more details.
pub struct BatchQueueLayer<Request, Response> {
    config: Config,
    _p: PhantomData<fn(Request) -> Response>,
}

impl<Request, Response> BatchQueueLayer<Request, Response> {
    /// Creates a new `BatchQueueLayer`, which builds queues using `config`.
    pub fn new(config: Config) -> Self {
        BatchQueueLayer {
            config,
            _p: PhantomData,
        }
    }
}

impl<S, Request, Response> Layer<S> for BatchQueueLayer<Request, Response>
where
    S: Service<Vec<Request>, Response = Vec<Response>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + 'static,
    Request: Send + 'static,
    Response: Send + 'static,
{
    type Service = BatchExecutionQueue<S, Request, Response>;

    fn layer(&self, service: S) -> Self::Service {
        BatchExecutionQueue::with_config(service, self.config.clone())
    }
}

impl<Request, Response> Clone for BatchQueueLayer<Request, Response> {
    fn clone(&self) -> Self {
        Self::new(self.config.clone())
    }
}

impl<Request, Response> fmt::Debug for BatchQueueLayer<Request, Response> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BatchQueueLayer")
            .field("config", &self.config)
            .finish()
    }
}
