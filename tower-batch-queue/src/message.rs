use tokio::{sync::oneshot, time::Instant};

use crate::BatchError;

/// Message sent to the batch worker
#[derive(Debug)]
pub(crate) struct Message<Request, Response> {
    pub(crate) request: Request,
    pub(crate) tx: Tx<Response>,
    pub(crate) span: tracing::Span,
    /// When the caller submitted the request.
    /// The batch deadline is measured from the first item's submission.
    pub(crate) enqueued_at: Instant,
}

/// Response sender
pub(crate) type Tx<Response> = oneshot::Sender<Result<Response, BatchError>>;

/// Response receiver
pub(crate) type Rx<Response> = oneshot::Receiver<Result<Response, BatchError>>;
